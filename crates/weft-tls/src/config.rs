//! TLS configuration and key material loading.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
    ServerName,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::pem::{self, PemBlock};
use crate::{BufferedTlsProvider, TlsError, TlsProvider, UnbufferedTlsProvider};

/// Which engine drives server sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsBackend {
    /// `rustls::Connection` fed through `read_tls`/`write_tls`.
    #[default]
    Buffered,
    /// The rustls unbuffered API; the session owns its record buffer.
    Unbuffered,
}

impl TlsBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buffered => "buffered",
            Self::Unbuffered => "unbuffered",
        }
    }
}

impl fmt::Display for TlsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TlsBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buffered" | "rustls" => Ok(Self::Buffered),
            "unbuffered" => Ok(Self::Unbuffered),
            other => Err(format!("unknown TLS backend '{other}'")),
        }
    }
}

/// Server-side TLS configuration.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Certificate chain (PEM), leaf first.
    pub cert_path: PathBuf,
    /// Private key (PEM): PKCS#8, PKCS#1 or SEC1.
    pub key_path: PathBuf,
    /// Accepted for compatibility. Encrypted keys are still rejected.
    pub key_password: Option<String>,
    /// Require and verify client certificates.
    pub verify_peer: bool,
    /// CA bundle used when `verify_peer` is set.
    pub ca_path: Option<PathBuf>,
    pub backend: TlsBackend,
}

impl TlsConfig {
    pub fn new(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
            key_password: None,
            verify_peer: false,
            ca_path: None,
            backend: TlsBackend::default(),
        }
    }

    /// Enables client certificate verification against `ca_path`.
    #[must_use]
    pub fn with_client_auth(mut self, ca_path: impl AsRef<Path>) -> Self {
        self.verify_peer = true;
        self.ca_path = Some(ca_path.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn with_key_password(mut self, password: impl Into<String>) -> Self {
        self.key_password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: TlsBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Builds a rustls `ServerConfig` from this configuration.
    pub fn build_server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path, self.key_password.as_deref())?;

        let builder = ServerConfig::builder();
        let config = if self.verify_peer {
            let ca_path = self.ca_path.as_deref().ok_or(TlsError::MissingCa)?;
            let roots = load_roots(ca_path)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| TlsError::Verifier(e.to_string()))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        } else {
            builder.with_no_client_auth().with_single_cert(certs, key)?
        };

        Ok(Arc::new(config))
    }

    /// Builds the configured provider.
    pub fn build_provider(&self) -> Result<Arc<dyn TlsProvider>, TlsError> {
        let config = self.build_server_config()?;
        debug!(backend = %self.backend, cert = %self.cert_path.display(), "TLS provider ready");
        Ok(match self.backend {
            TlsBackend::Buffered => Arc::new(BufferedTlsProvider::server(config)),
            TlsBackend::Unbuffered => Arc::new(UnbufferedTlsProvider::new(config)),
        })
    }
}

/// Client-side configuration, used by tests and tooling that talk to a
/// Weft listener.
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    pub ca_path: PathBuf,
    pub server_name: String,
}

impl TlsClientConfig {
    pub fn new(ca_path: impl AsRef<Path>, server_name: impl Into<String>) -> Self {
        Self {
            ca_path: ca_path.as_ref().to_path_buf(),
            server_name: server_name.into(),
        }
    }

    pub fn build(&self) -> Result<(Arc<ClientConfig>, ServerName<'static>), TlsError> {
        let roots = load_roots(&self.ca_path)?;
        let name = ServerName::try_from(self.server_name.clone())
            .map_err(|_| TlsError::InvalidServerName(self.server_name.clone()))?;
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok((Arc::new(config), name))
    }

    pub fn build_provider(&self) -> Result<BufferedTlsProvider, TlsError> {
        let (config, name) = self.build()?;
        Ok(BufferedTlsProvider::client(config, name))
    }
}

fn read_blocks(path: &Path) -> Result<Vec<PemBlock>, TlsError> {
    let data = std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    pem::parse_pem(&data).map_err(|source| TlsError::Pem {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<CertificateDer<'static>> = read_blocks(path)?
        .into_iter()
        .filter(|block| block.label == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.contents))
        .collect();

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Loads the first private key in a PEM file.
pub fn load_private_key(
    path: &Path,
    password: Option<&str>,
) -> Result<PrivateKeyDer<'static>, TlsError> {
    for block in read_blocks(path)? {
        if block.is_encrypted() {
            return Err(TlsError::EncryptedKey(path.to_path_buf()));
        }
        let key = match block.label.as_str() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(block.contents)),
            "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(block.contents)),
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(block.contents)),
            _ => continue,
        };
        if password.is_some() {
            warn!(path = %path.display(), "key password configured but key is not encrypted; ignoring");
        }
        return Ok(key);
    }

    Err(TlsError::NoPrivateKey(path.to_path_buf()))
}

fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}
