//! TLS error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::pem::PemError;

/// Errors raised while loading TLS material or creating session contexts.
///
/// Failures inside an established session are not errors of this type; they
/// surface as [`TlsResult::Error`](crate::TlsResult::Error) with the message
/// kept in [`TlsSessionState::last_error`](crate::TlsSessionState).
#[derive(Debug, Error)]
pub enum TlsError {
    /// A certificate or key file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A file was not valid PEM.
    #[error("failed to parse PEM file {}: {source}", path.display())]
    Pem { path: PathBuf, source: PemError },

    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    /// The key is password protected. rustls cannot decrypt it.
    #[error(
        "private key in {} is encrypted; decrypt it first (e.g. `openssl pkey -in key.pem -out plain.pem`)",
        .0.display()
    )]
    EncryptedKey(PathBuf),

    /// Peer verification was requested without a CA bundle.
    #[error("verify_peer requires a CA certificate path")]
    MissingCa,

    /// The backend cannot play the requested role.
    #[error("{backend} TLS backend does not support the {role} role")]
    UnsupportedRole {
        backend: &'static str,
        role: &'static str,
    },

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// Client verifier construction failed.
    #[error("client verifier: {0}")]
    Verifier(String),

    /// rustls rejected the configuration or the session.
    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),
}
