//! # weft-config: layered configuration for the Weft server
//!
//! Sources are merged in increasing precedence:
//!
//! 1. built-in defaults
//! 2. user config (`~/.config/weft/config.toml`)
//! 3. project config (`weft.toml`)
//! 4. local overrides (`weft.local.toml`)
//! 5. environment (`WEFT_SERVER__MAX_CONNECTIONS=64`)
//!
//! A loaded [`WeftConfig`] is validated and turned into the builder-style
//! [`weft_server::ServerConfig`] with [`WeftConfig::to_server_config`].
//!
//! ```toml
//! [server]
//! reactor = "epoll"
//! max_connections = 512
//!
//! [[listeners]]
//! address = "0.0.0.0:4000"
//!
//! [[listeners]]
//! address = "0.0.0.0:4443"
//! tls = { mode = "implicit" }
//!
//! [tls]
//! cert = "certs/server.pem"
//! key = "certs/server.key"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weft_reactor::ReactorKind;
use weft_server::{ListenerConfig, ServerConfig};
use weft_telnet::NegotiationConfig;
use weft_tls::{TlsBackend, TlsConfig};

mod error;
mod loader;
mod paths;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Complete Weft configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    pub server: ServerSection,
    pub negotiation: NegotiationSection,
    pub tls: Option<TlsSection>,
    pub listeners: Vec<ListenerConfig>,
    pub logging: LoggingSection,
}

impl Default for WeftConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            negotiation: NegotiationSection::default(),
            tls: None,
            listeners: vec![ListenerConfig::new("0.0.0.0:4000")],
            logging: LoggingSection::default(),
        }
    }
}

/// Event loop and connection limits. Durations are whole seconds or
/// milliseconds so they survive environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub reactor: ReactorKind,
    pub max_connections: usize,
    pub max_events: usize,
    pub read_buffer_size: usize,
    pub max_read_per_event: usize,
    pub max_output_backlog: usize,
    pub handshake_timeout_secs: u64,
    /// Zero disables the idle timeout.
    pub idle_timeout_secs: u64,
    pub shutdown_grace_ms: u64,
    pub tick_interval_ms: u64,
    pub command_queue_capacity: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            reactor: ReactorKind::Auto,
            max_connections: 1024,
            max_events: 256,
            read_buffer_size: 16 * 1024,
            max_read_per_event: 256 * 1024,
            max_output_backlog: 1024 * 1024,
            handshake_timeout_secs: 30,
            idle_timeout_secs: 300,
            shutdown_grace_ms: 2000,
            tick_interval_ms: 250,
            command_queue_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationSection {
    pub timeout_ms: u64,
    pub max_line_length: usize,
    pub max_subnegotiation_length: usize,
    /// Terminal type names collected before the TTYPE cycle stops.
    pub max_terminal_types: usize,
}

impl Default for NegotiationSection {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_line_length: 4096,
            max_subnegotiation_length: 8192,
            max_terminal_types: 4,
        }
    }
}

/// Certificate material shared by every TLS-capable listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSection {
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub key_password: Option<String>,
    #[serde(default)]
    pub verify_peer: bool,
    #[serde(default)]
    pub ca: Option<PathBuf>,
    #[serde(default)]
    pub backend: TlsBackend,
}

impl TlsSection {
    fn to_tls_config(&self) -> TlsConfig {
        let mut tls = TlsConfig::new(&self.cert, &self.key).with_backend(self.backend);
        if let Some(password) = &self.key_password {
            tls = tls.with_key_password(password.clone());
        }
        if self.verify_peer {
            if let Some(ca) = &self.ca {
                tls = tls.with_client_auth(ca);
            }
        }
        tls
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `tracing` filter directive; `RUST_LOG` wins when set.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl WeftConfig {
    /// Loads from the default locations, using the current directory as
    /// the project directory.
    pub fn load() -> anyhow::Result<Self> {
        ConfigLoader::new().load()
    }

    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parses a single TOML file with no layering.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Makes relative certificate paths relative to `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();
        if let Some(tls) = &mut self.tls {
            for path in [Some(&mut tls.cert), Some(&mut tls.key), tls.ca.as_mut()]
                .into_iter()
                .flatten()
            {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |message: String| Err(ConfigError::Validation(message));

        if self.listeners.is_empty() {
            return invalid("at least one listener is required".to_string());
        }
        for listener in &self.listeners {
            if let Err(e) = listener.host_port() {
                return invalid(e.to_string());
            }
            if listener.tls.needs_provider() && self.tls.is_none() {
                return invalid(format!(
                    "listener {} uses TLS but no [tls] section is configured",
                    listener.address
                ));
            }
        }

        let server = &self.server;
        if server.max_connections == 0 {
            return invalid("server.max_connections must be positive".to_string());
        }
        if server.max_events == 0 {
            return invalid("server.max_events must be positive".to_string());
        }
        if server.read_buffer_size == 0 {
            return invalid("server.read_buffer_size must be positive".to_string());
        }
        if server.max_read_per_event < server.read_buffer_size {
            return invalid(format!(
                "server.max_read_per_event ({}) is smaller than server.read_buffer_size ({})",
                server.max_read_per_event, server.read_buffer_size
            ));
        }
        if server.command_queue_capacity == 0 {
            return invalid("server.command_queue_capacity must be positive".to_string());
        }
        if server.tick_interval_ms == 0 {
            return invalid("server.tick_interval_ms must be positive".to_string());
        }

        if self.negotiation.max_line_length == 0 {
            return invalid("negotiation.max_line_length must be positive".to_string());
        }

        if let Some(tls) = &self.tls {
            if tls.verify_peer && tls.ca.is_none() {
                return invalid("tls.verify_peer requires tls.ca".to_string());
            }
        }

        if self.logging.level.trim().is_empty() {
            return invalid("logging.level must not be empty".to_string());
        }
        Ok(())
    }

    /// Validates and converts to the server's own configuration.
    pub fn to_server_config(&self) -> ConfigResult<ServerConfig> {
        self.validate()?;

        let server = &self.server;
        let negotiation = NegotiationConfig::default()
            .with_timeout(Duration::from_millis(self.negotiation.timeout_ms))
            .with_max_line_length(self.negotiation.max_line_length)
            .with_max_subnegotiation_length(self.negotiation.max_subnegotiation_length)
            .with_max_terminal_types(self.negotiation.max_terminal_types);
        let idle = (server.idle_timeout_secs > 0)
            .then(|| Duration::from_secs(server.idle_timeout_secs));

        let mut config = ServerConfig::default()
            .with_listeners(self.listeners.clone())
            .with_reactor(server.reactor)
            .with_max_connections(server.max_connections)
            .with_max_events(server.max_events)
            .with_read_buffer_size(server.read_buffer_size)
            .with_max_read_per_event(server.max_read_per_event)
            .with_max_output_backlog(server.max_output_backlog)
            .with_handshake_timeout(Duration::from_secs(server.handshake_timeout_secs))
            .with_idle_timeout(idle)
            .with_shutdown_grace(Duration::from_millis(server.shutdown_grace_ms))
            .with_tick_interval(Duration::from_millis(server.tick_interval_ms))
            .with_command_queue_capacity(server.command_queue_capacity)
            .with_negotiation(negotiation);
        if let Some(tls) = &self.tls {
            config = config.with_tls(tls.to_tls_config());
        }
        Ok(config)
    }
}
