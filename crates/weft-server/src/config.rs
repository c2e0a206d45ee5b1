//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use weft_reactor::ReactorKind;
use weft_telnet::{NegotiationConfig, StartTlsPolicy};
use weft_tls::TlsConfig;

use crate::{ServerError, ServerResult};

/// How a listener secures its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TlsMode {
    /// Cleartext only.
    #[default]
    Plain,
    /// TLS from the first byte.
    Implicit,
    /// Cleartext, with an in-band upgrade offered during negotiation.
    StartTls {
        /// Refuse to run the session unless the upgrade happens.
        #[serde(default)]
        required: bool,
    },
}

impl TlsMode {
    pub fn needs_provider(self) -> bool {
        !matches!(self, Self::Plain)
    }

    /// The negotiation policy a listener in this mode runs with.
    pub fn start_tls_policy(self) -> StartTlsPolicy {
        match self {
            Self::StartTls { required: true } => StartTlsPolicy::Required,
            Self::StartTls { required: false } => StartTlsPolicy::Offered,
            Self::Plain | Self::Implicit => StartTlsPolicy::Disabled,
        }
    }
}

/// One listening socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// `host:port`; IPv6 hosts go in brackets.
    pub address: String,
    #[serde(default)]
    pub tls: TlsMode,
}

impl ListenerConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tls: TlsMode::Plain,
        }
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// Splits the address into host and port.
    pub fn host_port(&self) -> ServerResult<(String, u16)> {
        let invalid = || ServerError::InvalidAddress(self.address.clone());
        let (host, port) = self.address.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        Ok((host.to_string(), port))
    }
}

/// Configuration for the connection server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listeners: Vec<ListenerConfig>,
    /// Reactor backend.
    pub reactor: ReactorKind,
    /// Maximum concurrent connections. Further accepts are closed at once.
    pub max_connections: usize,
    /// Maximum events taken from the reactor per poll.
    pub max_events: usize,
    /// Size of each pooled read buffer.
    pub read_buffer_size: usize,
    /// Readiness backends: bytes drained per Read event before re-arming.
    pub max_read_per_event: usize,
    /// Unsent output a connection may accumulate before it is dropped.
    pub max_output_backlog: usize,
    pub handshake_timeout: Duration,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    /// How long shutdown waits for close confirmations.
    pub shutdown_grace: Duration,
    /// How often timeouts are checked.
    pub tick_interval: Duration,
    /// Capacity of the cross-thread command queue.
    pub command_queue_capacity: usize,
    pub negotiation: NegotiationConfig,
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listeners: vec![ListenerConfig::new("0.0.0.0:4000")],
            reactor: ReactorKind::Auto,
            max_connections: 1024,
            max_events: 256,
            read_buffer_size: 16 * 1024,
            max_read_per_event: 256 * 1024,
            max_output_backlog: 1024 * 1024,
            handshake_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(300)),
            shutdown_grace: Duration::from_secs(2),
            tick_interval: Duration::from_millis(250),
            command_queue_capacity: 4096,
            negotiation: NegotiationConfig::default(),
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with a single plain listener.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            listeners: vec![ListenerConfig::new(address)],
            ..Self::default()
        }
    }

    /// Replaces the listener set.
    pub fn with_listeners(mut self, listeners: Vec<ListenerConfig>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn with_listener(mut self, listener: ListenerConfig) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_reactor(mut self, reactor: ReactorKind) -> Self {
        self.reactor = reactor;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_max_events(mut self, max: usize) -> Self {
        self.max_events = max;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_max_read_per_event(mut self, max: usize) -> Self {
        self.max_read_per_event = max;
        self
    }

    pub fn with_max_output_backlog(mut self, max: usize) -> Self {
        self.max_output_backlog = max;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_command_queue_capacity(mut self, capacity: usize) -> Self {
        self.command_queue_capacity = capacity;
        self
    }

    pub fn with_negotiation(mut self, negotiation: NegotiationConfig) -> Self {
        self.negotiation = negotiation;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub(crate) fn validate(&self) -> ServerResult<()> {
        if self.listeners.is_empty() {
            return Err(ServerError::NoListeners);
        }
        for listener in &self.listeners {
            listener.host_port()?;
        }
        Ok(())
    }
}
