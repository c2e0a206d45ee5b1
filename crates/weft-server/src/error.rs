//! Server error types.

use thiserror::Error;
use weft_reactor::ReactorError;
use weft_tls::TlsError;

use crate::ConnectionState;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that stop the server or reject its configuration.
///
/// Per-connection failures never surface here; a connection turns them into
/// a close reason.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Reactor creation or a fatal reactor failure.
    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),

    /// TLS material could not be loaded.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Metric registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// A listener address is not `host:port`.
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    /// A listener wants TLS but no provider is configured.
    #[error("listener {0} requires TLS but no TLS configuration was given")]
    TlsNotConfigured(String),

    #[error("no listeners configured")]
    NoListeners,

    /// A connection attempted an illegal lifecycle move.
    #[error("invalid connection state transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}
