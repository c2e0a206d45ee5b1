//! Reactor error types.

use std::io;

use weft_types::SocketHandle;

use crate::ReactorKind;

/// Errors from reactor setup and the event loop itself.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// Underlying OS I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// The listener address could not be resolved.
    #[error("could not resolve listener address {addr}")]
    Resolve { addr: String },

    /// Binding or listening failed.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    /// The handle is not (or no longer) owned by this reactor.
    #[error("unknown socket handle {0}")]
    UnknownHandle(SocketHandle),

    /// The operation does not apply to this kind of socket.
    #[error("socket {0} has the wrong role for this operation")]
    WrongRole(SocketHandle),

    /// The backend was requested on a platform that does not provide it.
    #[error("reactor backend {0} is not available on this platform")]
    Unavailable(ReactorKind),
}

/// Result type for reactor operations.
pub type ReactorResult<T> = Result<T, ReactorError>;

/// Immediate failure of `post_read`/`post_write`.
///
/// Returned synchronously. No later event is emitted for a post that failed
/// here, so callers treat it as terminal for the connection.
#[derive(Debug, thiserror::Error)]
pub enum PostError {
    /// The handle is not an open connection.
    #[error("connection {0} is not open")]
    NotOpen(SocketHandle),

    /// An operation of the same direction is already outstanding.
    #[error("connection {0} already has an outstanding operation in this direction")]
    Busy(SocketHandle),

    /// The OS rejected the submission.
    #[error("OS error {code}: {message}")]
    Os { code: i32, message: String },
}

impl PostError {
    pub(crate) fn from_io(err: &io::Error) -> Self {
        Self::Os {
            code: err.raw_os_error().unwrap_or(-1),
            message: err.to_string(),
        }
    }

    /// OS error code, when the failure came from the OS.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Os { code, .. } => Some(*code),
            _ => None,
        }
    }
}
