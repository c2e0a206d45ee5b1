//! Address helpers shared by the socket backends.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::{ReactorError, ReactorResult};

/// Resolves `host:port` to the first usable address.
pub(crate) fn resolve(host: &str, port: u16) -> ReactorResult<SocketAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    (host, port)
        .to_socket_addrs()
        .map_err(|source| ReactorError::Bind {
            addr: format!("{host}:{port}"),
            source,
        })?
        .next()
        .ok_or_else(|| ReactorError::Resolve {
            addr: format!("{host}:{port}"),
        })
}

/// Whether an error only means "try again later".
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Accept errors that concern one pending connection, not the listener.
pub(crate) fn is_per_connection_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::PermissionDenied
    )
}

/// OS error code for an error, or -1 when it has none.
pub(crate) fn error_code(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(-1)
}
