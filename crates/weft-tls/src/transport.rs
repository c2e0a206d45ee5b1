//! The session-level TLS contract shared by every backend.

use std::fmt;

use weft_buffer::ByteBuffer;
use weft_types::ConnectionHandle;

use crate::TlsError;

/// Outcome of one TLS processing step.
///
/// Only `Error` is fatal. `WantRead` and `WantWrite` describe what the
/// handshake needs next; any ciphertext produced is already in the caller's
/// output buffer either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsResult {
    Success,
    WantRead,
    WantWrite,
    /// The peer sent close_notify (or the session was shut down locally).
    Closed,
    Error,
}

impl fmt::Display for TlsResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::WantRead => "want_read",
            Self::WantWrite => "want_write",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Observable state of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSessionState {
    pub established: bool,
    /// Handshake ciphertext received while the session was not yet
    /// established.
    pub pending_handshake_bytes: usize,
    pub last_error: Option<String>,
}

/// One TLS session over in-memory buffers.
///
/// The transport never touches sockets: callers feed it ciphertext read from
/// the network and write out whatever it leaves in `encrypted_out`.
pub trait SecureTransport: Send {
    /// Consumes all of `encrypted_in`, appending recovered plaintext to
    /// `decrypted_out` and any handshake or alert records to
    /// `encrypted_out`.
    fn process_incoming(
        &mut self,
        encrypted_in: &mut ByteBuffer,
        decrypted_out: &mut ByteBuffer,
        encrypted_out: &mut ByteBuffer,
    ) -> TlsResult;

    /// Encrypts all of `plain_in`. Plaintext handed over before the
    /// handshake finishes is held and sent once it does.
    fn process_outgoing(
        &mut self,
        plain_in: &mut ByteBuffer,
        encrypted_out: &mut ByteBuffer,
    ) -> TlsResult;

    /// Queues close_notify into `encrypted_out`.
    fn shutdown_session(&mut self, encrypted_out: &mut ByteBuffer) -> TlsResult;

    fn is_established(&self) -> bool;

    fn needs_network_read(&self) -> bool;

    fn needs_network_write(&self) -> bool;

    fn state(&self) -> TlsSessionState;
}

/// Creates per-connection sessions from shared configuration.
pub trait TlsProvider: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn create_session_context(
        &self,
        handle: ConnectionHandle,
        is_server: bool,
    ) -> Result<Box<dyn SecureTransport>, TlsError>;
}

pub(crate) fn role_name(is_server: bool) -> &'static str {
    if is_server { "server" } else { "client" }
}
