//! Buffered backend: a `rustls::Connection` fed from memory.
//!
//! rustls keeps its own record and plaintext buffers; this backend shuttles
//! bytes between them and the connection's `ByteBuffer`s.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use tracing::{debug, trace};
use weft_buffer::ByteBuffer;
use weft_types::ConnectionHandle;

use crate::transport::role_name;
use crate::{SecureTransport, TlsError, TlsProvider, TlsResult, TlsSessionState};

/// Provider for [`BufferedSession`]s. Holds a server config, a client
/// config, or both.
#[derive(Clone, Default)]
pub struct BufferedTlsProvider {
    server: Option<Arc<ServerConfig>>,
    client: Option<(Arc<ClientConfig>, ServerName<'static>)>,
}

impl BufferedTlsProvider {
    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self {
            server: Some(config),
            client: None,
        }
    }

    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            server: None,
            client: Some((config, server_name)),
        }
    }

    #[must_use]
    pub fn with_client(mut self, config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        self.client = Some((config, server_name));
        self
    }
}

impl std::fmt::Debug for BufferedTlsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedTlsProvider")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .finish()
    }
}

impl TlsProvider for BufferedTlsProvider {
    fn name(&self) -> &'static str {
        "buffered"
    }

    fn create_session_context(
        &self,
        handle: ConnectionHandle,
        is_server: bool,
    ) -> Result<Box<dyn SecureTransport>, TlsError> {
        let unsupported = TlsError::UnsupportedRole {
            backend: self.name(),
            role: role_name(is_server),
        };
        let conn: Connection = if is_server {
            let config = self.server.as_ref().ok_or(unsupported)?;
            ServerConnection::new(Arc::clone(config))?.into()
        } else {
            let (config, name) = self.client.as_ref().ok_or(unsupported)?;
            ClientConnection::new(Arc::clone(config), name.clone())?.into()
        };
        trace!(handle = %handle, role = role_name(is_server), "buffered TLS session created");
        Ok(Box::new(BufferedSession::new(handle, conn)))
    }
}

/// One session driven through `read_tls`/`write_tls`.
pub struct BufferedSession {
    handle: ConnectionHandle,
    conn: Connection,
    closed: bool,
    state: TlsSessionState,
}

impl BufferedSession {
    fn new(handle: ConnectionHandle, conn: Connection) -> Self {
        Self {
            handle,
            conn,
            closed: false,
            state: TlsSessionState::default(),
        }
    }

    /// Moves every pending TLS record into `out`. Returns bytes produced.
    fn drain_records(&mut self, out: &mut ByteBuffer) -> io::Result<usize> {
        let mut records = Vec::new();
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut records)? == 0 {
                break;
            }
        }
        out.append(&records);
        Ok(records.len())
    }

    fn fail(&mut self, message: String, out: &mut ByteBuffer) -> TlsResult {
        debug!(handle = %self.handle, error = %message, "TLS session failed");
        // Best effort: rustls queues an alert describing the failure.
        let _ = self.drain_records(out);
        self.state.last_error = Some(message);
        TlsResult::Error
    }

    fn refresh(&mut self) {
        self.state.established = !self.conn.is_handshaking();
    }
}

impl SecureTransport for BufferedSession {
    fn process_incoming(
        &mut self,
        encrypted_in: &mut ByteBuffer,
        decrypted_out: &mut ByteBuffer,
        encrypted_out: &mut ByteBuffer,
    ) -> TlsResult {
        if !self.state.established {
            self.state.pending_handshake_bytes += encrypted_in.readable_bytes();
        }

        let input = encrypted_in.consume_all();
        let mut rd: &[u8] = &input;
        while !rd.is_empty() {
            match self.conn.read_tls(&mut rd) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => return self.fail(e.to_string(), encrypted_out),
            }

            let io_state = match self.conn.process_new_packets() {
                Ok(io_state) => io_state,
                Err(e) => return self.fail(e.to_string(), encrypted_out),
            };

            let available = io_state.plaintext_bytes_to_read();
            if available > 0 {
                decrypted_out.ensure_writable(available);
                let dst = &mut decrypted_out.writable_mut()[..available];
                if let Err(e) = self.conn.reader().read_exact(dst) {
                    return self.fail(e.to_string(), encrypted_out);
                }
                decrypted_out.commit_write(available);
            }
            if io_state.peer_has_closed() {
                self.closed = true;
            }
        }

        // A client with nothing received yet still has to send its hello.
        let produced = match self.drain_records(encrypted_out) {
            Ok(n) => n,
            Err(e) => return self.fail(e.to_string(), encrypted_out),
        };
        self.refresh();

        if self.closed {
            TlsResult::Closed
        } else if !self.state.established {
            if produced > 0 {
                TlsResult::WantWrite
            } else {
                TlsResult::WantRead
            }
        } else {
            TlsResult::Success
        }
    }

    fn process_outgoing(
        &mut self,
        plain_in: &mut ByteBuffer,
        encrypted_out: &mut ByteBuffer,
    ) -> TlsResult {
        if self.closed {
            plain_in.clear();
            return TlsResult::Closed;
        }
        if !plain_in.is_empty() {
            let plain = plain_in.consume_all();
            if let Err(e) = self.conn.writer().write_all(&plain) {
                return self.fail(e.to_string(), encrypted_out);
            }
        }
        if let Err(e) = self.drain_records(encrypted_out) {
            return self.fail(e.to_string(), encrypted_out);
        }
        self.refresh();
        if self.state.established {
            TlsResult::Success
        } else {
            TlsResult::WantRead
        }
    }

    fn shutdown_session(&mut self, encrypted_out: &mut ByteBuffer) -> TlsResult {
        self.conn.send_close_notify();
        if let Err(e) = self.drain_records(encrypted_out) {
            return self.fail(e.to_string(), encrypted_out);
        }
        self.closed = true;
        TlsResult::Closed
    }

    fn is_established(&self) -> bool {
        self.state.established
    }

    fn needs_network_read(&self) -> bool {
        !self.closed && self.conn.wants_read()
    }

    fn needs_network_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn state(&self) -> TlsSessionState {
        self.state.clone()
    }
}
