//! Unbuffered backend: the rustls unbuffered state machine.
//!
//! Unlike [`BufferedSession`](crate::BufferedSession) this session owns the
//! raw record buffer: ciphertext is copied in, rustls reports how much of it
//! was consumed, and the session discards those bytes itself. Outgoing
//! records are encoded into caller-sized scratch space.
//!
//! ```text
//!   encrypted_in ──► incoming ──► process_tls_records ──┬─► decrypted_out
//!                      ▲  │                             │
//!                      └──┘ discard                     └─► encrypted_out
//! ```

use std::sync::Arc;

use rustls::ServerConfig;
use rustls::server::UnbufferedServerConnection;
use rustls::unbuffered::{
    AppDataRecord, ConnectionState, EncodeError, EncryptError, InsufficientSizeError,
    UnbufferedStatus,
};
use tracing::{debug, trace};
use weft_buffer::ByteBuffer;
use weft_types::ConnectionHandle;

use crate::transport::role_name;
use crate::{SecureTransport, TlsError, TlsProvider, TlsResult, TlsSessionState};

/// Upper bound on state transitions per call.
const MAX_STEPS: usize = 64;

/// Initial scratch space for one encoded record.
const RECORD_ROOM: usize = 4096;

/// Provider for [`UnbufferedSession`]s. Server role only.
#[derive(Clone)]
pub struct UnbufferedTlsProvider {
    config: Arc<ServerConfig>,
}

impl UnbufferedTlsProvider {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }
}

impl std::fmt::Debug for UnbufferedTlsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnbufferedTlsProvider").finish_non_exhaustive()
    }
}

impl TlsProvider for UnbufferedTlsProvider {
    fn name(&self) -> &'static str {
        "unbuffered"
    }

    fn create_session_context(
        &self,
        handle: ConnectionHandle,
        is_server: bool,
    ) -> Result<Box<dyn SecureTransport>, TlsError> {
        if !is_server {
            return Err(TlsError::UnsupportedRole {
                backend: self.name(),
                role: role_name(is_server),
            });
        }
        let conn = UnbufferedServerConnection::new(Arc::clone(&self.config))?;
        trace!(handle = %handle, "unbuffered TLS session created");
        Ok(Box::new(UnbufferedSession {
            handle,
            conn,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            pending_plain: Vec::new(),
            undelivered: Vec::new(),
            close_requested: false,
            closed: false,
            session: TlsSessionState::default(),
        }))
    }
}

enum Step {
    Continue,
    Done(TlsResult),
    Fail(String),
}

enum Grow {
    Need(usize),
    Fatal(String),
}

/// One server session over the unbuffered API.
pub struct UnbufferedSession {
    handle: ConnectionHandle,
    conn: UnbufferedServerConnection,
    /// Received ciphertext not yet consumed by rustls.
    incoming: Vec<u8>,
    /// Encoded records not yet handed to the caller.
    outgoing: Vec<u8>,
    /// Plaintext waiting for the traffic keys.
    pending_plain: Vec<u8>,
    /// Plaintext recovered outside `process_incoming`.
    undelivered: Vec<u8>,
    close_requested: bool,
    closed: bool,
    session: TlsSessionState,
}

impl UnbufferedSession {
    /// Runs the state machine until it blocks on the network.
    fn drive(&mut self, encrypted_out: &mut ByteBuffer) -> TlsResult {
        let produced_before = self.outgoing.len();
        let mut result = None;

        for _ in 0..MAX_STEPS {
            let step = self.step();
            match step {
                Step::Continue => {}
                Step::Done(done) => {
                    result = Some(done);
                    break;
                }
                Step::Fail(message) => {
                    result = Some(self.fail(message));
                    break;
                }
            }
        }

        let produced = self.outgoing.len() > produced_before;
        encrypted_out.append(&self.outgoing);
        self.outgoing.clear();

        match result {
            Some(TlsResult::WantRead) if produced => TlsResult::WantWrite,
            Some(result) => result,
            None => self.fail("TLS state machine did not settle".to_string()),
        }
    }

    fn step(&mut self) -> Step {
        let Self {
            conn,
            incoming,
            outgoing,
            pending_plain,
            undelivered,
            close_requested,
            closed,
            session,
            ..
        } = self;

        let UnbufferedStatus { mut discard, state } = conn.process_tls_records(incoming);
        let step = match state {
            Err(e) => Step::Fail(e.to_string()),
            Ok(ConnectionState::ReadTraffic(mut traffic)) => {
                let mut step = Step::Continue;
                while let Some(record) = traffic.next_record() {
                    match record {
                        Ok(AppDataRecord {
                            discard: consumed,
                            payload,
                        }) => {
                            discard += consumed;
                            undelivered.extend_from_slice(payload);
                        }
                        Err(e) => {
                            step = Step::Fail(e.to_string());
                            break;
                        }
                    }
                }
                step
            }
            Ok(ConnectionState::ReadEarlyData(mut early)) => {
                let mut step = Step::Continue;
                while let Some(record) = early.next_record() {
                    match record {
                        Ok(AppDataRecord {
                            discard: consumed,
                            payload,
                        }) => {
                            discard += consumed;
                            undelivered.extend_from_slice(payload);
                        }
                        Err(e) => {
                            step = Step::Fail(e.to_string());
                            break;
                        }
                    }
                }
                step
            }
            Ok(ConnectionState::EncodeTlsData(mut encoder)) => {
                match write_growing(outgoing, |buf| encoder.encode(buf).map_err(encode_grow)) {
                    Ok(_) => Step::Continue,
                    Err(message) => Step::Fail(message),
                }
            }
            Ok(ConnectionState::TransmitTlsData(transmit)) => {
                // Records stay in `outgoing` until `drive` hands them over.
                transmit.done();
                Step::Continue
            }
            Ok(ConnectionState::BlockedHandshake) => {
                if *close_requested {
                    *closed = true;
                    Step::Done(TlsResult::Closed)
                } else {
                    Step::Done(TlsResult::WantRead)
                }
            }
            Ok(ConnectionState::WriteTraffic(mut traffic)) => {
                session.established = true;
                let mut step = Step::Done(TlsResult::Success);
                if !pending_plain.is_empty() {
                    match write_growing(outgoing, |buf| {
                        traffic.encrypt(pending_plain, buf).map_err(encrypt_grow)
                    }) {
                        Ok(_) => pending_plain.clear(),
                        Err(message) => step = Step::Fail(message),
                    }
                }
                if *close_requested && !*closed && matches!(step, Step::Done(_)) {
                    match write_growing(outgoing, |buf| {
                        traffic.queue_close_notify(buf).map_err(encrypt_grow)
                    }) {
                        Ok(_) => {
                            *closed = true;
                            step = Step::Done(TlsResult::Closed);
                        }
                        Err(message) => step = Step::Fail(message),
                    }
                }
                step
            }
            Ok(ConnectionState::PeerClosed | ConnectionState::Closed) => {
                *closed = true;
                Step::Done(TlsResult::Closed)
            }
            Ok(_) => Step::Fail("unsupported TLS connection state".to_string()),
        };

        if discard > 0 {
            incoming.drain(..discard);
        }
        step
    }

    fn fail(&mut self, message: String) -> TlsResult {
        debug!(handle = %self.handle, error = %message, "TLS session failed");
        self.session.last_error = Some(message);
        TlsResult::Error
    }
}

/// Runs `write` against spare room at the end of `out`, growing the room
/// when the encoder asks for more. Returns bytes written.
fn write_growing(
    out: &mut Vec<u8>,
    mut write: impl FnMut(&mut [u8]) -> Result<usize, Grow>,
) -> Result<usize, String> {
    let start = out.len();
    let mut room = RECORD_ROOM;
    loop {
        out.resize(start + room, 0);
        match write(&mut out[start..]) {
            Ok(n) => {
                out.truncate(start + n);
                return Ok(n);
            }
            Err(Grow::Need(required)) if required > room => room = required,
            Err(Grow::Need(required)) => {
                out.truncate(start);
                return Err(format!("encoder asked for {required} bytes but had {room}"));
            }
            Err(Grow::Fatal(message)) => {
                out.truncate(start);
                return Err(message);
            }
        }
    }
}

fn encode_grow(error: EncodeError) -> Grow {
    match error {
        EncodeError::InsufficientSize(InsufficientSizeError { required_size }) => {
            Grow::Need(required_size)
        }
        other => Grow::Fatal(format!("{other:?}")),
    }
}

fn encrypt_grow(error: EncryptError) -> Grow {
    match error {
        EncryptError::InsufficientSize(InsufficientSizeError { required_size }) => {
            Grow::Need(required_size)
        }
        other => Grow::Fatal(format!("{other:?}")),
    }
}

impl SecureTransport for UnbufferedSession {
    fn process_incoming(
        &mut self,
        encrypted_in: &mut ByteBuffer,
        decrypted_out: &mut ByteBuffer,
        encrypted_out: &mut ByteBuffer,
    ) -> TlsResult {
        if self.closed {
            encrypted_in.clear();
            return TlsResult::Closed;
        }
        if !self.session.established {
            self.session.pending_handshake_bytes += encrypted_in.readable_bytes();
        }
        self.incoming.extend_from_slice(encrypted_in.readable());
        encrypted_in.clear();

        let result = self.drive(encrypted_out);
        decrypted_out.append(&self.undelivered);
        self.undelivered.clear();
        result
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
        self.pending_plain.extend_from_slice(plain_in.readable());
        plain_in.clear();
        self.drive(encrypted_out)
    }

    fn shutdown_session(&mut self, encrypted_out: &mut ByteBuffer) -> TlsResult {
        if self.closed {
            return TlsResult::Closed;
        }
        self.close_requested = true;
        match self.drive(encrypted_out) {
            TlsResult::Error => TlsResult::Error,
            _ => {
                self.closed = true;
                TlsResult::Closed
            }
        }
    }

    fn is_established(&self) -> bool {
        self.session.established
    }

    fn needs_network_read(&self) -> bool {
        !self.closed
    }

    fn needs_network_write(&self) -> bool {
        !self.outgoing.is_empty()
    }

    fn state(&self) -> TlsSessionState {
        self.session.clone()
    }
}
