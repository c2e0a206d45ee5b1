//! One accepted socket: lifecycle state machine and data pipeline.
//!
//! ```text
//!  socket ─► RawIo ─► cipher_in ─► SecureTransport ─► plain_in
//!                                                       │
//!                              ProtocolNegotiator ◄─────┘
//!                               │               │
//!                            app_in          plain_out ◄── send_text
//!                               │               │
//!                   SessionManager     SecureTransport ─► wire_out ─► RawIo ─► socket
//! ```
//!
//! Without TLS, raw input lands in `plain_in` and `plain_out` is copied to
//! `wire_out` unchanged. Only this type turns lower-layer failures into a
//! `close(reason)`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace, warn};
use weft_buffer::{BufferPool, ByteBuffer};
use weft_reactor::{IoEvent, IoEventKind, Reactor};
use weft_telnet::{ClientInfo, NegotiationStatus, ProtocolNegotiator};
use weft_tls::{SecureTransport, TlsProvider, TlsResult};
use weft_types::{CloseReason, ConnectionHandle, SessionId};

use crate::io::{IoFailure, RawIo};
use crate::{ConnectionState, Metrics, ServerConfig, ServerError, ServerResult, SessionManager, TlsMode};

/// Everything a connection borrows from the server while handling one
/// event.
pub(crate) struct Ctx<'a> {
    pub reactor: &'a dyn Reactor,
    pub sessions: &'a mut dyn SessionManager,
    pub metrics: &'a Metrics,
    pub pool: &'a BufferPool,
    pub config: &'a ServerConfig,
    pub now: Instant,
}

/// What parsing one batch of plaintext led to.
enum Parsed {
    Done,
    /// The peer started a TLS upgrade; the connection is handshaking now.
    Upgrade,
    Closed,
}

/// A live or closing client connection.
pub struct Connection {
    handle: ConnectionHandle,
    remote: Option<SocketAddr>,
    tls_mode: TlsMode,
    tls_provider: Option<Arc<dyn TlsProvider>>,
    session: Option<SessionId>,

    state: ConnectionState,
    /// State to return to when a TLS handshake finishes.
    resume: Option<ConnectionState>,
    close_reason: Option<CloseReason>,

    io: RawIo,
    tls: Option<Box<dyn SecureTransport>>,
    negotiator: Option<Box<dyn ProtocolNegotiator>>,
    negotiation_started: bool,

    // ------------------------------------------------------------------------
    // Pipeline buffers
    // ------------------------------------------------------------------------
    cipher_in: ByteBuffer,
    plain_in: ByteBuffer,
    app_in: ByteBuffer,
    plain_out: ByteBuffer,
    wire_out: ByteBuffer,
    /// Application text sent before the connection was running.
    pending: Vec<(String, bool)>,

    opened_at: Instant,
    state_since: Instant,
    last_activity: Instant,
    bytes_in: u64,
    bytes_out: u64,
}

impl Connection {
    pub(crate) fn new(
        handle: ConnectionHandle,
        remote: Option<SocketAddr>,
        tls_mode: TlsMode,
        tls_provider: Option<Arc<dyn TlsProvider>>,
        negotiator: Box<dyn ProtocolNegotiator>,
        io: RawIo,
        now: Instant,
    ) -> Self {
        Self {
            handle,
            remote,
            tls_mode,
            tls_provider,
            session: None,
            state: ConnectionState::Initializing,
            resume: None,
            close_reason: None,
            io,
            tls: None,
            negotiator: Some(negotiator),
            negotiation_started: false,
            cipher_in: ByteBuffer::new(),
            plain_in: ByteBuffer::new(),
            app_in: ByteBuffer::new(),
            plain_out: ByteBuffer::new(),
            wire_out: ByteBuffer::new(),
            pending: Vec::new(),
            opened_at: now,
            state_since: now,
            last_activity: now,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// The first close reason recorded, once closing.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// What the client reported during negotiation. `None` once closed.
    pub fn client_info(&self) -> Option<&ClientInfo> {
        self.negotiator.as_deref().map(ProtocolNegotiator::client_info)
    }

    pub fn is_secure(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.is_established())
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_out
    }

    /// Output produced but not yet accepted by the socket.
    pub fn output_backlog(&self) -> usize {
        self.wire_out.readable_bytes() + self.io.in_flight()
    }

    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.opened_at)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    fn transition(&mut self, next: ConnectionState, now: Instant) -> ServerResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(ServerError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(handle = %self.handle, from = %self.state, to = %next, "connection state");
        self.state = next;
        self.state_since = now;
        Ok(())
    }

    /// Opens the session and starts the pipeline.
    pub(crate) fn open(&mut self, ctx: &mut Ctx<'_>) -> ServerResult<()> {
        match ctx.sessions.on_connection_open(self.handle, self.remote) {
            Some(session) => self.session = Some(session),
            None => {
                info!(handle = %self.handle, remote = ?self.remote, "session layer refused connection");
                self.close(ctx, CloseReason::LoginFailure);
                return Ok(());
            }
        }

        if self.tls_mode == TlsMode::Implicit {
            if !self.begin_tls(ctx, ConnectionState::Negotiating)? {
                return Ok(());
            }
        } else {
            self.transition(ConnectionState::Negotiating, ctx.now)?;
            self.start_negotiation(ctx);
        }

        if let Err(failure) = self.io.start(ctx.reactor, self.handle, ctx.pool) {
            self.fail_io(ctx, &failure);
            return Ok(());
        }
        self.flush(ctx);
        Ok(())
    }

    /// Starts a server-side TLS session and enters `TlsHandshaking`.
    ///
    /// Returns false if the session could not be created (the connection is
    /// closing then).
    fn begin_tls(&mut self, ctx: &mut Ctx<'_>, resume: ConnectionState) -> ServerResult<bool> {
        let Some(provider) = self.tls_provider.as_ref() else {
            warn!(handle = %self.handle, "TLS requested but no provider configured");
            self.close(ctx, CloseReason::TlsError);
            return Ok(false);
        };
        match provider.create_session_context(self.handle, true) {
            Ok(session) => {
                debug!(handle = %self.handle, backend = provider.name(), "TLS session created");
                self.tls = Some(session);
            }
            Err(e) => {
                warn!(handle = %self.handle, error = %e, "failed to create TLS session");
                ctx.metrics.tls_handshake_failures.inc();
                self.close(ctx, CloseReason::TlsError);
                return Ok(false);
            }
        }
        self.resume = Some(resume);
        self.transition(ConnectionState::TlsHandshaking, ctx.now)?;
        Ok(true)
    }

    fn finish_handshake(&mut self, ctx: &mut Ctx<'_>) -> ServerResult<()> {
        let next = self.resume.take().unwrap_or(ConnectionState::Negotiating);
        info!(handle = %self.handle, resume = %next, "TLS established");
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.set_secure(true);
        }
        self.transition(next, ctx.now)?;

        if next == ConnectionState::Negotiating && !self.negotiation_started {
            self.start_negotiation(ctx);
        }
        if next == ConnectionState::Running {
            self.flush_pending();
        }
        Ok(())
    }

    fn start_negotiation(&mut self, ctx: &Ctx<'_>) {
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.start_negotiation(&mut self.plain_out, ctx.now);
            self.negotiation_started = true;
        }
    }

    fn enter_running(&mut self, ctx: &mut Ctx<'_>) -> ServerResult<()> {
        self.transition(ConnectionState::Running, ctx.now)?;
        self.last_activity = ctx.now;
        if let Some(info) = self.client_info() {
            info!(
                handle = %self.handle,
                session = ?self.session,
                terminal = info.terminal_type().unwrap_or("unknown"),
                window = ?info.window_size,
                secure = info.secure,
                "connection running"
            );
        }
        self.flush_pending();
        Ok(())
    }

    /// Starts closing. Idempotent: the first reason wins and later calls do
    /// nothing.
    pub(crate) fn close(&mut self, ctx: &mut Ctx<'_>, reason: CloseReason) {
        if !self.state.is_live() {
            trace!(handle = %self.handle, %reason, "close ignored, already closing");
            return;
        }
        info!(handle = %self.handle, session = ?self.session, %reason, "closing connection");
        self.close_reason = Some(reason);
        self.pending.clear();
        self.state = ConnectionState::Closing;
        self.state_since = ctx.now;

        // Best effort: whatever is queued plus close_notify, then let go.
        self.seal_output(ctx);
        if let Some(tls) = self.tls.as_mut() {
            if tls.is_established() {
                let _ = tls.shutdown_session(&mut self.wire_out);
            }
        }
        match self.io.flush(ctx.reactor, self.handle, &mut self.wire_out) {
            Ok(n) => self.count_sent(ctx, n),
            Err(failure) => debug!(handle = %self.handle, error = %failure, "final flush failed"),
        }
        ctx.reactor.close_connection(self.handle);
    }

    /// Releases everything and notifies the session layer. Runs once, on
    /// the reactor's Close confirmation (or forced at the end of shutdown).
    pub(crate) fn finalize(&mut self, ctx: &mut Ctx<'_>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.state.is_live() {
            // Closed underneath us without a close() call.
            self.close_reason.get_or_insert(CloseReason::Unknown);
        }
        self.state = ConnectionState::Closed;
        self.state_since = ctx.now;

        self.tls = None;
        self.negotiator = None;
        self.pending.clear();
        for buffer in [
            &mut self.cipher_in,
            &mut self.plain_in,
            &mut self.app_in,
            &mut self.plain_out,
            &mut self.wire_out,
        ] {
            *buffer = ByteBuffer::new();
        }

        let reason = self.close_reason.unwrap_or(CloseReason::Unknown);
        ctx.metrics.record_close(reason);
        info!(
            handle = %self.handle,
            session = ?self.session,
            %reason,
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out,
            "connection closed"
        );
        if let Some(session) = self.session.take() {
            ctx.sessions.on_connection_close(session, reason);
        }
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub(crate) fn handle_event(&mut self, ctx: &mut Ctx<'_>, event: &mut IoEvent) -> ServerResult<()> {
        match event.kind {
            IoEventKind::Read => self.on_read(ctx, event)?,
            IoEventKind::Write => {
                self.io.on_write(event);
                if self.state.is_live() {
                    self.flush(ctx);
                }
            }
            IoEventKind::Error => {
                self.io.on_error(event, ctx.pool);
                if self.state.is_live() {
                    let code = event.error.unwrap_or(-1);
                    warn!(
                        handle = %self.handle,
                        code,
                        error = %ctx.reactor.error_string(code),
                        "socket error"
                    );
                    self.close(ctx, CloseReason::NetworkError);
                }
            }
            IoEventKind::Close => self.finalize(ctx),
            IoEventKind::Accept => {}
        }
        Ok(())
    }

    fn on_read(&mut self, ctx: &mut Ctx<'_>, event: &mut IoEvent) -> ServerResult<()> {
        if !self.state.is_live() {
            if let Some(buffer) = event.take_buffer() {
                ctx.pool.put(buffer);
            }
            return Ok(());
        }

        let target = if self.tls.is_some() {
            &mut self.cipher_in
        } else {
            &mut self.plain_in
        };
        let outcome = match self.io.on_read(ctx.reactor, self.handle, event, target, ctx.pool) {
            Ok(outcome) => outcome,
            Err(failure) => {
                self.fail_io(ctx, &failure);
                return Ok(());
            }
        };

        if outcome.bytes > 0 {
            self.bytes_in += outcome.bytes as u64;
            ctx.metrics.bytes_received.inc_by(outcome.bytes as u64);
            self.last_activity = ctx.now;
            trace!(handle = %self.handle, bytes = outcome.bytes, "read");
        }

        self.pump(ctx)?;

        if outcome.eof {
            if self.state.is_live() {
                info!(handle = %self.handle, "peer closed connection");
                self.close(ctx, CloseReason::NetworkError);
            }
            return Ok(());
        }
        if self.state.is_live() {
            if let Err(failure) = self.io.rearm_read(ctx.reactor, self.handle, ctx.pool) {
                self.fail_io(ctx, &failure);
                return Ok(());
            }
        }
        self.flush(ctx);
        Ok(())
    }

    /// Runs buffered input through TLS and the protocol until neither can
    /// make progress.
    fn pump(&mut self, ctx: &mut Ctx<'_>) -> ServerResult<()> {
        loop {
            match self.state {
                ConnectionState::TlsHandshaking => {
                    if !self.decrypt(ctx) {
                        return Ok(());
                    }
                    if !self.is_secure() {
                        return Ok(());
                    }
                    self.finish_handshake(ctx)?;
                }
                ConnectionState::Negotiating | ConnectionState::Running => {
                    if !self.decrypt(ctx) {
                        return Ok(());
                    }
                    match self.parse_input(ctx)? {
                        Parsed::Done => break,
                        Parsed::Upgrade => {}
                        Parsed::Closed => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        }
        self.advance_negotiation(ctx)?;
        self.deliver_lines(ctx);
        Ok(())
    }

    /// Feeds `cipher_in` to TLS. Returns false if the connection closed.
    fn decrypt(&mut self, ctx: &mut Ctx<'_>) -> bool {
        let Some(tls) = self.tls.as_mut() else {
            return true;
        };
        if self.cipher_in.is_empty() {
            return true;
        }
        let was_established = tls.is_established();
        let result = tls.process_incoming(&mut self.cipher_in, &mut self.plain_in, &mut self.wire_out);
        trace!(handle = %self.handle, %result, "TLS input");

        match result {
            TlsResult::Success | TlsResult::WantRead | TlsResult::WantWrite => true,
            TlsResult::Error => {
                let detail = tls.state().last_error.unwrap_or_default();
                warn!(handle = %self.handle, error = %detail, "TLS failure");
                if !was_established {
                    ctx.metrics.tls_handshake_failures.inc();
                }
                self.close(ctx, CloseReason::TlsError);
                false
            }
            TlsResult::Closed => {
                info!(handle = %self.handle, "peer ended TLS session");
                self.close(ctx, CloseReason::NetworkError);
                false
            }
        }
    }

    fn parse_input(&mut self, ctx: &mut Ctx<'_>) -> ServerResult<Parsed> {
        if self.plain_in.is_empty() {
            return Ok(Parsed::Done);
        }
        let Some(negotiator) = self.negotiator.as_mut() else {
            return Ok(Parsed::Done);
        };

        let result = negotiator.process_input(self.plain_in.readable(), &mut self.app_in, &mut self.plain_out);
        let consumed = match result {
            Ok(consumed) => consumed,
            Err(e) => {
                warn!(handle = %self.handle, error = %e, "protocol violation");
                self.close(ctx, CloseReason::ProtocolError);
                return Ok(Parsed::Closed);
            }
        };
        self.plain_in.consume_read(consumed);

        if !negotiator.take_upgrade_request() || self.tls.is_some() {
            return Ok(Parsed::Done);
        }

        // Replies up to the announcement still go out in cleartext; whatever
        // followed it is the start of the TLS stream.
        self.seal_output(ctx);
        let rest = self.plain_in.consume_all();
        self.cipher_in.append(&rest);
        info!(handle = %self.handle, "client accepted TLS upgrade");

        let resume = self.state;
        if self.begin_tls(ctx, resume)? {
            Ok(Parsed::Upgrade)
        } else {
            Ok(Parsed::Closed)
        }
    }

    fn advance_negotiation(&mut self, ctx: &mut Ctx<'_>) -> ServerResult<()> {
        if self.state != ConnectionState::Negotiating {
            return Ok(());
        }
        let Some(negotiator) = self.negotiator.as_mut() else {
            return Ok(());
        };
        match negotiator.negotiation_status(ctx.now) {
            NegotiationStatus::InProgress => Ok(()),
            NegotiationStatus::Completed => {
                if negotiator.timed_out() {
                    ctx.metrics.negotiation_timeouts.inc();
                    info!(handle = %self.handle, "negotiation timed out, continuing with defaults");
                }
                self.enter_running(ctx)
            }
            NegotiationStatus::Failed => {
                warn!(handle = %self.handle, "negotiation failed");
                self.close(ctx, CloseReason::ProtocolError);
                Ok(())
            }
        }
    }

    fn deliver_lines(&mut self, ctx: &mut Ctx<'_>) {
        if self.state != ConnectionState::Running {
            return;
        }
        let Some(session) = self.session else {
            return;
        };
        while let Some(pos) = self.app_in.position_of(b'\n') {
            let line = self.app_in.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line[..pos]);
            trace!(handle = %self.handle, %session, len = pos, "line");
            ctx.sessions.on_data_received(session, &text);
        }
    }

    // ------------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------------

    /// Formats application text for this connection. Text sent before the
    /// connection is running is queued; returns false once closing.
    pub(crate) fn send_text(&mut self, ctx: &mut Ctx<'_>, text: &str, prompt: bool) -> bool {
        match self.state {
            ConnectionState::Running => {
                self.format(text, prompt);
                self.flush(ctx);
                true
            }
            ConnectionState::Initializing
            | ConnectionState::TlsHandshaking
            | ConnectionState::Negotiating => {
                self.pending.push((text.to_owned(), prompt));
                true
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
        }
    }

    pub(crate) fn set_echo(&mut self, ctx: &mut Ctx<'_>, client_echo: bool) -> bool {
        if !self.state.is_live() {
            return false;
        }
        let Some(negotiator) = self.negotiator.as_mut() else {
            return false;
        };
        negotiator.set_echo(client_echo, &mut self.plain_out);
        self.flush(ctx);
        true
    }

    fn format(&mut self, text: &str, prompt: bool) {
        if let Some(negotiator) = self.negotiator.as_ref() {
            if prompt {
                negotiator.format_prompt(text.as_bytes(), &mut self.plain_out);
            } else {
                negotiator.format_output(text.as_bytes(), &mut self.plain_out);
            }
        }
    }

    fn flush_pending(&mut self) {
        for (text, prompt) in std::mem::take(&mut self.pending) {
            self.format(&text, prompt);
        }
    }

    /// Moves `plain_out` to `wire_out`, through TLS when a session exists.
    fn seal_output(&mut self, ctx: &mut Ctx<'_>) {
        if self.plain_out.is_empty() {
            return;
        }
        let Some(tls) = self.tls.as_mut() else {
            self.wire_out.append(self.plain_out.readable());
            self.plain_out.clear();
            return;
        };
        if tls.process_outgoing(&mut self.plain_out, &mut self.wire_out) == TlsResult::Error {
            let detail = tls.state().last_error.unwrap_or_default();
            warn!(handle = %self.handle, error = %detail, "TLS encrypt failed");
            self.plain_out.clear();
            self.close(ctx, CloseReason::TlsError);
        }
    }

    /// Seals pending output and hands it to the socket.
    pub(crate) fn flush(&mut self, ctx: &mut Ctx<'_>) {
        if !self.state.is_live() {
            return;
        }
        self.seal_output(ctx);
        if !self.state.is_live() {
            return;
        }
        match self.io.flush(ctx.reactor, self.handle, &mut self.wire_out) {
            Ok(n) => self.count_sent(ctx, n),
            Err(failure) => {
                self.fail_io(ctx, &failure);
                return;
            }
        }

        let backlog = self.output_backlog();
        if backlog > ctx.config.max_output_backlog {
            warn!(
                handle = %self.handle,
                backlog,
                limit = ctx.config.max_output_backlog,
                "output backlog exceeded"
            );
            self.close(ctx, CloseReason::NetworkError);
        }
    }

    fn count_sent(&mut self, ctx: &Ctx<'_>, n: usize) {
        if n > 0 {
            self.bytes_out += n as u64;
            ctx.metrics.bytes_sent.inc_by(n as u64);
        }
    }

    /// A post or native call failed synchronously: the connection ends now
    /// rather than waiting for an Error event that may never come.
    fn fail_io(&mut self, ctx: &mut Ctx<'_>, failure: &IoFailure) {
        warn!(handle = %self.handle, error = %failure, "socket operation failed");
        self.close(ctx, CloseReason::NetworkError);
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Checks the handshake, negotiation and idle deadlines.
    pub(crate) fn tick(&mut self, ctx: &mut Ctx<'_>) -> ServerResult<()> {
        match self.state {
            ConnectionState::TlsHandshaking => {
                let elapsed = ctx.now.saturating_duration_since(self.state_since);
                if elapsed >= ctx.config.handshake_timeout {
                    warn!(handle = %self.handle, ?elapsed, "TLS handshake timed out");
                    self.close(ctx, CloseReason::Timeout);
                }
            }
            ConnectionState::Negotiating => {
                self.advance_negotiation(ctx)?;
                self.deliver_lines(ctx);
                self.flush(ctx);
            }
            ConnectionState::Running => {
                if let Some(idle) = ctx.config.idle_timeout {
                    let quiet = ctx.now.saturating_duration_since(self.last_activity);
                    if quiet >= idle {
                        info!(handle = %self.handle, ?quiet, "idle timeout");
                        self.close(ctx, CloseReason::Timeout);
                    }
                }
            }
            ConnectionState::Initializing | ConnectionState::Closing | ConnectionState::Closed => {}
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("session", &self.session)
            .field("close_reason", &self.close_reason)
            .field("secure", &self.is_secure())
            .finish_non_exhaustive()
    }
}
