//! The event loop: listeners, dispatch, commands, timers and shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};
use weft_buffer::BufferPool;
use weft_reactor::{IoEvent, IoEventKind, Reactor};
use weft_telnet::{NegotiationConfig, TelnetNegotiator};
use weft_tls::TlsProvider;
use weft_types::{CloseReason, ConnectionHandle, EventContext, ListenerHandle};

use crate::connection::Ctx;
use crate::handle::{Command, Shared};
use crate::io::RawIo;
use crate::{
    Connection, ConnectionState, ListenerConfig, Metrics, ServerConfig, ServerError, ServerHandle,
    ServerResult, SessionManager, ShutdownHandle,
};

/// Upper bound on pooled read buffers regardless of `max_connections`.
const MAX_POOLED_BUFFERS: usize = 1024;

struct Listener {
    handle: ListenerHandle,
    config: ListenerConfig,
    local: Option<SocketAddr>,
    negotiation: NegotiationConfig,
}

/// A text-protocol server over one reactor.
///
/// Single-threaded: one thread calls [`run`](Self::run) or
/// [`poll_once`](Self::poll_once). Other threads use [`ServerHandle`].
pub struct Server {
    config: ServerConfig,
    reactor: Arc<dyn Reactor>,
    tls: Option<Arc<dyn TlsProvider>>,
    listeners: Vec<Listener>,
    connections: HashMap<ConnectionHandle, Connection>,
    sessions: Box<dyn SessionManager>,
    shared: Arc<Shared>,
    metrics: Metrics,
    pool: BufferPool,
    events: Vec<IoEvent>,
    last_tick: Instant,
    shutdown_started: Option<Instant>,
    stopped: bool,
}

impl Server {
    /// Creates the configured reactor backend, loads TLS material and binds
    /// every listener.
    pub fn new(config: ServerConfig, sessions: Box<dyn SessionManager>) -> ServerResult<Self> {
        let reactor = weft_reactor::create(config.reactor)?;
        Self::with_reactor(config, reactor, sessions)
    }

    /// Like [`new`](Self::new) over an existing reactor.
    pub fn with_reactor(
        config: ServerConfig,
        reactor: Arc<dyn Reactor>,
        sessions: Box<dyn SessionManager>,
    ) -> ServerResult<Self> {
        config.validate()?;
        let tls = match &config.tls {
            Some(tls) => Some(tls.build_provider()?),
            None => None,
        };
        Self::assemble(config, reactor, tls, sessions)
    }

    /// Like [`with_reactor`](Self::with_reactor) with a ready-made TLS
    /// provider instead of `config.tls`.
    pub fn with_tls_provider(
        config: ServerConfig,
        reactor: Arc<dyn Reactor>,
        provider: Arc<dyn TlsProvider>,
        sessions: Box<dyn SessionManager>,
    ) -> ServerResult<Self> {
        config.validate()?;
        Self::assemble(config, reactor, Some(provider), sessions)
    }

    fn assemble(
        config: ServerConfig,
        reactor: Arc<dyn Reactor>,
        tls: Option<Arc<dyn TlsProvider>>,
        sessions: Box<dyn SessionManager>,
    ) -> ServerResult<Self> {
        let shared = Arc::new(Shared::new(config.command_queue_capacity, Arc::clone(&reactor)));
        let pool = BufferPool::new(
            config.max_connections.min(MAX_POOLED_BUFFERS),
            config.read_buffer_size,
        );

        let mut server = Self {
            events: Vec::with_capacity(config.max_events),
            config,
            reactor,
            tls,
            listeners: Vec::new(),
            connections: HashMap::new(),
            sessions,
            shared,
            metrics: Metrics::new()?,
            pool,
            last_tick: Instant::now(),
            shutdown_started: None,
            stopped: false,
        };
        server.sessions.bind_server(server.handle());
        server.bind_listeners()?;
        Ok(server)
    }

    fn bind_listeners(&mut self) -> ServerResult<()> {
        for config in self.config.listeners.clone() {
            if config.tls.needs_provider() && self.tls.is_none() {
                return Err(ServerError::TlsNotConfigured(config.address));
            }
            let (host, port) = config.host_port()?;
            let handle = self.reactor.create_listener(&host, port)?;
            self.reactor
                .start_listening(handle, EventContext::from(handle))?;
            let local = self.reactor.local_address(handle);
            info!(
                address = %config.address,
                local = ?local,
                tls = ?config.tls,
                backend = %self.reactor.kind(),
                "listening"
            );

            let negotiation = self
                .config
                .negotiation
                .clone()
                .with_start_tls(config.tls.start_tls_policy());
            self.listeners.push(Listener {
                handle,
                config,
                local,
                negotiation,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// A handle for sending to and closing connections from any thread.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle::new(Arc::clone(&self.shared))
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle().shutdown_handle()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn reactor(&self) -> &Arc<dyn Reactor> {
        &self.reactor
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Bound addresses, in listener order. Empty once shutdown begins.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(|l| l.local).collect()
    }

    pub fn listener_handles(&self) -> Vec<ListenerHandle> {
        self.listeners.iter().map(|l| l.handle).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.connections.get(&handle)
    }

    /// True once shutdown has finished and every session was notified.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    // ------------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------------

    /// Runs until shutdown completes.
    pub fn run(&mut self) -> ServerResult<()> {
        info!(listeners = self.listeners.len(), "server running");
        while !self.stopped {
            self.poll_once(self.config.tick_interval)?;
        }
        Ok(())
    }

    /// Waits up to `timeout` for events, dispatches them, applies queued
    /// commands and checks timers. Returns the number of reactor events.
    pub fn poll_once(&mut self, timeout: Duration) -> ServerResult<usize> {
        if self.stopped {
            return Ok(0);
        }

        let mut events = std::mem::take(&mut self.events);
        let count = match self
            .reactor
            .process_events(Some(timeout), self.config.max_events, &mut events)
        {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "reactor failure");
                self.events = events;
                return Err(e.into());
            }
        };
        for mut event in events.drain(..) {
            self.dispatch(&mut event);
        }
        self.events = events;

        self.drain_commands();

        let now = Instant::now();
        if now.saturating_duration_since(self.last_tick) >= self.config.tick_interval {
            self.last_tick = now;
            self.tick(now);
        }
        self.reap();
        self.check_shutdown(now);
        Ok(count)
    }

    /// Splits the server into its connection map and the context a
    /// connection needs.
    fn split(&mut self, now: Instant) -> (&mut HashMap<ConnectionHandle, Connection>, Ctx<'_>) {
        (
            &mut self.connections,
            Ctx {
                reactor: self.reactor.as_ref(),
                sessions: self.sessions.as_mut(),
                metrics: &self.metrics,
                pool: &self.pool,
                config: &self.config,
                now,
            },
        )
    }

    fn dispatch(&mut self, event: &mut IoEvent) {
        if event.kind == IoEventKind::Accept {
            self.accept(event);
            return;
        }

        let handle = event.handle;
        let (connections, mut ctx) = self.split(Instant::now());
        let Some(conn) = connections.get_mut(&handle) else {
            trace!(handle = %handle, kind = ?event.kind, "event for unknown connection");
            if let Some(buffer) = event.take_buffer() {
                ctx.pool.put(buffer);
            }
            return;
        };
        if let Err(e) = conn.handle_event(&mut ctx, event) {
            error!(handle = %handle, error = %e, "connection fault");
            conn.close(&mut ctx, CloseReason::Unknown);
        }
    }

    fn accept(&mut self, event: &IoEvent) {
        let Some(accepted) = event.accepted else {
            return;
        };
        let Some(listener) = self.listeners.iter().find(|l| l.handle == event.handle) else {
            debug!(listener = %event.handle, "accept on unknown listener");
            self.reactor.close_connection(accepted);
            return;
        };

        if self.shutdown_started.is_some() || self.connections.len() >= self.config.max_connections {
            warn!(
                handle = %accepted,
                active = self.connections.len(),
                limit = self.config.max_connections,
                "at capacity, refusing connection"
            );
            self.metrics.connections_rejected.inc();
            self.metrics.connections_closed
                .with_label_values(&[CloseReason::Capacity.as_str()])
                .inc();
            self.reactor.close_connection(accepted);
            return;
        }

        let tls_mode = listener.config.tls;
        let tls = if tls_mode.needs_provider() {
            self.tls.clone()
        } else {
            None
        };
        let negotiator = Box::new(TelnetNegotiator::new(listener.negotiation.clone()));
        let listener_address = listener.config.address.clone();

        if let Err(e) = self
            .reactor
            .associate_context(accepted, EventContext::from(accepted))
        {
            warn!(handle = %accepted, error = %e, "accepted socket vanished");
            self.reactor.close_connection(accepted);
            return;
        }

        let now = Instant::now();
        let remote = self.reactor.remote_address(accepted);
        let io = RawIo::for_model(
            self.reactor.model(),
            self.config.read_buffer_size,
            self.config.max_read_per_event,
        );
        let conn = Connection::new(accepted, remote, tls_mode, tls, negotiator, io, now);
        self.connections.insert(accepted, conn);
        self.metrics.connections_accepted.inc();
        self.metrics.connections_active.inc();
        info!(handle = %accepted, remote = ?remote, listener = %listener_address, "accepted connection");

        let (connections, mut ctx) = self.split(now);
        if let Some(conn) = connections.get_mut(&accepted) {
            if let Err(e) = conn.open(&mut ctx) {
                error!(handle = %accepted, error = %e, "failed to open connection");
                conn.close(&mut ctx, CloseReason::Unknown);
            }
        }
    }

    fn drain_commands(&mut self) {
        let shared = Arc::clone(&self.shared);
        // Commands queued by callbacks below wait for the next poll.
        for _ in 0..self.config.command_queue_capacity.max(1) {
            let Some(command) = shared.pop() else {
                break;
            };
            let (connections, mut ctx) = self.split(Instant::now());
            let handle = match &command {
                Command::Send { handle, .. }
                | Command::SetEcho { handle, .. }
                | Command::Close { handle, .. } => *handle,
            };
            let Some(conn) = connections.get_mut(&handle) else {
                debug!(handle = %handle, ?command, "command for unknown connection");
                continue;
            };
            let applied = match command {
                Command::Send { text, prompt, .. } => conn.send_text(&mut ctx, &text, prompt),
                Command::SetEcho { client_echo, .. } => conn.set_echo(&mut ctx, client_echo),
                Command::Close { reason, .. } => {
                    conn.close(&mut ctx, reason);
                    true
                }
            };
            if !applied {
                debug!(handle = %handle, state = %conn.state(), "command dropped");
            }
        }
    }

    fn tick(&mut self, now: Instant) {
        let (connections, mut ctx) = self.split(now);
        for conn in connections.values_mut() {
            if let Err(e) = conn.tick(&mut ctx) {
                error!(handle = %conn.handle(), error = %e, "connection fault");
                conn.close(&mut ctx, CloseReason::Unknown);
            }
        }
    }

    fn reap(&mut self) {
        self.connections
            .retain(|_, conn| conn.state() != ConnectionState::Closed);
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    fn check_shutdown(&mut self, now: Instant) {
        if !self.shared.shutdown_requested() || self.stopped {
            return;
        }
        let started = match self.shutdown_started {
            Some(started) => started,
            None => {
                self.begin_shutdown(now);
                now
            }
        };

        if self.connections.is_empty() {
            info!("server stopped");
            self.stopped = true;
            return;
        }
        if now.saturating_duration_since(started) >= self.config.shutdown_grace {
            warn!(
                remaining = self.connections.len(),
                "shutdown grace expired, finalizing remaining connections"
            );
            let (connections, mut ctx) = self.split(now);
            for conn in connections.values_mut() {
                conn.finalize(&mut ctx);
            }
            connections.clear();
            info!("server stopped");
            self.stopped = true;
        }
    }

    fn begin_shutdown(&mut self, now: Instant) {
        info!(connections = self.connections.len(), "shutting down");
        self.shutdown_started = Some(now);
        for listener in self.listeners.drain(..) {
            self.reactor.close_listener(listener.handle);
        }
        let (connections, mut ctx) = self.split(now);
        for conn in connections.values_mut() {
            conn.close(&mut ctx, CloseReason::ServerShutdown);
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("backend", &self.reactor.kind())
            .field("listeners", &self.local_addrs())
            .field("connections", &self.connections.len())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}
