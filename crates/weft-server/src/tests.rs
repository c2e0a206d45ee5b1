//! Connection scenarios over `MemoryReactor`, plus one loopback run over the
//! platform's native backend.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use test_case::test_case;
use weft_buffer::ByteBuffer;
use weft_reactor::{MemoryReactor, Reactor, ReactorKind};
use weft_telnet::NegotiationConfig;
use weft_telnet::consts::{DO, EOR, FOLLOWS, IAC, SB, SE, WILL, option};
use weft_tls::{SecureTransport, TlsBackend, TlsClientConfig, TlsConfig, TlsProvider};
use weft_types::{CloseReason, ConnectionHandle, ListenerHandle, SessionId, SocketHandle};

use crate::{
    ConnectionState, ListenerConfig, Server, ServerConfig, ServerHandle, SessionManager, TlsMode,
};

// ============================================================================
// Session recorder
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Open(ConnectionHandle),
    Line(SessionId, String),
    Close(SessionId, CloseReason),
}

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<Seen>>>);

impl Log {
    fn push(&self, seen: Seen) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(seen);
    }

    fn all(&self) -> Vec<Seen> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn lines(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Line(_, line) => Some(line),
                _ => None,
            })
            .collect()
    }

    fn closes(&self) -> Vec<CloseReason> {
        self.all()
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Close(_, reason) => Some(reason),
                _ => None,
            })
            .collect()
    }

    fn opens(&self) -> usize {
        self.all()
            .iter()
            .filter(|seen| matches!(seen, Seen::Open(_)))
            .count()
    }
}

struct Recorder {
    log: Log,
    server: Option<ServerHandle>,
    accept: bool,
    echo: bool,
    greeting: Option<String>,
    next_id: u64,
    sessions: HashMap<SessionId, ConnectionHandle>,
}

impl Recorder {
    fn new(log: &Log) -> Self {
        Self {
            log: log.clone(),
            server: None,
            accept: true,
            echo: false,
            greeting: None,
            next_id: 1,
            sessions: HashMap::new(),
        }
    }

    fn refusing(mut self) -> Self {
        self.accept = false;
        self
    }

    fn echoing(mut self) -> Self {
        self.echo = true;
        self
    }

    fn greeting(mut self, text: &str) -> Self {
        self.greeting = Some(text.to_string());
        self
    }
}

impl SessionManager for Recorder {
    fn bind_server(&mut self, server: ServerHandle) {
        self.server = Some(server);
    }

    fn on_connection_open(
        &mut self,
        handle: ConnectionHandle,
        _remote: Option<SocketAddr>,
    ) -> Option<SessionId> {
        if !self.accept {
            return None;
        }
        let session = SessionId::new(self.next_id);
        self.next_id += 1;
        self.sessions.insert(session, handle);
        self.log.push(Seen::Open(handle));
        if let (Some(server), Some(greeting)) = (&self.server, &self.greeting) {
            server.send(handle, greeting.clone());
        }
        Some(session)
    }

    fn on_data_received(&mut self, session: SessionId, line: &str) {
        self.log.push(Seen::Line(session, line.to_string()));
        if self.echo {
            self.send_to_session(session, &format!("{line}\n"));
        }
    }

    fn on_connection_close(&mut self, session: SessionId, reason: CloseReason) {
        self.sessions.remove(&session);
        self.log.push(Seen::Close(session, reason));
    }

    fn send_to_session(&mut self, session: SessionId, text: &str) -> bool {
        match (self.sessions.get(&session), &self.server) {
            (Some(&handle), Some(server)) => server.send(handle, text),
            _ => false,
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

const PEER: &str = "127.0.0.1:50000";
const CONFIRM_ESSENTIALS: [u8; 6] = [IAC, DO, option::SGA, IAC, DO, option::EOR];

struct Harness {
    reactor: Arc<MemoryReactor>,
    server: Server,
    log: Log,
    listener: ListenerHandle,
}

fn config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:4000")
        .with_reactor(ReactorKind::Memory)
        .with_tick_interval(Duration::ZERO)
}

fn harness(config: ServerConfig, reactor: MemoryReactor, sessions: impl FnOnce(&Log) -> Recorder) -> Harness {
    let log = Log::default();
    let reactor = Arc::new(reactor);
    let dyn_reactor: Arc<dyn Reactor> = Arc::clone(&reactor) as Arc<dyn Reactor>;
    let server = Server::with_reactor(config, dyn_reactor, Box::new(sessions(&log))).unwrap();
    let listener = server.listener_handles()[0];
    Harness {
        reactor,
        server,
        log,
        listener,
    }
}

fn plain(sessions: impl FnOnce(&Log) -> Recorder) -> Harness {
    harness(config(), MemoryReactor::readiness(), sessions)
}

impl Harness {
    fn pump(&mut self) {
        for _ in 0..6 {
            self.server.poll_once(Duration::from_millis(1)).unwrap();
        }
    }

    fn connect(&mut self) -> ConnectionHandle {
        let handle = self
            .reactor
            .connect(self.listener, PEER.parse().unwrap())
            .unwrap();
        self.pump();
        handle
    }

    fn send(&mut self, handle: ConnectionHandle, bytes: &[u8]) {
        assert!(self.reactor.inject(handle, bytes));
        self.pump();
    }

    /// Connects and completes negotiation.
    fn running(&mut self) -> ConnectionHandle {
        let handle = self.connect();
        self.send(handle, &CONFIRM_ESSENTIALS);
        assert_eq!(self.state(handle), Some(ConnectionState::Running));
        self.reactor.take_output(handle);
        handle
    }

    fn state(&self, handle: ConnectionHandle) -> Option<ConnectionState> {
        self.server.connection(handle).map(|conn| conn.state())
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ============================================================================
// Plaintext lifecycle
// ============================================================================

#[test_case(MemoryReactor::readiness(); "readiness")]
#[test_case(MemoryReactor::completion(); "completion")]
fn client_offering_sga_and_eor_then_look_delivers_one_line(reactor: MemoryReactor) {
    let mut h = harness(config(), reactor, |log| Recorder::new(log).echoing());
    let conn = h.connect();

    let opening = h.reactor.take_output(conn);
    assert!(opening.starts_with(&[IAC, WILL, option::SGA, IAC, WILL, option::EOR]));
    assert!(contains(&opening, &[IAC, DO, option::NAWS]));
    assert_eq!(h.state(conn), Some(ConnectionState::Negotiating));

    h.send(conn, &[IAC, WILL, option::SGA, IAC, WILL, option::EOR]);
    let reply = h.reactor.take_output(conn);
    assert!(contains(&reply, &[IAC, DO, option::SGA, IAC, DO, option::EOR]));
    assert_eq!(h.state(conn), Some(ConnectionState::Running));

    h.send(conn, b"look\r\n");
    assert_eq!(h.log.lines(), vec!["look".to_string()]);
    assert!(contains(&h.reactor.take_output(conn), b"look\r\n"), "echoed");
}

#[test]
fn lines_typed_during_negotiation_arrive_once_running() {
    let mut h = plain(Recorder::new);
    let conn = h.connect();

    h.send(conn, b"early\r\n");
    assert!(h.log.lines().is_empty());

    h.send(conn, &CONFIRM_ESSENTIALS);
    assert_eq!(h.log.lines(), vec!["early".to_string()]);
}

#[test]
fn text_sent_before_running_is_held_until_running() {
    let mut h = plain(|log| Recorder::new(log).greeting("Welcome\n"));
    let conn = h.connect();

    assert!(!contains(&h.reactor.take_output(conn), b"Welcome"));

    h.send(conn, &CONFIRM_ESSENTIALS);
    assert!(contains(&h.reactor.take_output(conn), b"Welcome\r\n"));
}

#[test]
fn refused_session_closes_without_protocol_bytes_or_notification() {
    let mut h = plain(|log| Recorder::new(log).refusing());
    let conn = h.connect();

    assert!(h.reactor.take_output(conn).is_empty());
    assert!(!h.reactor.is_open(conn));
    assert!(h.log.all().is_empty());
    assert_eq!(h.server.connection_count(), 0);
    assert_eq!(h.server.metrics().closed_with(CloseReason::LoginFailure), 1);
}

#[test]
fn prompt_ends_with_end_of_record() {
    let mut h = plain(Recorder::new);
    let conn = h.running();

    assert!(h.server.handle().send_prompt(conn, "> "));
    h.pump();
    assert_eq!(h.reactor.take_output(conn), vec![b'>', b' ', IAC, EOR]);
}

#[test]
fn set_echo_asks_client_to_stop_echoing() {
    let mut h = plain(Recorder::new);
    let conn = h.running();

    assert!(h.server.handle().set_echo(conn, false));
    h.pump();
    assert_eq!(h.reactor.take_output(conn), vec![IAC, WILL, option::ECHO]);
}

#[test]
fn malformed_subnegotiation_closes_with_protocol_error() {
    let mut h = plain(Recorder::new);
    let conn = h.running();

    h.send(conn, &[IAC, SB, option::NAWS, 0, IAC, b'x']);
    assert_eq!(h.log.closes(), vec![CloseReason::ProtocolError]);
}

// ============================================================================
// Close semantics
// ============================================================================

#[test]
fn double_close_notifies_once() {
    let mut h = plain(Recorder::new);
    let conn = h.running();
    let handle = h.server.handle();

    assert!(handle.close(conn, CloseReason::NetworkError));
    assert!(handle.close(conn, CloseReason::AdminAction));
    h.pump();

    assert_eq!(h.log.closes(), vec![CloseReason::NetworkError]);
    assert_eq!(h.server.connection_count(), 0);

    // Commands for the finalized handle are dropped.
    handle.send(conn, "late");
    handle.close(conn, CloseReason::Unknown);
    h.pump();
    assert_eq!(h.log.closes().len(), 1);
}

#[test]
fn peer_hangup_is_a_network_error() {
    let mut h = plain(Recorder::new);
    let conn = h.running();

    h.reactor.hangup(conn);
    h.pump();
    assert_eq!(h.log.closes(), vec![CloseReason::NetworkError]);
}

#[test]
fn socket_error_closes_once() {
    let mut h = plain(Recorder::new);
    let conn = h.running();

    h.reactor.fail(conn, 104);
    h.pump();
    h.pump();
    assert_eq!(h.log.closes(), vec![CloseReason::NetworkError]);
}

#[test]
fn connections_past_the_limit_are_refused() {
    let mut h = harness(config().with_max_connections(1), MemoryReactor::readiness(), Recorder::new);
    let first = h.connect();
    let second = h.connect();

    assert!(h.reactor.is_open(first));
    assert!(!h.reactor.is_open(second));
    assert_eq!(h.log.opens(), 1);
    assert_eq!(h.server.metrics().connections_rejected.get(), 1);
    assert_eq!(h.server.metrics().closed_with(CloseReason::Capacity), 1);
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn silent_peer_still_reaches_running_at_negotiation_timeout() {
    let negotiation = NegotiationConfig::default().with_timeout(Duration::from_millis(30));
    let mut h = harness(
        config().with_negotiation(negotiation),
        MemoryReactor::readiness(),
        Recorder::new,
    );
    let conn = h.connect();
    assert_eq!(h.state(conn), Some(ConnectionState::Negotiating));

    std::thread::sleep(Duration::from_millis(40));
    h.pump();

    assert_eq!(h.state(conn), Some(ConnectionState::Running));
    assert_eq!(h.server.metrics().negotiation_timeouts.get(), 1);
}

#[test]
fn idle_connection_times_out() {
    let mut h = harness(
        config().with_idle_timeout(Some(Duration::from_millis(30))),
        MemoryReactor::readiness(),
        Recorder::new,
    );
    h.running();

    std::thread::sleep(Duration::from_millis(40));
    h.pump();
    assert_eq!(h.log.closes(), vec![CloseReason::Timeout]);
}

// ============================================================================
// Output flow control
// ============================================================================

#[test]
fn write_interest_is_dropped_once_output_drains() {
    let mut h = plain(Recorder::new);
    let conn = h.running();
    h.reactor.set_write_capacity(conn, 16);

    let text = "x".repeat(100);
    h.server.handle().send(conn, text.clone());
    h.pump();

    let mut received = Vec::new();
    for _ in 0..20 {
        received.extend(h.reactor.take_output(conn));
        h.pump();
        if received.len() >= 100 {
            break;
        }
    }
    assert_eq!(received, text.as_bytes());
    assert!(!h.reactor.interest(conn).unwrap().write);
    assert_eq!(h.server.poll_once(Duration::ZERO).unwrap(), 0, "no spurious events");
}

#[test]
fn unbounded_backlog_closes_the_connection() {
    let mut h = harness(
        config().with_max_output_backlog(64),
        MemoryReactor::readiness(),
        Recorder::new,
    );
    let conn = h.running();
    h.reactor.set_write_capacity(conn, 0);

    h.server.handle().send(conn, "y".repeat(200));
    h.pump();
    assert_eq!(h.log.closes(), vec![CloseReason::NetworkError]);
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn shutdown_notifies_every_session_and_stops() {
    let mut h = plain(Recorder::new);
    h.running();
    h.running();

    let shutdown = h.server.shutdown_handle();
    std::thread::spawn(move || shutdown.shutdown()).join().unwrap();
    h.pump();

    assert_eq!(h.log.closes(), vec![CloseReason::ServerShutdown; 2]);
    assert!(h.server.is_stopped());
    assert!(h.server.local_addrs().is_empty());
}

#[test]
fn zero_grace_finalizes_stragglers_once() {
    let mut h = harness(
        config().with_shutdown_grace(Duration::ZERO),
        MemoryReactor::readiness(),
        Recorder::new,
    );
    h.running();

    h.server.handle().shutdown();
    h.server.poll_once(Duration::ZERO).unwrap();
    assert!(h.server.is_stopped());
    assert_eq!(h.log.closes(), vec![CloseReason::ServerShutdown]);

    // The reactor's late Close confirmation finds nothing to notify.
    h.server.poll_once(Duration::ZERO).unwrap();
    assert_eq!(h.log.closes().len(), 1);
}

// ============================================================================
// TLS
// ============================================================================

struct Material {
    _dir: TempDir,
    cert: PathBuf,
    key: PathBuf,
}

fn material() -> Material {
    let dir = tempfile::tempdir().unwrap();
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    Material {
        _dir: dir,
        cert: cert_path,
        key: key_path,
    }
}

fn tls_harness(material: &Material, mode: TlsMode, backend: TlsBackend) -> Harness {
    let config = config()
        .with_listeners(vec![ListenerConfig::new("127.0.0.1:4443").with_tls(mode)])
        .with_tls(TlsConfig::new(&material.cert, &material.key).with_backend(backend));
    harness(config, MemoryReactor::readiness(), Recorder::new)
}

fn tls_client(material: &Material) -> Box<dyn SecureTransport> {
    TlsClientConfig::new(&material.cert, "localhost")
        .build_provider()
        .unwrap()
        .create_session_context(SocketHandle::new(900, 0), false)
        .unwrap()
}

impl Harness {
    /// Sends `data` as `pieces` separate reads.
    fn send_in_pieces(&mut self, handle: ConnectionHandle, data: &[u8], pieces: usize) {
        let size = data.len().div_ceil(pieces).max(1);
        for piece in data.chunks(size) {
            self.send(handle, piece);
        }
    }

    /// Runs one round of server output into the client and client output
    /// back, in `pieces` fragments. Returns decrypted plaintext.
    fn tls_round(
        &mut self,
        handle: ConnectionHandle,
        client: &mut dyn SecureTransport,
        pieces: usize,
    ) -> Vec<u8> {
        let mut from_server = ByteBuffer::from(&self.reactor.take_output(handle)[..]);
        let mut plain = ByteBuffer::new();
        let mut to_server = ByteBuffer::new();
        if !from_server.is_empty() {
            client.process_incoming(&mut from_server, &mut plain, &mut to_server);
        }
        let outgoing = to_server.consume_all();
        if !outgoing.is_empty() {
            self.send_in_pieces(handle, &outgoing, pieces);
        }
        plain.consume_all()
    }

    /// Encrypts `text` on the client and delivers it.
    fn send_encrypted(&mut self, handle: ConnectionHandle, client: &mut dyn SecureTransport, text: &[u8]) {
        let mut plain = ByteBuffer::from(text);
        let mut wire = ByteBuffer::new();
        client.process_outgoing(&mut plain, &mut wire);
        self.send(handle, &wire.consume_all());
    }

    fn complete_handshake(
        &mut self,
        handle: ConnectionHandle,
        client: &mut dyn SecureTransport,
        pieces: usize,
    ) -> Vec<u8> {
        let mut plain = Vec::new();
        for _ in 0..10 {
            plain.extend(self.tls_round(handle, client, pieces));
            let server_secure = self
                .server
                .connection(handle)
                .is_some_and(|conn| conn.is_secure());
            if client.is_established() && server_secure {
                plain.extend(self.tls_round(handle, client, pieces));
                break;
            }
        }
        plain
    }
}

#[test_case(TlsBackend::Buffered; "buffered")]
#[test_case(TlsBackend::Unbuffered; "unbuffered")]
fn handshake_fragmented_across_three_reads_completes(backend: TlsBackend) {
    let material = material();
    let mut h = tls_harness(&material, TlsMode::Implicit, backend);
    let conn = h.connect();
    assert_eq!(h.state(conn), Some(ConnectionState::TlsHandshaking));
    assert!(h.reactor.take_output(conn).is_empty(), "server waits for the ClientHello");

    let mut client = tls_client(&material);
    let mut hello = ByteBuffer::new();
    client.process_incoming(&mut ByteBuffer::new(), &mut ByteBuffer::new(), &mut hello);
    h.send_in_pieces(conn, &hello.consume_all(), 3);

    let opening = h.complete_handshake(conn, client.as_mut(), 3);
    assert_eq!(h.state(conn), Some(ConnectionState::Negotiating));
    assert!(opening.starts_with(&[IAC, WILL, option::SGA]), "{opening:?}");

    let mut first = CONFIRM_ESSENTIALS.to_vec();
    first.extend_from_slice(b"look\r\n");
    h.send_encrypted(conn, client.as_mut(), &first);

    assert_eq!(h.log.lines(), vec!["look".to_string()]);
    let conn_ref = h.server.connection(conn).unwrap();
    assert!(conn_ref.client_info().unwrap().secure);
}

#[test]
fn start_tls_upgrade_resumes_negotiation() {
    let material = material();
    let mut h = tls_harness(&material, TlsMode::StartTls { required: true }, TlsBackend::Buffered);
    let conn = h.connect();
    assert!(contains(
        &h.reactor.take_output(conn),
        &[IAC, DO, option::START_TLS]
    ));

    h.send(conn, &[IAC, WILL, option::START_TLS]);
    assert_eq!(
        h.reactor.take_output(conn),
        vec![IAC, SB, option::START_TLS, FOLLOWS, IAC, SE]
    );

    // The announcement and the ClientHello share one read.
    let mut client = tls_client(&material);
    let mut hello = ByteBuffer::new();
    client.process_incoming(&mut ByteBuffer::new(), &mut ByteBuffer::new(), &mut hello);
    let mut input = vec![IAC, SB, option::START_TLS, FOLLOWS, IAC, SE];
    input.extend(hello.consume_all());
    h.send(conn, &input);
    assert_eq!(h.state(conn), Some(ConnectionState::TlsHandshaking));

    h.complete_handshake(conn, client.as_mut(), 1);
    assert_eq!(h.state(conn), Some(ConnectionState::Negotiating));

    h.send_encrypted(conn, client.as_mut(), &CONFIRM_ESSENTIALS);
    assert_eq!(h.state(conn), Some(ConnectionState::Running));

    h.send_encrypted(conn, client.as_mut(), b"look\r\n");
    assert_eq!(h.log.lines(), vec!["look".to_string()]);
}

#[test]
fn plaintext_on_tls_listener_is_a_tls_error() {
    let material = material();
    let mut h = tls_harness(&material, TlsMode::Implicit, TlsBackend::Buffered);
    let conn = h.connect();

    h.send(conn, b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(h.log.closes(), vec![CloseReason::TlsError]);
    assert_eq!(h.server.metrics().tls_handshake_failures.get(), 1);
}

#[test]
fn stalled_handshake_times_out() {
    let material = material();
    let config = config()
        .with_listeners(vec![ListenerConfig::new("127.0.0.1:4443").with_tls(TlsMode::Implicit)])
        .with_tls(TlsConfig::new(&material.cert, &material.key))
        .with_handshake_timeout(Duration::from_millis(30));
    let mut h = harness(config, MemoryReactor::readiness(), Recorder::new);
    h.connect();

    std::thread::sleep(Duration::from_millis(40));
    h.pump();
    assert_eq!(h.log.closes(), vec![CloseReason::Timeout]);
}

#[test]
fn tls_listener_without_material_is_rejected() {
    let config = config().with_listeners(vec![
        ListenerConfig::new("127.0.0.1:4443").with_tls(TlsMode::Implicit),
    ]);
    let reactor: Arc<dyn Reactor> = Arc::new(MemoryReactor::readiness());
    let log = Log::default();
    let result = Server::with_reactor(config, reactor, Box::new(Recorder::new(&log)));
    assert!(matches!(result, Err(crate::ServerError::TlsNotConfigured(_))));
}

#[test]
fn injected_provider_is_used_for_implicit_listeners() {
    let material = material();
    let provider: Arc<dyn TlsProvider> = TlsConfig::new(&material.cert, &material.key)
        .build_provider()
        .unwrap();
    let config = config().with_listeners(vec![
        ListenerConfig::new("127.0.0.1:4443").with_tls(TlsMode::Implicit),
    ]);
    let reactor = Arc::new(MemoryReactor::readiness());
    let log = Log::default();
    let mut server = Server::with_tls_provider(
        config,
        Arc::clone(&reactor) as Arc<dyn Reactor>,
        provider,
        Box::new(Recorder::new(&log)),
    )
    .unwrap();

    let conn = reactor
        .connect(server.listener_handles()[0], PEER.parse().unwrap())
        .unwrap();
    server.poll_once(Duration::from_millis(1)).unwrap();
    assert_eq!(
        server.connection(conn).map(|c| c.state()),
        Some(ConnectionState::TlsHandshaking)
    );
}

// ============================================================================
// Native backend
// ============================================================================

#[test]
fn loopback_echo_over_native_backend() {
    use std::io::{Read, Write};
    use std::net::TcpStream;

    let log = Log::default();
    let config = ServerConfig::new("127.0.0.1:0")
        .with_reactor(ReactorKind::Auto)
        .with_tick_interval(Duration::from_millis(5));
    let mut server = Server::new(config, Box::new(Recorder::new(&log).echoing())).unwrap();
    let addr = server.local_addrs()[0];

    let client = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 512];

        let n = stream.read(&mut buf).unwrap();
        assert!(buf[..n].starts_with(&[IAC, WILL, option::SGA]));

        stream.write_all(&CONFIRM_ESSENTIALS).unwrap();
        stream.write_all(b"look\r\n").unwrap();

        let mut seen = Vec::new();
        while !contains(&seen, b"look\r\n") {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "server hung up");
            seen.extend_from_slice(&buf[..n]);
        }
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while !client.is_finished() && Instant::now() < deadline {
        server.poll_once(Duration::from_millis(10)).unwrap();
    }
    client.join().unwrap();
    assert_eq!(log.lines(), vec!["look".to_string()]);
}
