//! Unit tests for weft-reactor

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use test_case::test_case;
use weft_buffer::ByteBuffer;
use weft_types::{ConnectionHandle, EventContext, ListenerHandle};

use crate::{
    IoEvent, IoEventKind, IoModel, MemoryReactor, MioReactor, PostError, Reactor, ReactorError,
    ReactorKind,
};

const SHORT: Duration = Duration::from_millis(30);

fn peer() -> SocketAddr {
    "10.0.0.7:50000".parse().unwrap()
}

fn poll(reactor: &dyn Reactor, timeout: Duration) -> Vec<IoEvent> {
    let mut events = Vec::new();
    reactor.process_events(Some(timeout), 64, &mut events).unwrap();
    events
}

/// Polls until an event of `kind` for `handle` arrives, or panics.
fn wait_for(reactor: &dyn Reactor, kind: IoEventKind, handle: ConnectionHandle) -> IoEvent {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        for event in poll(reactor, Duration::from_millis(50)) {
            if event.kind == kind && event.handle == handle {
                return event;
            }
        }
    }
    panic!("no {kind:?} event for {handle}");
}

fn memory_listener(reactor: &MemoryReactor) -> ListenerHandle {
    let listener = reactor.create_listener("127.0.0.1", 4000).unwrap();
    reactor
        .start_listening(listener, EventContext::new(99))
        .unwrap();
    listener
}

fn memory_accept(reactor: &MemoryReactor, listener: ListenerHandle) -> ConnectionHandle {
    let conn = reactor.connect(listener, peer()).unwrap();
    let events = poll(reactor, SHORT);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, IoEventKind::Accept);
    assert_eq!(events[0].accepted, Some(conn));
    assert_eq!(events[0].context, EventContext::new(99));
    reactor
        .associate_context(conn, EventContext::from(conn))
        .unwrap();
    conn
}

// ============================================================================
// Memory reactor: readiness rules
// ============================================================================

#[test]
fn readiness_write_event_is_not_redelivered_without_post() {
    let reactor = MemoryReactor::readiness();
    let listener = memory_listener(&reactor);
    let conn = memory_accept(&reactor, listener);

    reactor.post_write(conn, &[]).unwrap();
    let events = poll(&reactor, SHORT);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, IoEventKind::Write);
    assert!(!reactor.interest(conn).unwrap().write);

    assert!(
        poll(&reactor, SHORT).is_empty(),
        "write readiness must not repeat until re-posted"
    );

    reactor.post_write(conn, &[]).unwrap();
    assert_eq!(poll(&reactor, SHORT)[0].kind, IoEventKind::Write);
}

#[test]
fn readiness_read_returns_parked_buffer_and_caller_drains() {
    let reactor = MemoryReactor::readiness();
    let listener = memory_listener(&reactor);
    let conn = memory_accept(&reactor, listener);

    reactor.post_read(conn, ByteBuffer::with_capacity(8)).unwrap();
    assert!(matches!(
        reactor.post_read(conn, ByteBuffer::new()),
        Err(PostError::Busy(_))
    ));
    reactor.inject(conn, b"hello ");
    reactor.inject(conn, b"world");

    let mut events = poll(&reactor, SHORT);
    assert_eq!(events.len(), 1);
    let event = &mut events[0];
    assert_eq!(event.kind, IoEventKind::Read);
    assert_eq!(event.bytes, 0);
    assert!(event.take_buffer().is_some());

    let mut drained = Vec::new();
    let mut chunk = [0u8; 4];
    loop {
        match reactor.try_read(conn, &mut chunk) {
            Ok(0) => panic!("unexpected eof"),
            Ok(n) => drained.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(err) => panic!("{err}"),
        }
    }
    assert_eq!(drained, b"hello world");
}

#[test]
fn full_socket_blocks_writes_until_peer_reads() {
    let reactor = MemoryReactor::readiness();
    let listener = memory_listener(&reactor);
    let conn = memory_accept(&reactor, listener);
    reactor.set_write_capacity(conn, 4);

    assert_eq!(reactor.try_write(conn, b"abcdef").unwrap(), 4);
    let err = reactor.try_write(conn, b"ef").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);

    reactor.post_write(conn, &[]).unwrap();
    assert!(poll(&reactor, SHORT).is_empty());

    assert_eq!(reactor.take_output(conn), b"abcd");
    assert_eq!(poll(&reactor, SHORT)[0].kind, IoEventKind::Write);
}

// ============================================================================
// Memory reactor: close and stale handles
// ============================================================================

#[test]
fn close_connection_is_idempotent_and_confirms_once() {
    let reactor = MemoryReactor::readiness();
    let listener = memory_listener(&reactor);
    let conn = memory_accept(&reactor, listener);

    reactor.close_connection(conn);
    reactor.close_connection(conn);

    let events = poll(&reactor, SHORT);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, IoEventKind::Close);
    assert_eq!(events[0].context, EventContext::from(conn));
    assert!(poll(&reactor, SHORT).is_empty());
}

#[test]
fn closed_handle_is_never_resolved_again() {
    let reactor = MemoryReactor::readiness();
    let listener = memory_listener(&reactor);
    let old = memory_accept(&reactor, listener);
    reactor.post_read(old, ByteBuffer::new()).unwrap();
    reactor.inject(old, b"late bytes");
    reactor.close_connection(old);

    let events = poll(&reactor, SHORT);
    assert!(events.iter().all(|e| e.kind == IoEventKind::Close));

    let new = memory_accept(&reactor, listener);
    assert_eq!(old.index(), new.index(), "slot should be reused");
    assert_ne!(old, new);
    assert!(reactor.try_read(old, &mut [0; 4]).is_err());
    assert!(matches!(
        reactor.post_write(old, b"x"),
        Err(PostError::NotOpen(_))
    ));
    assert!(reactor.remote_address(old).is_none());
    assert_eq!(reactor.remote_address(new), Some(peer()));
}

#[test]
fn closing_listener_leaves_accepted_connections_alone() {
    let reactor = MemoryReactor::readiness();
    let listener = memory_listener(&reactor);
    let conn = memory_accept(&reactor, listener);

    reactor.close_listener(listener);

    assert!(reactor.is_open(conn));
    assert!(reactor.connect(listener, peer()).is_err());
    assert_eq!(reactor.handles().len(), 1);
}

#[test]
fn socket_fault_becomes_error_event_with_code() {
    let reactor = MemoryReactor::readiness();
    let listener = memory_listener(&reactor);
    let conn = memory_accept(&reactor, listener);

    reactor.fail(conn, 104);
    let events = poll(&reactor, SHORT);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, IoEventKind::Error);
    assert_eq!(events[0].error, Some(104));
    assert!(!reactor.error_string(104).is_empty());
}

// ============================================================================
// Memory reactor: completion rules
// ============================================================================

#[test]
fn completion_read_reports_exact_chunk_and_eof() {
    let reactor = MemoryReactor::completion();
    let listener = memory_listener(&reactor);
    let conn = memory_accept(&reactor, listener);

    reactor.inject(conn, b"abc");
    reactor.inject(conn, b"defgh");
    reactor.post_read(conn, ByteBuffer::new()).unwrap();

    let mut events = poll(&reactor, SHORT);
    assert_eq!(events[0].kind, IoEventKind::Read);
    assert_eq!(events[0].bytes, 3);
    let buffer = events[0].take_buffer().unwrap();
    assert_eq!(buffer.readable(), b"abc");
    assert!(!buffer.is_locked());

    assert!(poll(&reactor, SHORT).is_empty(), "no re-delivery without a post");

    reactor.post_read(conn, buffer).unwrap();
    let mut events = poll(&reactor, SHORT);
    assert_eq!(events[0].bytes, 5);
    let mut buffer = events[0].take_buffer().unwrap();
    // The unconsumed first chunk is still ahead of the second one.
    assert_eq!(buffer.consume_all(), b"abcdefgh");

    reactor.hangup(conn);
    reactor.post_read(conn, buffer).unwrap();
    let events = poll(&reactor, SHORT);
    assert_eq!(events[0].kind, IoEventKind::Read);
    assert_eq!(events[0].bytes, 0, "zero bytes signals orderly shutdown");
}

#[test]
fn completion_allows_one_outstanding_operation_per_direction() {
    let reactor = MemoryReactor::completion();
    let listener = memory_listener(&reactor);
    let conn = memory_accept(&reactor, listener);

    reactor.post_read(conn, ByteBuffer::new()).unwrap();
    assert!(matches!(
        reactor.post_read(conn, ByteBuffer::new()),
        Err(PostError::Busy(_))
    ));

    reactor.post_write(conn, b"one").unwrap();
    assert!(matches!(
        reactor.post_write(conn, b"two"),
        Err(PostError::Busy(_))
    ));

    let events = poll(&reactor, SHORT);
    let write = events.iter().find(|e| e.kind == IoEventKind::Write).unwrap();
    assert_eq!(write.bytes, 3);
    assert_eq!(reactor.take_output(conn), b"one");

    reactor.post_write(conn, b"two").unwrap();
    assert!(reactor.try_write(conn, b"x").is_err());
}

#[test]
fn memory_wake_interrupts_blocking_wait() {
    let reactor = Arc::new(MemoryReactor::readiness());
    let waker = Arc::clone(&reactor);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        waker.wake().unwrap();
    });

    let mut events = Vec::new();
    let n = reactor.process_events(None, 16, &mut events).unwrap();
    assert_eq!(n, 0);
    handle.join().unwrap();
}

// ============================================================================
// Native backends over loopback
// ============================================================================

fn native_listener(reactor: &dyn Reactor) -> (ListenerHandle, SocketAddr) {
    let listener = reactor.create_listener("127.0.0.1", 0).unwrap();
    reactor
        .start_listening(listener, EventContext::new(1))
        .unwrap();
    let addr = reactor.local_address(listener).unwrap();
    (listener, addr)
}

fn native_accept(reactor: &dyn Reactor, listener: ListenerHandle) -> ConnectionHandle {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        for event in poll(reactor, Duration::from_millis(50)) {
            if event.kind == IoEventKind::Accept && event.handle == listener {
                let conn = event.accepted.unwrap();
                reactor
                    .associate_context(conn, EventContext::from(conn))
                    .unwrap();
                return conn;
            }
        }
    }
    panic!("no accept");
}

fn readiness_echo_round_trip(reactor: &dyn Reactor) {
    let (listener, addr) = native_listener(reactor);
    let mut client = TcpStream::connect(addr).unwrap();
    let conn = native_accept(reactor, listener);
    assert_eq!(
        reactor.remote_address(conn),
        Some(client.local_addr().unwrap())
    );

    client.write_all(b"ping").unwrap();
    reactor.post_read(conn, ByteBuffer::new()).unwrap();
    let mut event = wait_for(reactor, IoEventKind::Read, conn);
    assert!(event.take_buffer().is_some());

    let mut buf = [0u8; 16];
    let n = reactor.try_read(conn, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");

    reactor.post_write(conn, &[]).unwrap();
    wait_for(reactor, IoEventKind::Write, conn);
    let further = poll(reactor, Duration::from_millis(50));
    assert!(
        further.iter().all(|e| e.kind != IoEventKind::Write),
        "write readiness delivered twice"
    );

    assert_eq!(reactor.try_write(conn, b"pong").unwrap(), 4);
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"pong");

    reactor.close_connection(conn);
    let close = wait_for(reactor, IoEventKind::Close, conn);
    assert_eq!(close.context, EventContext::from(conn));
    reactor.close_listener(listener);
}

#[test]
fn mio_readiness_round_trip() {
    let reactor = MioReactor::readiness().unwrap();
    assert_eq!(reactor.model(), IoModel::Readiness);
    readiness_echo_round_trip(&reactor);
}

#[cfg(unix)]
#[test]
fn poll_readiness_round_trip() {
    let reactor = crate::PollReactor::new().unwrap();
    readiness_echo_round_trip(&reactor);
}

#[cfg(unix)]
#[test]
fn emulated_completion_round_trip() {
    let reactor = MioReactor::emulated_completion().unwrap();
    assert_eq!(reactor.model(), IoModel::Completion);
    let (listener, addr) = native_listener(&reactor);
    let mut client = TcpStream::connect(addr).unwrap();
    let conn = native_accept(&reactor, listener);

    client.write_all(b"hello").unwrap();
    reactor.post_read(conn, ByteBuffer::new()).unwrap();
    let mut event = wait_for(&reactor, IoEventKind::Read, conn);
    assert_eq!(event.bytes, 5);
    assert_eq!(event.take_buffer().unwrap().readable(), b"hello");

    reactor.post_write(conn, b"world").unwrap();
    let event = wait_for(&reactor, IoEventKind::Write, conn);
    assert_eq!(event.bytes, 5);
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"world");

    drop(client);
    reactor.post_read(conn, ByteBuffer::new()).unwrap();
    let event = wait_for(&reactor, IoEventKind::Read, conn);
    assert_eq!(event.bytes, 0);
}

#[test]
fn mio_wake_interrupts_blocking_wait() {
    let reactor = Arc::new(MioReactor::readiness().unwrap());
    let waker = Arc::clone(&reactor);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        waker.wake().unwrap();
    });

    let mut events = Vec::new();
    assert_eq!(reactor.process_events(None, 16, &mut events).unwrap(), 0);
    handle.join().unwrap();
}

#[test]
fn binding_a_taken_port_reports_bind_error() {
    let reactor = MioReactor::readiness().unwrap();
    let (_listener, addr) = native_listener(&reactor);
    let err = reactor.create_listener("127.0.0.1", addr.port()).unwrap_err();
    assert!(matches!(err, ReactorError::Bind { .. }));
}

// ============================================================================
// Backend selection
// ============================================================================

#[test]
fn auto_resolves_to_an_available_native_backend() {
    let reactor = crate::create(ReactorKind::Auto).unwrap();
    assert_ne!(reactor.kind(), ReactorKind::Auto);
    assert!(reactor.kind().is_available());
}

#[cfg(unix)]
#[test]
fn iocp_is_unavailable_off_windows() {
    assert!(matches!(
        crate::create(ReactorKind::Iocp),
        Err(ReactorError::Unavailable(ReactorKind::Iocp))
    ));
}

#[test_case("epoll", ReactorKind::Epoll; "epoll")]
#[test_case("select", ReactorKind::Poll; "select alias")]
#[test_case("emulated-completion", ReactorKind::EmulatedCompletion; "dashed")]
#[test_case("IOCP", ReactorKind::Iocp; "uppercase")]
fn reactor_kind_parses(input: &str, expected: ReactorKind) {
    assert_eq!(input.parse::<ReactorKind>().unwrap(), expected);
}

#[test]
fn completion_kinds_report_completion_model() {
    assert_eq!(ReactorKind::Iocp.model(), IoModel::Completion);
    assert_eq!(ReactorKind::EmulatedCompletion.model(), IoModel::Completion);
    assert_eq!(ReactorKind::Poll.model(), IoModel::Readiness);
}
