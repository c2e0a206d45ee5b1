//! `mio`-based backends: native readiness and emulated completion.
//!
//! mio drives epoll on Linux and kqueue on macOS/BSD. The same socket
//! plumbing serves two reactor kinds:
//!
//! - [`IoModel::Readiness`]: Read/Write events only report that the socket is
//!   ready. Interest is revoked as soon as it is reported and re-armed by the
//!   next post.
//! - [`IoModel::Completion`]: the reactor performs the posted operation itself
//!   when the socket becomes ready and reports the exact byte count, which is
//!   how an IOCP-style backend behaves.
//!
//! mio notifications are edge-triggered. Re-arming interest re-registers the
//! socket, and the kernel re-reports readiness that is still pending at that
//! point, so a caller that stops draining early is notified again.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, Token, Waker};
use tracing::{debug, trace, warn};
use weft_buffer::ByteBuffer;
use weft_types::{ConnectionHandle, EventContext, ListenerHandle, SocketHandle};

use crate::net::{error_code, is_per_connection_accept_error, is_transient, resolve};
use crate::reactor::{not_connected, unsupported_on_completion};
use crate::registry::{Entry, Registry};
use crate::{
    Interest, IoEvent, IoModel, PostError, Reactor, ReactorError, ReactorKind, ReactorResult,
    SocketRole,
};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Bytes a completion-model read asks for when the posted buffer is full.
const DEFAULT_READ_CHUNK: usize = 16 * 1024;

/// Initial capacity of the mio event list.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

enum MioSocket {
    Listener {
        listener: TcpListener,
        registered: bool,
    },
    Stream(StreamSlot),
}

struct StreamSlot {
    stream: TcpStream,
    peer: SocketAddr,
    registered: bool,
    read_buffer: Option<ByteBuffer>,
    write: Option<PendingWrite>,
}

struct PendingWrite {
    data: Vec<u8>,
    written: usize,
}

/// What mio reported for one token.
#[derive(Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
    read_closed: bool,
    write_closed: bool,
}

struct PollState {
    poll: Poll,
    events: Events,
}

/// Reactor over mio's OS selector.
pub struct MioReactor {
    kind: ReactorKind,
    model: IoModel,
    selector: Mutex<PollState>,
    registry: mio::Registry,
    waker: Waker,
    sockets: Registry<MioSocket>,
    pending: Mutex<VecDeque<IoEvent>>,
    read_chunk: usize,
}

impl MioReactor {
    /// Native readiness reactor (epoll or kqueue, whichever mio selects).
    pub fn readiness() -> ReactorResult<Self> {
        let kind = if cfg!(any(target_os = "linux", target_os = "android")) {
            ReactorKind::Epoll
        } else {
            ReactorKind::Kqueue
        };
        Self::with_model(kind, IoModel::Readiness)
    }

    /// Completion semantics on top of mio readiness.
    pub fn emulated_completion() -> ReactorResult<Self> {
        Self::with_model(ReactorKind::EmulatedCompletion, IoModel::Completion)
    }

    fn with_model(kind: ReactorKind, model: IoModel) -> ReactorResult<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(&registry, WAKE_TOKEN)?;
        debug!(kind = %kind, "created mio reactor");

        Ok(Self {
            kind,
            model,
            selector: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(DEFAULT_EVENT_CAPACITY),
            }),
            registry,
            waker,
            sockets: Registry::new(),
            pending: Mutex::new(VecDeque::new()),
            read_chunk: DEFAULT_READ_CHUNK,
        })
    }

    /// Sets how many bytes a completion-model read requests at minimum.
    pub fn with_read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(1);
        self
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<IoEvent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn token(handle: SocketHandle) -> Token {
        Token(handle.as_u64() as usize)
    }

    /// Brings the OS registration in line with `interest`.
    fn sync_interest(
        registry: &mio::Registry,
        handle: SocketHandle,
        source: &mut impl Source,
        registered: &mut bool,
        interest: Interest,
    ) -> io::Result<()> {
        let wanted = match (interest.read, interest.write) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        };

        match (wanted, *registered) {
            (Some(interests), true) => registry.reregister(source, Self::token(handle), interests),
            (Some(interests), false) => {
                registry.register(source, Self::token(handle), interests)?;
                *registered = true;
                Ok(())
            }
            (None, true) => {
                *registered = false;
                registry.deregister(source)
            }
            (None, false) => Ok(()),
        }
    }

    fn sync_entry(registry: &mio::Registry, handle: SocketHandle, entry: &mut Entry<MioSocket>) -> io::Result<()> {
        let interest = entry.interest;
        match &mut entry.socket {
            MioSocket::Listener {
                listener,
                registered,
            } => Self::sync_interest(registry, handle, listener, registered, interest),
            MioSocket::Stream(slot) => Self::sync_interest(
                registry,
                handle,
                &mut slot.stream,
                &mut slot.registered,
                interest,
            ),
        }
    }

    // ------------------------------------------------------------------------
    // Event translation
    // ------------------------------------------------------------------------

    fn dispatch(&self, ready: Readiness, out: &mut Vec<IoEvent>) {
        let handle = SocketHandle::from(ready.token.0 as u64);
        let mut accepted = Vec::new();

        let listener_context = self.sockets.with(handle, |entry| match &mut entry.socket {
            MioSocket::Listener { listener, .. } => {
                if ready.readable {
                    Self::accept_all(handle, listener, &mut accepted);
                }
                Some(entry.context)
            }
            MioSocket::Stream(_) => {
                match self.model {
                    IoModel::Readiness => Self::stream_readiness(handle, entry, ready, out),
                    IoModel::Completion => {
                        Self::stream_completion(handle, entry, ready, self.read_chunk, out);
                    }
                }
                if let Err(err) = Self::sync_entry(&self.registry, handle, entry) {
                    warn!(handle = %handle, error = %err, "failed to update socket interest");
                }
                None
            }
        });

        // Stale token: the socket was closed after the OS queued the event.
        let Some(listener_context) = listener_context else {
            trace!(handle = %handle, "dropping event for closed socket");
            return;
        };
        let Some(context) = listener_context else {
            return;
        };

        for (stream, peer) in accepted {
            let conn = self.sockets.insert(
                SocketRole::Connection,
                MioSocket::Stream(StreamSlot {
                    stream,
                    peer,
                    registered: false,
                    read_buffer: None,
                    write: None,
                }),
            );
            debug!(listener = %handle, connection = %conn, peer = %peer, "accepted connection");
            out.push(IoEvent::accept(handle, context, conn));
        }
    }

    fn accept_all(handle: ListenerHandle, listener: &TcpListener, accepted: &mut Vec<(TcpStream, SocketAddr)>) {
        loop {
            match listener.accept() {
                Ok(pair) => accepted.push(pair),
                Err(ref err) if is_transient(err) => break,
                Err(ref err) if is_per_connection_accept_error(err) => {
                    debug!(listener = %handle, error = %err, "pending connection failed before accept");
                }
                Err(err) => {
                    warn!(listener = %handle, error = %err, "accept failed");
                    break;
                }
            }
        }
    }

    fn socket_error(slot: &StreamSlot) -> Option<io::Error> {
        match slot.stream.take_error() {
            Ok(Some(err)) => Some(err),
            Ok(None) => None,
            Err(err) => Some(err),
        }
    }

    fn stream_readiness(handle: ConnectionHandle, entry: &mut Entry<MioSocket>, ready: Readiness, out: &mut Vec<IoEvent>) {
        let MioSocket::Stream(slot) = &mut entry.socket else {
            return;
        };

        if ready.error {
            if let Some(err) = Self::socket_error(slot) {
                entry.interest = Interest::NONE;
                out.push(IoEvent::error(handle, entry.context, error_code(&err), slot.read_buffer.take()));
                return;
            }
        }

        if entry.interest.read && (ready.readable || ready.read_closed || ready.error) {
            entry.interest.read = false;
            out.push(IoEvent::read(handle, entry.context, 0, slot.read_buffer.take()));
        }
        if entry.interest.write && (ready.writable || ready.write_closed || ready.error) {
            entry.interest.write = false;
            out.push(IoEvent::write(handle, entry.context, 0));
        }
    }

    fn stream_completion(
        handle: ConnectionHandle,
        entry: &mut Entry<MioSocket>,
        ready: Readiness,
        read_chunk: usize,
        out: &mut Vec<IoEvent>,
    ) {
        let MioSocket::Stream(slot) = &mut entry.socket else {
            return;
        };

        if ready.error {
            if let Some(err) = Self::socket_error(slot) {
                entry.interest = Interest::NONE;
                slot.write = None;
                out.push(IoEvent::error(handle, entry.context, error_code(&err), slot.read_buffer.take()));
                return;
            }
        }

        if entry.interest.read && (ready.readable || ready.read_closed) {
            if let Some(mut buffer) = slot.read_buffer.take() {
                buffer.unlock();
                buffer.ensure_writable(read_chunk);
                match (&slot.stream).read(buffer.writable_mut()) {
                    Ok(n) => {
                        buffer.commit_write(n);
                        entry.interest.read = false;
                        out.push(IoEvent::read(handle, entry.context, n, Some(buffer)));
                    }
                    Err(ref err) if is_transient(err) => {
                        buffer.lock();
                        slot.read_buffer = Some(buffer);
                    }
                    Err(err) => {
                        entry.interest = Interest::NONE;
                        out.push(IoEvent::error(handle, entry.context, error_code(&err), Some(buffer)));
                        return;
                    }
                }
            }
        }

        if entry.interest.write && (ready.writable || ready.write_closed) {
            let Some(pending) = slot.write.as_mut() else {
                entry.interest.write = false;
                return;
            };
            while pending.written < pending.data.len() {
                match (&slot.stream).write(&pending.data[pending.written..]) {
                    Ok(0) => {
                        let err = io::Error::from(io::ErrorKind::WriteZero);
                        entry.interest = Interest::NONE;
                        slot.write = None;
                        out.push(IoEvent::error(handle, entry.context, error_code(&err), None));
                        return;
                    }
                    Ok(n) => pending.written += n,
                    Err(ref err) if is_transient(err) => return,
                    Err(err) => {
                        entry.interest = Interest::NONE;
                        slot.write = None;
                        out.push(IoEvent::error(handle, entry.context, error_code(&err), None));
                        return;
                    }
                }
            }
            let written = pending.written;
            slot.write = None;
            entry.interest.write = false;
            out.push(IoEvent::write(handle, entry.context, written));
        }
    }
}

impl Reactor for MioReactor {
    fn kind(&self) -> ReactorKind {
        self.kind
    }

    fn model(&self) -> IoModel {
        self.model
    }

    fn create_listener(&self, host: &str, port: u16) -> ReactorResult<ListenerHandle> {
        let addr = resolve(host, port)?;
        let listener = TcpListener::bind(addr).map_err(|source| ReactorError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let handle = self.sockets.insert(
            SocketRole::Listener,
            MioSocket::Listener {
                listener,
                registered: false,
            },
        );
        debug!(listener = %handle, addr = %addr, "created listener");
        Ok(handle)
    }

    fn start_listening(&self, listener: ListenerHandle, context: EventContext) -> ReactorResult<()> {
        self.sockets
            .with(listener, |entry| {
                if entry.role != SocketRole::Listener {
                    return Err(ReactorError::WrongRole(listener));
                }
                entry.context = context;
                entry.interest.read = true;
                Self::sync_entry(&self.registry, listener, entry)?;
                Ok(())
            })
            .ok_or(ReactorError::UnknownHandle(listener))?
    }

    fn close_listener(&self, listener: ListenerHandle) {
        if let Some(mut entry) = self.sockets.remove(listener) {
            entry.interest = Interest::NONE;
            let _ = Self::sync_entry(&self.registry, listener, &mut entry);
            debug!(listener = %listener, "closed listener");
        }
    }

    fn associate_context(&self, handle: SocketHandle, context: EventContext) -> ReactorResult<()> {
        self.sockets
            .with(handle, |entry| entry.context = context)
            .ok_or(ReactorError::UnknownHandle(handle))
    }

    fn close_connection(&self, handle: ConnectionHandle) {
        let Some(mut entry) = self.sockets.remove(handle) else {
            return;
        };
        entry.interest = Interest::NONE;
        if let Err(err) = Self::sync_entry(&self.registry, handle, &mut entry) {
            trace!(handle = %handle, error = %err, "deregister on close failed");
        }
        if let MioSocket::Stream(slot) = &entry.socket {
            let _ = slot.stream.shutdown(std::net::Shutdown::Both);
        }
        drop(entry.socket);
        self.pending().push_back(IoEvent::close(handle, entry.context));
        trace!(handle = %handle, "closed connection");
    }

    fn post_read(&self, handle: ConnectionHandle, mut buffer: ByteBuffer) -> Result<(), PostError> {
        let model = self.model;
        self.sockets
            .with(handle, |entry| {
                let MioSocket::Stream(slot) = &mut entry.socket else {
                    return Err(PostError::NotOpen(handle));
                };
                if slot.read_buffer.is_some() {
                    return Err(PostError::Busy(handle));
                }
                if model == IoModel::Completion {
                    buffer.lock();
                }
                slot.read_buffer = Some(buffer);
                entry.interest.read = true;
                Self::sync_entry(&self.registry, handle, entry).map_err(|err| PostError::from_io(&err))
            })
            .unwrap_or(Err(PostError::NotOpen(handle)))
    }

    fn post_write(&self, handle: ConnectionHandle, data: &[u8]) -> Result<(), PostError> {
        let model = self.model;
        self.sockets
            .with(handle, |entry| {
                let MioSocket::Stream(slot) = &mut entry.socket else {
                    return Err(PostError::NotOpen(handle));
                };
                if model == IoModel::Completion {
                    if slot.write.is_some() {
                        return Err(PostError::Busy(handle));
                    }
                    slot.write = Some(PendingWrite {
                        data: data.to_vec(),
                        written: 0,
                    });
                }
                entry.interest.write = true;
                Self::sync_entry(&self.registry, handle, entry).map_err(|err| PostError::from_io(&err))
            })
            .unwrap_or(Err(PostError::NotOpen(handle)))
    }

    fn process_events(
        &self,
        timeout: Option<Duration>,
        max_events: usize,
        events: &mut Vec<IoEvent>,
    ) -> ReactorResult<usize> {
        let max_events = max_events.max(1);

        if self.pending().is_empty() {
            let ready: Vec<Readiness> = {
                let mut state = self.selector.lock().unwrap_or_else(PoisonError::into_inner);
                let PollState { poll, events: os_events } = &mut *state;
                if os_events.capacity() < max_events {
                    *os_events = Events::with_capacity(max_events);
                }
                match poll.poll(os_events, timeout) {
                    Ok(()) => {}
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
                    Err(err) => return Err(err.into()),
                }
                os_events
                    .iter()
                    .filter(|event| event.token() != WAKE_TOKEN)
                    .map(|event| Readiness {
                        token: event.token(),
                        readable: event.is_readable(),
                        writable: event.is_writable(),
                        error: event.is_error(),
                        read_closed: event.is_read_closed(),
                        write_closed: event.is_write_closed(),
                    })
                    .collect()
            };

            let mut produced = Vec::new();
            for readiness in ready {
                self.dispatch(readiness, &mut produced);
            }
            self.pending().extend(produced);
        }

        let mut pending = self.pending();
        let count = pending.len().min(max_events);
        events.extend(pending.drain(..count));
        Ok(count)
    }

    fn try_read(&self, handle: ConnectionHandle, buf: &mut [u8]) -> io::Result<usize> {
        if self.model == IoModel::Completion {
            return Err(unsupported_on_completion());
        }
        self.sockets
            .with(handle, |entry| match &entry.socket {
                MioSocket::Stream(slot) => (&slot.stream).read(buf),
                MioSocket::Listener { .. } => Err(not_connected(handle)),
            })
            .unwrap_or_else(|| Err(not_connected(handle)))
    }

    fn try_write(&self, handle: ConnectionHandle, data: &[u8]) -> io::Result<usize> {
        if self.model == IoModel::Completion {
            return Err(unsupported_on_completion());
        }
        self.sockets
            .with(handle, |entry| match &entry.socket {
                MioSocket::Stream(slot) => (&slot.stream).write(data),
                MioSocket::Listener { .. } => Err(not_connected(handle)),
            })
            .unwrap_or_else(|| Err(not_connected(handle)))
    }

    fn remote_address(&self, handle: ConnectionHandle) -> Option<SocketAddr> {
        self.sockets
            .with(handle, |entry| match &entry.socket {
                MioSocket::Stream(slot) => Some(slot.peer),
                MioSocket::Listener { .. } => None,
            })
            .flatten()
    }

    fn local_address(&self, handle: SocketHandle) -> Option<SocketAddr> {
        self.sockets
            .with(handle, |entry| match &entry.socket {
                MioSocket::Stream(slot) => slot.stream.local_addr().ok(),
                MioSocket::Listener { listener, .. } => listener.local_addr().ok(),
            })
            .flatten()
    }

    fn wake(&self) -> ReactorResult<()> {
        self.waker.wake()?;
        Ok(())
    }

    fn handles(&self) -> Vec<(SocketHandle, SocketRole)> {
        self.sockets.snapshot()
    }
}

impl std::fmt::Debug for MioReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioReactor")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("sockets", &self.sockets.len())
            .finish_non_exhaustive()
    }
}
