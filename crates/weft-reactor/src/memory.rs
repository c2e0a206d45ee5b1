//! Deterministic in-process reactor.
//!
//! Sockets are byte queues owned by the reactor. A test plays the remote peer
//! through [`MemoryReactor::connect`], [`inject`](MemoryReactor::inject),
//! [`take_output`](MemoryReactor::take_output),
//! [`hangup`](MemoryReactor::hangup) and [`fail`](MemoryReactor::fail). Each
//! injected chunk is delivered as one unit by completion-model reads, which
//! makes fragmentation scenarios exact.
//!
//! The reactor runs either I/O model with the same rules as the native
//! backends: readiness interest is disarmed when reported, and completion
//! posts are limited to one per direction.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;
use weft_buffer::ByteBuffer;
use weft_types::{ConnectionHandle, EventContext, ListenerHandle, SocketHandle};

use crate::reactor::{not_connected, unsupported_on_completion};
use crate::registry::{Entry, Registry};
use crate::{
    Interest, IoEvent, IoModel, PostError, Reactor, ReactorError, ReactorKind, ReactorResult,
    SocketRole,
};

enum MemSocket {
    Listener {
        local: SocketAddr,
        backlog: VecDeque<ConnectionHandle>,
    },
    Stream(MemStream),
}

struct MemStream {
    peer: SocketAddr,
    local: SocketAddr,
    inbound: VecDeque<Vec<u8>>,
    outbound: Vec<u8>,
    peer_closed: bool,
    write_capacity: usize,
    fault: Option<i32>,
    read_buffer: Option<ByteBuffer>,
    write: Option<Vec<u8>>,
}

impl MemStream {
    fn room(&self) -> usize {
        self.write_capacity.saturating_sub(self.outbound.len())
    }

    fn has_input(&self) -> bool {
        !self.inbound.is_empty() || self.peer_closed
    }
}

/// In-memory reactor for tests and simulation.
pub struct MemoryReactor {
    model: IoModel,
    sockets: Registry<MemSocket>,
    pending: Mutex<VecDeque<IoEvent>>,
    // Bytes written to sockets that have since been closed.
    closed_output: Mutex<HashMap<ConnectionHandle, Vec<u8>>>,
    signal: Mutex<u64>,
    changed: Condvar,
}

impl MemoryReactor {
    pub fn new(model: IoModel) -> Self {
        Self {
            model,
            sockets: Registry::new(),
            pending: Mutex::new(VecDeque::new()),
            closed_output: Mutex::new(HashMap::new()),
            signal: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    pub fn readiness() -> Self {
        Self::new(IoModel::Readiness)
    }

    pub fn completion() -> Self {
        Self::new(IoModel::Completion)
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<IoEvent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let mut signal = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
        *signal = signal.wrapping_add(1);
        self.changed.notify_all();
    }

    fn stream<R>(&self, handle: ConnectionHandle, f: impl FnOnce(&mut MemStream) -> R) -> Option<R> {
        self.sockets
            .with(handle, |entry| match &mut entry.socket {
                MemSocket::Stream(stream) => Some(f(stream)),
                MemSocket::Listener { .. } => None,
            })
            .flatten()
    }

    // ------------------------------------------------------------------------
    // Peer side
    // ------------------------------------------------------------------------

    /// Opens a connection to `listener` from `peer`. It is accepted on a
    /// later `process_events`.
    pub fn connect(&self, listener: ListenerHandle, peer: SocketAddr) -> ReactorResult<ConnectionHandle> {
        let local = self
            .sockets
            .with(listener, |entry| match &entry.socket {
                MemSocket::Listener { local, .. } => Some(*local),
                MemSocket::Stream(_) => None,
            })
            .flatten()
            .ok_or(ReactorError::UnknownHandle(listener))?;

        let conn = self.sockets.insert(
            SocketRole::Connection,
            MemSocket::Stream(MemStream {
                peer,
                local,
                inbound: VecDeque::new(),
                outbound: Vec::new(),
                peer_closed: false,
                write_capacity: usize::MAX,
                fault: None,
                read_buffer: None,
                write: None,
            }),
        );
        self.sockets.with(listener, |entry| {
            if let MemSocket::Listener { backlog, .. } = &mut entry.socket {
                backlog.push_back(conn);
            }
        });
        self.notify();
        Ok(conn)
    }

    /// Queues `bytes` as one chunk arriving from the peer.
    pub fn inject(&self, handle: ConnectionHandle, bytes: &[u8]) -> bool {
        let delivered = self
            .stream(handle, |stream| stream.inbound.push_back(bytes.to_vec()))
            .is_some();
        self.notify();
        delivered
    }

    /// Drains everything the server wrote to this socket, including bytes
    /// written before it was closed.
    pub fn take_output(&self, handle: ConnectionHandle) -> Vec<u8> {
        let live = self.stream(handle, |stream| std::mem::take(&mut stream.outbound));
        let output = match live {
            Some(output) => output,
            None => self
                .closed_output
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&handle)
                .unwrap_or_default(),
        };
        if !output.is_empty() {
            self.notify();
        }
        output
    }

    /// The peer closes its sending side.
    pub fn hangup(&self, handle: ConnectionHandle) {
        self.stream(handle, |stream| stream.peer_closed = true);
        self.notify();
    }

    /// The socket fails with `code` on the next `process_events`.
    pub fn fail(&self, handle: ConnectionHandle, code: i32) {
        self.stream(handle, |stream| stream.fault = Some(code));
        self.notify();
    }

    /// Limits how many unread output bytes the socket buffers before writes
    /// would block.
    pub fn set_write_capacity(&self, handle: ConnectionHandle, capacity: usize) {
        self.stream(handle, |stream| stream.write_capacity = capacity);
        self.notify();
    }

    pub fn is_open(&self, handle: ConnectionHandle) -> bool {
        self.sockets.contains(handle)
    }

    /// Current interest flags, for assertions.
    pub fn interest(&self, handle: SocketHandle) -> Option<Interest> {
        self.sockets.with(handle, |entry| entry.interest)
    }

    // ------------------------------------------------------------------------
    // Event production
    // ------------------------------------------------------------------------

    fn produce(&self, out: &mut Vec<IoEvent>) {
        let mut accepts = Vec::new();
        let model = self.model;

        self.sockets.for_each(|handle, entry| match &mut entry.socket {
            MemSocket::Listener { backlog, .. } => {
                if entry.interest.read {
                    while let Some(conn) = backlog.pop_front() {
                        accepts.push((handle, entry.context, conn));
                    }
                }
            }
            MemSocket::Stream(_) => match model {
                IoModel::Readiness => Self::produce_readiness(handle, entry, out),
                IoModel::Completion => Self::produce_completion(handle, entry, out),
            },
        });

        for (listener, context, conn) in accepts {
            // The peer may have been torn down before the accept.
            if self.sockets.contains(conn) {
                out.push(IoEvent::accept(listener, context, conn));
            }
        }
    }

    fn produce_readiness(handle: ConnectionHandle, entry: &mut Entry<MemSocket>, out: &mut Vec<IoEvent>) {
        let MemSocket::Stream(stream) = &mut entry.socket else {
            return;
        };
        if let Some(code) = stream.fault.take() {
            entry.interest = Interest::NONE;
            out.push(IoEvent::error(handle, entry.context, code, stream.read_buffer.take()));
            return;
        }
        if entry.interest.read && stream.has_input() {
            entry.interest.read = false;
            out.push(IoEvent::read(handle, entry.context, 0, stream.read_buffer.take()));
        }
        if entry.interest.write && stream.room() > 0 {
            entry.interest.write = false;
            out.push(IoEvent::write(handle, entry.context, 0));
        }
    }

    fn produce_completion(handle: ConnectionHandle, entry: &mut Entry<MemSocket>, out: &mut Vec<IoEvent>) {
        let MemSocket::Stream(stream) = &mut entry.socket else {
            return;
        };
        if let Some(code) = stream.fault.take() {
            entry.interest = Interest::NONE;
            stream.write = None;
            out.push(IoEvent::error(handle, entry.context, code, stream.read_buffer.take()));
            return;
        }
        if entry.interest.read && stream.has_input() {
            if let Some(mut buffer) = stream.read_buffer.take() {
                buffer.unlock();
                let bytes = match stream.inbound.pop_front() {
                    Some(chunk) => {
                        buffer.append(&chunk);
                        chunk.len()
                    }
                    None => 0,
                };
                entry.interest.read = false;
                out.push(IoEvent::read(handle, entry.context, bytes, Some(buffer)));
            }
        }
        if entry.interest.write {
            let fits = stream
                .write
                .as_ref()
                .is_some_and(|data| data.len() <= stream.room());
            if fits {
                let data = stream.write.take().unwrap_or_default();
                stream.outbound.extend_from_slice(&data);
                entry.interest.write = false;
                out.push(IoEvent::write(handle, entry.context, data.len()));
            }
        }
    }
}

impl Default for MemoryReactor {
    fn default() -> Self {
        Self::readiness()
    }
}

impl Reactor for MemoryReactor {
    fn kind(&self) -> ReactorKind {
        ReactorKind::Memory
    }

    fn model(&self) -> IoModel {
        self.model
    }

    fn create_listener(&self, host: &str, port: u16) -> ReactorResult<ListenerHandle> {
        let ip = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let handle = self.sockets.insert(
            SocketRole::Listener,
            MemSocket::Listener {
                local: SocketAddr::new(ip, port),
                backlog: VecDeque::new(),
            },
        );
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
                Ok(())
            })
            .ok_or(ReactorError::UnknownHandle(listener))??;
        self.notify();
        Ok(())
    }

    fn close_listener(&self, listener: ListenerHandle) {
        self.sockets.remove(listener);
    }

    fn associate_context(&self, handle: SocketHandle, context: EventContext) -> ReactorResult<()> {
        self.sockets
            .with(handle, |entry| entry.context = context)
            .ok_or(ReactorError::UnknownHandle(handle))
    }

    fn close_connection(&self, handle: ConnectionHandle) {
        let Some(entry) = self.sockets.remove(handle) else {
            return;
        };
        if let MemSocket::Stream(stream) = entry.socket {
            if !stream.outbound.is_empty() {
                self.closed_output
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(handle, stream.outbound);
            }
        }
        self.pending().push_back(IoEvent::close(handle, entry.context));
        trace!(handle = %handle, "closed memory connection");
        self.notify();
    }

    fn post_read(&self, handle: ConnectionHandle, mut buffer: ByteBuffer) -> Result<(), PostError> {
        let model = self.model;
        let posted = self
            .sockets
            .with(handle, |entry| {
                let MemSocket::Stream(stream) = &mut entry.socket else {
                    return Err(PostError::NotOpen(handle));
                };
                if stream.read_buffer.is_some() {
                    return Err(PostError::Busy(handle));
                }
                if model == IoModel::Completion {
                    buffer.lock();
                }
                stream.read_buffer = Some(buffer);
                entry.interest.read = true;
                Ok(())
            })
            .unwrap_or(Err(PostError::NotOpen(handle)));
        self.notify();
        posted
    }

    fn post_write(&self, handle: ConnectionHandle, data: &[u8]) -> Result<(), PostError> {
        let model = self.model;
        let posted = self
            .sockets
            .with(handle, |entry| {
                let MemSocket::Stream(stream) = &mut entry.socket else {
                    return Err(PostError::NotOpen(handle));
                };
                if model == IoModel::Completion {
                    if stream.write.is_some() {
                        return Err(PostError::Busy(handle));
                    }
                    stream.write = Some(data.to_vec());
                }
                entry.interest.write = true;
                Ok(())
            })
            .unwrap_or(Err(PostError::NotOpen(handle)));
        self.notify();
        posted
    }

    fn process_events(
        &self,
        timeout: Option<Duration>,
        max_events: usize,
        events: &mut Vec<IoEvent>,
    ) -> ReactorResult<usize> {
        let max_events = max_events.max(1);
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut woken = false;

        loop {
            let seen = *self.signal.lock().unwrap_or_else(PoisonError::into_inner);

            if self.pending().is_empty() {
                let mut produced = Vec::new();
                self.produce(&mut produced);
                self.pending().extend(produced);
            }

            {
                let mut pending = self.pending();
                if !pending.is_empty() {
                    let count = pending.len().min(max_events);
                    events.extend(pending.drain(..count));
                    return Ok(count);
                }
            }

            // A wake (or any peer activity) that produced nothing ends the wait.
            if woken {
                return Ok(0);
            }
            woken = true;

            let signal = self.signal.lock().unwrap_or_else(PoisonError::into_inner);
            if *signal != seen {
                continue;
            }
            match deadline {
                None => {
                    drop(self.changed.wait(signal).unwrap_or_else(PoisonError::into_inner));
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(0);
                    }
                    let (_signal, result) = self
                        .changed
                        .wait_timeout(signal, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    if result.timed_out() {
                        return Ok(0);
                    }
                }
            }
        }
    }

    fn try_read(&self, handle: ConnectionHandle, buf: &mut [u8]) -> io::Result<usize> {
        if self.model == IoModel::Completion {
            return Err(unsupported_on_completion());
        }
        self.stream(handle, |stream| {
            if let Some(fault) = stream.fault {
                return Err(io::Error::from_raw_os_error(fault));
            }
            let Some(chunk) = stream.inbound.front_mut() else {
                return if stream.peer_closed {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                stream.inbound.pop_front();
            }
            Ok(n)
        })
        .unwrap_or_else(|| Err(not_connected(handle)))
    }

    fn try_write(&self, handle: ConnectionHandle, data: &[u8]) -> io::Result<usize> {
        if self.model == IoModel::Completion {
            return Err(unsupported_on_completion());
        }
        self.stream(handle, |stream| {
            if let Some(fault) = stream.fault {
                return Err(io::Error::from_raw_os_error(fault));
            }
            let n = stream.room().min(data.len());
            if n == 0 && !data.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            stream.outbound.extend_from_slice(&data[..n]);
            Ok(n)
        })
        .unwrap_or_else(|| Err(not_connected(handle)))
    }

    fn remote_address(&self, handle: ConnectionHandle) -> Option<SocketAddr> {
        self.stream(handle, |stream| stream.peer)
    }

    fn local_address(&self, handle: SocketHandle) -> Option<SocketAddr> {
        self.sockets.with(handle, |entry| match &entry.socket {
            MemSocket::Listener { local, .. } => *local,
            MemSocket::Stream(stream) => stream.local,
        })
    }

    fn wake(&self) -> ReactorResult<()> {
        self.notify();
        Ok(())
    }

    fn handles(&self) -> Vec<(SocketHandle, SocketRole)> {
        self.sockets.snapshot()
    }
}

impl std::fmt::Debug for MemoryReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReactor")
            .field("model", &self.model)
            .field("sockets", &self.sockets.len())
            .finish_non_exhaustive()
    }
}
