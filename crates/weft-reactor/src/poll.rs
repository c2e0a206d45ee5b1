//! `poll(2)` backend: the portable select-family fallback.
//!
//! Level-triggered. The pollfd set is rebuilt from the socket map on every
//! call, so interest changes made by other threads take effect on the next
//! wait. A self-pipe (a `UnixStream` pair) interrupts a blocked `poll`.

#![allow(unsafe_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, nfds_t, pollfd};
use tracing::{debug, trace, warn};
use weft_buffer::ByteBuffer;
use weft_types::{ConnectionHandle, EventContext, ListenerHandle, SocketHandle};

use crate::net::{error_code, is_per_connection_accept_error, is_transient, resolve};
use crate::reactor::not_connected;
use crate::registry::{Entry, Registry};
use crate::{
    Interest, IoEvent, PostError, Reactor, ReactorError, ReactorKind, ReactorResult, SocketRole,
};

enum PollSocket {
    Listener(TcpListener),
    Stream {
        stream: TcpStream,
        peer: SocketAddr,
        read_buffer: Option<ByteBuffer>,
    },
}

impl PollSocket {
    fn raw_fd(&self) -> RawFd {
        match self {
            Self::Listener(listener) => listener.as_raw_fd(),
            Self::Stream { stream, .. } => stream.as_raw_fd(),
        }
    }
}

/// Self-pipe used to interrupt `poll`.
struct WakePipe {
    reader: UnixStream,
    writer: UnixStream,
}

impl WakePipe {
    fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    fn wake(&self) -> io::Result<()> {
        match (&self.writer).write(&[1]) {
            Ok(_) => Ok(()),
            // A full pipe already guarantees a wakeup.
            Err(ref err) if is_transient(err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn drain(&self) {
        let mut scratch = [0u8; 64];
        while let Ok(n) = (&self.reader).read(&mut scratch) {
            if n == 0 {
                break;
            }
        }
    }
}

/// Level-triggered `poll(2)` reactor.
pub struct PollReactor {
    sockets: Registry<PollSocket>,
    pending: Mutex<VecDeque<IoEvent>>,
    wake: WakePipe,
    // Serializes waiters; also keeps the pollfd allocation between calls.
    scratch: Mutex<Vec<(pollfd, SocketHandle)>>,
}

impl PollReactor {
    pub fn new() -> ReactorResult<Self> {
        debug!("created poll reactor");
        Ok(Self {
            sockets: Registry::new(),
            pending: Mutex::new(VecDeque::new()),
            wake: WakePipe::new()?,
            scratch: Mutex::new(Vec::new()),
        })
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<IoEvent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Milliseconds for `poll`, rounding up so a short timeout never spins.
    fn timeout_ms(timeout: Option<Duration>) -> i32 {
        match timeout {
            None => -1,
            Some(d) => {
                let ms = d.as_nanos().div_ceil(1_000_000);
                i32::try_from(ms).unwrap_or(i32::MAX)
            }
        }
    }

    fn wait(fds: &mut [pollfd], timeout_ms: i32) -> io::Result<usize> {
        // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd for
        // the duration of the call and its length is passed alongside.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as nfds_t, timeout_ms) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    fn dispatch(&self, handle: SocketHandle, revents: i16, out: &mut Vec<IoEvent>) {
        let mut accepted = Vec::new();

        let listener_context = self.sockets.with(handle, |entry| {
            if let PollSocket::Listener(listener) = &entry.socket {
                if revents & POLLIN != 0 {
                    Self::accept_all(handle, listener, &mut accepted);
                }
                Some(entry.context)
            } else {
                Self::stream_ready(handle, entry, revents, out);
                None
            }
        });

        let Some(Some(context)) = listener_context else {
            return;
        };
        for (stream, peer) in accepted {
            if let Err(err) = stream.set_nonblocking(true) {
                warn!(listener = %handle, error = %err, "dropping connection that cannot be made non-blocking");
                continue;
            }
            let conn = self.sockets.insert(
                SocketRole::Connection,
                PollSocket::Stream {
                    stream,
                    peer,
                    read_buffer: None,
                },
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

    fn stream_ready(handle: ConnectionHandle, entry: &mut Entry<PollSocket>, revents: i16, out: &mut Vec<IoEvent>) {
        let PollSocket::Stream {
            stream,
            read_buffer,
            ..
        } = &mut entry.socket
        else {
            return;
        };

        if revents & POLLNVAL != 0 {
            entry.interest = Interest::NONE;
            out.push(IoEvent::error(handle, entry.context, libc::EBADF, read_buffer.take()));
            return;
        }
        if revents & POLLERR != 0 {
            let err = match stream.take_error() {
                Ok(Some(err)) | Err(err) => Some(err),
                Ok(None) => None,
            };
            if let Some(err) = err {
                entry.interest = Interest::NONE;
                out.push(IoEvent::error(handle, entry.context, error_code(&err), read_buffer.take()));
                return;
            }
        }

        let hangup = revents & (POLLHUP | POLLERR) != 0;
        if entry.interest.read && (revents & POLLIN != 0 || hangup) {
            entry.interest.read = false;
            out.push(IoEvent::read(handle, entry.context, 0, read_buffer.take()));
        }
        if entry.interest.write && (revents & POLLOUT != 0 || hangup) {
            entry.interest.write = false;
            out.push(IoEvent::write(handle, entry.context, 0));
        }
    }
}

impl Reactor for PollReactor {
    fn kind(&self) -> ReactorKind {
        ReactorKind::Poll
    }

    fn create_listener(&self, host: &str, port: u16) -> ReactorResult<ListenerHandle> {
        let addr = resolve(host, port)?;
        let bind = |addr: SocketAddr| -> io::Result<TcpListener> {
            let listener = TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            Ok(listener)
        };
        let listener = bind(addr).map_err(|source| ReactorError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let handle = self
            .sockets
            .insert(SocketRole::Listener, PollSocket::Listener(listener));
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
                Ok(())
            })
            .ok_or(ReactorError::UnknownHandle(listener))??;
        self.wake()
    }

    fn close_listener(&self, listener: ListenerHandle) {
        if self.sockets.remove(listener).is_some() {
            debug!(listener = %listener, "closed listener");
        }
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
        if let PollSocket::Stream { stream, .. } = &entry.socket {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.pending().push_back(IoEvent::close(handle, entry.context));
        trace!(handle = %handle, "closed connection");
    }

    fn post_read(&self, handle: ConnectionHandle, buffer: ByteBuffer) -> Result<(), PostError> {
        self.sockets
            .with(handle, |entry| {
                let PollSocket::Stream { read_buffer, .. } = &mut entry.socket else {
                    return Err(PostError::NotOpen(handle));
                };
                if read_buffer.is_some() {
                    return Err(PostError::Busy(handle));
                }
                *read_buffer = Some(buffer);
                entry.interest.read = true;
                Ok(())
            })
            .unwrap_or(Err(PostError::NotOpen(handle)))
    }

    fn post_write(&self, handle: ConnectionHandle, _data: &[u8]) -> Result<(), PostError> {
        self.sockets
            .with(handle, |entry| {
                if !matches!(entry.socket, PollSocket::Stream { .. }) {
                    return Err(PostError::NotOpen(handle));
                }
                entry.interest.write = true;
                Ok(())
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
            let mut scratch = self.scratch.lock().unwrap_or_else(PoisonError::into_inner);
            scratch.clear();
            scratch.push((
                pollfd {
                    fd: self.wake.reader.as_raw_fd(),
                    events: POLLIN,
                    revents: 0,
                },
                SocketHandle::from(0),
            ));
            self.sockets.for_each(|handle, entry| {
                let mut flags = 0;
                if entry.interest.read {
                    flags |= POLLIN;
                }
                if entry.interest.write {
                    flags |= POLLOUT;
                }
                if flags != 0 {
                    scratch.push((
                        pollfd {
                            fd: entry.socket.raw_fd(),
                            events: flags,
                            revents: 0,
                        },
                        handle,
                    ));
                }
            });

            let mut fds: Vec<pollfd> = scratch.iter().map(|(fd, _)| *fd).collect();
            match Self::wait(&mut fds, Self::timeout_ms(timeout)) {
                Ok(0) => return Ok(0),
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
                Err(err) => return Err(err.into()),
            }

            if fds[0].revents != 0 {
                self.wake.drain();
            }

            let mut produced = Vec::new();
            for (fd, (_, handle)) in fds.iter().zip(scratch.iter()).skip(1) {
                if fd.revents != 0 {
                    self.dispatch(*handle, fd.revents, &mut produced);
                }
            }
            drop(scratch);
            self.pending().extend(produced);
        }

        let mut pending = self.pending();
        let count = pending.len().min(max_events);
        events.extend(pending.drain(..count));
        Ok(count)
    }

    fn try_read(&self, handle: ConnectionHandle, buf: &mut [u8]) -> io::Result<usize> {
        self.sockets
            .with(handle, |entry| match &entry.socket {
                PollSocket::Stream { stream, .. } => (&*stream).read(buf),
                PollSocket::Listener(_) => Err(not_connected(handle)),
            })
            .unwrap_or_else(|| Err(not_connected(handle)))
    }

    fn try_write(&self, handle: ConnectionHandle, data: &[u8]) -> io::Result<usize> {
        self.sockets
            .with(handle, |entry| match &entry.socket {
                PollSocket::Stream { stream, .. } => (&*stream).write(data),
                PollSocket::Listener(_) => Err(not_connected(handle)),
            })
            .unwrap_or_else(|| Err(not_connected(handle)))
    }

    fn remote_address(&self, handle: ConnectionHandle) -> Option<SocketAddr> {
        self.sockets
            .with(handle, |entry| match &entry.socket {
                PollSocket::Stream { peer, .. } => Some(*peer),
                PollSocket::Listener(_) => None,
            })
            .flatten()
    }

    fn local_address(&self, handle: SocketHandle) -> Option<SocketAddr> {
        self.sockets
            .with(handle, |entry| match &entry.socket {
                PollSocket::Stream { stream, .. } => stream.local_addr().ok(),
                PollSocket::Listener(listener) => listener.local_addr().ok(),
            })
            .flatten()
    }

    fn wake(&self) -> ReactorResult<()> {
        self.wake.wake()?;
        Ok(())
    }

    fn handles(&self) -> Vec<(SocketHandle, SocketRole)> {
        self.sockets.snapshot()
    }
}

impl std::fmt::Debug for PollReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollReactor")
            .field("sockets", &self.sockets.len())
            .finish_non_exhaustive()
    }
}
