//! Windows I/O completion port backend.
//!
//! Every socket is associated with one completion port, using its handle as
//! the completion key. Each outstanding operation lives in a heap-allocated
//! [`Operation`] whose first field is the `OVERLAPPED` the kernel writes to;
//! ownership passes to the kernel on submission and comes back when the
//! completion is dequeued. Operations still in flight when their socket is
//! closed complete with an abort status, find no entry for their key and are
//! freed silently.
//!
//! ```text
//!   post_read ──► WSARecv(op.buffer)      ──┐
//!   post_write ─► WSASend(op.data)        ──┤   GetQueuedCompletionStatusEx
//!   listening ──► AcceptEx(op.accept_sock) ─┴──► Operation ──► IoEvent
//! ```

#![allow(unsafe_code)]

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::windows::io::{AsRawSocket, FromRawSocket};
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace, warn};
use weft_buffer::ByteBuffer;
use weft_types::{ConnectionHandle, EventContext, ListenerHandle, SocketHandle};
use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, WAIT_TIMEOUT};
use windows_sys::Win32::Networking::WinSock::{
    AF_INET, AF_INET6, AcceptEx, INVALID_SOCKET, IPPROTO_TCP, SO_UPDATE_ACCEPT_CONTEXT,
    SOCK_STREAM, SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR, SOL_SOCKET, WSA_FLAG_OVERLAPPED,
    WSA_IO_PENDING, WSABUF, WSAGetLastError, WSAGetOverlappedResult, WSARecv, WSASend,
    WSASocketW, closesocket, setsockopt,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED, OVERLAPPED_ENTRY,
    PostQueuedCompletionStatus,
};
use windows_sys::Win32::System::Threading::INFINITE;

use crate::net::resolve;
use crate::reactor::unsupported_on_completion;
use crate::registry::Registry;
use crate::{
    IoEvent, PostError, Reactor, ReactorError, ReactorKind, ReactorResult, SocketRole,
};

/// Completion key reserved for `wake`.
const WAKE_KEY: usize = usize::MAX;

/// AcceptEx address slot: sockaddr storage plus the 16 bytes it requires.
const ACCEPT_ADDR_LEN: usize = mem::size_of::<SOCKADDR_STORAGE>() + 16;

/// Concurrent AcceptEx operations kept in flight per listener.
const ACCEPTS_IN_FLIGHT: usize = 4;

/// Bytes a read requests when the posted buffer is full.
const DEFAULT_READ_CHUNK: usize = 16 * 1024;

struct CompletionPort(HANDLE);

// SAFETY: a completion port handle may be used from any thread.
unsafe impl Send for CompletionPort {}
// SAFETY: all port operations are thread-safe kernel calls.
unsafe impl Sync for CompletionPort {}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        // SAFETY: the handle was returned by CreateIoCompletionPort and is
        // closed exactly once.
        unsafe { CloseHandle(self.0) };
    }
}

enum OpKind {
    Accept {
        socket: SOCKET,
        addresses: [u8; 2 * ACCEPT_ADDR_LEN],
    },
    Read {
        buffer: ByteBuffer,
        wsabuf: WSABUF,
    },
    Write {
        data: Vec<u8>,
        written: usize,
        wsabuf: WSABUF,
    },
}

#[repr(C)]
struct Operation {
    // Must stay the first field: the kernel hands back this pointer.
    overlapped: OVERLAPPED,
    handle: SocketHandle,
    kind: OpKind,
}

impl Operation {
    fn new(handle: SocketHandle, kind: OpKind) -> Box<Self> {
        Box::new(Self {
            // SAFETY: OVERLAPPED is plain data; all-zero is its initial state.
            overlapped: unsafe { mem::zeroed() },
            handle,
            kind,
        })
    }
}

enum IocpSocket {
    Listener {
        listener: TcpListener,
        ipv6: bool,
    },
    Stream {
        stream: TcpStream,
        peer: SocketAddr,
        reading: bool,
        writing: bool,
    },
}

/// I/O completion port reactor.
pub struct IocpReactor {
    port: CompletionPort,
    sockets: Registry<IocpSocket>,
    pending: Mutex<VecDeque<IoEvent>>,
    entries: Mutex<Vec<OVERLAPPED_ENTRY>>,
    read_chunk: usize,
}

// SAFETY: OVERLAPPED_ENTRY holds raw pointers that are only dereferenced by
// the thread holding the `entries` lock.
unsafe impl Send for IocpReactor {}
// SAFETY: see above; every other field is Sync.
unsafe impl Sync for IocpReactor {}

fn last_socket_error() -> io::Error {
    // SAFETY: reads thread-local WinSock error state.
    io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

impl IocpReactor {
    pub fn new() -> ReactorResult<Self> {
        // SAFETY: creating a fresh port; INVALID_HANDLE_VALUE as the file
        // handle is the documented way to do so.
        let port = unsafe {
            CreateIoCompletionPort(windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1)
        };
        if port.is_null() {
            return Err(io::Error::last_os_error().into());
        }
        debug!("created iocp reactor");
        Ok(Self {
            port: CompletionPort(port),
            sockets: Registry::new(),
            pending: Mutex::new(VecDeque::new()),
            entries: Mutex::new(Vec::new()),
            read_chunk: DEFAULT_READ_CHUNK,
        })
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<IoEvent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn associate(&self, socket: SOCKET, handle: SocketHandle) -> io::Result<()> {
        // SAFETY: `socket` is a live overlapped socket owned by this reactor.
        let rc = unsafe {
            CreateIoCompletionPort(socket as HANDLE, self.port.0, handle.as_u64() as usize, 0)
        };
        if rc.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn submit_accept(&self, listener_handle: ListenerHandle, listen_socket: SOCKET, ipv6: bool) -> io::Result<()> {
        let family = if ipv6 { AF_INET6 } else { AF_INET };
        // SAFETY: plain socket creation; the result is checked below.
        let socket = unsafe {
            WSASocketW(i32::from(family), SOCK_STREAM, IPPROTO_TCP, ptr::null(), 0, WSA_FLAG_OVERLAPPED)
        };
        if socket == INVALID_SOCKET {
            return Err(last_socket_error());
        }

        let op = Operation::new(
            listener_handle,
            OpKind::Accept {
                socket,
                addresses: [0; 2 * ACCEPT_ADDR_LEN],
            },
        );
        let raw = Box::into_raw(op);
        let mut received = 0u32;
        // SAFETY: `raw` stays alive until its completion is dequeued; the
        // address buffer lives inside it.
        let ok = unsafe {
            let OpKind::Accept { addresses, .. } = &mut (*raw).kind else {
                unreachable!("accept operation");
            };
            AcceptEx(
                listen_socket,
                socket,
                addresses.as_mut_ptr().cast(),
                0,
                ACCEPT_ADDR_LEN as u32,
                ACCEPT_ADDR_LEN as u32,
                &mut received,
                &mut (*raw).overlapped,
            )
        };
        if ok == 0 {
            let err = last_socket_error();
            if err.raw_os_error() != Some(WSA_IO_PENDING) {
                // SAFETY: the kernel did not take ownership.
                drop(unsafe { Box::from_raw(raw) });
                // SAFETY: the accept socket was never handed out.
                unsafe { closesocket(socket) };
                return Err(err);
            }
        }
        Ok(())
    }

    fn submit_read(&self, handle: ConnectionHandle, socket: SOCKET, mut buffer: ByteBuffer) -> Result<(), (io::Error, ByteBuffer)> {
        buffer.ensure_writable(self.read_chunk);
        let writable = buffer.writable_mut();
        let wsabuf = WSABUF {
            len: writable.len().min(u32::MAX as usize) as u32,
            buf: writable.as_mut_ptr(),
        };
        buffer.lock();

        let raw = Box::into_raw(Operation::new(handle, OpKind::Read { buffer, wsabuf }));
        let mut flags = 0u32;
        // SAFETY: `raw` owns the buffer the WSABUF points into and stays
        // alive until the completion is dequeued.
        let rc = unsafe {
            let OpKind::Read { wsabuf, .. } = &(*raw).kind else {
                unreachable!("read operation");
            };
            WSARecv(socket, wsabuf, 1, ptr::null_mut(), &mut flags, &mut (*raw).overlapped, None)
        };
        if rc == SOCKET_ERROR {
            let err = last_socket_error();
            if err.raw_os_error() != Some(WSA_IO_PENDING) {
                // SAFETY: the kernel did not take ownership.
                let op = unsafe { Box::from_raw(raw) };
                let OpKind::Read { mut buffer, .. } = op.kind else {
                    unreachable!("read operation");
                };
                buffer.unlock();
                return Err((err, buffer));
            }
        }
        Ok(())
    }

    /// Submits (or resubmits, after a partial completion) a write.
    fn submit_write(&self, socket: SOCKET, raw: *mut Operation) -> io::Result<()> {
        // SAFETY: `raw` is exclusively owned by the caller until submitted.
        let rc = unsafe {
            (*raw).overlapped = mem::zeroed();
            let OpKind::Write { data, written, wsabuf } = &mut (*raw).kind else {
                unreachable!("write operation");
            };
            let rest = &mut data[*written..];
            *wsabuf = WSABUF {
                len: rest.len().min(u32::MAX as usize) as u32,
                buf: rest.as_mut_ptr(),
            };
            WSASend(socket, wsabuf, 1, ptr::null_mut(), 0, &mut (*raw).overlapped, None)
        };
        if rc == SOCKET_ERROR {
            let err = last_socket_error();
            if err.raw_os_error() != Some(WSA_IO_PENDING) {
                // SAFETY: the kernel did not take ownership.
                drop(unsafe { Box::from_raw(raw) });
                return Err(err);
            }
        }
        Ok(())
    }

    fn socket_of(&self, handle: SocketHandle) -> Option<SOCKET> {
        self.sockets.with(handle, |entry| match &entry.socket {
            IocpSocket::Listener { listener, .. } => listener.as_raw_socket() as SOCKET,
            IocpSocket::Stream { stream, .. } => stream.as_raw_socket() as SOCKET,
        })
    }

    /// Outcome of a dequeued operation: transferred bytes or the OS error.
    fn completion_status(socket: SOCKET, op: &Operation) -> Result<usize, i32> {
        let mut transferred = 0u32;
        let mut flags = 0u32;
        // SAFETY: `op.overlapped` belongs to a completed operation on `socket`.
        let ok = unsafe { WSAGetOverlappedResult(socket, &op.overlapped, &mut transferred, 0, &mut flags) };
        if ok == 0 {
            // SAFETY: reads thread-local WinSock error state.
            Err(unsafe { WSAGetLastError() })
        } else {
            Ok(transferred as usize)
        }
    }

    fn complete(&self, op: Box<Operation>, out: &mut Vec<IoEvent>) {
        let handle = op.handle;
        let Some(socket) = self.socket_of(handle) else {
            trace!(handle = %handle, "dropping completion for closed socket");
            if let OpKind::Accept { socket, .. } = op.kind {
                // SAFETY: the accept socket was never handed out.
                unsafe { closesocket(socket) };
            }
            return;
        };
        let status = Self::completion_status(socket, &op);

        match op.kind {
            OpKind::Accept { socket: accepted, .. } => self.complete_accept(handle, socket, accepted, status, out),
            OpKind::Read { mut buffer, .. } => {
                buffer.unlock();
                let context = self
                    .sockets
                    .with(handle, |entry| {
                        if let IocpSocket::Stream { reading, .. } = &mut entry.socket {
                            *reading = false;
                        }
                        entry.context
                    })
                    .unwrap_or_default();
                match status {
                    Ok(n) => {
                        buffer.commit_write(n);
                        out.push(IoEvent::read(handle, context, n, Some(buffer)));
                    }
                    Err(code) => out.push(IoEvent::error(handle, context, code, Some(buffer))),
                }
            }
            OpKind::Write { data, written, wsabuf } => {
                let context = self.sockets.with(handle, |entry| entry.context).unwrap_or_default();
                match status {
                    Ok(n) if written + n < data.len() && n > 0 => {
                        let raw = Box::into_raw(Box::new(Operation {
                            // SAFETY: plain data, reset again before submission.
                            overlapped: unsafe { mem::zeroed() },
                            handle,
                            kind: OpKind::Write { data, written: written + n, wsabuf },
                        }));
                        if let Err(err) = self.submit_write(socket, raw) {
                            self.finish_write(handle);
                            out.push(IoEvent::error(handle, context, err.raw_os_error().unwrap_or(-1), None));
                        }
                    }
                    Ok(n) if n == 0 && written < data.len() => {
                        self.finish_write(handle);
                        let err = io::Error::from(io::ErrorKind::WriteZero);
                        out.push(IoEvent::error(handle, context, err.raw_os_error().unwrap_or(-1), None));
                    }
                    Ok(_) => {
                        self.finish_write(handle);
                        out.push(IoEvent::write(handle, context, data.len()));
                    }
                    Err(code) => {
                        self.finish_write(handle);
                        out.push(IoEvent::error(handle, context, code, None));
                    }
                }
            }
        }
    }

    fn finish_write(&self, handle: ConnectionHandle) {
        self.sockets.with(handle, |entry| {
            if let IocpSocket::Stream { writing, .. } = &mut entry.socket {
                *writing = false;
            }
        });
    }

    fn complete_accept(
        &self,
        listener: ListenerHandle,
        listen_socket: SOCKET,
        accepted: SOCKET,
        status: Result<usize, i32>,
        out: &mut Vec<IoEvent>,
    ) {
        let Some((context, ipv6)) = self.sockets.with(listener, |entry| match &entry.socket {
            IocpSocket::Listener { ipv6, .. } => Some((entry.context, *ipv6)),
            IocpSocket::Stream { .. } => None,
        }).flatten() else {
            // SAFETY: the accept socket was never handed out.
            unsafe { closesocket(accepted) };
            return;
        };

        if let Err(err) = self.submit_accept(listener, listen_socket, ipv6) {
            warn!(listener = %listener, error = %err, "failed to re-arm accept");
        }

        if let Err(code) = status {
            debug!(listener = %listener, code, "accept completed with error");
            // SAFETY: the accept socket was never handed out.
            unsafe { closesocket(accepted) };
            return;
        }

        // SAFETY: inherits the listener's properties so getpeername works.
        let rc = unsafe {
            setsockopt(
                accepted,
                SOL_SOCKET,
                SO_UPDATE_ACCEPT_CONTEXT,
                ptr::from_ref(&listen_socket).cast(),
                mem::size_of::<SOCKET>() as i32,
            )
        };
        // SAFETY: `accepted` is a connected socket we exclusively own.
        let stream = unsafe { TcpStream::from_raw_socket(accepted as u64) };
        if rc == SOCKET_ERROR {
            warn!(listener = %listener, error = %last_socket_error(), "failed to update accept context");
            return;
        }
        let Ok(peer) = stream.peer_addr() else {
            return;
        };

        let conn = self.sockets.insert(
            SocketRole::Connection,
            IocpSocket::Stream {
                stream,
                peer,
                reading: false,
                writing: false,
            },
        );
        if let Err(err) = self.associate(accepted, conn) {
            warn!(connection = %conn, error = %err, "failed to associate accepted socket");
            self.sockets.remove(conn);
            return;
        }
        debug!(listener = %listener, connection = %conn, peer = %peer, "accepted connection");
        out.push(IoEvent::accept(listener, context, conn));
    }
}

impl Reactor for IocpReactor {
    fn kind(&self) -> ReactorKind {
        ReactorKind::Iocp
    }

    fn create_listener(&self, host: &str, port: u16) -> ReactorResult<ListenerHandle> {
        let addr = resolve(host, port)?;
        let listener = TcpListener::bind(addr).map_err(|source| ReactorError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let socket = listener.as_raw_socket() as SOCKET;
        let handle = self.sockets.insert(
            SocketRole::Listener,
            IocpSocket::Listener {
                listener,
                ipv6: addr.is_ipv6(),
            },
        );
        if let Err(err) = self.associate(socket, handle) {
            self.sockets.remove(handle);
            return Err(err.into());
        }
        debug!(listener = %handle, addr = %addr, "created listener");
        Ok(handle)
    }

    fn start_listening(&self, listener: ListenerHandle, context: EventContext) -> ReactorResult<()> {
        let (socket, ipv6) = self
            .sockets
            .with(listener, |entry| {
                entry.context = context;
                entry.interest.read = true;
                match &entry.socket {
                    IocpSocket::Listener { listener: socket, ipv6 } => {
                        Ok((socket.as_raw_socket() as SOCKET, *ipv6))
                    }
                    IocpSocket::Stream { .. } => Err(ReactorError::WrongRole(listener)),
                }
            })
            .ok_or(ReactorError::UnknownHandle(listener))??;
        for _ in 0..ACCEPTS_IN_FLIGHT {
            self.submit_accept(listener, socket, ipv6)?;
        }
        Ok(())
    }

    fn close_listener(&self, listener: ListenerHandle) {
        if let Some(entry) = self.sockets.remove(listener) {
            // Dropping the listener closes it; in-flight AcceptEx operations
            // complete aborted and are freed in `complete`.
            drop(entry);
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
        if let IocpSocket::Stream { stream, .. } = &entry.socket {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        let context = entry.context;
        drop(entry);
        self.pending().push_back(IoEvent::close(handle, context));
        trace!(handle = %handle, "closed connection");
    }

    fn post_read(&self, handle: ConnectionHandle, buffer: ByteBuffer) -> Result<(), PostError> {
        let socket = self
            .sockets
            .with(handle, |entry| match &mut entry.socket {
                IocpSocket::Stream { stream, reading, .. } => {
                    if *reading {
                        return Err(PostError::Busy(handle));
                    }
                    *reading = true;
                    entry.interest.read = true;
                    Ok(stream.as_raw_socket() as SOCKET)
                }
                IocpSocket::Listener { .. } => Err(PostError::NotOpen(handle)),
            })
            .unwrap_or(Err(PostError::NotOpen(handle)))?;

        self.submit_read(handle, socket, buffer).map_err(|(err, _buffer)| {
            self.sockets.with(handle, |entry| {
                if let IocpSocket::Stream { reading, .. } = &mut entry.socket {
                    *reading = false;
                }
            });
            PostError::from_io(&err)
        })
    }

    fn post_write(&self, handle: ConnectionHandle, data: &[u8]) -> Result<(), PostError> {
        let socket = self
            .sockets
            .with(handle, |entry| match &mut entry.socket {
                IocpSocket::Stream { stream, writing, .. } => {
                    if *writing {
                        return Err(PostError::Busy(handle));
                    }
                    *writing = true;
                    Ok(stream.as_raw_socket() as SOCKET)
                }
                IocpSocket::Listener { .. } => Err(PostError::NotOpen(handle)),
            })
            .unwrap_or(Err(PostError::NotOpen(handle)))?;

        let op = Operation::new(
            handle,
            OpKind::Write {
                data: data.to_vec(),
                written: 0,
                wsabuf: WSABUF {
                    len: 0,
                    buf: ptr::null_mut(),
                },
            },
        );
        self.submit_write(socket, Box::into_raw(op)).map_err(|err| {
            self.finish_write(handle);
            PostError::from_io(&err)
        })
    }

    fn process_events(
        &self,
        timeout: Option<Duration>,
        max_events: usize,
        events: &mut Vec<IoEvent>,
    ) -> ReactorResult<usize> {
        let max_events = max_events.max(1);

        if self.pending().is_empty() {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if entries.len() < max_events {
                // SAFETY: OVERLAPPED_ENTRY is plain data.
                entries.resize(max_events, unsafe { mem::zeroed() });
            }
            let millis = timeout.map_or(INFINITE, |d| {
                u32::try_from(d.as_nanos().div_ceil(1_000_000)).unwrap_or(INFINITE - 1)
            });
            let mut removed = 0u32;
            // SAFETY: `entries` has room for `max_events` entries.
            let ok = unsafe {
                GetQueuedCompletionStatusEx(
                    self.port.0,
                    entries.as_mut_ptr(),
                    max_events as u32,
                    &mut removed,
                    millis,
                    0,
                )
            };
            if ok == 0 {
                // SAFETY: reads thread-local error state.
                let code = unsafe { GetLastError() };
                if code == WAIT_TIMEOUT {
                    return Ok(0);
                }
                return Err(io::Error::from_raw_os_error(code as i32).into());
            }

            let mut produced = Vec::new();
            for entry in &entries[..removed as usize] {
                if entry.lpCompletionKey == WAKE_KEY || entry.lpOverlapped.is_null() {
                    continue;
                }
                // SAFETY: every non-wake completion carries an Operation we
                // leaked with Box::into_raw; OVERLAPPED is its first field.
                let op = unsafe { Box::from_raw(entry.lpOverlapped.cast::<Operation>()) };
                self.complete(op, &mut produced);
            }
            drop(entries);
            self.pending().extend(produced);
        }

        let mut pending = self.pending();
        let count = pending.len().min(max_events);
        events.extend(pending.drain(..count));
        Ok(count)
    }

    fn try_read(&self, _handle: ConnectionHandle, _buf: &mut [u8]) -> io::Result<usize> {
        Err(unsupported_on_completion())
    }

    fn try_write(&self, _handle: ConnectionHandle, _data: &[u8]) -> io::Result<usize> {
        Err(unsupported_on_completion())
    }

    fn remote_address(&self, handle: ConnectionHandle) -> Option<SocketAddr> {
        self.sockets
            .with(handle, |entry| match &entry.socket {
                IocpSocket::Stream { peer, .. } => Some(*peer),
                IocpSocket::Listener { .. } => None,
            })
            .flatten()
    }

    fn local_address(&self, handle: SocketHandle) -> Option<SocketAddr> {
        self.sockets
            .with(handle, |entry| match &entry.socket {
                IocpSocket::Stream { stream, .. } => stream.local_addr().ok(),
                IocpSocket::Listener { listener, .. } => listener.local_addr().ok(),
            })
            .flatten()
    }

    fn wake(&self) -> ReactorResult<()> {
        // SAFETY: posts a key-only packet; no OVERLAPPED is involved.
        let ok = unsafe { PostQueuedCompletionStatus(self.port.0, 0, WAKE_KEY, ptr::null()) };
        if ok == 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn handles(&self) -> Vec<(SocketHandle, SocketRole)> {
        self.sockets.snapshot()
    }
}

impl Drop for IocpReactor {
    fn drop(&mut self) {
        // Close every socket first so in-flight operations abort, then reap
        // their completions so the leaked Operation boxes are freed.
        for (handle, _) in self.sockets.snapshot() {
            self.sockets.remove(handle);
        }
        let mut events = Vec::new();
        while let Ok(n) = self.process_events(Some(Duration::ZERO), 64, &mut events) {
            if n == 0 {
                break;
            }
            events.clear();
        }
    }
}
