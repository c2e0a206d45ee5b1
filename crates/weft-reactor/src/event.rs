//! Normalized reactor notifications.

use weft_buffer::ByteBuffer;
use weft_types::{ConnectionHandle, EventContext, ListenerHandle, SocketHandle};

/// What happened on a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoEventKind {
    /// A listener produced a new connection (see [`IoEvent::accepted`]).
    Accept,
    /// Readiness: the socket is readable. Completion: a posted read finished.
    Read,
    /// Readiness: the socket is writable. Completion: a posted write finished.
    Write,
    /// The reactor released the socket after `close_connection`.
    Close,
    /// A socket-level error, carrying the OS code.
    Error,
}

/// One reactor notification.
///
/// Produced by `process_events`, consumed immediately by the dispatcher and
/// not retained.
#[derive(Debug)]
pub struct IoEvent {
    pub kind: IoEventKind,
    /// The socket the event is about (the listener, for `Accept`).
    pub handle: SocketHandle,
    /// The new connection, for `Accept` only.
    pub accepted: Option<ConnectionHandle>,
    /// Exact transfer size for completion-model reads and writes; 0 otherwise.
    pub bytes: usize,
    /// OS error code, for `Error` only.
    pub error: Option<i32>,
    /// Context bound to `handle` when the event was produced.
    pub context: EventContext,
    /// The buffer handed over by `post_read`, returned to its owner.
    pub buffer: Option<ByteBuffer>,
}

impl IoEvent {
    pub(crate) fn accept(
        listener: ListenerHandle,
        context: EventContext,
        accepted: ConnectionHandle,
    ) -> Self {
        Self {
            kind: IoEventKind::Accept,
            handle: listener,
            accepted: Some(accepted),
            bytes: 0,
            error: None,
            context,
            buffer: None,
        }
    }

    pub(crate) fn read(
        handle: ConnectionHandle,
        context: EventContext,
        bytes: usize,
        buffer: Option<ByteBuffer>,
    ) -> Self {
        Self {
            kind: IoEventKind::Read,
            handle,
            accepted: None,
            bytes,
            error: None,
            context,
            buffer,
        }
    }

    pub(crate) fn write(handle: ConnectionHandle, context: EventContext, bytes: usize) -> Self {
        Self {
            kind: IoEventKind::Write,
            handle,
            accepted: None,
            bytes,
            error: None,
            context,
            buffer: None,
        }
    }

    pub(crate) fn close(handle: SocketHandle, context: EventContext) -> Self {
        Self {
            kind: IoEventKind::Close,
            handle,
            accepted: None,
            bytes: 0,
            error: None,
            context,
            buffer: None,
        }
    }

    pub(crate) fn error(
        handle: SocketHandle,
        context: EventContext,
        code: i32,
        buffer: Option<ByteBuffer>,
    ) -> Self {
        Self {
            kind: IoEventKind::Error,
            handle,
            accepted: None,
            bytes: 0,
            error: Some(code),
            context,
            buffer,
        }
    }

    /// Takes the attached buffer, unlocking it for the caller.
    pub fn take_buffer(&mut self) -> Option<ByteBuffer> {
        let mut buffer = self.buffer.take()?;
        buffer.unlock();
        Some(buffer)
    }
}
