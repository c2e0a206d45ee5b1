//! The uniform reactor contract.
//!
//! [`Reactor`] hides two I/O models that cannot share an implementation:
//!
//! - **Readiness** (epoll, kqueue, poll): `post_read` parks the caller's
//!   buffer and arms read interest; the Read event hands the buffer back and
//!   the caller drains the socket itself with [`Reactor::try_read`] until it
//!   would block. `post_write` only arms write interest: exactly one Write
//!   event follows and interest is revoked again, so the caller writes with
//!   [`Reactor::try_write`] and re-posts if bytes remain.
//! - **Completion** (IOCP, and an emulation over mio): `post_read` submits one
//!   read into the caller's buffer and the Read event returns it with the
//!   exact byte count (0 means orderly shutdown). `post_write` copies the bytes
//!   and the Write event reports them all written. Nothing is re-delivered:
//!   the caller posts the next operation itself.

use std::fmt::{self, Display};
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weft_buffer::ByteBuffer;
use weft_types::{ConnectionHandle, EventContext, ListenerHandle, SocketHandle};

use crate::{IoEvent, PostError, ReactorResult};

/// Which notification style a backend implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoModel {
    Readiness,
    Completion,
}

/// Role of a socket in a reactor's handle map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketRole {
    Listener,
    Connection,
}

/// Read/write interest flags of one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };

    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

/// Reactor backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactorKind {
    /// Best backend for the platform.
    #[default]
    Auto,
    /// Linux epoll (readiness).
    Epoll,
    /// BSD/macOS kqueue (readiness).
    Kqueue,
    /// `poll(2)`, the portable select-family fallback (readiness).
    Poll,
    /// Completion semantics emulated over readiness notifications.
    EmulatedCompletion,
    /// Windows I/O completion ports.
    Iocp,
    /// In-process sockets for tests and simulation (readiness).
    Memory,
}

impl ReactorKind {
    /// Replaces `Auto` with the platform default.
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto => {
                if cfg!(target_os = "linux") || cfg!(target_os = "android") {
                    Self::Epoll
                } else if cfg!(any(
                    target_os = "macos",
                    target_os = "ios",
                    target_os = "freebsd",
                    target_os = "netbsd",
                    target_os = "openbsd",
                    target_os = "dragonfly"
                )) {
                    Self::Kqueue
                } else if cfg!(windows) {
                    Self::Iocp
                } else {
                    Self::Poll
                }
            }
            other => other,
        }
    }

    /// Whether this backend can run on the current platform.
    pub fn is_available(self) -> bool {
        match self.resolve() {
            Self::Epoll => cfg!(any(target_os = "linux", target_os = "android")),
            Self::Kqueue => cfg!(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            )),
            Self::Poll | Self::EmulatedCompletion => cfg!(unix),
            Self::Iocp => cfg!(windows),
            Self::Memory | Self::Auto => true,
        }
    }

    pub fn model(self) -> IoModel {
        match self.resolve() {
            Self::EmulatedCompletion | Self::Iocp => IoModel::Completion,
            _ => IoModel::Readiness,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Epoll => "epoll",
            Self::Kqueue => "kqueue",
            Self::Poll => "poll",
            Self::EmulatedCompletion => "emulated_completion",
            Self::Iocp => "iocp",
            Self::Memory => "memory",
        }
    }
}

impl Display for ReactorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReactorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(Self::Auto),
            "epoll" => Ok(Self::Epoll),
            "kqueue" => Ok(Self::Kqueue),
            "poll" | "select" => Ok(Self::Poll),
            "emulated_completion" | "completion" => Ok(Self::EmulatedCompletion),
            "iocp" => Ok(Self::Iocp),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown reactor kind '{other}'")),
        }
    }
}

/// OS-event-driven socket multiplexer.
///
/// Every backend keeps a mutex-protected, generation-checked map from handle
/// to `{role, context, interest, native socket}`. Listener and connection
/// sockets share the map; closing a listener never touches connections it
/// already accepted. Events for handles that left the map are dropped
/// silently, so a stale notification can never reach a reused slot.
///
/// Would-block and interrupted conditions are never events. Socket errors are
/// reported once as [`IoEventKind::Error`](crate::IoEventKind::Error) and the
/// reactor never retries a failed operation.
pub trait Reactor: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> ReactorKind;

    /// Which I/O model the connection layer must drive.
    fn model(&self) -> IoModel {
        self.kind().model()
    }

    /// Binds a listening socket. It accepts nothing until `start_listening`.
    fn create_listener(&self, host: &str, port: u16) -> ReactorResult<ListenerHandle>;

    /// Starts accepting. Accept events carry `context`.
    fn start_listening(&self, listener: ListenerHandle, context: EventContext)
    -> ReactorResult<()>;

    /// Stops accepting and releases the listening socket.
    fn close_listener(&self, listener: ListenerHandle);

    /// Binds an opaque context to a socket for later event dispatch.
    fn associate_context(&self, handle: SocketHandle, context: EventContext) -> ReactorResult<()>;

    /// Releases a connection socket.
    ///
    /// Idempotent. The first call for a live handle queues exactly one
    /// [`IoEventKind::Close`](crate::IoEventKind::Close) carrying the bound
    /// context; later calls do nothing.
    fn close_connection(&self, handle: ConnectionHandle);

    /// Submits (completion) or arms (readiness) a read into `buffer`.
    ///
    /// The buffer comes back in the Read or Error event.
    fn post_read(&self, handle: ConnectionHandle, buffer: ByteBuffer) -> Result<(), PostError>;

    /// Submits (completion) or arms (readiness) a write.
    ///
    /// Completion backends copy `data`. Readiness backends ignore it and only
    /// arm write interest.
    fn post_write(&self, handle: ConnectionHandle, data: &[u8]) -> Result<(), PostError>;

    /// Waits up to `timeout` (forever when `None`) and appends at most
    /// `max_events` events to `events`.
    ///
    /// Returns the number of events appended, 0 on timeout.
    fn process_events(
        &self,
        timeout: Option<Duration>,
        max_events: usize,
        events: &mut Vec<IoEvent>,
    ) -> ReactorResult<usize>;

    /// Non-blocking native read used by the readiness connection flavor.
    ///
    /// `Ok(0)` is orderly shutdown; `WouldBlock` ends the drain loop.
    fn try_read(&self, handle: ConnectionHandle, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking native write used by the readiness connection flavor.
    fn try_write(&self, handle: ConnectionHandle, data: &[u8]) -> io::Result<usize>;

    fn remote_address(&self, handle: ConnectionHandle) -> Option<SocketAddr>;

    fn local_address(&self, handle: SocketHandle) -> Option<SocketAddr>;

    /// Human-readable text for an OS error code.
    fn error_string(&self, code: i32) -> String {
        io::Error::from_raw_os_error(code).to_string()
    }

    /// Interrupts a blocked `process_events` from another thread.
    fn wake(&self) -> ReactorResult<()>;

    /// Snapshot of every live handle.
    fn handles(&self) -> Vec<(SocketHandle, SocketRole)>;
}

pub(crate) fn unsupported_on_completion() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "completion reactors do not support direct socket reads or writes",
    )
}

pub(crate) fn not_connected(handle: SocketHandle) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        format!("connection {handle} is not open"),
    )
}
