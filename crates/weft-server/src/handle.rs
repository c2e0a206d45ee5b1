//! Cross-thread access to a running server.
//!
//! The event loop owns every connection. Other threads (and the session
//! layer itself) reach connections by pushing [`Command`]s onto a bounded
//! lock-free queue and waking the reactor; the loop drains the queue after
//! each batch of events.
//!
//! A full queue hands the command back as backpressure instead of blocking
//! the producer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::ArrayQueue;
use tracing::{trace, warn};
use weft_reactor::Reactor;
use weft_types::{CloseReason, ConnectionHandle};

/// A request for the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Send {
        handle: ConnectionHandle,
        text: String,
        prompt: bool,
    },
    SetEcho {
        handle: ConnectionHandle,
        client_echo: bool,
    },
    Close {
        handle: ConnectionHandle,
        reason: CloseReason,
    },
}

/// Result of attempting to queue a command.
#[derive(Debug)]
pub(crate) enum PushResult<T> {
    Ok,
    /// Queue is full. Returns the command for the caller to handle.
    Backpressure(T),
}

pub(crate) struct Shared {
    commands: ArrayQueue<Command>,
    shutdown: AtomicBool,
    reactor: Arc<dyn Reactor>,
}

impl Shared {
    pub(crate) fn new(capacity: usize, reactor: Arc<dyn Reactor>) -> Self {
        Self {
            commands: ArrayQueue::new(capacity.max(1)),
            shutdown: AtomicBool::new(false),
            reactor,
        }
    }

    fn try_push(&self, command: Command) -> PushResult<Command> {
        match self.commands.push(command) {
            Ok(()) => {
                self.wake();
                PushResult::Ok
            }
            Err(command) => PushResult::Backpressure(command),
        }
    }

    pub(crate) fn pop(&self) -> Option<Command> {
        self.commands.pop()
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            trace!("shutdown requested");
        }
        self.wake();
    }

    fn wake(&self) {
        if let Err(e) = self.reactor.wake() {
            warn!(error = %e, "failed to wake event loop");
        }
    }
}

/// Cloneable handle for sending to and closing connections from any thread.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Queues `text` for a connection. Text sent before the connection is
    /// running is held and flushed when it gets there.
    ///
    /// Returns false if the command queue is full.
    pub fn send(&self, handle: ConnectionHandle, text: impl Into<String>) -> bool {
        self.push(Command::Send {
            handle,
            text: text.into(),
            prompt: false,
        })
    }

    /// Like [`send`](Self::send), followed by the protocol's prompt marker.
    pub fn send_prompt(&self, handle: ConnectionHandle, text: impl Into<String>) -> bool {
        self.push(Command::Send {
            handle,
            text: text.into(),
            prompt: true,
        })
    }

    /// Asks the client to stop echoing input (`false`), e.g. around a
    /// password prompt, or to resume (`true`).
    pub fn set_echo(&self, handle: ConnectionHandle, client_echo: bool) -> bool {
        self.push(Command::SetEcho {
            handle,
            client_echo,
        })
    }

    pub fn close(&self, handle: ConnectionHandle, reason: CloseReason) -> bool {
        self.push(Command::Close { handle, reason })
    }

    pub fn shutdown(&self) {
        self.shared.request_shutdown();
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn push(&self, command: Command) -> bool {
        match self.shared.try_push(command) {
            PushResult::Ok => true,
            PushResult::Backpressure(command) => {
                warn!(?command, "server command queue full, dropping");
                false
            }
        }
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("queued", &self.shared.commands.len())
            .finish_non_exhaustive()
    }
}

/// Stops a running server from another thread or a signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    /// Starts a graceful shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.shared.request_shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown_requested()
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
