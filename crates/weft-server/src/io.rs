//! The raw-byte step, the one part of a connection that differs between
//! I/O models.
//!
//! - [`ReadinessIo`]: told a socket is ready, drains it with `try_read`
//!   until it would block (capped per event) and writes with `try_write`
//!   until the socket buffer fills, then re-arms write interest.
//! - [`CompletionIo`]: trusts the byte count of one finished read, forwards
//!   it and posts the next read at once; keeps at most one write in flight.
//!
//! Everything above this step (TLS, protocol, session delivery) is shared.

use std::io;

use weft_buffer::{BufferPool, ByteBuffer};
use weft_reactor::{IoEvent, IoModel, PostError, Reactor};
use weft_types::ConnectionHandle;

/// Largest single completion-model write.
const MAX_COMPLETION_WRITE: usize = 64 * 1024;

/// Outcome of one Read event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ReadOutcome {
    /// Bytes appended to the caller's buffer.
    pub bytes: usize,
    /// The peer shut down its sending side.
    pub eof: bool,
}

/// A fatal socket failure, already rendered for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IoFailure {
    pub code: Option<i32>,
    pub message: String,
}

impl From<io::Error> for IoFailure {
    fn from(err: io::Error) -> Self {
        Self {
            code: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}

impl From<PostError> for IoFailure {
    fn from(err: PostError) -> Self {
        let code = match &err {
            PostError::Os { code, .. } => Some(*code),
            PostError::NotOpen(_) | PostError::Busy(_) => None,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for IoFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (os error {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

pub(crate) enum RawIo {
    Readiness(ReadinessIo),
    Completion(CompletionIo),
}

impl RawIo {
    pub(crate) fn for_model(model: IoModel, read_size: usize, max_read_per_event: usize) -> Self {
        match model {
            IoModel::Readiness => Self::Readiness(ReadinessIo::new(read_size, max_read_per_event)),
            IoModel::Completion => Self::Completion(CompletionIo::new()),
        }
    }

    /// Posts the first read.
    pub(crate) fn start(
        &mut self,
        reactor: &dyn Reactor,
        handle: ConnectionHandle,
        pool: &BufferPool,
    ) -> Result<(), IoFailure> {
        match self {
            Self::Readiness(io) => io.arm_read(reactor, handle),
            Self::Completion(io) => io.post_read(reactor, handle, pool),
        }
    }

    /// Moves the bytes a Read event stands for into `into`.
    pub(crate) fn on_read(
        &mut self,
        reactor: &dyn Reactor,
        handle: ConnectionHandle,
        event: &mut IoEvent,
        into: &mut ByteBuffer,
        pool: &BufferPool,
    ) -> Result<ReadOutcome, IoFailure> {
        match self {
            Self::Readiness(io) => io.on_read(reactor, handle, event, into),
            Self::Completion(io) => io.on_read(reactor, handle, event, into, pool),
        }
    }

    /// Keeps input flowing after a Read event has been processed.
    pub(crate) fn rearm_read(
        &mut self,
        reactor: &dyn Reactor,
        handle: ConnectionHandle,
        pool: &BufferPool,
    ) -> Result<(), IoFailure> {
        match self {
            Self::Readiness(io) => io.arm_read(reactor, handle),
            Self::Completion(io) => io.post_read(reactor, handle, pool),
        }
    }

    /// Hands as much of `out` to the socket as it takes now. Returns the
    /// byte count handed over.
    pub(crate) fn flush(
        &mut self,
        reactor: &dyn Reactor,
        handle: ConnectionHandle,
        out: &mut ByteBuffer,
    ) -> Result<usize, IoFailure> {
        match self {
            Self::Readiness(io) => io.flush(reactor, handle, out),
            Self::Completion(io) => io.flush(reactor, handle, out),
        }
    }

    pub(crate) fn on_write(&mut self, event: &IoEvent) {
        match self {
            Self::Readiness(io) => io.write_armed = false,
            Self::Completion(io) => {
                debug_assert!(
                    io.write_in_flight.is_none_or(|n| n == event.bytes),
                    "completion write size mismatch"
                );
                io.write_in_flight = None;
            }
        }
    }

    /// Returns any buffer the reactor handed back with an Error event.
    pub(crate) fn on_error(&mut self, event: &mut IoEvent, pool: &BufferPool) {
        if let Some(buffer) = event.take_buffer() {
            pool.put(buffer);
        }
        match self {
            Self::Readiness(io) => {
                io.read_armed = false;
                io.write_armed = false;
            }
            Self::Completion(io) => {
                io.read_posted = false;
                io.write_in_flight = None;
            }
        }
    }

    /// Bytes handed to the socket but not yet confirmed.
    pub(crate) fn in_flight(&self) -> usize {
        match self {
            Self::Readiness(_) => 0,
            Self::Completion(io) => io.write_in_flight.unwrap_or(0),
        }
    }
}

// ============================================================================
// Readiness
// ============================================================================

pub(crate) struct ReadinessIo {
    scratch: Vec<u8>,
    max_read_per_event: usize,
    read_armed: bool,
    write_armed: bool,
}

impl ReadinessIo {
    fn new(read_size: usize, max_read_per_event: usize) -> Self {
        Self {
            scratch: vec![0; read_size.max(512)],
            max_read_per_event: max_read_per_event.max(1),
            read_armed: false,
            write_armed: false,
        }
    }

    fn arm_read(&mut self, reactor: &dyn Reactor, handle: ConnectionHandle) -> Result<(), IoFailure> {
        if self.read_armed {
            return Ok(());
        }
        // Readiness backends only park the buffer; an empty one costs nothing.
        reactor.post_read(handle, ByteBuffer::new())?;
        self.read_armed = true;
        Ok(())
    }

    fn on_read(
        &mut self,
        reactor: &dyn Reactor,
        handle: ConnectionHandle,
        event: &mut IoEvent,
        into: &mut ByteBuffer,
    ) -> Result<ReadOutcome, IoFailure> {
        self.read_armed = false;
        drop(event.take_buffer());

        let mut outcome = ReadOutcome::default();
        while outcome.bytes < self.max_read_per_event {
            match reactor.try_read(handle, &mut self.scratch) {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    into.append(&self.scratch[..n]);
                    outcome.bytes += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(outcome)
    }

    fn flush(
        &mut self,
        reactor: &dyn Reactor,
        handle: ConnectionHandle,
        out: &mut ByteBuffer,
    ) -> Result<usize, IoFailure> {
        let mut written = 0;
        while !out.is_empty() {
            match reactor.try_write(handle, out.readable()) {
                Ok(0) => break,
                Ok(n) => {
                    out.consume_read(n);
                    written += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        // Socket buffer full: ask for exactly one Write event.
        if !out.is_empty() && !self.write_armed {
            reactor.post_write(handle, &[])?;
            self.write_armed = true;
        }
        Ok(written)
    }
}

// ============================================================================
// Completion
// ============================================================================

pub(crate) struct CompletionIo {
    read_posted: bool,
    write_in_flight: Option<usize>,
}

impl CompletionIo {
    fn new() -> Self {
        Self {
            read_posted: false,
            write_in_flight: None,
        }
    }

    fn post_read(
        &mut self,
        reactor: &dyn Reactor,
        handle: ConnectionHandle,
        pool: &BufferPool,
    ) -> Result<(), IoFailure> {
        if self.read_posted {
            return Ok(());
        }
        reactor.post_read(handle, pool.get())?;
        self.read_posted = true;
        Ok(())
    }

    fn on_read(
        &mut self,
        reactor: &dyn Reactor,
        handle: ConnectionHandle,
        event: &mut IoEvent,
        into: &mut ByteBuffer,
        pool: &BufferPool,
    ) -> Result<ReadOutcome, IoFailure> {
        self.read_posted = false;
        if event.bytes == 0 {
            if let Some(buffer) = event.take_buffer() {
                pool.put(buffer);
            }
            return Ok(ReadOutcome {
                bytes: 0,
                eof: true,
            });
        }

        if let Some(buffer) = event.take_buffer() {
            // Posted buffers start empty, so the tail is exactly this read.
            let readable = buffer.readable();
            let start = readable.len().saturating_sub(event.bytes);
            into.append(&readable[start..]);
            pool.put(buffer);
        }

        // No re-delivery in this model: the next read must be posted now.
        self.post_read(reactor, handle, pool)?;
        Ok(ReadOutcome {
            bytes: event.bytes,
            eof: false,
        })
    }

    fn flush(
        &mut self,
        reactor: &dyn Reactor,
        handle: ConnectionHandle,
        out: &mut ByteBuffer,
    ) -> Result<usize, IoFailure> {
        if self.write_in_flight.is_some() || out.is_empty() {
            return Ok(0);
        }
        let n = out.readable_bytes().min(MAX_COMPLETION_WRITE);
        reactor.post_write(handle, &out.readable()[..n])?;
        // The reactor copied the bytes.
        out.consume_read(n);
        self.write_in_flight = Some(n);
        Ok(n)
    }
}
