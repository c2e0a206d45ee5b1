//! # weft-reactor: socket multiplexing for Weft
//!
//! One [`Reactor`] contract over heterogeneous OS notification models:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     weft-server (Connection)                 │
//! │          drives ReadinessIo or CompletionIo per model()      │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ Reactor trait
//! ┌──────────┬──────────┬────────┴─┬───────────────────┬─────────┐
//! │  epoll   │  kqueue  │   poll   │ emulated complet. │  IOCP   │
//! │ (mio)    │ (mio)    │  (libc)  │ (mio)             │(win-sys)│
//! └──────────┴──────────┴──────────┴───────────────────┴─────────┘
//!                     + MemoryReactor (tests)
//! ```
//!
//! Backends are chosen at startup with [`create`]; [`ReactorKind::Auto`]
//! picks the native one for the platform.

use std::sync::Arc;

use tracing::info;

mod error;
mod event;
mod memory;
mod mio_backend;
mod net;
mod reactor;
mod registry;

#[cfg(windows)]
mod iocp;
#[cfg(unix)]
mod poll;

pub use error::{PostError, ReactorError, ReactorResult};
pub use event::{IoEvent, IoEventKind};
pub use memory::MemoryReactor;
pub use mio_backend::MioReactor;
pub use reactor::{Interest, IoModel, Reactor, ReactorKind, SocketRole};

#[cfg(windows)]
pub use iocp::IocpReactor;
#[cfg(unix)]
pub use poll::PollReactor;

/// Creates the reactor backend for `kind`.
///
/// `Auto` resolves to the platform's native backend. Requesting a backend the
/// platform lacks is an error rather than a silent fallback.
pub fn create(kind: ReactorKind) -> ReactorResult<Arc<dyn Reactor>> {
    let resolved = kind.resolve();
    if !resolved.is_available() {
        return Err(ReactorError::Unavailable(resolved));
    }

    let reactor: Arc<dyn Reactor> = match resolved {
        ReactorKind::Epoll | ReactorKind::Kqueue => Arc::new(MioReactor::readiness()?),
        ReactorKind::EmulatedCompletion => Arc::new(MioReactor::emulated_completion()?),
        #[cfg(unix)]
        ReactorKind::Poll => Arc::new(PollReactor::new()?),
        #[cfg(windows)]
        ReactorKind::Iocp => Arc::new(IocpReactor::new()?),
        ReactorKind::Memory => Arc::new(MemoryReactor::readiness()),
        other => return Err(ReactorError::Unavailable(other)),
    };

    info!(requested = %kind, backend = %reactor.kind(), "reactor selected");
    Ok(reactor)
}

#[cfg(test)]
mod tests;
