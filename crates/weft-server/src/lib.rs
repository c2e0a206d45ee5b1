//! # weft-server: connection lifecycle and event loop
//!
//! Ties the lower layers together for each accepted socket:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                Application (SessionManager)                │
//! └─────────────▲──────────────────────────────┬───────────────┘
//!   lines, open/close                          │ ServerHandle (command queue)
//! ┌─────────────┴──────────────────────────────▼───────────────┐
//! │  Server: poll_once → dispatch → Connection::handle_event   │
//! │  Connection: state machine + TLS/protocol pipeline         │
//! │  RawIo: ReadinessIo | CompletionIo                         │
//! └─────────────▲──────────────────────────────┬───────────────┘
//!               │ IoEvent                      │ post / try_*
//! ┌─────────────┴──────────────────────────────▼───────────────┐
//! │                    weft-reactor backend                    │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use weft_server::{Server, ServerConfig};
//!
//! let config = ServerConfig::new("0.0.0.0:4000");
//! let mut server = Server::new(config, Box::new(MySessions::default()))?;
//! let shutdown = server.shutdown_handle();
//! server.run()?;
//! ```

mod config;
mod connection;
mod error;
mod handle;
mod io;
pub mod metrics;
mod server;
mod session;
mod state;

pub use config::{ListenerConfig, ServerConfig, TlsMode};
pub use connection::Connection;
pub use error::{ServerError, ServerResult};
pub use handle::{ServerHandle, ShutdownHandle};
pub use metrics::Metrics;
pub use server::Server;
pub use session::SessionManager;
pub use state::ConnectionState;

#[cfg(test)]
mod tests;
