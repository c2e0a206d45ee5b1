//! # weft-tls: TLS sessions for Weft connections
//!
//! A [`SecureTransport`] turns ciphertext into plaintext and back over
//! in-memory buffers; the connection decides when bytes reach the socket.
//! Two interchangeable backends sit behind [`TlsProvider`]:
//!
//! | Provider | Engine | Roles |
//! |---|---|---|
//! | [`BufferedTlsProvider`] | `rustls::Connection` | server, client |
//! | [`UnbufferedTlsProvider`] | rustls unbuffered API | server |
//!
//! ```no_run
//! # use weft_tls::TlsConfig;
//! let provider = TlsConfig::new("cert.pem", "key.pem").build_provider()?;
//! # Ok::<(), weft_tls::TlsError>(())
//! ```

mod buffered;
mod config;
mod error;
pub mod pem;
mod transport;
mod unbuffered;

pub use buffered::{BufferedSession, BufferedTlsProvider};
pub use config::{TlsBackend, TlsClientConfig, TlsConfig, load_certs, load_private_key};
pub use error::TlsError;
pub use transport::{SecureTransport, TlsProvider, TlsResult, TlsSessionState};
pub use unbuffered::{UnbufferedSession, UnbufferedTlsProvider};
