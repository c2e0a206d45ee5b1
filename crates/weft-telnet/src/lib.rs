//! # weft-telnet: the line protocol spoken by Weft connections
//!
//! [`TelnetNegotiator`] implements [`ProtocolNegotiator`] for RFC 854 telnet:
//! it frames input into lines, answers option negotiation, collects what the
//! client reports about its terminal and escapes output for the wire.
//!
//! Options handled:
//!
//! | Option | Side | Purpose |
//! |---|---|---|
//! | SGA, EOR | server | prompt marking (`IAC EOR`, else `IAC GA`) |
//! | ECHO | server | hiding typed passwords via [`ProtocolNegotiator::set_echo`] |
//! | TTYPE, NAWS, NEW-ENVIRON, CHARSET | client | [`ClientInfo`] |
//! | START_TLS | client | in-band TLS upgrade, per [`StartTlsPolicy`] |

mod client;
mod config;
pub mod consts;
mod error;
mod format;
mod negotiator;
pub mod options;
mod telnet;

pub use client::ClientInfo;
pub use config::{NegotiationConfig, StartTlsPolicy};
pub use error::{ProtocolError, ProtocolResult};
pub use format::escape_output;
pub use negotiator::{NegotiationStatus, ProtocolNegotiator};
pub use options::{NegotiationState, OptionState};
pub use telnet::TelnetNegotiator;

#[cfg(test)]
mod tests;
