//! Protocol error types.

use thiserror::Error;

use crate::consts::option_name;

/// Result type for input processing.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Peer input the negotiator cannot recover from. The connection closes
/// with `CloseReason::ProtocolError`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A subnegotiation grew past the configured limit without `IAC SE`.
    #[error("subnegotiation for option {option} ({}) exceeds {limit} bytes", option_name(*.option))]
    SubnegotiationTooLong { option: u8, limit: usize },

    /// `IAC` inside a subnegotiation followed by something other than
    /// `IAC` or `SE`.
    #[error("malformed subnegotiation for option {option}: IAC followed by {byte}")]
    MalformedSubnegotiation { option: u8, byte: u8 },
}
