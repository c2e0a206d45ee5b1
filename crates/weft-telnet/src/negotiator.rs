//! The contract a connection uses to speak its line protocol.

use std::fmt;
use std::time::Instant;

use weft_buffer::ByteBuffer;

use crate::{ClientInfo, ProtocolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStatus {
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for NegotiationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// Byte-level protocol state for one connection.
///
/// All methods are synchronous and never block; time is passed in so the
/// caller's clock (and tests) decide when timeouts fire.
pub trait ProtocolNegotiator: Send {
    /// Writes the opening offers and requests to `out` and starts the
    /// negotiation timer.
    fn start_negotiation(&mut self, out: &mut ByteBuffer, now: Instant);

    /// Parses peer bytes. Complete lines (each ending in a single `\n`) go
    /// to `app_out`; negotiation replies go to `responses`.
    ///
    /// Returns how many bytes of `input` were consumed. That is all of them
    /// unless the peer announced a TLS upgrade, in which case parsing stops
    /// right after the announcement and the remainder is TLS.
    fn process_input(
        &mut self,
        input: &[u8],
        app_out: &mut ByteBuffer,
        responses: &mut ByteBuffer,
    ) -> ProtocolResult<usize>;

    fn negotiation_status(&mut self, now: Instant) -> NegotiationStatus;

    /// Completed because the timer ran out rather than because the
    /// essential options settled.
    fn timed_out(&self) -> bool {
        false
    }

    /// Escapes application text for the wire.
    fn format_output(&self, text: &[u8], out: &mut ByteBuffer);

    /// Like [`format_output`](Self::format_output), followed by the
    /// end-of-prompt marker the client negotiated.
    fn format_prompt(&self, text: &[u8], out: &mut ByteBuffer);

    fn client_info(&self) -> &ClientInfo;

    /// Returns true once per accepted TLS upgrade.
    fn take_upgrade_request(&mut self) -> bool;

    /// Records that the transport is now encrypted.
    fn set_secure(&mut self, secure: bool);

    /// Asks the client to echo locally (`true`) or to let the server take
    /// over echoing, which hides typed input (`false`).
    fn set_echo(&mut self, client_echo: bool, out: &mut ByteBuffer);
}
