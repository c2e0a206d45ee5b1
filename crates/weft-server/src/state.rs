//! Connection lifecycle states.
//!
//! ```text
//!                 ┌──────────────────────────┐
//!                 │                          ▼
//! Initializing ──►├─► TlsHandshaking ──► Negotiating ──► Running
//!                 │        ▲   │              │  ▲          │
//!                 │        │   └──────────────┼──┘          │
//!                 │        └─────(START_TLS)──┴─────────────┘
//!                 ▼
//!   any live state ──► Closing ──► Closed
//! ```
//!
//! A START_TLS upgrade returns to whichever state it interrupted.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initializing,
    TlsHandshaking,
    Negotiating,
    Running,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal lifecycle move.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::{Closed, Closing, Initializing, Negotiating, Running, TlsHandshaking};

        match (self, next) {
            (Initializing, TlsHandshaking | Negotiating)
            | (TlsHandshaking, Negotiating | Running)
            | (Negotiating, TlsHandshaking | Running)
            | (Running, TlsHandshaking)
            | (Closing, Closed) => true,
            (Initializing | TlsHandshaking | Negotiating | Running, Closing) => true,
            _ => false,
        }
    }

    /// Not yet closing.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Closing | Self::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::TlsHandshaking => "tls_handshaking",
            Self::Negotiating => "negotiating",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::ConnectionState::{self, *};

    const ALL: [ConnectionState; 6] = [Initializing, TlsHandshaking, Negotiating, Running, Closing, Closed];

    #[test_case(Initializing, TlsHandshaking; "implicit tls")]
    #[test_case(Initializing, Negotiating; "plain")]
    #[test_case(TlsHandshaking, Negotiating; "handshake done")]
    #[test_case(Negotiating, Running; "negotiated")]
    #[test_case(Negotiating, TlsHandshaking; "starttls while negotiating")]
    #[test_case(Running, TlsHandshaking; "starttls while running")]
    #[test_case(TlsHandshaking, Running; "starttls resumes running")]
    #[test_case(Closing, Closed; "confirmed")]
    fn legal_moves(from: ConnectionState, to: ConnectionState) {
        assert!(from.can_transition_to(to));
    }

    #[test_case(Initializing, Running; "skips negotiation")]
    #[test_case(Running, Negotiating; "renegotiation")]
    #[test_case(Closing, Running; "reopen")]
    #[test_case(Closed, Closing; "after closed")]
    #[test_case(Running, Closed; "skips closing")]
    fn illegal_moves(from: ConnectionState, to: ConnectionState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn every_live_state_may_close_and_nothing_leaves_closed() {
        for state in ALL {
            assert_eq!(state.can_transition_to(Closing), state.is_live(), "{state}");
            assert!(!Closed.can_transition_to(state));
            assert!(!state.can_transition_to(state), "{state} self loop");
        }
    }
}
