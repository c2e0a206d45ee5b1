//! Per-option negotiation state.
//!
//! Each option has two independent sides. The local side tracks what the
//! server does (`WILL`/`WONT` sent, `DO`/`DONT` received); the remote side
//! tracks what the client does (`DO`/`DONT` sent, `WILL`/`WONT` received).
//!
//! ```text
//!  local:  Idle ──WILL──► SentWill ──DO──► ActiveWill
//!                              └────DONT──► RejectedWill
//!          Idle ◄──DO── (peer)  ──WILL──►  ReceivedDo
//!
//!  remote: Idle ──DO──► SentDo ──WILL──► ActiveDo
//!                          └────WONT──► RejectedDo
//!          Idle ◄──WILL── (peer) ──DO──► ReceivedWill
//! ```

use std::fmt;
use std::time::Instant;

use crate::consts::option_name;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OptionState {
    #[default]
    Idle,
    SentWill,
    SentWont,
    SentDo,
    SentDont,
    ActiveWill,
    ActiveDo,
    RejectedWill,
    RejectedDo,
    ReceivedWill,
    ReceivedDo,
}

impl OptionState {
    /// The exchange for this side is over.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::ActiveWill
                | Self::ActiveDo
                | Self::RejectedWill
                | Self::RejectedDo
                | Self::ReceivedWill
                | Self::ReceivedDo
        )
    }

    /// The option is in effect.
    pub fn is_enabled(&self) -> bool {
        matches!(
            self,
            Self::ActiveWill | Self::ActiveDo | Self::ReceivedWill | Self::ReceivedDo
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::SentWill | Self::SentWont | Self::SentDo | Self::SentDont
        )
    }
}

impl fmt::Display for OptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Both sides of one option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionEntry {
    pub local: OptionState,
    pub remote: OptionState,
}

/// Which side of an option a check refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// Option table plus negotiation timing for one connection.
#[derive(Debug, Clone)]
pub struct NegotiationState {
    options: Box<[OptionEntry; 256]>,
    pub started_at: Option<Instant>,
    pub deadline: Option<Instant>,
    /// Completed by settling rather than by timeout.
    pub settled: bool,
    pub timed_out: bool,
}

impl Default for NegotiationState {
    fn default() -> Self {
        Self {
            options: Box::new([OptionEntry::default(); 256]),
            started_at: None,
            deadline: None,
            settled: false,
            timed_out: false,
        }
    }
}

impl NegotiationState {
    pub fn entry(&self, option: u8) -> OptionEntry {
        self.options[usize::from(option)]
    }

    pub fn get(&self, option: u8, side: Side) -> OptionState {
        let entry = self.entry(option);
        match side {
            Side::Local => entry.local,
            Side::Remote => entry.remote,
        }
    }

    pub fn set(&mut self, option: u8, side: Side, state: OptionState) {
        let entry = &mut self.options[usize::from(option)];
        match side {
            Side::Local => entry.local = state,
            Side::Remote => entry.remote = state,
        }
    }

    pub fn is_enabled(&self, option: u8, side: Side) -> bool {
        self.get(option, side).is_enabled()
    }

    /// Options with an exchange still in flight, for timeout logging.
    pub fn pending(&self) -> Vec<String> {
        self.options
            .iter()
            .enumerate()
            .flat_map(|(code, entry)| {
                let name = option_name(code as u8);
                let local = entry
                    .local
                    .is_pending()
                    .then(|| format!("{name}({code}) local {}", entry.local));
                let remote = entry
                    .remote
                    .is_pending()
                    .then(|| format!("{name}({code}) remote {}", entry.remote));
                local.into_iter().chain(remote)
            })
            .collect()
    }
}
