//! Negotiation settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether the server asks for an in-band TLS upgrade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartTlsPolicy {
    /// START_TLS is refused like any unsupported option.
    #[default]
    Disabled,
    /// Offered; a refusal leaves the session in plaintext.
    Offered,
    /// Offered; a refusal (or silence until the timeout) fails negotiation.
    Required,
}

impl StartTlsPolicy {
    pub fn is_offered(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Per-connection negotiation limits and policy.
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// How long to wait for essential options before proceeding.
    pub timeout: Duration,
    /// Lines are flushed once they reach this many bytes.
    pub max_line_length: usize,
    /// Subnegotiations longer than this are a protocol error.
    pub max_subnegotiation_length: usize,
    /// Terminal type names to collect before the cycle stops.
    pub max_terminal_types: usize,
    pub start_tls: StartTlsPolicy,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_line_length: 4096,
            max_subnegotiation_length: 8192,
            max_terminal_types: 4,
            start_tls: StartTlsPolicy::Disabled,
        }
    }
}

impl NegotiationConfig {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max.max(1);
        self
    }

    #[must_use]
    pub fn with_max_subnegotiation_length(mut self, max: usize) -> Self {
        self.max_subnegotiation_length = max;
        self
    }

    #[must_use]
    pub fn with_max_terminal_types(mut self, max: usize) -> Self {
        self.max_terminal_types = max.max(1);
        self
    }

    #[must_use]
    pub fn with_start_tls(mut self, policy: StartTlsPolicy) -> Self {
        self.start_tls = policy;
        self
    }
}
