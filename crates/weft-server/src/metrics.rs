//! Prometheus metrics for the connection server.
//!
//! Each [`Server`](crate::Server) owns its own registry so several servers
//! (and tests) in one process never share counters.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use weft_types::CloseReason;

use crate::ServerResult;

/// Server metrics collection.
pub struct Metrics {
    registry: Registry,

    // Connection metrics
    /// Total connections accepted.
    pub connections_accepted: IntCounter,
    /// Connections currently open (accepted, not yet finalized).
    pub connections_active: IntGauge,
    /// Accepts dropped because `max_connections` was reached.
    pub connections_rejected: IntCounter,
    /// Finalized connections by close reason.
    pub connections_closed: IntCounterVec,

    // Traffic
    pub bytes_received: IntCounter,
    pub bytes_sent: IntCounter,

    // Protocol
    /// Negotiations completed by the timer rather than by the client.
    pub negotiation_timeouts: IntCounter,
    pub tls_handshake_failures: IntCounter,
}

impl Metrics {
    pub fn new() -> ServerResult<Self> {
        let registry = Registry::new();

        let connections_accepted =
            IntCounter::new("weft_connections_accepted_total", "Total connections accepted")?;
        let connections_active =
            IntGauge::new("weft_connections_active", "Number of open connections")?;
        let connections_rejected = IntCounter::new(
            "weft_connections_rejected_total",
            "Connections refused because the server was at capacity",
        )?;
        let connections_closed = IntCounterVec::new(
            Opts::new("weft_connections_closed_total", "Closed connections by reason"),
            &["reason"],
        )?;
        let bytes_received =
            IntCounter::new("weft_bytes_received_total", "Raw bytes read from sockets")?;
        let bytes_sent = IntCounter::new("weft_bytes_sent_total", "Raw bytes handed to sockets")?;
        let negotiation_timeouts = IntCounter::new(
            "weft_negotiation_timeouts_total",
            "Negotiations that completed by timeout",
        )?;
        let tls_handshake_failures = IntCounter::new(
            "weft_tls_handshake_failures_total",
            "TLS sessions that failed before or during the handshake",
        )?;

        registry.register(Box::new(connections_accepted.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(connections_rejected.clone()))?;
        registry.register(Box::new(connections_closed.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(bytes_sent.clone()))?;
        registry.register(Box::new(negotiation_timeouts.clone()))?;
        registry.register(Box::new(tls_handshake_failures.clone()))?;

        Ok(Self {
            registry,
            connections_accepted,
            connections_active,
            connections_rejected,
            connections_closed,
            bytes_received,
            bytes_sent,
            negotiation_timeouts,
            tls_handshake_failures,
        })
    }

    pub(crate) fn record_close(&self, reason: CloseReason) {
        self.connections_active.dec();
        self.connections_closed
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    pub fn closed_with(&self, reason: CloseReason) -> u64 {
        self.connections_closed
            .with_label_values(&[reason.as_str()])
            .get()
    }

    /// Renders metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_else(|e| format!("# Error encoding metrics: {e}\n"))
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("accepted", &self.connections_accepted.get())
            .field("active", &self.connections_active.get())
            .finish_non_exhaustive()
    }
}
