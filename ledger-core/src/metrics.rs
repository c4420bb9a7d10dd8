//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `ledger_mutations_total{reason}` - Version records appended, by reason
//! - `ledger_rejections_total{kind}` - Business rejections (insufficient funds, ...)
//! - `ledger_operation_duration_seconds` - Histogram of ledger transaction latencies
//!
//! Collectors live in a registry owned by the `Ledger`, so several ledgers can
//! coexist in one process.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct LedgerMetrics {
    /// Version records appended, labelled by reason
    pub mutations_total: IntCounterVec,

    /// Rejected operations, labelled by error kind
    pub rejections_total: IntCounterVec,

    /// Operation latency histogram
    pub operation_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl LedgerMetrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let mutations_total = IntCounterVec::new(
            Opts::new("ledger_mutations_total", "Version records appended"),
            &["reason"],
        )?;
        registry.register(Box::new(mutations_total.clone()))?;

        let rejections_total = IntCounterVec::new(
            Opts::new("ledger_rejections_total", "Rejected ledger operations"),
            &["kind"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let operation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_operation_duration_seconds",
                "Histogram of ledger transaction latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            mutations_total,
            rejections_total,
            operation_duration,
            registry,
        })
    }

    /// Render in the Prometheus text format
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
