//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `sequencer_emitted_total` - Messages delivered downstream (in-order + drained)
//! - `sequencer_drained_total` - Messages released from the stash
//! - `sequencer_duplicates_total` - Stale or duplicate entries discarded
//! - `sequencer_stashed_total` - Out-of-order messages stashed
//! - `sequencer_retried_total` - Entries re-appended after a failure
//! - `sequencer_dead_lettered_total` - Entries moved to the dead-letter sink
//! - `sequencer_conflicts_total` - Conditional pointer advances that lost
//! - `sequencer_process_duration_seconds` - Per-entry processing latency

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Messages delivered downstream
    pub emitted_total: IntCounter,

    /// Messages released from the stash
    pub drained_total: IntCounter,

    /// Entries discarded as duplicates
    pub duplicates_total: IntCounter,

    /// Messages stashed
    pub stashed_total: IntCounter,

    /// Entries retried
    pub retried_total: IntCounter,

    /// Entries dead-lettered
    pub dead_lettered_total: IntCounter,

    /// Pointer conflicts
    pub conflicts_total: IntCounter,

    /// Per-entry processing latency
    pub process_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let emitted_total = counter(
            "sequencer_emitted_total",
            "Messages delivered downstream in order",
        )?;
        let drained_total = counter(
            "sequencer_drained_total",
            "Messages released from the stash",
        )?;
        let duplicates_total = counter(
            "sequencer_duplicates_total",
            "Stale or duplicate entries discarded",
        )?;
        let stashed_total = counter(
            "sequencer_stashed_total",
            "Out-of-order messages stashed",
        )?;
        let retried_total = counter(
            "sequencer_retried_total",
            "Entries re-appended after a processing failure",
        )?;
        let dead_lettered_total = counter(
            "sequencer_dead_lettered_total",
            "Entries moved to the dead-letter sink",
        )?;
        let conflicts_total = counter(
            "sequencer_conflicts_total",
            "Conditional pointer advances that observed a different value",
        )?;

        let process_duration = Histogram::with_opts(
            HistogramOpts::new(
                "sequencer_process_duration_seconds",
                "Per-entry processing latency",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
        )?;
        registry.register(Box::new(process_duration.clone()))?;

        Ok(Self {
            emitted_total,
            drained_total,
            duplicates_total,
            stashed_total,
            retried_total,
            dead_lettered_total,
            conflicts_total,
            process_duration,
            registry,
        })
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
