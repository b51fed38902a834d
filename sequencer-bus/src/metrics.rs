//! Prometheus metrics for the bus backend

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// Bus metrics collector
#[derive(Debug, Clone)]
pub struct BusMetrics {
    /// Publishes by stream and status (`success` / `error`)
    pub publish_total: IntCounterVec,

    /// Publish duration including retries
    pub publish_duration: HistogramVec,

    /// Entries received by stream and status
    pub receive_total: IntCounterVec,

    /// Prometheus registry
    pub registry: Registry,
}

impl BusMetrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let publish_total = IntCounterVec::new(
            Opts::new("sequencer_bus_publish_total", "Total messages published"),
            &["stream", "status"],
        )?;
        registry.register(Box::new(publish_total.clone()))?;

        let publish_duration = HistogramVec::new(
            HistogramOpts::new(
                "sequencer_bus_publish_duration_seconds",
                "Message publish duration in seconds",
            ),
            &["stream"],
        )?;
        registry.register(Box::new(publish_duration.clone()))?;

        let receive_total = IntCounterVec::new(
            Opts::new("sequencer_bus_receive_total", "Total entries received"),
            &["stream", "status"],
        )?;
        registry.register(Box::new(receive_total.clone()))?;

        Ok(Self {
            publish_total,
            publish_duration,
            receive_total,
            registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        let metrics = BusMetrics::new().unwrap();
        metrics
            .publish_total
            .with_label_values(&["LUNAR_INCOMING", "success"])
            .inc();
        assert_eq!(
            metrics
                .publish_total
                .with_label_values(&["LUNAR_INCOMING", "success"])
                .get(),
            1
        );
    }
}
