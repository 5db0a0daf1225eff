//! Metrics using Prometheus.
//!
//! Counters are labelled by backend (`memory`, `sqlite`, `postgres`) and queue name:
//!
//! - **Counters**: messages sent, received, deleted, dead-lettered, expired by retention,
//!   and sweep failures
//! - **Histograms**: sweep duration

use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::error;

/// Global metrics registry
static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Global metrics instance
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    let metrics = Metrics::new();
    if let Err(e) = metrics.register(&METRICS_REGISTRY) {
        error!("Failed to register metrics: {}", e);
    }
    Arc::new(metrics)
});

const QUEUE_LABELS: &[&str] = &["backend", "queue_name"];

/// Metrics collector for nexq
pub struct Metrics {
    /// Messages enqueued by send or publish
    pub messages_sent_total: IntCounterVec,
    /// Messages claimed by receive
    pub messages_received_total: IntCounterVec,
    /// Messages deleted by callers
    pub messages_deleted_total: IntCounterVec,
    /// Messages moved to a dead letter target or dropped after exhausting their attempts
    pub messages_dead_lettered_total: IntCounterVec,
    /// Messages deleted by the retention policy
    pub messages_expired_total: IntCounterVec,
    /// Per-queue sweep steps that failed
    pub sweep_failures_total: IntCounterVec,
    /// Full sweep duration in seconds
    pub sweep_duration_seconds: HistogramVec,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        let messages_sent_total = IntCounterVec::new(
            Opts::new("nexq_messages_sent_total", "Total messages sent to queues"),
            QUEUE_LABELS,
        )
        .expect("Failed to create messages_sent_total metric");

        let messages_received_total = IntCounterVec::new(
            Opts::new(
                "nexq_messages_received_total",
                "Total messages received from queues",
            ),
            QUEUE_LABELS,
        )
        .expect("Failed to create messages_received_total metric");

        let messages_deleted_total = IntCounterVec::new(
            Opts::new(
                "nexq_messages_deleted_total",
                "Total messages deleted from queues",
            ),
            QUEUE_LABELS,
        )
        .expect("Failed to create messages_deleted_total metric");

        let messages_dead_lettered_total = IntCounterVec::new(
            Opts::new(
                "nexq_messages_dead_lettered_total",
                "Total messages that exhausted their receive count",
            ),
            QUEUE_LABELS,
        )
        .expect("Failed to create messages_dead_lettered_total metric");

        let messages_expired_total = IntCounterVec::new(
            Opts::new(
                "nexq_messages_expired_total",
                "Total messages deleted past their retention period",
            ),
            QUEUE_LABELS,
        )
        .expect("Failed to create messages_expired_total metric");

        let sweep_failures_total = IntCounterVec::new(
            Opts::new("nexq_sweep_failures_total", "Total failed queue sweeps"),
            QUEUE_LABELS,
        )
        .expect("Failed to create sweep_failures_total metric");

        let sweep_duration_seconds = HistogramVec::new(
            HistogramOpts::new("nexq_sweep_duration_seconds", "Sweep duration in seconds")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
            &["backend"],
        )
        .expect("Failed to create sweep_duration_seconds metric");

        Self {
            messages_sent_total,
            messages_received_total,
            messages_deleted_total,
            messages_dead_lettered_total,
            messages_expired_total,
            sweep_failures_total,
            sweep_duration_seconds,
        }
    }

    /// Register all metrics with the registry
    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.messages_sent_total.clone()))?;
        registry.register(Box::new(self.messages_received_total.clone()))?;
        registry.register(Box::new(self.messages_deleted_total.clone()))?;
        registry.register(Box::new(self.messages_dead_lettered_total.clone()))?;
        registry.register(Box::new(self.messages_expired_total.clone()))?;
        registry.register(Box::new(self.sweep_failures_total.clone()))?;
        registry.register(Box::new(self.sweep_duration_seconds.clone()))?;
        Ok(())
    }

    /// Gather metrics in Prometheus text format.
    ///
    /// Exposition hook for a scrape endpoint; the engine itself only records.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = METRICS_REGISTRY.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the global metrics instance
pub fn get_metrics() -> Arc<Metrics> {
    METRICS.clone()
}

/// Add `count` to a per-queue counter.
pub(crate) fn record(counter: &IntCounterVec, backend: &str, queue_name: &str, count: u64) {
    if count > 0 {
        counter.with_label_values(&[backend, queue_name]).inc_by(count);
    }
}
