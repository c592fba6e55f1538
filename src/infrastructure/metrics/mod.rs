//! Prometheus metrics for queue engines.
//!
//! Collectors are owned by each engine instance and carry a constant `queue`
//! label, so several engines can register into one [`Registry`] side by side.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "rq";

/// Operation outcomes used as the `outcome` label.
pub mod outcome {
    pub const OK: &str = "ok";
    pub const EMPTY: &str = "empty";
    pub const MISS: &str = "miss";
    pub const DUPLICATE: &str = "duplicate";
    pub const ERROR: &str = "error";
}

/// Per-queue collectors.
#[derive(Clone)]
pub struct QueueMetrics {
    operations: IntCounterVec,
    retries: IntCounterVec,
    retries_exhausted: IntCounterVec,
    duplicates: IntCounter,
    queue_size: IntGauge,
    ephemeral_size: IntGauge,
    orphans: IntGauge,
    latency: HistogramVec,
}

impl QueueMetrics {
    /// Create unregistered collectors for the named queue.
    pub fn new(queue: &str) -> Result<Self, prometheus::Error> {
        let opts = |name: &str, help: &str| {
            Opts::new(format!("{}_{}", METRIC_PREFIX, name), help).const_label("queue", queue)
        };

        Ok(Self {
            operations: IntCounterVec::new(
                opts("queue_operations_total", "Queue operations by outcome"),
                &["operation", "outcome"],
            )?,
            retries: IntCounterVec::new(
                opts("queue_retries_total", "Retries after transient storage conflicts"),
                &["operation"],
            )?,
            retries_exhausted: IntCounterVec::new(
                opts(
                    "queue_retries_exhausted_total",
                    "Operations that failed after exhausting retries",
                ),
                &["operation"],
            )?,
            duplicates: IntCounter::with_opts(opts(
                "queue_duplicates_total",
                "Inserts that hit an existing message id",
            ))?,
            queue_size: IntGauge::with_opts(opts("queue_size", "Messages in the Queued state"))?,
            ephemeral_size: IntGauge::with_opts(opts(
                "queue_ephemeral_size",
                "Messages in the Taken state",
            ))?,
            orphans: IntGauge::with_opts(opts(
                "queue_orphans",
                "Taken messages older than the orphan threshold at the last scan",
            ))?,
            latency: HistogramVec::new(
                HistogramOpts::new(
                    format!("{}_queue_operation_duration_seconds", METRIC_PREFIX),
                    "Queue operation latency including retries",
                )
                .const_label("queue", queue)
                .buckets(vec![
                    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
                ]),
                &["operation"],
            )?,
        })
    }

    /// Register every collector into `registry`.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.operations.clone()))?;
        registry.register(Box::new(self.retries.clone()))?;
        registry.register(Box::new(self.retries_exhausted.clone()))?;
        registry.register(Box::new(self.duplicates.clone()))?;
        registry.register(Box::new(self.queue_size.clone()))?;
        registry.register(Box::new(self.ephemeral_size.clone()))?;
        registry.register(Box::new(self.orphans.clone()))?;
        registry.register(Box::new(self.latency.clone()))?;
        Ok(())
    }

    /// Record an operation outcome and its latency.
    pub fn record_operation(&self, operation: &str, outcome: &str, elapsed_secs: f64) {
        self.operations
            .with_label_values(&[operation, outcome])
            .inc();
        self.latency
            .with_label_values(&[operation])
            .observe(elapsed_secs);
    }

    /// Record a retry after a transient conflict.
    pub fn record_retry(&self, operation: &str) {
        self.retries.with_label_values(&[operation]).inc();
    }

    /// Record an operation that ran out of retries.
    pub fn record_retries_exhausted(&self, operation: &str) {
        self.retries_exhausted.with_label_values(&[operation]).inc();
    }

    /// Record an insert that hit an existing id.
    pub fn record_duplicate(&self) {
        self.duplicates.inc();
    }

    /// Update the Queued gauge.
    pub fn set_queue_size(&self, size: usize) {
        self.queue_size.set(size as i64);
    }

    /// Update the Taken gauge.
    pub fn set_ephemeral_size(&self, size: usize) {
        self.ephemeral_size.set(size as i64);
    }

    /// Update the orphan gauge.
    pub fn set_orphans(&self, count: usize) {
        self.orphans.set(count as i64);
    }

    pub fn operation_count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations
            .with_label_values(&[operation, outcome])
            .get()
    }

    pub fn retry_count(&self, operation: &str) -> u64 {
        self.retries.with_label_values(&[operation]).get()
    }

    pub fn retries_exhausted_count(&self, operation: &str) -> u64 {
        self.retries_exhausted.with_label_values(&[operation]).get()
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.get()
    }

    pub fn orphan_gauge(&self) -> i64 {
        self.orphans.get()
    }
}

/// Encode a registry to Prometheus text format
pub fn encode_metrics(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}
