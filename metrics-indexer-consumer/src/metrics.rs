//! Prometheus metrics for the message processor
//!
//! Metrics live on a registry owned by the processor, so several processors
//! can coexist in one process (and one test binary).

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

use crate::batch::DropCounts;
use crate::indexer::FetchType;

#[derive(Clone)]
pub struct IndexerMetrics {
    registry: Registry,

    pub batches_processed: IntCounter,
    pub batches_failed: IntCounterVec,
    pub messages_received: IntCounter,
    pub messages_emitted: IntCounter,
    pub messages_dropped: IntCounterVec,
    pub keys_to_remove: IntCounter,
    pub strings_recorded: IntCounterVec,
    pub payload_bytes: IntCounterVec,
    pub apply_failures: IntCounter,

    pub batch_size: Histogram,
    pub stage_duration: HistogramVec,
}

impl IndexerMetrics {
    /// Create metrics registered on a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("metrics_indexer".to_string()), None)?;

        let batches_processed = IntCounter::new(
            "batches_processed_total",
            "Total number of batches processed",
        )?;
        let batches_failed = IntCounterVec::new(
            Opts::new(
                "batches_failed_total",
                "Batches that failed and must be redelivered, by error category",
            ),
            &["category"],
        )?;
        let messages_received = IntCounter::new(
            "messages_received_total",
            "Total number of raw messages received",
        )?;
        let messages_emitted = IntCounter::new(
            "messages_emitted_total",
            "Total number of indexed messages emitted",
        )?;
        let messages_dropped = IntCounterVec::new(
            Opts::new("messages_dropped_total", "Messages dropped, by reason"),
            &["reason"],
        )?;
        let keys_to_remove = IntCounter::new(
            "cardinality_keys_to_remove_total",
            "Messages rejected by the cardinality limiter",
        )?;
        let strings_recorded = IntCounterVec::new(
            Opts::new(
                "strings_recorded_total",
                "Strings passed through the indexer, by fetch type",
            ),
            &["fetch_type"],
        )?;
        let payload_bytes = IntCounterVec::new(
            Opts::new(
                "payload_bytes_total",
                "Encoded payload bytes accepted, by use case",
            ),
            &["use_case"],
        )?;
        let apply_failures = IntCounter::new(
            "cardinality_apply_failures_total",
            "Deferred cardinality apply steps that failed",
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Raw messages per batch").buckets(vec![
                1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0,
            ]),
        )?;
        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                "stage_duration_seconds",
                "Time spent in each processing stage",
            ),
            &["stage"],
        )?;

        registry.register(Box::new(batches_processed.clone()))?;
        registry.register(Box::new(batches_failed.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_emitted.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(keys_to_remove.clone()))?;
        registry.register(Box::new(strings_recorded.clone()))?;
        registry.register(Box::new(payload_bytes.clone()))?;
        registry.register(Box::new(apply_failures.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;

        Ok(Self {
            registry,
            batches_processed,
            batches_failed,
            messages_received,
            messages_emitted,
            messages_dropped,
            keys_to_remove,
            strings_recorded,
            payload_bytes,
            apply_failures,
            batch_size,
            stage_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn observe_stage(&self, stage: &str, elapsed: Duration) {
        self.stage_duration
            .with_label_values(&[stage])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_drops(&self, drops: &DropCounts) {
        for (reason, count) in drops.iter() {
            self.messages_dropped
                .with_label_values(&[reason.as_str()])
                .inc_by(count);
        }
    }

    pub fn record_fetch_type(&self, fetch_type: FetchType, count: usize) {
        self.strings_recorded
            .with_label_values(&[fetch_type.as_str()])
            .inc_by(count as u64);
    }

    /// Dropped messages for one reason, mostly for tests and summaries
    pub fn dropped(&self, reason: &str) -> u64 {
        self.messages_dropped.with_label_values(&[reason]).get()
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
