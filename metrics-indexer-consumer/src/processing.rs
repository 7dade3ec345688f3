//! Message processor
//!
//! Runs one batch through parse, cardinality check, filter, indexing and
//! reconstruct. The limiter's apply step for batch N is handed to a single
//! background worker and awaited at the start of batch N+1, so it overlaps
//! the indexing work of the next batch but never its cardinality check.

use anyhow::Context;
use metrics_indexer_core::validation::for_use_case_key;
use metrics_indexer_core::{BrokerMeta, IndexerError, IndexerResult, RawMessage, TagsValidator};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchOptions, DropCounts, IndexerBatch, IndexerOutputBatch};
use crate::config::MetricsIngestConfiguration;
use crate::indexer::{build_indexer, StringIndexer};
use crate::limiters::{
    CardinalityLimiter, CardinalityLimiterState, MemoryCardinalityStore,
    WindowedCardinalityLimiter,
};
use crate::metrics::IndexerMetrics;
use crate::routing::SliceRouter;

/// Work item for the apply worker
struct ApplyJob {
    state: CardinalityLimiterState,
    done: oneshot::Sender<IndexerResult<()>>,
}

/// Everything a processed batch produced
#[derive(Debug)]
pub struct ProcessedBatch {
    pub output: IndexerOutputBatch,
    /// Messages that could not be decoded, for dead-lettering
    pub invalid_msg_meta: BTreeSet<BrokerMeta>,
    pub drops: DropCounts,
}

pub struct MessageProcessor {
    config: MetricsIngestConfiguration,
    options: BatchOptions,
    indexer: Arc<dyn StringIndexer>,
    limiter: Arc<dyn CardinalityLimiter>,
    metrics: IndexerMetrics,
    apply_tx: flume::Sender<ApplyJob>,
    worker: Option<JoinHandle<()>>,
    prev_apply: Option<oneshot::Receiver<IndexerResult<()>>>,
}

async fn apply_worker(limiter: Arc<dyn CardinalityLimiter>, jobs: flume::Receiver<ApplyJob>) {
    while let Ok(job) = jobs.recv_async().await {
        let result = limiter.apply_cardinality_limits(job.state).await;
        if let Err(e) = &result {
            error!("Cardinality apply failed: {}", e);
        }
        // The processor may have been dropped without joining
        let _ = job.done.send(result);
    }
    debug!("Cardinality apply worker stopped");
}

impl MessageProcessor {
    /// Build a processor and all of its components from configuration.
    /// Must be called from within a Tokio runtime.
    pub fn from_config(config: MetricsIngestConfiguration) -> anyhow::Result<Self> {
        config.validate()?;

        let indexer = build_indexer(&config).context("Failed to build string indexer")?;
        let limiter: Arc<dyn CardinalityLimiter> = Arc::new(WindowedCardinalityLimiter::new(
            Arc::new(MemoryCardinalityStore::new()),
            config.cardinality.clone(),
        ));
        let validator: Arc<dyn TagsValidator> = Arc::from(for_use_case_key(config.use_case));

        Self::with_components(config, indexer, limiter, validator)
    }

    /// Build a processor around existing components
    pub fn with_components(
        config: MetricsIngestConfiguration,
        indexer: Arc<dyn StringIndexer>,
        limiter: Arc<dyn CardinalityLimiter>,
        validator: Arc<dyn TagsValidator>,
    ) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("MessageProcessor must be created inside a Tokio runtime")?;
        let metrics = IndexerMetrics::new().context("Failed to initialize indexer metrics")?;

        let (apply_tx, apply_rx) = flume::bounded::<ApplyJob>(1);
        let worker = runtime.spawn(apply_worker(Arc::clone(&limiter), apply_rx));

        let options = BatchOptions {
            use_case_key: config.use_case,
            should_index_tag_values: config.should_index_tag_values,
            validator,
            router: config
                .is_output_sliced
                .then(|| SliceRouter::new(&config.slicing)),
        };

        info!(
            "Message processor ready: use_case={}, backend={}, index_tag_values={}, sliced={}",
            config.use_case,
            indexer.name(),
            config.should_index_tag_values,
            config.is_output_sliced
        );

        Ok(Self {
            config,
            options,
            indexer,
            limiter,
            metrics,
            apply_tx,
            worker: Some(worker),
            prev_apply: None,
        })
    }

    pub fn config(&self) -> &MetricsIngestConfiguration {
        &self.config
    }

    pub fn metrics(&self) -> &IndexerMetrics {
        &self.metrics
    }

    pub fn indexer(&self) -> &Arc<dyn StringIndexer> {
        &self.indexer
    }

    /// Process a batch and return its output
    pub async fn process_messages(
        &mut self,
        messages: Vec<RawMessage>,
    ) -> IndexerResult<IndexerOutputBatch> {
        Ok(self.process_batch(messages).await?.output)
    }

    /// Process a batch, returning output plus drop accounting.
    ///
    /// A failed batch is only counted in `batches_failed`; it is expected to
    /// be redelivered, and its messages are accounted for then.
    pub async fn process_batch(&mut self, messages: Vec<RawMessage>) -> IndexerResult<ProcessedBatch> {
        let input_count = messages.len();
        match self.run_batch(messages).await {
            Ok(processed) => Ok(processed),
            Err(e) => {
                error!("Failed to process batch of {} messages: {}", input_count, e);
                self.metrics
                    .batches_failed
                    .with_label_values(&[e.category()])
                    .inc();
                Err(e)
            }
        }
    }

    async fn run_batch(&mut self, messages: Vec<RawMessage>) -> IndexerResult<ProcessedBatch> {
        let batch_start = Instant::now();
        let input_count = messages.len();

        let stage = Instant::now();
        self.join().await?;
        self.metrics.observe_stage("join", stage.elapsed());

        let stage = Instant::now();
        let mut batch = IndexerBatch::new(self.options.clone());
        batch.parse(messages);
        self.metrics.observe_stage("parse", stage.elapsed());

        let stage = Instant::now();
        let state = self
            .limiter
            .check_cardinality_limits(self.config.use_case, batch.payloads())
            .await?;
        self.metrics.observe_stage("cardinality_check", stage.elapsed());
        let removed = state.keys_to_remove().len();

        let stage = Instant::now();
        batch.filter_messages(state.keys_to_remove());
        self.metrics.observe_stage("filter", stage.elapsed());

        let stage = Instant::now();
        let strings = batch.extract_strings();
        let string_count = strings.len();
        let results = self.indexer.bulk_record(strings).await?;
        self.metrics.observe_stage("index", stage.elapsed());

        let stage = Instant::now();
        let output = batch.reconstruct_messages(&results);
        self.metrics.observe_stage("reconstruct", stage.elapsed());

        self.submit_apply(state).await?;

        let drops = batch.drops().clone();
        self.metrics.batch_size.observe(input_count as f64);
        self.metrics.messages_received.inc_by(input_count as u64);
        self.metrics.keys_to_remove.inc_by(removed as u64);
        for (fetch_type, count) in results.fetch_type_counts() {
            self.metrics.record_fetch_type(fetch_type, count);
        }
        self.metrics.record_drops(&drops);
        self.metrics.messages_emitted.inc_by(output.len() as u64);
        self.metrics.batches_processed.inc();
        for (use_case, bytes) in batch.payload_bytes() {
            self.metrics
                .payload_bytes
                .with_label_values(&[use_case.as_str()])
                .inc_by(*bytes);
        }

        debug!(
            "Processed batch: {} in, {} out, {} dropped, {} strings in {:?}",
            input_count,
            output.len(),
            drops.total(),
            string_count,
            batch_start.elapsed()
        );

        Ok(ProcessedBatch {
            output,
            invalid_msg_meta: batch.invalid_msg_meta().clone(),
            drops,
        })
    }

    /// Hand the state to the apply worker; it is joined by the next batch
    async fn submit_apply(&mut self, state: CardinalityLimiterState) -> IndexerResult<()> {
        if !state.has_grants() {
            return Ok(());
        }

        let (done, receiver) = oneshot::channel();
        self.apply_tx
            .send_async(ApplyJob { state, done })
            .await
            .map_err(|_| IndexerError::worker("Cardinality apply worker is not running"))?;
        self.prev_apply = Some(receiver);
        Ok(())
    }

    /// Wait for the outstanding apply step, if any
    pub async fn join(&mut self) -> IndexerResult<()> {
        let Some(receiver) = self.prev_apply.take() else {
            return Ok(());
        };

        let result = receiver.await.unwrap_or_else(|_| {
            Err(IndexerError::worker(
                "Cardinality apply worker exited before completing",
            ))
        });

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.metrics.apply_failures.inc();
                if self.config.cardinality.fail_open {
                    warn!("Ignoring failed cardinality apply: {}", e);
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Join the outstanding apply and stop the worker
    pub async fn shutdown(mut self) -> IndexerResult<()> {
        let joined = self.join().await;

        let MessageProcessor {
            apply_tx, worker, ..
        } = self;
        drop(apply_tx);
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|e| IndexerError::worker(format!("Apply worker panicked: {}", e)))?;
        }

        info!("Message processor stopped");
        joined
    }
}
