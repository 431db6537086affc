use super::ledger::ItemLedger;
use super::retry::RetryPolicy;
use super::router::{BackendOutput, IntelligenceRouter, RouterError, RouterInput, RouterPayload};
use super::types::{Batch, BatchStatus, CancellationPolicy, WorkItem, build_batches};
use crate::clock::Clock;
use crate::config::{BatchConfig, ValidationError};
use crate::error::FailureKind;
use crate::metrics::PipelineMetrics;
use crate::progress::{FailedItem, OperationId, OperationSnapshot, ProgressTracker, TrackerError};
use crate::rag::{RagEngine, RagError, VectorRecord};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Errors returned by the batch processor.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Configuration was rejected before anything was enqueued.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Two submitted items share an id.
    #[error("duplicate work item id '{0}'")]
    DuplicateItem(String),
    /// Operation bookkeeping failed.
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    /// The operation was aborted by a non-retryable error.
    #[error("operation {operation} aborted: {reason}")]
    Fatal {
        /// Aborted operation.
        operation: OperationId,
        /// Error that caused the abort.
        reason: String,
    },
    /// The control task ended abnormally.
    #[error("batch worker for operation {operation} stopped unexpectedly: {reason}")]
    Worker {
        /// Operation being processed.
        operation: OperationId,
        /// Join error detail.
        reason: String,
    },
}

/// Handle to a submitted operation.
pub struct BatchHandle {
    operation: OperationId,
    task: JoinHandle<Result<OperationSnapshot, BatchError>>,
}

impl BatchHandle {
    /// Operation being processed.
    pub fn operation_id(&self) -> OperationId {
        self.operation
    }

    /// Wait for every admitted batch to finish and return the final snapshot.
    pub async fn wait(self) -> Result<OperationSnapshot, BatchError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(BatchError::Worker {
                operation: self.operation,
                reason: err.to_string(),
            }),
        }
    }
}

// Shared stop signal for one operation. `stop` flips once, on cancellation or abort.
struct RunControl {
    policy: CancellationPolicy,
    stop: watch::Sender<bool>,
    cancelled: Mutex<bool>,
    fatal: Mutex<Option<String>>,
}

impl RunControl {
    fn new(policy: CancellationPolicy) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            policy,
            stop,
            cancelled: Mutex::new(false),
            fatal: Mutex::new(None),
        }
    }

    fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.stop.send_replace(true);
    }

    fn abort(&self, reason: String) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(reason);
        }
        drop(fatal);
        self.stop.send_replace(true);
    }

    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    fn fatal_reason(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    // Results returning after a cancel are dropped unless draining.
    fn discards_results(&self) -> bool {
        self.is_stopped() && !(self.is_cancelled() && self.policy == CancellationPolicy::Drain)
    }
}

enum BatchOutcome {
    Completed,
    Failed,
    Cancelled,
    Aborted,
}

/// Executes work items against the intelligence router in bounded, retried batches.
///
/// Highlights:
/// - At most `max_concurrency` batches hold a backend call at once.
/// - Cancellation is checked before each admission and before each retry.
/// - Embeddings returned by the backend are upserted into the [`RagEngine`].
#[derive(Clone)]
pub struct BatchProcessor {
    router: Arc<dyn IntelligenceRouter>,
    tracker: Arc<ProgressTracker>,
    rag: Arc<RagEngine>,
    ledger: Arc<ItemLedger>,
    clock: Arc<dyn Clock>,
    metrics: Arc<PipelineMetrics>,
    controls: Arc<DashMap<OperationId, Arc<RunControl>>>,
}

impl BatchProcessor {
    /// Build a processor sharing the given collaborators.
    pub fn new(
        router: Arc<dyn IntelligenceRouter>,
        tracker: Arc<ProgressTracker>,
        rag: Arc<RagEngine>,
        clock: Arc<dyn Clock>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            router,
            tracker,
            rag,
            ledger: Arc::new(ItemLedger::new()),
            clock,
            metrics,
            controls: Arc::new(DashMap::new()),
        }
    }

    /// Item ledger populated by submissions.
    pub fn ledger(&self) -> Arc<ItemLedger> {
        Arc::clone(&self.ledger)
    }

    /// Check a submission without touching any state: the config must be valid and item ids
    /// unique.
    pub fn validate(items: &[WorkItem], config: &BatchConfig) -> Result<(), BatchError> {
        config.validate()?;
        let mut seen = HashSet::with_capacity(items.len());
        for item in items {
            if !seen.insert(item.id()) {
                return Err(BatchError::DuplicateItem(item.id().to_string()));
            }
        }
        Ok(())
    }

    /// Start processing `items` for a `Pending` operation.
    ///
    /// Validation happens synchronously; on error nothing is enqueued and the operation stays
    /// `Pending`. A missing embedding dimension fails the operation before any call is made.
    pub async fn submit(
        &self,
        operation: OperationId,
        items: Vec<WorkItem>,
        config: BatchConfig,
    ) -> Result<BatchHandle, BatchError> {
        Self::validate(&items, &config)?;
        // Unknown operations are rejected before touching any state.
        self.tracker.snapshot(operation)?;

        if config.request_kind.wants_embedding() && self.rag.config().dimension.is_none() {
            let reason = RagError::FatalConfiguration(
                "EMBEDDING_DIMENSION is not configured".into(),
            )
            .to_string();
            error!(operation = %operation, reason = %reason, "Aborting operation");
            self.tracker.fail(operation, reason.clone()).await?;
            return Err(BatchError::Fatal { operation, reason });
        }

        // Registered before `start` so a concurrent cancel always reaches the control loop.
        let control = Arc::new(RunControl::new(config.cancellation_policy));
        self.controls.insert(operation, Arc::clone(&control));
        if let Err(err) = self.tracker.start(operation).await {
            self.controls.remove(&operation);
            return Err(err.into());
        }
        self.ledger
            .register(operation, &items, &config.namespace);

        let batches = build_batches(items, config.batch_size, config.max_batch_tokens);

        info!(
            operation = %operation,
            batches = batches.len(),
            batch_size = config.batch_size,
            max_concurrency = config.max_concurrency,
            "Submitting batches"
        );

        let processor = self.clone();
        let task = tokio::spawn(async move {
            let result = processor
                .run(operation, batches, config, Arc::clone(&control))
                .await;
            processor.controls.remove(&operation);
            result
        });

        Ok(BatchHandle { operation, task })
    }

    /// Stop admitting batches for `operation` and mark it cancelled.
    ///
    /// Returns `false` when the operation had already finished.
    pub async fn cancel(&self, operation: OperationId) -> Result<bool, BatchError> {
        if let Some(control) = self.controls.get(&operation) {
            control.cancel();
        }
        let changed = self.tracker.cancel(operation).await?;
        if changed {
            let skipped = self.ledger.cancel_pending(operation);
            info!(operation = %operation, skipped, "Operation cancelled");
        }
        Ok(changed)
    }

    async fn run(
        &self,
        operation: OperationId,
        batches: Vec<Batch>,
        config: BatchConfig,
        control: Arc<RunControl>,
    ) -> Result<OperationSnapshot, BatchError> {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        let config = Arc::new(config);
        let mut stop = control.stop.subscribe();
        let mut workers = JoinSet::new();
        let mut pending = batches.into_iter();

        while let Some(mut batch) = pending.next() {
            let permit = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit.filter(|_| !control.is_stopped()) else {
                self.skip(operation, std::iter::once(batch).chain(pending.by_ref()));
                break;
            };
            batch.status = BatchStatus::Running;
            debug!(operation = %operation, batch = batch.index, items = batch.items.len(), "Batch admitted");
            let worker = self.clone();
            let config = Arc::clone(&config);
            let control = Arc::clone(&control);
            workers.spawn(async move {
                worker
                    .run_batch(operation, batch, &config, &control, permit)
                    .await
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                control.abort(format!("batch task failed: {err}"));
            }
        }

        if let Some(reason) = control.fatal_reason() {
            self.ledger.cancel_pending(operation);
            self.tracker.fail(operation, reason.clone()).await?;
            return Err(BatchError::Fatal { operation, reason });
        }

        if control.is_cancelled() {
            self.tracker.cancel(operation).await?;
        } else {
            let snapshot = self.tracker.snapshot(operation)?;
            let ratio = if snapshot.total == 0 {
                0.0
            } else {
                snapshot.failed_count as f64 / snapshot.total as f64
            };
            if ratio > config.failure_ratio_threshold {
                warn!(
                    operation = %operation,
                    ratio,
                    threshold = config.failure_ratio_threshold,
                    "Failure ratio exceeded"
                );
                self.tracker
                    .fail(
                        operation,
                        format!(
                            "failure ratio {ratio:.2} exceeded threshold {:.2}",
                            config.failure_ratio_threshold
                        ),
                    )
                    .await?;
            } else {
                self.tracker.complete(operation).await?;
            }
        }

        Ok(self.tracker.snapshot(operation)?)
    }

    async fn run_batch(
        self,
        operation: OperationId,
        mut batch: Batch,
        config: &BatchConfig,
        control: &RunControl,
        permit: OwnedSemaphorePermit,
    ) {
        let _permit = permit;
        let policy = RetryPolicy::from(config);
        let ids = batch.item_ids();
        let payload = RouterPayload {
            items: batch
                .items
                .iter()
                .map(|item| RouterInput {
                    id: item.id().to_string(),
                    text: item.text().to_string(),
                    kind: item.kind(),
                })
                .collect(),
        };

        let outcome = loop {
            batch.attempts += 1;
            self.ledger.begin_attempt(operation, &ids);
            let call = self.router.route(config.request_kind, payload.clone());
            let result = match tokio::time::timeout(config.timeout_per_call, call).await {
                Ok(result) => result,
                Err(_) => Err(RouterError::transient(
                    FailureKind::Timeout,
                    format!("no response within {:?}", config.timeout_per_call),
                )),
            };

            let err = match result {
                Ok(outputs) => {
                    break self
                        .accept(operation, &batch, &ids, outputs, config, control)
                        .await;
                }
                Err(err) => err,
            };

            if let RouterError::Fatal(reason) = &err {
                error!(operation = %operation, batch = batch.index, reason = %reason, "Fatal backend error");
                self.ledger.fail(operation, &ids, FailureKind::Fatal);
                control.abort(err.to_string());
                break BatchOutcome::Aborted;
            }

            let kind = err.kind();
            let attempt = batch.attempts - 1;
            if !kind.is_transient() || !policy.allows_retry(attempt) {
                break self.give_up(operation, &batch, &ids, kind).await;
            }
            if control.is_stopped() {
                break self.abandon(operation, &ids);
            }

            let delay = policy.delay(attempt);
            warn!(
                operation = %operation,
                batch = batch.index,
                attempt = batch.attempts,
                kind = %kind,
                delay_ms = delay.as_millis() as u64,
                "Retrying batch"
            );
            self.ledger.note_error(operation, &ids, kind);
            self.metrics.record_retry();
            if let Err(err) = self.tracker.record_retry(operation, 1) {
                debug!(operation = %operation, error = %err, "Retry not recorded");
            }
            self.clock.sleep(delay).await;
            if control.is_stopped() {
                break self.abandon(operation, &ids);
            }
        };

        batch.status = match outcome {
            BatchOutcome::Completed => BatchStatus::Completed,
            BatchOutcome::Failed | BatchOutcome::Aborted => BatchStatus::Failed,
            BatchOutcome::Cancelled => BatchStatus::Cancelled,
        };
        debug!(
            operation = %operation,
            batch = batch.index,
            status = ?batch.status,
            attempts = batch.attempts,
            "Batch finished"
        );
    }

    async fn accept(
        &self,
        operation: OperationId,
        batch: &Batch,
        ids: &[String],
        outputs: Vec<BackendOutput>,
        config: &BatchConfig,
        control: &RunControl,
    ) -> BatchOutcome {
        if control.discards_results() {
            return self.abandon(operation, ids);
        }
        let wants_embedding = config.request_kind.wants_embedding();
        let malformed = outputs.len() != batch.items.len()
            || (wants_embedding && outputs.iter().any(|output| output.embedding.is_none()));
        if malformed {
            warn!(
                operation = %operation,
                batch = batch.index,
                expected = batch.items.len(),
                received = outputs.len(),
                "Malformed backend response"
            );
            return self
                .give_up(operation, batch, ids, FailureKind::MalformedResponse)
                .await;
        }

        if wants_embedding {
            let records: Vec<VectorRecord> = batch
                .items
                .iter()
                .zip(&outputs)
                .filter_map(|(item, output)| {
                    output.embedding.as_ref().map(|embedding| VectorRecord {
                        id: item.id().to_string(),
                        embedding: embedding.clone(),
                        metadata: item.vector_metadata(),
                        namespace: Some(config.namespace.clone()),
                    })
                })
                .collect();
            let count = records.len() as u64;
            match self.rag.upsert(records).await {
                Ok(_) => self.metrics.record_upserts(count),
                Err(RagError::DimensionMismatch { id, expected, actual }) => {
                    warn!(operation = %operation, id = %id, expected, actual, "Backend embedding has wrong dimension");
                    return self
                        .give_up(operation, batch, ids, FailureKind::DimensionMismatch)
                        .await;
                }
                Err(RagError::NonFiniteEmbedding { id, index }) => {
                    warn!(operation = %operation, id = %id, index, "Backend embedding is not finite");
                    return self
                        .give_up(operation, batch, ids, FailureKind::MalformedResponse)
                        .await;
                }
                Err(err) => {
                    error!(operation = %operation, error = %err, "Vector upsert failed");
                    self.ledger.fail(operation, ids, FailureKind::Fatal);
                    control.abort(err.to_string());
                    return BatchOutcome::Aborted;
                }
            }
        }

        let counted = self
            .tracker
            .advance(operation, ids.len(), Vec::new())
            .unwrap_or(false);
        if !counted && control.policy == CancellationPolicy::Abandon {
            return self.abandon(operation, ids);
        }
        self.ledger.complete(operation, ids, outputs);
        self.metrics.record_batch_completed();
        BatchOutcome::Completed
    }

    async fn give_up(
        &self,
        operation: OperationId,
        batch: &Batch,
        ids: &[String],
        kind: FailureKind,
    ) -> BatchOutcome {
        warn!(
            operation = %operation,
            batch = batch.index,
            attempts = batch.attempts,
            kind = %kind,
            "Batch failed"
        );
        self.ledger.fail(operation, ids, kind);
        let failed = ids
            .iter()
            .map(|id| FailedItem::new(id.clone(), kind))
            .collect();
        if let Err(err) = self.tracker.advance(operation, 0, failed) {
            debug!(operation = %operation, error = %err, "Failure not recorded");
        }
        self.metrics.record_batch_failed();
        BatchOutcome::Failed
    }

    fn abandon(&self, operation: OperationId, ids: &[String]) -> BatchOutcome {
        debug!(operation = %operation, items = ids.len(), "Discarding batch after stop");
        self.ledger.cancel(operation, ids);
        self.metrics.record_batch_cancelled();
        BatchOutcome::Cancelled
    }

    fn skip(&self, operation: OperationId, batches: impl Iterator<Item = Batch>) {
        let mut skipped = 0;
        for batch in batches {
            self.ledger.cancel(operation, &batch.item_ids());
            self.metrics.record_batch_cancelled();
            skipped += 1;
        }
        if skipped > 0 {
            info!(operation = %operation, batches = skipped, "Batches not admitted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ItemState;
    use crate::batch::types::RequestKind;
    use crate::chunking::Chunk;
    use crate::clock::ManualClock;
    use crate::config::RagConfig;
    use crate::privacy::Metadata;
    use crate::progress::OperationState;
    use crate::rag::SimilarityMetric;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Gate {
        at_call: usize,
        started: Notify,
        release: Notify,
    }

    #[derive(Default)]
    struct FakeRouter {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        transient_failures: AtomicUsize,
        failing_ids: Vec<String>,
        fatal: bool,
        short_response: bool,
        nan_embeddings: bool,
        gate: Option<Gate>,
    }

    impl FakeRouter {
        fn respond(
            &self,
            kind: RequestKind,
            payload: &RouterPayload,
        ) -> Result<Vec<BackendOutput>, RouterError> {
            if self.fatal {
                return Err(RouterError::Fatal("credentials revoked".into()));
            }
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                return Err(RouterError::transient(FailureKind::Connection, "reset"));
            }
            if payload
                .items
                .iter()
                .any(|item| self.failing_ids.contains(&item.id))
            {
                return Err(RouterError::transient(FailureKind::RateLimited, "slow down"));
            }
            if self.short_response {
                return Ok(Vec::new());
            }
            Ok(payload
                .items
                .iter()
                .enumerate()
                .map(|(index, item)| BackendOutput {
                    embedding: kind.wants_embedding().then(|| {
                        if self.nan_embeddings {
                            vec![f32::NAN, index as f32]
                        } else {
                            vec![1.0, index as f32]
                        }
                    }),
                    analysis: kind
                        .wants_analysis()
                        .then(|| format!("summary of {}", item.id)),
                    confidence: 0.9,
                })
                .collect())
        }
    }

    #[async_trait]
    impl IntelligenceRouter for FakeRouter {
        async fn route(
            &self,
            kind: RequestKind,
            payload: RouterPayload,
        ) -> Result<Vec<BackendOutput>, RouterError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if let Some(gate) = &self.gate {
                if gate.at_call == call {
                    gate.started.notify_one();
                    gate.release.notified().await;
                }
            }
            let result = self.respond(kind, &payload);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct SlowRouter;

    #[async_trait]
    impl IntelligenceRouter for SlowRouter {
        async fn route(
            &self,
            _kind: RequestKind,
            _payload: RouterPayload,
        ) -> Result<Vec<BackendOutput>, RouterError> {
            std::future::pending::<Result<Vec<BackendOutput>, RouterError>>().await
        }
    }

    struct Harness {
        processor: BatchProcessor,
        tracker: Arc<ProgressTracker>,
        rag: Arc<RagEngine>,
        clock: Arc<ManualClock>,
        metrics: Arc<PipelineMetrics>,
    }

    fn harness(router: Arc<dyn IntelligenceRouter>, dimension: Option<usize>) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let tracker = Arc::new(ProgressTracker::new(clock.clone()));
        let rag = Arc::new(RagEngine::new(RagConfig {
            dimension,
            metric: SimilarityMetric::Cosine,
        }));
        let metrics = Arc::new(PipelineMetrics::new());
        let processor = BatchProcessor::new(
            router,
            tracker.clone(),
            rag.clone(),
            clock.clone(),
            metrics.clone(),
        );
        Harness {
            processor,
            tracker,
            rag,
            clock,
            metrics,
        }
    }

    fn chunks(count: usize) -> Vec<WorkItem> {
        (0..count)
            .map(|position| {
                WorkItem::Chunk(Chunk {
                    id: format!("doc#{position}"),
                    document_id: "doc".into(),
                    position,
                    text: format!("Sentence number {position}."),
                    token_count: 3,
                    overlap_tokens: 0,
                    overlap_len: 0,
                    start: 0,
                    end: 0,
                    coherence_broken: false,
                })
            })
            .collect()
    }

    fn config(batch_size: usize, max_concurrency: usize) -> BatchConfig {
        BatchConfig {
            batch_size,
            max_concurrency,
            backoff_base: Duration::from_millis(10),
            ..BatchConfig::default()
        }
    }

    async fn run(
        harness: &Harness,
        items: Vec<WorkItem>,
        config: BatchConfig,
    ) -> (OperationId, Result<OperationSnapshot, BatchError>) {
        let total = items.len();
        let op = harness
            .tracker
            .create_operation(total, Metadata::new())
            .await;
        let handle = harness.processor.submit(op, items, config).await.unwrap();
        (op, handle.wait().await)
    }

    #[tokio::test]
    async fn all_batches_succeed_within_concurrency_bound() {
        let router = Arc::new(FakeRouter::default());
        let harness = harness(router.clone(), Some(2));

        let (_, result) = run(&harness, chunks(50), config(10, 3)).await;
        let snapshot = result.unwrap();

        assert_eq!(snapshot.state, OperationState::Completed);
        assert_eq!(snapshot.completed, 50);
        assert_eq!(snapshot.failed_count, 0);
        assert_eq!(router.calls.load(Ordering::SeqCst), 5);
        assert!(router.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(harness.rag.len(), 50);
        let metrics = harness.metrics.snapshot();
        assert_eq!(metrics.batches_completed, 5);
        assert_eq!(metrics.vectors_upserted, 50);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_with_backoff() {
        let router = Arc::new(FakeRouter {
            transient_failures: AtomicUsize::new(2),
            ..FakeRouter::default()
        });
        let harness = harness(router.clone(), Some(2));

        let (op, result) = run(&harness, chunks(1), config(10, 1)).await;
        let snapshot = result.unwrap();

        assert_eq!(snapshot.state, OperationState::Completed);
        assert_eq!(snapshot.retries, 2);
        assert_eq!(
            harness.clock.sleeps(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
        let records = harness.processor.ledger().items(op).unwrap();
        assert_eq!(records[0].attempts, 3);
        assert_eq!(records[0].state, ItemState::Completed);
    }

    #[tokio::test]
    async fn exhausted_batch_does_not_affect_siblings() {
        let router = Arc::new(FakeRouter {
            failing_ids: vec!["doc#12".into()],
            ..FakeRouter::default()
        });
        let harness = harness(router.clone(), Some(2));

        let (_, result) = run(&harness, chunks(30), config(10, 2)).await;
        let snapshot = result.unwrap();

        assert_eq!(snapshot.state, OperationState::Completed);
        assert_eq!(snapshot.completed, 20);
        assert_eq!(snapshot.failed_count, 10);
        assert!(
            snapshot
                .failed_items
                .iter()
                .all(|item| item.kind == FailureKind::RateLimited)
        );
        // One call plus three retries for the failing batch.
        assert_eq!(router.calls.load(Ordering::SeqCst), 6);
        assert_eq!(harness.metrics.snapshot().batches_failed, 1);
    }

    #[tokio::test]
    async fn failure_ratio_breach_fails_operation() {
        let router = Arc::new(FakeRouter {
            failing_ids: vec!["doc#0".into(), "doc#10".into()],
            ..FakeRouter::default()
        });
        let harness = harness(router, Some(2));

        let (_, result) = run(&harness, chunks(30), config(10, 3)).await;
        let snapshot = result.unwrap();

        assert_eq!(snapshot.state, OperationState::Failed);
        assert_eq!(snapshot.failed_count, 20);
        assert!(snapshot.error.unwrap().contains("failure ratio"));
    }

    #[tokio::test]
    async fn fatal_backend_error_aborts_operation() {
        let router = Arc::new(FakeRouter {
            fatal: true,
            ..FakeRouter::default()
        });
        let harness = harness(router, Some(2));

        let (op, result) = run(&harness, chunks(30), config(10, 1)).await;

        assert!(matches!(result, Err(BatchError::Fatal { .. })));
        let snapshot = harness.tracker.snapshot(op).unwrap();
        assert_eq!(snapshot.state, OperationState::Failed);
        let counts = harness.processor.ledger().counts(op).unwrap();
        assert_eq!(counts.pending + counts.running, 0);
    }

    #[tokio::test]
    async fn missing_dimension_fails_before_any_call() {
        let router = Arc::new(FakeRouter::default());
        let harness = harness(router.clone(), None);
        let op = harness.tracker.create_operation(5, Metadata::new()).await;

        let err = harness
            .processor
            .submit(op, chunks(5), config(10, 1))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, BatchError::Fatal { .. }));
        assert_eq!(router.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            harness.tracker.snapshot(op).unwrap().state,
            OperationState::Failed
        );
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_synchronously() {
        let harness = harness(Arc::new(FakeRouter::default()), Some(2));
        let op = harness.tracker.create_operation(5, Metadata::new()).await;

        let err = harness
            .processor
            .submit(op, chunks(5), config(10, 0))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, BatchError::Validation(_)));
        assert_eq!(
            harness.tracker.snapshot(op).unwrap().state,
            OperationState::Pending
        );
    }

    #[tokio::test]
    async fn duplicate_item_ids_are_rejected() {
        let harness = harness(Arc::new(FakeRouter::default()), Some(2));
        let op = harness.tracker.create_operation(2, Metadata::new()).await;
        let mut items = chunks(1);
        items.extend(chunks(1));

        let err = harness
            .processor
            .submit(op, items, config(10, 1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BatchError::DuplicateItem(ref id) if id == "doc#0"));
    }

    #[tokio::test]
    async fn timeouts_count_against_retry_budget() {
        let harness = harness(Arc::new(SlowRouter), Some(2));
        let config = BatchConfig {
            max_retries: 1,
            timeout_per_call: Duration::from_millis(20),
            ..config(10, 1)
        };

        let (_, result) = run(&harness, chunks(2), config).await;
        let snapshot = result.unwrap();

        assert_eq!(snapshot.state, OperationState::Failed);
        assert_eq!(snapshot.retries, 1);
        assert!(
            snapshot
                .failed_items
                .iter()
                .all(|item| item.kind == FailureKind::Timeout)
        );
    }

    #[tokio::test]
    async fn malformed_response_fails_without_retry() {
        let router = Arc::new(FakeRouter {
            short_response: true,
            ..FakeRouter::default()
        });
        let harness = harness(router.clone(), Some(2));

        let (_, result) = run(&harness, chunks(3), config(10, 1)).await;
        let snapshot = result.unwrap();

        assert_eq!(router.calls.load(Ordering::SeqCst), 1);
        assert_eq!(snapshot.failed_items[0].kind, FailureKind::MalformedResponse);
    }

    #[tokio::test]
    async fn non_finite_embeddings_fail_batch_without_retry() {
        let router = Arc::new(FakeRouter {
            nan_embeddings: true,
            ..FakeRouter::default()
        });
        let harness = harness(router.clone(), Some(2));

        let (_, result) = run(&harness, chunks(3), config(10, 1)).await;
        let snapshot = result.unwrap();

        assert_eq!(router.calls.load(Ordering::SeqCst), 1);
        assert_eq!(snapshot.failed_count, 3);
        assert!(
            snapshot
                .failed_items
                .iter()
                .all(|item| item.kind == FailureKind::MalformedResponse)
        );
        assert!(harness.rag.is_empty());
    }

    #[tokio::test]
    async fn analysis_only_requests_skip_the_index() {
        let harness = harness(Arc::new(FakeRouter::default()), None);
        let config = BatchConfig {
            request_kind: RequestKind::Analysis,
            ..config(10, 1)
        };

        let (op, result) = run(&harness, chunks(4), config).await;

        assert_eq!(result.unwrap().state, OperationState::Completed);
        assert!(harness.rag.is_empty());
        let records = harness.processor.ledger().items(op).unwrap();
        assert_eq!(
            records[0].output.as_ref().unwrap().analysis.as_deref(),
            Some("summary of doc#0")
        );
    }

    #[tokio::test]
    async fn drain_keeps_in_flight_results_after_cancel() {
        let router = Arc::new(FakeRouter {
            gate: Some(Gate {
                at_call: 2,
                started: Notify::new(),
                release: Notify::new(),
            }),
            ..FakeRouter::default()
        });
        let harness = harness(router.clone(), Some(2));
        let op = harness.tracker.create_operation(30, Metadata::new()).await;
        let config = BatchConfig {
            cancellation_policy: CancellationPolicy::Drain,
            ..config(10, 1)
        };
        let handle = harness.processor.submit(op, chunks(30), config).await.unwrap();

        let gate = router.gate.as_ref().unwrap();
        gate.started.notified().await;
        assert!(harness.processor.cancel(op).await.unwrap());
        gate.release.notify_one();
        let snapshot = handle.wait().await.unwrap();

        assert_eq!(snapshot.state, OperationState::Cancelled);
        assert_eq!(snapshot.completed, 10);
        assert_eq!(snapshot.cancelled, 20);
        let counts = harness.processor.ledger().counts(op).unwrap();
        assert_eq!(counts.completed, 20);
        assert_eq!(counts.cancelled, 10);
        assert_eq!(router.calls.load(Ordering::SeqCst), 2);
        assert_eq!(harness.rag.len(), 20);
    }

    #[tokio::test]
    async fn cancel_after_finish_reports_false() {
        let harness = harness(Arc::new(FakeRouter::default()), Some(2));
        let (op, result) = run(&harness, chunks(3), config(10, 1)).await;
        assert_eq!(result.unwrap().state, OperationState::Completed);
        assert!(!harness.processor.cancel(op).await.unwrap());
    }
}
