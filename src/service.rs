//! Pipeline facade wiring redaction, chunking, batching, retrieval and aggregation.

use crate::batch::{BatchProcessor, IntelligenceRouter, WorkItem};
use crate::chunking::{Chunk, Chunker, ChunkingError, CoherenceSignal};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::PipelineError;
use crate::hierarchy::{AggregationError, HierarchicalProcessor, Insight, InsightLevel};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::persistence::KeyValueStore;
use crate::privacy::{Document, Metadata, PrivacyError, PrivacyGuardian, RedactedDocument};
use crate::progress::{OperationId, OperationSnapshot, ProgressTracker};
use crate::rag::{MetadataFilter, RagEngine, ScoredRecord, SearchHandle};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Abstraction over the pipeline used by external surfaces (HTTP, embedding hosts).
#[async_trait]
pub trait PipelineApi: Send + Sync {
    /// Redact, chunk and submit documents as one operation.
    async fn ingest(&self, documents: Vec<Document>) -> Result<IngestReceipt, PipelineError>;

    /// Wait for a submitted operation to finish.
    async fn wait(&self, operation: OperationId) -> Result<OperationSnapshot, PipelineError>;

    /// Current state of an operation.
    async fn status(&self, operation: OperationId) -> Result<OperationSnapshot, PipelineError>;

    /// Cancel an operation; `false` when it had already finished.
    async fn cancel(&self, operation: OperationId) -> Result<bool, PipelineError>;

    /// Release a finished operation's in-memory state; `false` while it is still active.
    async fn forget(&self, operation: OperationId) -> Result<bool, PipelineError>;

    /// Aggregate an operation's results at level 0, 1 or 2.
    async fn aggregate(
        &self,
        operation: OperationId,
        level: u8,
    ) -> Result<Vec<Insight>, PipelineError>;

    /// Similarity search over stored vectors.
    async fn search(&self, request: SearchRequest) -> Result<Vec<ScoredRecord>, PipelineError>;

    /// Current counters.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// Summary returned when an ingestion is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    /// Operation tracking the submission.
    pub operation: OperationId,
    /// Documents that passed redaction.
    pub documents: usize,
    /// Chunks submitted for processing.
    pub chunks: usize,
    /// Ids of documents the privacy guardian refused.
    pub rejected: Vec<String>,
}

/// Similarity query against the retrieval index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Query vector.
    pub embedding: Vec<f32>,
    /// Number of hits to return.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Metadata restrictions.
    #[serde(default)]
    pub filter: MetadataFilter,
    /// Namespace to search; defaults to the index default.
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_k() -> usize {
    10
}

/// Builder collecting the collaborators a [`Pipeline`] needs.
pub struct PipelineBuilder {
    config: Config,
    guardian: Arc<dyn PrivacyGuardian>,
    router: Arc<dyn IntelligenceRouter>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn KeyValueStore>>,
    signal: Option<Arc<dyn CoherenceSignal>>,
}

impl PipelineBuilder {
    /// Time source for backoff and ETA estimates.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Durable storage for operation snapshots and vectors.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Similarity signal used to place topic boundaries.
    pub fn coherence_signal(mut self, signal: Arc<dyn CoherenceSignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Validate configuration and assemble the pipeline.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.config.validate()?;

        let mut chunker = Chunker::new(self.config.chunker.clone())?;
        if let Some(signal) = self.signal {
            chunker = chunker.with_signal(signal);
        }

        let mut tracker = ProgressTracker::new(Arc::clone(&self.clock));
        let mut rag = RagEngine::new(self.config.rag.clone());
        if let Some(store) = &self.store {
            tracker = tracker.with_store(Arc::clone(store));
            rag = rag.with_store(Arc::clone(store));
        }
        let tracker = Arc::new(tracker);
        let rag = Arc::new(rag);
        let metrics = Arc::new(PipelineMetrics::new());

        let batches = BatchProcessor::new(
            self.router,
            Arc::clone(&tracker),
            Arc::clone(&rag),
            self.clock,
            Arc::clone(&metrics),
        );
        let aggregator = HierarchicalProcessor::new(
            batches.ledger(),
            rag.search_handle(),
            self.config.aggregation.clone(),
        );

        info!(
            max_tokens = self.config.chunker.max_tokens,
            batch_size = self.config.batch.batch_size,
            max_concurrency = self.config.batch.max_concurrency,
            dimension = ?self.config.rag.dimension,
            "Pipeline ready"
        );

        Ok(Pipeline {
            config: self.config,
            guardian: self.guardian,
            chunker,
            tracker,
            rag,
            batches,
            aggregator,
            metrics,
            runs: Arc::new(DashMap::new()),
        })
    }
}

/// Document-processing pipeline.
///
/// Construct it once near process start and share it through an `Arc`; every collaborator is
/// injected, so there is no global state.
pub struct Pipeline {
    config: Config,
    guardian: Arc<dyn PrivacyGuardian>,
    chunker: Chunker,
    tracker: Arc<ProgressTracker>,
    rag: Arc<RagEngine>,
    batches: BatchProcessor,
    aggregator: HierarchicalProcessor,
    metrics: Arc<PipelineMetrics>,
    // Present while an operation's batches are running; the flag flips when the run ends.
    runs: Arc<DashMap<OperationId, watch::Receiver<bool>>>,
}

impl Pipeline {
    /// Start building a pipeline around the two external collaborators.
    pub fn builder(
        config: Config,
        guardian: Arc<dyn PrivacyGuardian>,
        router: Arc<dyn IntelligenceRouter>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            config,
            guardian,
            router,
            clock: Arc::new(SystemClock),
            store: None,
            signal: None,
        }
    }

    /// Shared progress tracker.
    pub fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    /// Read-only view of the retrieval index.
    pub fn search_handle(&self) -> SearchHandle {
        self.rag.search_handle()
    }

    /// Batch processor, for submitting pre-built work items.
    pub fn batch_processor(&self) -> &BatchProcessor {
        &self.batches
    }

    /// Submit already-redacted work items as a new operation.
    ///
    /// The submission is validated before the operation is created, so a rejected call leaves
    /// nothing behind in the tracker.
    pub async fn submit_items(
        &self,
        items: Vec<WorkItem>,
        metadata: Metadata,
    ) -> Result<OperationId, PipelineError> {
        BatchProcessor::validate(&items, &self.config.batch)?;
        let operation = self.tracker.create_operation(items.len(), metadata).await;
        let handle = match self
            .batches
            .submit(operation, items, self.config.batch.clone())
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                if let Err(fail_err) = self.tracker.fail(operation, err.to_string()).await {
                    warn!(operation = %operation, error = %fail_err, "Could not fail rejected operation");
                }
                return Err(err.into());
            }
        };

        let (done, finished) = watch::channel(false);
        self.runs.insert(operation, finished);
        let runs = Arc::clone(&self.runs);
        let tracker = Arc::clone(&self.tracker);
        tokio::spawn(async move {
            if let Err(err) = handle.wait().await {
                warn!(operation = %operation, error = %err, "Operation ended with an error");
                // Only has an effect when the run task died before reaching a terminal state.
                if let Err(fail_err) = tracker.fail(operation, err.to_string()).await {
                    warn!(operation = %operation, error = %fail_err, "Could not record run failure");
                }
            }
            runs.remove(&operation);
            done.send_replace(true);
        });
        Ok(operation)
    }

    /// Release every finished operation whose terminal transition is at least `max_age` old.
    ///
    /// Returns how many operations were dropped from memory; persisted snapshots stay in the
    /// store.
    pub fn prune_finished(&self, max_age: Duration) -> usize {
        let mut released = 0;
        for operation in self.tracker.finished_before(max_age) {
            if self.release(operation).unwrap_or(false) {
                released += 1;
            }
        }
        if released > 0 {
            info!(released, "Pruned finished operations");
        }
        released
    }

    /// Operations whose run task is still active.
    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    fn release(&self, operation: OperationId) -> Result<bool, PipelineError> {
        if self.runs.contains_key(&operation) {
            return Ok(false);
        }
        if !self.tracker.forget(operation)? {
            return Ok(false);
        }
        self.batches.ledger().forget(operation);
        debug!(operation = %operation, "Operation state released");
        Ok(true)
    }

    async fn chunk_documents(
        &self,
        documents: Vec<RedactedDocument>,
    ) -> Result<Vec<(RedactedDocument, Vec<Chunk>)>, PipelineError> {
        let chunker = self.chunker.clone();
        let chunked = tokio::task::spawn_blocking(move || {
            documents
                .into_iter()
                .map(|document| {
                    let chunks = chunker.split(&document);
                    (document, chunks)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|err| ChunkingError::Worker(err.to_string()))?;
        Ok(chunked)
    }
}

#[async_trait]
impl PipelineApi for Pipeline {
    async fn ingest(&self, documents: Vec<Document>) -> Result<IngestReceipt, PipelineError> {
        let mut items = Vec::new();
        let mut rejected = Vec::new();
        let mut accepted = 0usize;

        let mut redacted_documents = Vec::new();
        for document in documents {
            match self.guardian.redact(document).await {
                Ok(redacted) => redacted_documents.push(redacted),
                Err(PrivacyError::Rejected { id, reason }) => {
                    warn!(document = %id, reason = %reason, "Document rejected by privacy guardian");
                    rejected.push(id);
                }
                Err(err) => return Err(err.into()),
            }
        }

        // Segmentation and token counting are CPU-bound; keep them off the async workers.
        for (document, chunks) in self.chunk_documents(redacted_documents).await? {
            self.metrics.record_document(chunks.len() as u64);
            info!(document = %document.id(), chunks = chunks.len(), "Document chunked");
            accepted += 1;
            items.extend(chunks.into_iter().map(WorkItem::Chunk));
        }

        let chunks = items.len();
        let mut metadata = Metadata::new();
        metadata.insert("documents".into(), accepted.to_string());
        metadata.insert("chunks".into(), chunks.to_string());
        let operation = self.submit_items(items, metadata).await?;

        Ok(IngestReceipt {
            operation,
            documents: accepted,
            chunks,
            rejected,
        })
    }

    async fn wait(&self, operation: OperationId) -> Result<OperationSnapshot, PipelineError> {
        let finished = self.runs.get(&operation).map(|entry| entry.value().clone());
        if let Some(mut finished) = finished {
            // The sender only goes away after flagging completion.
            if finished.wait_for(|done| *done).await.is_err() {
                debug!(operation = %operation, "Run signal closed");
            }
        }
        Ok(self.tracker.snapshot(operation)?)
    }

    async fn status(&self, operation: OperationId) -> Result<OperationSnapshot, PipelineError> {
        Ok(self.tracker.snapshot(operation)?)
    }

    async fn cancel(&self, operation: OperationId) -> Result<bool, PipelineError> {
        Ok(self.batches.cancel(operation).await?)
    }

    async fn forget(&self, operation: OperationId) -> Result<bool, PipelineError> {
        self.release(operation)
    }

    async fn aggregate(
        &self,
        operation: OperationId,
        level: u8,
    ) -> Result<Vec<Insight>, PipelineError> {
        let level = InsightLevel::try_from(level).map_err(AggregationError::InvalidLevel)?;
        Ok(self.aggregator.aggregate(operation, level)?)
    }

    async fn search(&self, request: SearchRequest) -> Result<Vec<ScoredRecord>, PipelineError> {
        Ok(self.rag.query(
            &request.embedding,
            request.k,
            &request.filter,
            request.namespace.as_deref(),
        )?)
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
