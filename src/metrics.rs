use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing pipeline activity.
#[derive(Default)]
pub struct PipelineMetrics {
    documents_chunked: AtomicU64,
    chunks_produced: AtomicU64,
    batches_completed: AtomicU64,
    batches_failed: AtomicU64,
    batches_cancelled: AtomicU64,
    retries: AtomicU64,
    vectors_upserted: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a chunked document and the number of chunks produced for it.
    pub fn record_document(&self, chunk_count: u64) {
        self.documents_chunked.fetch_add(1, Ordering::Relaxed);
        self.chunks_produced
            .fetch_add(chunk_count, Ordering::Relaxed);
    }

    /// Record a batch that finished with every item completed.
    pub fn record_batch_completed(&self) {
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch whose retry budget ran out.
    pub fn record_batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch that never ran, or whose results were discarded, because of cancellation.
    pub fn record_batch_cancelled(&self) {
        self.batches_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one retried backend call.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record vectors written to the retrieval index.
    pub fn record_upserts(&self, count: u64) {
        self.vectors_upserted.fetch_add(count, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_chunked: self.documents_chunked.load(Ordering::Relaxed),
            chunks_produced: self.chunks_produced.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_cancelled: self.batches_cancelled.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            vectors_upserted: self.vectors_upserted.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Documents split by the chunker since startup.
    pub documents_chunked: u64,
    /// Total chunks produced across all documents.
    pub chunks_produced: u64,
    /// Batches whose backend call eventually succeeded.
    pub batches_completed: u64,
    /// Batches that exhausted their retry budget or hit a fatal error.
    pub batches_failed: u64,
    /// Batches skipped or discarded due to cancellation.
    pub batches_cancelled: u64,
    /// Backend calls retried after a transient failure.
    pub retries: u64,
    /// Vector records written to the retrieval index.
    pub vectors_upserted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_documents_and_chunks() {
        let metrics = PipelineMetrics::new();
        metrics.record_document(2);
        metrics.record_document(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.documents_chunked, 2);
        assert_eq!(snapshot.chunks_produced, 5);
    }

    #[test]
    fn records_batch_outcomes() {
        let metrics = PipelineMetrics::new();
        metrics.record_batch_completed();
        metrics.record_batch_failed();
        metrics.record_batch_cancelled();
        metrics.record_retry();
        metrics.record_retry();
        metrics.record_upserts(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches_completed, 1);
        assert_eq!(snapshot.batches_failed, 1);
        assert_eq!(snapshot.batches_cancelled, 1);
        assert_eq!(snapshot.retries, 2);
        assert_eq!(snapshot.vectors_upserted, 7);
    }

    #[test]
    fn snapshot_starts_empty() {
        assert_eq!(PipelineMetrics::new().snapshot(), MetricsSnapshot::default());
    }
}
