use super::types::{FailedItem, OperationId, OperationSnapshot, OperationState, TrackerError};
use crate::clock::{Clock, SystemClock, current_timestamp_rfc3339 as timestamp};
use crate::persistence::KeyValueStore;
use crate::privacy::Metadata;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct OperationEntry {
    state: OperationState,
    total: usize,
    completed: usize,
    failed: Vec<FailedItem>,
    cancelled: usize,
    retries: u64,
    metadata: Metadata,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

/// Shared ledger of operation state.
///
/// One tracker is built per pipeline and handed around as `Arc<ProgressTracker>`. Each operation
/// sits behind its own mutex, so updates to different operations never contend.
pub struct ProgressTracker {
    operations: DashMap<OperationId, Arc<Mutex<OperationEntry>>>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl ProgressTracker {
    /// Tracker reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            operations: DashMap::new(),
            clock,
            store: None,
        }
    }

    /// Persist a snapshot under `operation/{id}` on every state transition.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a new operation in the `Pending` state.
    pub async fn create_operation(&self, total_items: usize, metadata: Metadata) -> OperationId {
        let id = OperationId::new();
        let now = timestamp();
        let entry = OperationEntry {
            state: OperationState::Pending,
            total: total_items,
            completed: 0,
            failed: Vec::new(),
            cancelled: 0,
            retries: 0,
            metadata,
            error: None,
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            finished_at: None,
        };
        self.operations.insert(id, Arc::new(Mutex::new(entry)));
        info!(operation = %id, total = total_items, "Operation created");
        self.persist(id).await;
        id
    }

    /// Move a `Pending` operation to `Running`.
    pub async fn start(&self, id: OperationId) -> Result<(), TrackerError> {
        {
            let entry = self.entry(id)?;
            let mut entry = entry.lock();
            if entry.state != OperationState::Pending {
                return Err(TrackerError::InvalidTransition {
                    id,
                    from: entry.state,
                    to: OperationState::Running,
                });
            }
            entry.state = OperationState::Running;
            entry.started_at = Some(self.clock.now());
            entry.updated_at = timestamp();
        }
        info!(operation = %id, "Operation started");
        self.persist(id).await;
        Ok(())
    }

    /// Record `completed_delta` finished items and any newly failed ones.
    ///
    /// Returns `Ok(false)` without changing anything when the operation is already terminal.
    pub fn advance(
        &self,
        id: OperationId,
        completed_delta: usize,
        failed: Vec<FailedItem>,
    ) -> Result<bool, TrackerError> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        match entry.state {
            OperationState::Running => {}
            state if state.is_terminal() => {
                debug!(operation = %id, state = %state, "Ignoring advance on finished operation");
                return Ok(false);
            }
            state => {
                return Err(TrackerError::InvalidTransition {
                    id,
                    from: state,
                    to: OperationState::Running,
                });
            }
        }
        entry.completed += completed_delta;
        entry.failed.extend(failed);
        entry.updated_at = timestamp();
        if entry.completed + entry.failed.len() > entry.total {
            warn!(
                operation = %id,
                completed = entry.completed,
                failed = entry.failed.len(),
                total = entry.total,
                "Operation advanced past its declared total"
            );
        }
        Ok(true)
    }

    /// Count `count` backend retries against a running operation.
    pub fn record_retry(&self, id: OperationId, count: u64) -> Result<(), TrackerError> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        if !entry.state.is_terminal() {
            entry.retries += count;
        }
        Ok(())
    }

    /// Finish a running operation successfully. `Ok(false)` if it had already finished.
    pub async fn complete(&self, id: OperationId) -> Result<bool, TrackerError> {
        self.finish(id, OperationState::Completed, None).await
    }

    /// Mark an operation failed with a reason. `Ok(false)` if it had already finished.
    pub async fn fail(&self, id: OperationId, reason: impl Into<String>) -> Result<bool, TrackerError> {
        self.finish(id, OperationState::Failed, Some(reason.into()))
            .await
    }

    /// Cancel an operation. Every item without an outcome is counted as cancelled and the counts
    /// freeze. `Ok(false)` if it had already finished.
    pub async fn cancel(&self, id: OperationId) -> Result<bool, TrackerError> {
        self.finish(id, OperationState::Cancelled, None).await
    }

    /// Current view of an operation.
    pub fn snapshot(&self, id: OperationId) -> Result<OperationSnapshot, TrackerError> {
        let entry = self.entry(id)?;
        let entry = entry.lock();
        Ok(self.build_snapshot(id, &entry))
    }

    /// Whether the tracker knows the operation.
    pub fn contains(&self, id: OperationId) -> bool {
        self.operations.contains_key(&id)
    }

    /// Number of operations held in memory.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether no operations are held.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Drop a finished operation from memory. Its persisted snapshot is left in the store.
    ///
    /// `Ok(false)` while the operation is still pending or running.
    pub fn forget(&self, id: OperationId) -> Result<bool, TrackerError> {
        if !self.operations.contains_key(&id) {
            return Err(TrackerError::UnknownOperation(id));
        }
        let removed = self
            .operations
            .remove_if(&id, |_, entry| entry.lock().state.is_terminal())
            .is_some();
        if removed {
            debug!(operation = %id, "Operation released");
        }
        Ok(removed)
    }

    /// Finished operations whose terminal transition is at least `max_age` old.
    pub fn finished_before(&self, max_age: Duration) -> Vec<OperationId> {
        let now = self.clock.now();
        self.operations
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .lock()
                    .finished_at
                    .is_some_and(|finished| now.saturating_duration_since(finished) >= max_age)
            })
            .map(|entry| *entry.key())
            .collect()
    }

    async fn finish(
        &self,
        id: OperationId,
        target: OperationState,
        reason: Option<String>,
    ) -> Result<bool, TrackerError> {
        {
            let entry = self.entry(id)?;
            let mut entry = entry.lock();
            if entry.state.is_terminal() {
                debug!(operation = %id, state = %entry.state, requested = %target, "Operation already finished");
                return Ok(false);
            }
            if target == OperationState::Completed && entry.state != OperationState::Running {
                return Err(TrackerError::InvalidTransition {
                    id,
                    from: entry.state,
                    to: target,
                });
            }
            if target == OperationState::Cancelled {
                let finished = entry.completed + entry.failed.len();
                entry.cancelled = entry.total.saturating_sub(finished);
            }
            entry.state = target;
            entry.error = reason;
            entry.finished_at = Some(self.clock.now());
            entry.updated_at = timestamp();
            info!(
                operation = %id,
                state = %target,
                completed = entry.completed,
                failed = entry.failed.len(),
                cancelled = entry.cancelled,
                retries = entry.retries,
                "Operation finished"
            );
        }
        self.persist(id).await;
        Ok(true)
    }

    fn entry(&self, id: OperationId) -> Result<Arc<Mutex<OperationEntry>>, TrackerError> {
        self.operations
            .get(&id)
            .map(|entry| Arc::clone(&entry))
            .ok_or(TrackerError::UnknownOperation(id))
    }

    fn build_snapshot(&self, id: OperationId, entry: &OperationEntry) -> OperationSnapshot {
        OperationSnapshot {
            id,
            state: entry.state,
            total: entry.total,
            completed: entry.completed,
            failed_count: entry.failed.len(),
            failed_items: entry.failed.clone(),
            cancelled: entry.cancelled,
            retries: entry.retries,
            eta_ms: self.estimate(entry).map(|eta| eta.as_millis() as u64),
            metadata: entry.metadata.clone(),
            error: entry.error.clone(),
            created_at: entry.created_at.clone(),
            updated_at: entry.updated_at.clone(),
        }
    }

    // Linear extrapolation from the throughput observed since `start`.
    fn estimate(&self, entry: &OperationEntry) -> Option<Duration> {
        match entry.state {
            OperationState::Completed => return Some(Duration::ZERO),
            OperationState::Running => {}
            _ => return None,
        }
        let started = entry.started_at?;
        let processed = entry.completed + entry.failed.len();
        if processed == 0 {
            return None;
        }
        let remaining = entry.total.saturating_sub(processed);
        let elapsed = self.clock.now().saturating_duration_since(started);
        Some(elapsed.mul_f64(remaining as f64 / processed as f64))
    }

    async fn persist(&self, id: OperationId) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = match self.snapshot(id) {
            Ok(snapshot) => snapshot,
            Err(_) => return,
        };
        let key = storage_key(id);
        let result = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => store.put(&key, bytes).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            warn!(key = %key, error = %err, "Failed to persist operation snapshot");
        }
    }
}

/// Storage key for a persisted operation snapshot.
pub fn storage_key(id: OperationId) -> String {
    format!("operation/{id}")
}
