//! Per-item bookkeeping for submitted operations.

use super::router::BackendOutput;
use super::types::{WorkItem, WorkItemKind};
use crate::error::FailureKind;
use crate::progress::OperationId;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Lifecycle of a single work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Not yet admitted.
    Pending,
    /// Backend call in flight.
    Running,
    /// Backend output recorded.
    Completed,
    /// Gave up on the item.
    Failed,
    /// Skipped or discarded because the operation stopped.
    Cancelled,
}

impl ItemState {
    /// Whether the item reached an outcome.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Ledger entry for one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemRecord {
    /// Work item id.
    pub id: String,
    /// Item variant.
    pub kind: WorkItemKind,
    /// Parent document id.
    pub document_id: String,
    /// Chunk position within the document.
    pub position: Option<usize>,
    /// Whether the chunk was hard-split.
    pub coherence_broken: bool,
    /// Redacted text sent to the backend.
    pub text: String,
    /// Namespace embeddings were written to.
    pub namespace: String,
    /// Current state.
    pub state: ItemState,
    /// Backend attempts made.
    pub attempts: u32,
    /// Last failure observed.
    pub last_error: Option<FailureKind>,
    /// Backend output, once completed.
    pub output: Option<BackendOutput>,
}

#[derive(Default)]
struct OperationItems {
    order: Vec<ItemRecord>,
    index: HashMap<String, usize>,
}

impl OperationItems {
    fn update<F>(&mut self, ids: &[String], mut apply: F)
    where
        F: FnMut(&mut ItemRecord),
    {
        for id in ids {
            if let Some(&slot) = self.index.get(id) {
                apply(&mut self.order[slot]);
            }
        }
    }
}

/// Counts of items per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ItemCounts {
    /// Items not yet admitted.
    pub pending: usize,
    /// Items in flight.
    pub running: usize,
    /// Completed items.
    pub completed: usize,
    /// Failed items.
    pub failed: usize,
    /// Cancelled items.
    pub cancelled: usize,
}

/// Concurrent map from operation to its item records.
#[derive(Default)]
pub struct ItemLedger {
    operations: DashMap<OperationId, Arc<RwLock<OperationItems>>>,
}

impl ItemLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every item of a submission as `Pending`, in submission order.
    pub fn register(&self, operation: OperationId, items: &[WorkItem], namespace: &str) {
        let mut entries = OperationItems::default();
        for item in items {
            entries.index.insert(item.id().to_string(), entries.order.len());
            entries.order.push(ItemRecord {
                id: item.id().to_string(),
                kind: item.kind(),
                document_id: item.document_id().to_string(),
                position: item.position(),
                coherence_broken: item.coherence_broken(),
                text: item.text().to_string(),
                namespace: namespace.to_string(),
                state: ItemState::Pending,
                attempts: 0,
                last_error: None,
                output: None,
            });
        }
        self.operations
            .insert(operation, Arc::new(RwLock::new(entries)));
    }

    /// Whether the operation has items registered.
    pub fn contains(&self, operation: OperationId) -> bool {
        self.operations.contains_key(&operation)
    }

    /// Drop every record of an operation; `false` when none were held.
    pub fn forget(&self, operation: OperationId) -> bool {
        self.operations.remove(&operation).is_some()
    }

    /// Number of operations with registered items.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether no operation has registered items.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Record the start of a backend attempt for the given items.
    pub fn begin_attempt(&self, operation: OperationId, ids: &[String]) {
        self.with_items(operation, |items| {
            items.update(ids, |record| {
                record.state = ItemState::Running;
                record.attempts += 1;
            })
        });
    }

    /// Store outputs for completed items; `outputs` is parallel to `ids`.
    pub fn complete(&self, operation: OperationId, ids: &[String], outputs: Vec<BackendOutput>) {
        self.with_items(operation, |items| {
            for (id, output) in ids.iter().zip(outputs) {
                if let Some(&slot) = items.index.get(id) {
                    let record = &mut items.order[slot];
                    record.state = ItemState::Completed;
                    record.output = Some(output);
                }
            }
        });
    }

    /// Mark items failed with `kind`.
    pub fn fail(&self, operation: OperationId, ids: &[String], kind: FailureKind) {
        self.with_items(operation, |items| {
            items.update(ids, |record| {
                record.state = ItemState::Failed;
                record.last_error = Some(kind);
            })
        });
    }

    /// Record a failed attempt that will be retried.
    pub fn note_error(&self, operation: OperationId, ids: &[String], kind: FailureKind) {
        self.with_items(operation, |items| {
            items.update(ids, |record| record.last_error = Some(kind))
        });
    }

    /// Mark the given items cancelled.
    pub fn cancel(&self, operation: OperationId, ids: &[String]) {
        self.with_items(operation, |items| {
            items.update(ids, |record| {
                record.state = ItemState::Cancelled;
                record.last_error = Some(FailureKind::Cancelled);
            })
        });
    }

    /// Cancel every item still `Pending`; returns how many were cancelled.
    pub fn cancel_pending(&self, operation: OperationId) -> usize {
        self.with_items(operation, |items| {
            let mut cancelled = 0;
            for record in items
                .order
                .iter_mut()
                .filter(|record| record.state == ItemState::Pending)
            {
                record.state = ItemState::Cancelled;
                record.last_error = Some(FailureKind::Cancelled);
                cancelled += 1;
            }
            cancelled
        })
        .unwrap_or(0)
    }

    /// Copy of every record, in submission order.
    pub fn items(&self, operation: OperationId) -> Option<Vec<ItemRecord>> {
        let entries = self.handle(operation)?;
        let entries = entries.read();
        Some(entries.order.clone())
    }

    /// Per-state counts.
    pub fn counts(&self, operation: OperationId) -> Option<ItemCounts> {
        let entries = self.handle(operation)?;
        let entries = entries.read();
        let mut counts = ItemCounts::default();
        for record in &entries.order {
            match record.state {
                ItemState::Pending => counts.pending += 1,
                ItemState::Running => counts.running += 1,
                ItemState::Completed => counts.completed += 1,
                ItemState::Failed => counts.failed += 1,
                ItemState::Cancelled => counts.cancelled += 1,
            }
        }
        Some(counts)
    }

    fn handle(&self, operation: OperationId) -> Option<Arc<RwLock<OperationItems>>> {
        self.operations
            .get(&operation)
            .map(|entry| Arc::clone(&entry))
    }

    fn with_items<T, F>(&self, operation: OperationId, apply: F) -> Option<T>
    where
        F: FnOnce(&mut OperationItems) -> T,
    {
        let entries = self.handle(operation)?;
        let mut entries = entries.write();
        Some(apply(&mut entries))
    }
}
