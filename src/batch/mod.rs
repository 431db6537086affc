//! Bounded, retried execution of work items against external backends.
//!
//! Highlights:
//! - Items are grouped by count and optional token budget, preserving submission order.
//! - Transient failures back off exponentially through the injected clock.
//! - A per-operation [`ItemLedger`] records every item's outcome for aggregation.

mod ledger;
mod processor;
mod retry;
mod router;
mod types;

pub use ledger::{ItemCounts, ItemLedger, ItemRecord, ItemState};
pub use processor::{BatchError, BatchHandle, BatchProcessor};
pub use retry::RetryPolicy;
pub use router::{BackendOutput, IntelligenceRouter, RouterError, RouterInput, RouterPayload};
pub use types::{
    Batch, BatchStatus, CancellationPolicy, RequestKind, WorkItem, WorkItemKind, build_batches,
};
