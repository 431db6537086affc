//! Progress tracking for long-running operations.
//!
//! Highlights:
//! - State machine `Pending -> Running -> {Completed, Failed, Cancelled}`; terminal states are final.
//! - `advance` is atomic per operation and becomes a silent no-op once the operation finished.
//! - Snapshots carry an ETA extrapolated through the injected [`crate::clock::Clock`].

mod tracker;
mod types;

pub use tracker::{ProgressTracker, storage_key};
pub use types::{
    FailedItem, OperationId, OperationSnapshot, OperationState, TrackerError,
};
