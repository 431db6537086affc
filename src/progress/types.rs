use crate::error::FailureKind;
use crate::privacy::Metadata;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a long-running pipeline invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Created, no work admitted yet.
    Pending,
    /// Work in progress.
    Running,
    /// Finished within the failure-ratio threshold.
    Completed,
    /// Aborted by a fatal error or a failure-ratio breach.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl OperationState {
    /// Whether the state is final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Item that did not complete, with its last error kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    /// Work item id.
    pub id: String,
    /// Last failure observed for the item.
    pub kind: FailureKind,
}

impl FailedItem {
    /// Convenience constructor.
    pub fn new(id: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Point-in-time view of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    /// Operation identifier.
    pub id: OperationId,
    /// Current state.
    pub state: OperationState,
    /// Items the operation was created with.
    pub total: usize,
    /// Items that completed successfully.
    pub completed: usize,
    /// Number of failed items.
    pub failed_count: usize,
    /// Failed item ids with their last error kind.
    pub failed_items: Vec<FailedItem>,
    /// Items that were never finished because the operation was cancelled.
    pub cancelled: usize,
    /// Backend retries performed so far.
    pub retries: u64,
    /// Estimated time to completion in milliseconds, when it can be estimated.
    pub eta_ms: Option<u64>,
    /// Caller-supplied metadata.
    pub metadata: Metadata,
    /// Reason recorded when the operation failed.
    pub error: Option<String>,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 time of the last change.
    pub updated_at: String,
}

impl OperationSnapshot {
    /// Items that reached an outcome (completed, failed or cancelled).
    pub fn processed(&self) -> usize {
        self.completed + self.failed_count + self.cancelled
    }
}

/// Errors raised by the progress tracker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// No operation with the given id exists.
    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),
    /// The requested change is not allowed from the current state.
    #[error("operation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Operation concerned.
        id: OperationId,
        /// Current state.
        from: OperationState,
        /// Requested state.
        to: OperationState,
    },
}
