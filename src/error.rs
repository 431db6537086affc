//! Crate-wide error type and item failure classification.

use crate::batch::BatchError;
use crate::chunking::ChunkingError;
use crate::config::{ConfigError, ValidationError};
use crate::hierarchy::AggregationError;
use crate::persistence::PersistenceError;
use crate::privacy::PrivacyError;
use crate::progress::TrackerError;
use crate::rag::RagError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a work item ended up failed or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Backend call exceeded its timeout.
    Timeout,
    /// Backend throttled the request.
    RateLimited,
    /// Network-level failure reaching the backend.
    Connection,
    /// Backend returned an error response.
    Backend,
    /// Backend response did not line up with the request.
    MalformedResponse,
    /// Produced embedding did not match the index dimension.
    DimensionMismatch,
    /// Non-retryable failure that aborted the operation.
    Fatal,
    /// Item was never processed, or its result was discarded, because of cancellation.
    Cancelled,
}

impl FailureKind {
    /// Whether another attempt may succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Connection | Self::Backend
        )
    }

    /// Stable snake_case label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Connection => "connection",
            Self::Backend => "backend",
            Self::MalformedResponse => "malformed_response",
            Self::DimensionMismatch => "dimension_mismatch",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error surfaced by the [`crate::service::Pipeline`] facade.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A configuration value was rejected before any work was enqueued.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Redaction failed or refused a document.
    #[error(transparent)]
    Privacy(#[from] PrivacyError),
    /// Chunking failed.
    #[error(transparent)]
    Chunking(#[from] ChunkingError),
    /// Operation bookkeeping failed.
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    /// Batch execution failed.
    #[error(transparent)]
    Batch(#[from] BatchError),
    /// Retrieval failed.
    #[error(transparent)]
    Rag(#[from] RagError),
    /// Aggregation failed.
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    /// Durable storage failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(FailureKind::Timeout.is_transient());
        assert!(FailureKind::RateLimited.is_transient());
        assert!(!FailureKind::Fatal.is_transient());
        assert!(!FailureKind::Cancelled.is_transient());
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::MalformedResponse).unwrap();
        assert_eq!(json, "\"malformed_response\"");
        assert_eq!(FailureKind::RateLimited.to_string(), "rate_limited");
    }
}
