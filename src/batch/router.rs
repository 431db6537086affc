//! Seam to the external backend selector.

use super::types::{RequestKind, WorkItemKind};
use crate::error::FailureKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One item of a backend request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterInput {
    /// Work item id.
    pub id: String,
    /// Redacted text.
    pub text: String,
    /// Item variant.
    pub kind: WorkItemKind,
}

/// Payload of a single backend call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterPayload {
    /// Items, in batch order.
    pub items: Vec<RouterInput>,
}

/// Backend result for one item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendOutput {
    /// Embedding, when requested.
    pub embedding: Option<Vec<f32>>,
    /// Free-text analysis (summary), when requested.
    pub analysis: Option<String>,
    /// Backend confidence in `[0, 1]`.
    pub confidence: f32,
}

/// Failure reported by the router.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RouterError {
    /// Retryable failure such as a timeout or rate limit.
    #[error("transient backend failure ({kind}): {message}")]
    Transient {
        /// Classification of the failure.
        kind: FailureKind,
        /// Backend-supplied detail.
        message: String,
    },
    /// Failure no retry can fix; aborts the operation.
    #[error("fatal backend failure: {0}")]
    Fatal(String),
}

impl RouterError {
    /// Shorthand for a transient failure.
    pub fn transient(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    /// Classification recorded on failed items.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient { kind, .. } => *kind,
            Self::Fatal(_) => FailureKind::Fatal,
        }
    }
}

/// Dispatches embedding and analysis calls to whichever backend is appropriate.
///
/// Implementations return exactly one [`BackendOutput`] per input item, in order.
#[async_trait]
pub trait IntelligenceRouter: Send + Sync {
    /// Execute one backend call.
    async fn route(
        &self,
        kind: RequestKind,
        payload: RouterPayload,
    ) -> Result<Vec<BackendOutput>, RouterError>;
}
