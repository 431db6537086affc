//! Shared types used by the retrieval engine.

use crate::persistence::PersistenceError;
use crate::privacy::Metadata;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Namespace used when a record or query does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Errors returned by the retrieval engine.
#[derive(Debug, Error)]
pub enum RagError {
    /// An embedding does not match the configured dimension; nothing was written.
    #[error("embedding dimension mismatch for '{id}': expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Record (or `"<query>"`) carrying the offending vector.
        id: String,
        /// Dimension configured on the engine.
        expected: usize,
        /// Dimension that was supplied.
        actual: usize,
    },
    /// An embedding contains NaN or an infinite component; nothing was written.
    #[error("embedding for '{id}' has a non-finite component at index {index}")]
    NonFiniteEmbedding {
        /// Record (or `"<query>"`) carrying the offending vector.
        id: String,
        /// Position of the first non-finite component.
        index: usize,
    },
    /// The engine cannot operate with its current configuration.
    #[error("fatal configuration error: {0}")]
    FatalConfiguration(String),
    /// Durable storage rejected a read or write.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Stored embedding plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Identifier matching the chunk or document that produced the vector.
    pub id: String,
    /// Fixed-dimension embedding.
    pub embedding: Vec<f32>,
    /// Filterable metadata.
    pub metadata: Metadata,
    /// Tenant partition; `None` means [`DEFAULT_NAMESPACE`].
    pub namespace: Option<String>,
}

impl VectorRecord {
    /// Build a record in the default namespace with no metadata.
    pub fn new(id: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            embedding,
            metadata: Metadata::new(),
            namespace: None,
        }
    }

    /// Place the record in a namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Namespace the record lives in.
    pub fn effective_namespace(&self) -> &str {
        resolve_namespace(self.namespace.as_deref())
    }
}

/// Query hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecord {
    /// Matching record as stored at query time.
    pub record: VectorRecord,
    /// Similarity under the engine's metric.
    pub similarity: f32,
}

/// Summary describing how an upsert was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertAck {
    /// Records that did not exist before.
    pub inserted: usize,
    /// Records that replaced an existing id.
    pub updated: usize,
}

pub(crate) fn resolve_namespace(namespace: Option<&str>) -> &str {
    match namespace.map(str::trim) {
        Some(value) if !value.is_empty() => value,
        _ => DEFAULT_NAMESPACE,
    }
}
