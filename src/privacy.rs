//! Document types and the redaction boundary.
//!
//! A raw [`Document`] never enters the pipeline. The [`PrivacyGuardian`] consumes it by value and
//! returns a [`RedactedDocument`], which is the only document type the chunker, the batch
//! processor, and the retrieval index accept.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Free-form document metadata such as sender or date.
pub type Metadata = BTreeMap<String, String>;

/// Errors raised by a redaction component.
#[derive(Debug, Error)]
pub enum PrivacyError {
    /// The guardian refused to release the document.
    #[error("document '{id}' rejected by privacy guardian: {reason}")]
    Rejected {
        /// Identifier of the rejected document.
        id: String,
        /// Reason reported by the guardian.
        reason: String,
    },
    /// The guardian could not be reached.
    #[error("privacy guardian unavailable: {0}")]
    Unavailable(String),
}

/// Source document as fetched from the upstream provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Stable identifier.
    pub id: String,
    /// Raw, unredacted text.
    pub text: String,
    /// Provider metadata.
    pub metadata: Metadata,
}

impl Document {
    /// Build a document without metadata.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Document whose text has passed through a [`PrivacyGuardian`]. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactedDocument {
    id: String,
    text: String,
    metadata: Metadata,
}

impl RedactedDocument {
    /// Wrap already-redacted content. Intended for guardian implementations.
    pub fn new(id: impl Into<String>, text: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata,
        }
    }

    /// Stable identifier carried over from the source document.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Redacted text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Metadata carried over from the source document.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// Redaction component invoked before any text reaches the chunker.
#[async_trait]
pub trait PrivacyGuardian: Send + Sync {
    /// Consume a raw document and release its redacted form.
    async fn redact(&self, document: Document) -> Result<RedactedDocument, PrivacyError>;
}
