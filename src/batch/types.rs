use crate::chunking::Chunk;
use crate::privacy::{Metadata, RedactedDocument};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Unit of work handed to the batch processor.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    /// A chunk produced by the chunker.
    Chunk(Chunk),
    /// A whole redacted document.
    Document(RedactedDocument),
}

/// Tag describing which variant a work item is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    /// Chunk-level item.
    Chunk,
    /// Document-level item.
    Document,
}

impl WorkItemKind {
    /// Stable label stored in vector metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Document => "document",
        }
    }
}

impl WorkItem {
    /// Identifier unique within a submission.
    pub fn id(&self) -> &str {
        match self {
            Self::Chunk(chunk) => &chunk.id,
            Self::Document(document) => document.id(),
        }
    }

    /// Variant tag.
    pub fn kind(&self) -> WorkItemKind {
        match self {
            Self::Chunk(_) => WorkItemKind::Chunk,
            Self::Document(_) => WorkItemKind::Document,
        }
    }

    /// Text sent to the backend.
    pub fn text(&self) -> &str {
        match self {
            Self::Chunk(chunk) => &chunk.text,
            Self::Document(document) => document.text(),
        }
    }

    /// Id of the document the item belongs to.
    pub fn document_id(&self) -> &str {
        match self {
            Self::Chunk(chunk) => &chunk.document_id,
            Self::Document(document) => document.id(),
        }
    }

    /// Position within the parent document, for chunks.
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::Chunk(chunk) => Some(chunk.position),
            Self::Document(_) => None,
        }
    }

    /// Whether the chunk was hard-split.
    pub fn coherence_broken(&self) -> bool {
        match self {
            Self::Chunk(chunk) => chunk.coherence_broken,
            Self::Document(_) => false,
        }
    }

    /// Tokens counted toward the batch budget. Documents are estimated by whitespace words.
    pub fn token_estimate(&self) -> usize {
        match self {
            Self::Chunk(chunk) => chunk.token_count,
            Self::Document(document) => document.text().split_whitespace().count(),
        }
    }

    /// Metadata attached to stored vectors.
    pub fn vector_metadata(&self) -> Metadata {
        let mut metadata = match self {
            Self::Chunk(_) => Metadata::new(),
            Self::Document(document) => document.metadata().clone(),
        };
        metadata.insert("document_id".into(), self.document_id().to_string());
        metadata.insert("kind".into(), self.kind().as_str().to_string());
        if let Some(position) = self.position() {
            metadata.insert("position".into(), position.to_string());
        }
        metadata
    }
}

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Waiting for a worker slot.
    Pending,
    /// Backend call in flight.
    Running,
    /// Every item succeeded.
    Completed,
    /// Retries exhausted or a non-retryable error occurred.
    Failed,
    /// Never admitted, or results discarded, because the operation stopped.
    Cancelled,
}

/// Bounded group of work items executed with a single backend call.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Zero-based index in submission order.
    pub index: usize,
    /// Items in submission order.
    pub items: Vec<WorkItem>,
    /// Current status.
    pub status: BatchStatus,
    /// Backend attempts made for every item of the batch.
    pub attempts: u32,
}

impl Batch {
    /// Ids of the contained items.
    pub fn item_ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id().to_string()).collect()
    }
}

/// Group items into batches of at most `batch_size` items, closing a batch early when its token
/// total would exceed `max_tokens`. An item larger than the budget forms its own batch.
pub fn build_batches(
    items: Vec<WorkItem>,
    batch_size: usize,
    max_tokens: Option<usize>,
) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<WorkItem> = Vec::new();
    let mut current_tokens = 0usize;

    for item in items {
        let tokens = item.token_estimate();
        let over_budget = max_tokens.is_some_and(|limit| current_tokens + tokens > limit);
        if !current.is_empty() && (current.len() >= batch_size || over_budget) {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }

    batches
        .into_iter()
        .enumerate()
        .map(|(index, items)| Batch {
            index,
            items,
            status: BatchStatus::Pending,
            attempts: 0,
        })
        .collect()
}

/// What happens to in-flight batches when an operation is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPolicy {
    /// Let in-flight calls return, then discard their results.
    #[default]
    Abandon,
    /// Keep results of in-flight calls in the item ledger.
    Drain,
}

impl FromStr for CancellationPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abandon" => Ok(Self::Abandon),
            "drain" => Ok(Self::Drain),
            _ => Err(()),
        }
    }
}

/// Which backend capability each call requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Embeddings only.
    Embedding,
    /// Analysis (summary) only.
    Analysis,
    /// Embeddings and analysis.
    #[default]
    Both,
}

impl RequestKind {
    /// Whether responses must carry embeddings.
    pub fn wants_embedding(self) -> bool {
        matches!(self, Self::Embedding | Self::Both)
    }

    /// Whether responses should carry analysis.
    pub fn wants_analysis(self) -> bool {
        matches!(self, Self::Analysis | Self::Both)
    }
}

impl FromStr for RequestKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "embedding" | "embeddings" => Ok(Self::Embedding),
            "analysis" => Ok(Self::Analysis),
            "both" => Ok(Self::Both),
            _ => Err(()),
        }
    }
}
