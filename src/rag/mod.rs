//! Vector storage and similarity search.
//!
//! Highlights:
//! - Records are partitioned by namespace; queries never cross partitions.
//! - Dimension is fixed by configuration and enforced on every write and query.
//! - [`SearchHandle`] exposes the index read-only to aggregation and HTTP callers.

mod engine;
mod filters;
pub mod similarity;
mod types;

pub use engine::{RagEngine, SearchHandle, storage_key};
pub use filters::{Condition, MetadataFilter};
pub use similarity::SimilarityMetric;
pub use types::{DEFAULT_NAMESPACE, RagError, ScoredRecord, UpsertAck, VectorRecord};
