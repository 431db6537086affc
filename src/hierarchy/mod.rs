//! Multi-level aggregation of backend results.
//!
//! Highlights:
//! - Level 0 exposes per-item results, level 1 merges them per document, level 2 clusters related
//!   documents found through the retrieval index.
//! - Chunks that were hard-split count for less when merging.
//! - Every insight lists the item ids it was built from.

mod insight;
mod processor;
mod summarize;

pub use insight::{Insight, InsightLevel, compute_insight_id};
pub use processor::{AggregationError, HierarchicalProcessor};
