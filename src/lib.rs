#![deny(missing_docs)]

//! Core library for Rusty Corpus, a chunk, batch, retrieve and aggregate pipeline for large text
//! corpora.

/// HTTP routing and REST handlers.
pub mod api;
/// Concurrent, retrying batch execution against the intelligence router.
pub mod batch;
/// Token-bounded, coherence-aware document chunking.
pub mod chunking;
/// Injectable time source.
pub mod clock;
/// Environment-driven configuration management.
pub mod config;
/// Shared error types.
pub mod error;
/// Multi-level aggregation of batch results into insights.
pub mod hierarchy;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline metrics helpers.
pub mod metrics;
/// Durable key/value storage abstraction.
pub mod persistence;
/// Privacy guardian boundary and redacted document types.
pub mod privacy;
/// Operation progress tracking.
pub mod progress;
/// In-process vector index with filtered similarity search.
pub mod rag;
/// Pipeline facade and its service trait.
pub mod service;

pub use error::{FailureKind, PipelineError};
pub use service::{IngestReceipt, Pipeline, PipelineApi, PipelineBuilder, SearchRequest};
