//! Chunk data model and chunking errors.

use crate::config::ValidationError;
use anyhow::Error as TokenizerError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while turning redacted text into chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Chunker configuration describes an impossible token budget.
    #[error(transparent)]
    InvalidConfig(#[from] ValidationError),
    /// Tokenizer resources were unavailable for the configured model.
    #[error("failed to initialize tokenizer for model '{model}': {source}")]
    Tokenizer {
        /// Model or encoding we attempted to load.
        model: String,
        /// Underlying error raised by the tokenizer library.
        #[source]
        source: TokenizerError,
    },
    /// The blocking chunking task panicked or was cancelled.
    #[error("chunking task stopped unexpectedly: {0}")]
    Worker(String),
}

/// Ordered, token-bounded slice of a redacted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `"{document_id}#{position}"`.
    pub id: String,
    /// Identifier of the parent document.
    pub document_id: String,
    /// Zero-based order within the parent document.
    pub position: usize,
    /// Chunk text, including the overlap prefix.
    pub text: String,
    /// Tokens in `text` as measured by the chunker's counter.
    pub token_count: usize,
    /// Tokens shared with the tail of the previous chunk.
    pub overlap_tokens: usize,
    /// Byte length of the overlap prefix inside `text`.
    pub overlap_len: usize,
    /// Byte offset of `text` within the redacted document.
    pub start: usize,
    /// Byte offset one past the end of `text` within the redacted document.
    pub end: usize,
    /// Set when a sentence longer than the token budget had to be cut mid-sentence.
    pub coherence_broken: bool,
}

impl Chunk {
    /// Text contributed by this chunk alone, without the overlap prefix.
    pub fn body(&self) -> &str {
        self.text[self.overlap_len..].trim_start()
    }
}

/// Rebuild a document from its chunks (in position order), normalizing whitespace.
///
/// Bodies that continue a word cut at the previous chunk's end are joined without a space.
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|chunk| chunk.position);
    let mut joined = String::new();
    let mut previous_end: Option<usize> = None;
    for chunk in ordered {
        let body = chunk.body();
        let body_start = chunk.end.saturating_sub(body.len());
        if previous_end.is_some_and(|end| body_start != end) {
            joined.push(' ');
        }
        joined.push_str(body);
        previous_end = Some(chunk.end);
    }
    normalize_whitespace(&joined)
}

/// Collapse whitespace runs into single spaces and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
