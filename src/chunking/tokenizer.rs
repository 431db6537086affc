//! Token counting.
//!
//! Prefer `tiktoken-rs` when a model or encoding name is configured; the whitespace counter is the
//! default because it makes overlap measurements exact (one word is one token).

use crate::config::TokenizerKind;
use anyhow::Error as TokenizerError;
use std::sync::Arc;
use tiktoken_rs::{
    CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, p50k_edit, r50k_base,
};

use super::types::ChunkingError;

/// Shared token counting function.
pub type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Build a token counter for the configured strategy.
pub fn build_token_counter(kind: &TokenizerKind) -> Result<TokenCounter, ChunkingError> {
    match kind {
        TokenizerKind::Whitespace => Ok(whitespace_token_counter()),
        TokenizerKind::Tiktoken(model) => build_tiktoken_counter(model),
    }
}

fn build_tiktoken_counter(model: &str) -> Result<TokenCounter, ChunkingError> {
    let normalized = model.trim();
    let target = if normalized.is_empty() {
        "cl100k_base"
    } else {
        normalized
    };
    let encoding = resolve_encoding(target).map_err(|source| ChunkingError::Tokenizer {
        model: target.to_string(),
        source,
    })?;
    let encoding = Arc::new(encoding);

    Ok(Arc::new(move |segment: &str| {
        encoding.encode_ordinary(segment).len()
    }))
}

fn resolve_encoding(model: &str) -> Result<CoreBPE, TokenizerError> {
    if let Some(candidate) = encoding_from_name(model) {
        return candidate;
    }
    match get_bpe_from_model(model) {
        Ok(encoding) => Ok(encoding),
        Err(model_err) => {
            tracing::warn!(
                model,
                error = %model_err,
                "Unknown tokenizer model; falling back to 'cl100k_base'"
            );
            cl100k_base()
        }
    }
}

fn encoding_from_name(name: &str) -> Option<Result<CoreBPE, TokenizerError>> {
    match name {
        "cl100k_base" => Some(cl100k_base()),
        "o200k_base" => Some(o200k_base()),
        "p50k_base" => Some(p50k_base()),
        "p50k_edit" => Some(p50k_edit()),
        "r50k_base" | "gpt2" => Some(r50k_base()),
        _ => None,
    }
}

/// Count whitespace-separated words.
pub fn whitespace_token_counter() -> TokenCounter {
    Arc::new(|segment: &str| segment.split_whitespace().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_counter_counts_words() {
        let counter = whitespace_token_counter();
        assert_eq!(counter.as_ref()("one two  three\nfour"), 4);
        assert_eq!(counter.as_ref()("   "), 0);
        assert_eq!(counter.as_ref()(""), 0);
    }

    #[test]
    fn tiktoken_counter_loads_named_encoding() {
        let counter =
            build_token_counter(&TokenizerKind::Tiktoken("cl100k_base".into())).expect("encoding");
        let tokens = counter.as_ref()("The quick brown fox jumps over the lazy dog.");
        assert!(tokens >= 9);
        assert!(tokens <= 12);
    }

    #[test]
    fn unknown_model_falls_back_to_cl100k() {
        let counter = build_token_counter(&TokenizerKind::Tiktoken("not-a-real-model".into()))
            .expect("fallback encoding");
        assert!(counter.as_ref()("hello world") >= 2);
    }
}
