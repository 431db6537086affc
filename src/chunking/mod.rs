//! Semantic-aware chunking of redacted documents.
//!
//! This module decides where chunk boundaries fall and how much context carries across them.
//! Highlights:
//!
//! - Sentence units: the document is segmented into sentences; words are never cut unless a
//!   single word alone exceeds the token budget.
//! - Budget: a chunk closes before the next sentence would push it past `max_tokens`.
//! - Topic cuts: when the similarity between the window's trailing sentence and the next one
//!   drops below `coherence_threshold`, the chunk may close early, provided it already holds
//!   `min_tokens` of new content.
//! - Overlap: each chunk after the first starts with the last `overlap_tokens` of its
//!   predecessor (word aligned), so spans around boundaries remain visible downstream.
//! - Oversized sentences are hard-split word by word, and a word above budget is cut at char
//!   boundaries into pieces that each fit. The resulting chunks are flagged `coherence_broken`.

mod segment;
pub mod signal;
pub mod tokenizer;
pub mod types;

pub use signal::{CoherenceSignal, HashedEmbedder};
pub use tokenizer::{TokenCounter, build_token_counter, whitespace_token_counter};
pub use types::{Chunk, ChunkingError, normalize_whitespace, reconstruct};

use crate::config::ChunkerConfig;
use crate::privacy::RedactedDocument;
use crate::rag::similarity::cosine_similarity;
use segment::{Unit, Word, segment, split_word};
use std::sync::Arc;

/// Split a redacted document with a one-off chunker built from `config`.
pub fn split(
    document: &RedactedDocument,
    config: &ChunkerConfig,
) -> Result<Vec<Chunk>, ChunkingError> {
    Ok(Chunker::new(config.clone())?.split(document))
}

/// Reusable, deterministic document splitter.
#[derive(Clone)]
pub struct Chunker {
    config: ChunkerConfig,
    counter: TokenCounter,
    signal: Arc<dyn CoherenceSignal>,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Chunker {
    /// Validate `config` and load its tokenizer. Uses [`HashedEmbedder`] for topic detection.
    pub fn new(config: ChunkerConfig) -> Result<Self, ChunkingError> {
        config.validate()?;
        let counter = build_token_counter(&config.tokenizer)?;
        Ok(Self {
            config,
            counter,
            signal: Arc::new(HashedEmbedder::default()),
        })
    }

    /// Replace the similarity signal used for topic cuts.
    pub fn with_signal(mut self, signal: Arc<dyn CoherenceSignal>) -> Self {
        self.signal = signal;
        self
    }

    /// Replace the token counter.
    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.counter = counter;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Count tokens with the configured counter.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.as_ref()(text)
    }

    /// Split `document` into ordered chunks. An empty document yields no chunks.
    pub fn split(&self, document: &RedactedDocument) -> Vec<Chunk> {
        let text = document.text();
        let units = segment(text, &self.counter);
        let mut builder = ChunkBuilder::new(document, &self.config, &self.counter);
        let mut previous_signal: Option<Vec<f32>> = None;

        for unit in &units {
            let signal = self.signal.embed(unit.text(text));
            let topic_break = previous_signal
                .as_ref()
                .map(|previous| cosine_similarity(previous, &signal) < self.config.coherence_threshold)
                .unwrap_or(false);
            builder.push_unit(unit, topic_break);
            previous_signal = Some(signal);
        }

        let chunks = builder.finish();
        tracing::debug!(
            document = document.id(),
            sentences = units.len(),
            chunks = chunks.len(),
            broken = chunks.iter().filter(|chunk| chunk.coherence_broken).count(),
            "Document chunked"
        );
        chunks
    }
}

/// Growing window of words plus the chunks closed so far.
struct ChunkBuilder<'a> {
    document: &'a RedactedDocument,
    counter: &'a TokenCounter,
    max_tokens: usize,
    overlap_tokens: usize,
    min_tokens: usize,
    words: Vec<Word>,
    seed_len: usize,
    tokens: usize,
    broken: bool,
    chunks: Vec<Chunk>,
}

impl<'a> ChunkBuilder<'a> {
    fn new(
        document: &'a RedactedDocument,
        config: &ChunkerConfig,
        counter: &'a TokenCounter,
    ) -> Self {
        Self {
            document,
            counter,
            max_tokens: config.max_tokens,
            overlap_tokens: config.overlap_tokens,
            min_tokens: config.min_tokens.min(config.max_tokens),
            words: Vec::new(),
            seed_len: 0,
            tokens: 0,
            broken: false,
            chunks: Vec::new(),
        }
    }

    fn has_new_content(&self) -> bool {
        self.words.len() > self.seed_len
    }

    fn new_tokens(&self) -> usize {
        self.words[self.seed_len..]
            .iter()
            .map(|word| word.tokens)
            .sum()
    }

    fn push_unit(&mut self, unit: &Unit, topic_break: bool) {
        if self.has_new_content() {
            let overflow = self.tokens + unit.tokens > self.max_tokens;
            let topic_cut = topic_break && self.new_tokens() >= self.min_tokens;
            if overflow || topic_cut {
                self.close();
            }
        }

        if self.tokens + unit.tokens <= self.max_tokens {
            self.extend(&unit.words);
        } else if unit.tokens <= self.max_tokens {
            self.shrink_seed(self.max_tokens - unit.tokens);
            self.extend(&unit.words);
        } else {
            self.hard_split(unit);
        }
    }

    /// Cut an oversized sentence at word boundaries, and oversized words at char boundaries.
    fn hard_split(&mut self, unit: &Unit) {
        self.broken = true;
        let words: Vec<Word> = unit
            .words
            .iter()
            .flat_map(|&word| {
                if word.tokens > self.max_tokens {
                    split_word(self.document.text(), word, self.max_tokens, self.counter)
                } else {
                    vec![word]
                }
            })
            .collect();
        for word in &words {
            if self.has_new_content() && self.tokens + word.tokens > self.max_tokens {
                self.close();
                self.broken = true;
            }
            if self.tokens + word.tokens > self.max_tokens {
                self.shrink_seed(self.max_tokens.saturating_sub(word.tokens));
            }
            self.extend(std::slice::from_ref(word));
        }
    }

    fn extend(&mut self, words: &[Word]) {
        self.tokens += words.iter().map(|word| word.tokens).sum::<usize>();
        self.words.extend_from_slice(words);
    }

    /// Drop overlap words from the front until the window holds at most `budget` tokens.
    fn shrink_seed(&mut self, budget: usize) {
        let mut dropped = 0;
        while dropped < self.seed_len && self.tokens > budget {
            self.tokens -= self.words[dropped].tokens;
            dropped += 1;
        }
        if dropped > 0 {
            self.words.drain(..dropped);
            self.seed_len -= dropped;
        }
    }

    fn close(&mut self) {
        if !self.has_new_content() {
            return;
        }

        let text = self.document.text();
        let start = self.words[0].start;
        let end = self.words[self.words.len() - 1].end;
        let overlap_len = if self.seed_len > 0 {
            self.words[self.seed_len].start - start
        } else {
            0
        };
        let overlap_tokens = self.words[..self.seed_len]
            .iter()
            .map(|word| word.tokens)
            .sum();
        let position = self.chunks.len();

        self.chunks.push(Chunk {
            id: format!("{}#{}", self.document.id(), position),
            document_id: self.document.id().to_string(),
            position,
            text: text[start..end].to_string(),
            token_count: self.tokens,
            overlap_tokens,
            overlap_len,
            start,
            end,
            coherence_broken: self.broken,
        });

        let seed = self.tail_for_overlap();
        self.tokens = seed.iter().map(|word| word.tokens).sum();
        self.seed_len = seed.len();
        self.words = seed;
        self.broken = false;
    }

    /// Trailing words of the current window totalling at most `overlap_tokens`.
    fn tail_for_overlap(&self) -> Vec<Word> {
        let mut budget = self.overlap_tokens;
        let mut first = self.words.len();
        while first > 0 {
            let candidate = self.words[first - 1].tokens;
            if candidate > budget {
                break;
            }
            budget -= candidate;
            first -= 1;
        }
        self.words[first..].to_vec()
    }

    fn finish(mut self) -> Vec<Chunk> {
        self.close();
        self.chunks
    }
}
