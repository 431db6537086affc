//! Environment-driven configuration for the pipeline components.
//!
//! Every knob has a default so an empty environment yields a usable (if conservative) setup. The
//! one exception is `EMBEDDING_DIMENSION`: leaving it unset is allowed at load time but any vector
//! operation then fails with a fatal configuration error.

use crate::batch::{CancellationPolicy, RequestKind};
use crate::rag::SimilarityMetric;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
    /// Values parsed but describe an impossible configuration.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// A configuration value rejected before any work was enqueued.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid configuration for `{field}`: {reason}")]
pub struct ValidationError {
    /// Name of the offending field.
    pub field: &'static str,
    /// Human readable explanation.
    pub reason: String,
}

impl ValidationError {
    pub(crate) fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Token counting strategy used by the chunker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    /// One token per whitespace-separated word.
    Whitespace,
    /// A `tiktoken` model or encoding name such as `cl100k_base`.
    Tiktoken(String),
}

impl FromStr for TokenizerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "" => Err(()),
            "whitespace" | "words" => Ok(Self::Whitespace),
            _ => Ok(Self::Tiktoken(trimmed.to_string())),
        }
    }
}

/// Chunk sizing and boundary detection knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Upper bound on tokens per chunk.
    pub max_tokens: usize,
    /// Tokens carried from the tail of one chunk into the head of the next.
    pub overlap_tokens: usize,
    /// Similarity between adjacent sentences below which a topic cut is permitted.
    pub coherence_threshold: f32,
    /// New (non-overlap) tokens a chunk must hold before a topic cut may close it. Values above
    /// `max_tokens` behave like `max_tokens`, which disables topic cuts.
    pub min_tokens: usize,
    /// Token counting strategy.
    pub tokenizer: TokenizerKind,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            overlap_tokens: 64,
            coherence_threshold: 0.10,
            min_tokens: 128,
            tokenizer: TokenizerKind::Whitespace,
        }
    }
}

impl ChunkerConfig {
    /// Reject impossible budgets.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_tokens == 0 {
            return Err(ValidationError::new(
                "max_tokens",
                "must be greater than zero",
            ));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err(ValidationError::new(
                "overlap_tokens",
                format!(
                    "must be smaller than max_tokens ({} >= {})",
                    self.overlap_tokens, self.max_tokens
                ),
            ));
        }
        if !self.coherence_threshold.is_finite() || !(-1.0..=1.0).contains(&self.coherence_threshold)
        {
            return Err(ValidationError::new(
                "coherence_threshold",
                "must be a finite similarity in [-1, 1]",
            ));
        }
        Ok(())
    }
}

/// Grouping, concurrency, and retry knobs for the batch processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum items per batch.
    pub batch_size: usize,
    /// Optional cumulative token budget per batch.
    pub max_batch_tokens: Option<usize>,
    /// Batches allowed in flight at once.
    pub max_concurrency: usize,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub backoff_base: Duration,
    /// Ceiling applied to every computed backoff delay.
    pub max_backoff: Duration,
    /// Deadline for a single backend call.
    pub timeout_per_call: Duration,
    /// Failed/total ratio above which the operation is marked failed.
    pub failure_ratio_threshold: f64,
    /// What happens to in-flight batches on cancellation.
    pub cancellation_policy: CancellationPolicy,
    /// Kind of backend request issued per batch.
    pub request_kind: RequestKind,
    /// Vector namespace that receives produced embeddings.
    pub namespace: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            max_batch_tokens: None,
            max_concurrency: 4,
            max_retries: 3,
            backoff_base: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            timeout_per_call: Duration::from_secs(30),
            failure_ratio_threshold: 0.5,
            cancellation_policy: CancellationPolicy::Abandon,
            request_kind: RequestKind::Both,
            namespace: "default".into(),
        }
    }
}

impl BatchConfig {
    /// Reject configurations that could never make progress.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::new(
                "batch_size",
                "must be greater than zero",
            ));
        }
        if self.max_batch_tokens == Some(0) {
            return Err(ValidationError::new(
                "max_batch_tokens",
                "must be greater than zero when set",
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ValidationError::new(
                "max_concurrency",
                "must be greater than zero",
            ));
        }
        if self.timeout_per_call.is_zero() {
            return Err(ValidationError::new(
                "timeout_per_call",
                "must be greater than zero",
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_ratio_threshold) {
            return Err(ValidationError::new(
                "failure_ratio_threshold",
                "must be within [0, 1]",
            ));
        }
        if self.namespace.trim().is_empty() {
            return Err(ValidationError::new("namespace", "must not be empty"));
        }
        Ok(())
    }
}

/// Vector store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagConfig {
    /// Fixed embedding dimension; `None` means it was never configured.
    pub dimension: Option<usize>,
    /// Similarity function used for ranking.
    pub metric: SimilarityMetric,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            dimension: None,
            metric: SimilarityMetric::Cosine,
        }
    }
}

impl RagConfig {
    /// Reject a zero dimension; an absent one is reported lazily as fatal.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.dimension == Some(0) {
            return Err(ValidationError::new(
                "dimension",
                "must be greater than zero when set",
            ));
        }
        Ok(())
    }
}

/// Hierarchical aggregation knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Neighbours requested per document when building corpus clusters.
    pub related_k: usize,
    /// Minimum similarity for two documents to share a cluster.
    pub cluster_threshold: f32,
    /// Weight applied to chunks flagged `coherence_broken`.
    pub broken_chunk_weight: f32,
    /// Word budget for merged summaries.
    pub max_summary_words: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            related_k: 8,
            cluster_threshold: 0.75,
            broken_chunk_weight: 0.5,
            max_summary_words: 120,
        }
    }
}

impl AggregationConfig {
    /// Reject weights and thresholds outside their meaningful range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.related_k == 0 {
            return Err(ValidationError::new(
                "related_k",
                "must be greater than zero",
            ));
        }
        if !(0.0..=1.0).contains(&self.broken_chunk_weight) {
            return Err(ValidationError::new(
                "broken_chunk_weight",
                "must be within [0, 1]",
            ));
        }
        if !self.cluster_threshold.is_finite() {
            return Err(ValidationError::new(
                "cluster_threshold",
                "must be finite",
            ));
        }
        if self.max_summary_words == 0 {
            return Err(ValidationError::new(
                "max_summary_words",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Runtime configuration for the whole pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Chunker settings.
    pub chunker: ChunkerConfig,
    /// Batch processor settings.
    pub batch: BatchConfig,
    /// Vector store settings.
    pub rag: RagConfig,
    /// Aggregation settings.
    pub aggregation: AggregationConfig,
}

impl Config {
    /// Load `.env` (when present) and then read configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self::from_env()?;
        tracing::debug!(
            max_tokens = config.chunker.max_tokens,
            overlap_tokens = config.chunker.overlap_tokens,
            batch_size = config.batch.batch_size,
            max_concurrency = config.batch.max_concurrency,
            dimension = ?config.rag.dimension,
            metric = ?config.rag.metric,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Read configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup, falling back to defaults per key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let source = Source(lookup);

        let chunker = ChunkerConfig {
            max_tokens: source
                .parsed("CHUNK_MAX_TOKENS")?
                .unwrap_or(defaults.chunker.max_tokens),
            overlap_tokens: source
                .parsed("CHUNK_OVERLAP_TOKENS")?
                .unwrap_or(defaults.chunker.overlap_tokens),
            coherence_threshold: source
                .parsed("CHUNK_COHERENCE_THRESHOLD")?
                .unwrap_or(defaults.chunker.coherence_threshold),
            min_tokens: source
                .parsed("CHUNK_MIN_TOKENS")?
                .unwrap_or(defaults.chunker.min_tokens),
            tokenizer: source
                .parsed("CHUNK_TOKENIZER")?
                .unwrap_or(defaults.chunker.tokenizer),
        };

        let batch = BatchConfig {
            batch_size: source
                .parsed("BATCH_SIZE")?
                .unwrap_or(defaults.batch.batch_size),
            max_batch_tokens: source.parsed("BATCH_MAX_TOKENS")?,
            max_concurrency: source
                .parsed("BATCH_MAX_CONCURRENCY")?
                .unwrap_or(defaults.batch.max_concurrency),
            max_retries: source
                .parsed("BATCH_MAX_RETRIES")?
                .unwrap_or(defaults.batch.max_retries),
            backoff_base: source
                .millis("BATCH_BACKOFF_BASE_MS")?
                .unwrap_or(defaults.batch.backoff_base),
            max_backoff: source
                .millis("BATCH_MAX_BACKOFF_MS")?
                .unwrap_or(defaults.batch.max_backoff),
            timeout_per_call: source
                .millis("BATCH_TIMEOUT_MS")?
                .unwrap_or(defaults.batch.timeout_per_call),
            failure_ratio_threshold: source
                .parsed("BATCH_FAILURE_RATIO")?
                .unwrap_or(defaults.batch.failure_ratio_threshold),
            cancellation_policy: source
                .parsed("BATCH_CANCELLATION_POLICY")?
                .unwrap_or(defaults.batch.cancellation_policy),
            request_kind: source
                .parsed("BATCH_REQUEST_KIND")?
                .unwrap_or(defaults.batch.request_kind),
            namespace: source
                .raw("RAG_NAMESPACE")
                .unwrap_or(defaults.batch.namespace),
        };

        let rag = RagConfig {
            dimension: source.parsed("EMBEDDING_DIMENSION")?,
            metric: source
                .parsed("RAG_METRIC")?
                .unwrap_or(defaults.rag.metric),
        };

        let aggregation = AggregationConfig {
            related_k: source
                .parsed("AGGREGATE_RELATED_K")?
                .unwrap_or(defaults.aggregation.related_k),
            cluster_threshold: source
                .parsed("AGGREGATE_CLUSTER_THRESHOLD")?
                .unwrap_or(defaults.aggregation.cluster_threshold),
            broken_chunk_weight: source
                .parsed("AGGREGATE_BROKEN_WEIGHT")?
                .unwrap_or(defaults.aggregation.broken_chunk_weight),
            max_summary_words: source
                .parsed("AGGREGATE_MAX_WORDS")?
                .unwrap_or(defaults.aggregation.max_summary_words),
        };

        let config = Self {
            chunker,
            batch,
            rag,
            aggregation,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate every component section.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.chunker.validate()?;
        self.batch.validate()?;
        self.rag.validate()?;
        self.aggregation.validate()
    }
}

struct Source<F>(F);

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.raw(key)
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(key.to_string()))
            })
            .transpose()
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parsed::<u64>(key)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = Config::from_lookup(|_| None).expect("defaults are valid");
        assert_eq!(config, Config::default());
        assert!(config.rag.dimension.is_none());
    }

    #[test]
    fn reads_overrides_from_lookup() {
        let config = Config::from_lookup(lookup(&[
            ("CHUNK_MAX_TOKENS", "1000"),
            ("CHUNK_OVERLAP_TOKENS", "100"),
            ("CHUNK_TOKENIZER", "cl100k_base"),
            ("BATCH_SIZE", "10"),
            ("BATCH_BACKOFF_BASE_MS", "5"),
            ("BATCH_CANCELLATION_POLICY", "drain"),
            ("EMBEDDING_DIMENSION", "768"),
            ("RAG_METRIC", "inner_product"),
            ("RAG_NAMESPACE", " tenant-a "),
        ]))
        .expect("config");

        assert_eq!(config.chunker.max_tokens, 1000);
        assert_eq!(config.chunker.overlap_tokens, 100);
        assert_eq!(
            config.chunker.tokenizer,
            TokenizerKind::Tiktoken("cl100k_base".into())
        );
        assert_eq!(config.batch.batch_size, 10);
        assert_eq!(config.batch.backoff_base, Duration::from_millis(5));
        assert_eq!(config.batch.cancellation_policy, CancellationPolicy::Drain);
        assert_eq!(config.batch.namespace, "tenant-a");
        assert_eq!(config.rag.dimension, Some(768));
        assert_eq!(config.rag.metric, SimilarityMetric::InnerProduct);
    }

    #[test]
    fn rejects_unparseable_values() {
        let error = Config::from_lookup(lookup(&[("BATCH_SIZE", "ten")])).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidValue(key) if key == "BATCH_SIZE"));
    }

    #[test]
    fn rejects_overlap_not_below_max_tokens() {
        let error = Config::from_lookup(lookup(&[
            ("CHUNK_MAX_TOKENS", "100"),
            ("CHUNK_OVERLAP_TOKENS", "100"),
        ]))
        .unwrap_err();
        match error {
            ConfigError::Validation(validation) => assert_eq!(validation.field, "overlap_tokens"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn batch_validation_rejects_zero_concurrency() {
        let config = BatchConfig {
            max_concurrency: 0,
            ..BatchConfig::default()
        };
        assert_eq!(
            config.validate().unwrap_err().field,
            "max_concurrency"
        );
    }

    #[test]
    fn tokenizer_kind_parses_whitespace_alias() {
        assert_eq!("Words".parse::<TokenizerKind>(), Ok(TokenizerKind::Whitespace));
        assert!("  ".parse::<TokenizerKind>().is_err());
    }
}
