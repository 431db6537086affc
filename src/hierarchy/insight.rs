use crate::clock::current_timestamp_rfc3339;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Aggregation level of an insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightLevel {
    /// Level 0: one insight per completed work item.
    Chunk,
    /// Level 1: one insight per document.
    Document,
    /// Level 2: one insight per cluster of related documents.
    Corpus,
}

impl InsightLevel {
    /// Numeric level (0, 1 or 2).
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Chunk => 0,
            Self::Document => 1,
            Self::Corpus => 2,
        }
    }
}

impl TryFrom<u8> for InsightLevel {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Chunk),
            1 => Ok(Self::Document),
            2 => Ok(Self::Corpus),
            other => Err(other),
        }
    }
}

impl fmt::Display for InsightLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Chunk => "chunk",
            Self::Document => "document",
            Self::Corpus => "corpus",
        };
        f.write_str(label)
    }
}

/// Immutable aggregation result.
///
/// Fields are read-only; a new aggregation produces new `Insight` values instead of editing old
/// ones. The id is derived from the level and provenance, so re-aggregating identical inputs
/// yields the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    id: String,
    level: InsightLevel,
    summary: String,
    confidence: f32,
    provenance: Vec<String>,
    created_at: String,
}

impl Insight {
    pub(crate) fn new(
        level: InsightLevel,
        summary: String,
        confidence: f32,
        provenance: Vec<String>,
    ) -> Self {
        Self {
            id: compute_insight_id(level, &provenance),
            level,
            summary,
            confidence: confidence.clamp(0.0, 1.0),
            provenance,
            created_at: current_timestamp_rfc3339(),
        }
    }

    /// Deterministic identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Aggregation level.
    pub fn level(&self) -> InsightLevel {
        self.level
    }

    /// Summary text.
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Confidence in `[0, 1]`.
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Ordered ids of the work items that contributed.
    pub fn provenance(&self) -> &[String] {
        &self.provenance
    }

    /// RFC 3339 creation time.
    pub fn created_at(&self) -> &str {
        &self.created_at
    }
}

/// SHA-256 over the level and provenance ids, hex encoded.
pub fn compute_insight_id(level: InsightLevel, provenance: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update([level.as_u8()]);
    for id in provenance {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insight_id_depends_on_level_and_provenance() {
        let ids = vec!["a#0".to_string(), "a#1".to_string()];
        let same = compute_insight_id(InsightLevel::Document, &ids);
        assert_eq!(same, compute_insight_id(InsightLevel::Document, &ids));
        assert_ne!(same, compute_insight_id(InsightLevel::Corpus, &ids));
        assert_ne!(
            compute_insight_id(InsightLevel::Document, &["ab".into()]),
            compute_insight_id(InsightLevel::Document, &["a".into(), "b".into()])
        );
        assert_eq!(same.len(), 64);
    }

    #[test]
    fn levels_convert_from_numbers() {
        assert_eq!(InsightLevel::try_from(2), Ok(InsightLevel::Corpus));
        assert_eq!(InsightLevel::try_from(3), Err(3));
    }

    #[test]
    fn confidence_is_clamped() {
        let insight = Insight::new(InsightLevel::Chunk, "s".into(), 1.7, vec!["x".into()]);
        assert_eq!(insight.confidence(), 1.0);
        assert_eq!(insight.provenance(), ["x".to_string()]);
    }
}
