//! Metadata filters applied to retrieval queries.

use crate::privacy::Metadata;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Conjunction of metadata conditions; an empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFilter {
    #[serde(default)]
    must: Vec<Condition>,
}

/// Single metadata constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "match")]
pub enum Condition {
    /// Field equals the value.
    Equals {
        /// Metadata key.
        key: String,
        /// Required value.
        value: String,
    },
    /// Field equals any of the values.
    AnyOf {
        /// Metadata key.
        key: String,
        /// Accepted values.
        values: HashSet<String>,
    },
}

impl MetadataFilter {
    /// Filter matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key == value`. Blank keys or values are ignored.
    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        if let (Some(key), Some(value)) = (non_empty(&key), non_empty(&value)) {
            self.must.push(Condition::Equals {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        self
    }

    /// Require `key` to equal one of `values`. Blank entries are dropped; an empty set is ignored.
    pub fn any_of<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.into();
        let cleaned: HashSet<String> = values
            .into_iter()
            .map(Into::into)
            .filter_map(|value| non_empty(&value).map(str::to_string))
            .collect();
        if let Some(key) = non_empty(&key) {
            if !cleaned.is_empty() {
                self.must.push(Condition::AnyOf {
                    key: key.to_string(),
                    values: cleaned,
                });
            }
        }
        self
    }

    /// Whether no conditions are present.
    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    /// Evaluate the filter against record metadata.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.must.iter().all(|condition| match condition {
            Condition::Equals { key, value } => metadata.get(key) == Some(value),
            Condition::AnyOf { key, values } => metadata
                .get(key)
                .is_some_and(|actual| values.contains(actual)),
        })
    }
}

fn non_empty(input: &str) -> Option<&str> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = MetadataFilter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&Metadata::new()));
    }

    #[test]
    fn equals_requires_exact_value() {
        let filter = MetadataFilter::new().equals("sender", "alice@example.org");
        assert!(filter.matches(&metadata(&[("sender", "alice@example.org")])));
        assert!(!filter.matches(&metadata(&[("sender", "bob@example.org")])));
        assert!(!filter.matches(&Metadata::new()));
    }

    #[test]
    fn any_of_accepts_listed_values() {
        let filter = MetadataFilter::new().any_of("label", ["inbox", "work"]);
        assert!(filter.matches(&metadata(&[("label", "work")])));
        assert!(!filter.matches(&metadata(&[("label", "spam")])));
    }

    #[test]
    fn any_of_collapses_duplicates_and_round_trips_json() {
        let filter = MetadataFilter::new().any_of("label", ["work", "work", "home"]);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["must"][0]["values"].as_array().unwrap().len(), 2);
        let restored: MetadataFilter = serde_json::from_value(json).unwrap();
        assert_eq!(restored, filter);
        assert!(restored.matches(&metadata(&[("label", "home")])));
    }

    #[test]
    fn blank_conditions_are_ignored() {
        let filter = MetadataFilter::new()
            .equals("  ", "value")
            .equals("key", " ")
            .any_of("label", ["", "  "]);
        assert!(filter.is_empty());
    }

    #[test]
    fn conditions_are_conjunctive() {
        let filter = MetadataFilter::new()
            .equals("document_id", "d1")
            .any_of("kind", ["chunk"]);
        assert!(filter.matches(&metadata(&[("document_id", "d1"), ("kind", "chunk")])));
        assert!(!filter.matches(&metadata(&[("document_id", "d1"), ("kind", "document")])));
    }
}
