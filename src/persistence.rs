//! Key-value persistence consumed by the tracker and the retrieval engine.
//!
//! The pipeline only needs eventual read-after-write consistency per key, so the contract is a
//! plain `get`/`put` over byte values. Callers serialize with `serde_json`.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Errors surfaced by a persistence backend.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Backend could not be reached or refused the request.
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),
    /// Value could not be encoded or decoded.
    #[error("failed to encode persisted value: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Minimal durable key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the latest value written under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), PersistenceError>;
}

/// Process-local store, useful for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, Vec<u8>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), PersistenceError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}
