//! In-process vector index with namespace isolation.

use super::filters::MetadataFilter;
use super::types::{RagError, ScoredRecord, UpsertAck, VectorRecord, resolve_namespace};
use crate::config::RagConfig;
use crate::persistence::KeyValueStore;
use dashmap::DashMap;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

type Namespace = Arc<DashMap<String, StoredRecord>>;

#[derive(Debug, Clone)]
struct StoredRecord {
    record: VectorRecord,
    revision: u64,
}

/// Embedding store answering top-k similarity queries.
///
/// Highlights:
/// - Writes for the same id are serialized; the later write wins and carries a higher revision.
/// - An upsert validates every vector before touching the index, so a bad batch writes nothing.
/// - NaN and infinite components are refused on writes and queries alike.
/// - Equal similarities are broken in favour of the most recently written record.
pub struct RagEngine {
    config: RagConfig,
    namespaces: DashMap<String, Namespace>,
    revision: AtomicU64,
    store: Option<Arc<dyn KeyValueStore>>,
    write_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl RagEngine {
    /// Create an empty engine.
    pub fn new(config: RagConfig) -> Self {
        Self {
            config,
            namespaces: DashMap::new(),
            revision: AtomicU64::new(0),
            store: None,
            write_locks: DashMap::new(),
        }
    }

    /// Mirror every upserted record into durable storage.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Read-only view suitable for handing to query-only callers.
    pub fn search_handle(self: &Arc<Self>) -> SearchHandle {
        SearchHandle {
            engine: Arc::clone(self),
        }
    }

    /// Insert or replace records by id.
    ///
    /// Every embedding is checked for the configured dimension and for finite components first;
    /// one bad vector rejects the whole batch. With a store attached, the index update and the
    /// durable write for an id happen under that id's write lock, so the persisted copy is never
    /// older than the indexed one.
    pub async fn upsert(&self, records: Vec<VectorRecord>) -> Result<UpsertAck, RagError> {
        let dimension = self.dimension()?;
        for record in &records {
            if let Err(err) = check_vector(&record.id, &record.embedding, dimension) {
                warn!(id = %record.id, error = %err, "Rejecting upsert batch");
                return Err(err);
            }
        }

        let mut ack = UpsertAck::default();
        for record in &records {
            let key = storage_key(record.effective_namespace(), &record.id);
            let _guard = match &self.store {
                Some(_) => Some(self.write_lock(&key).lock_owned().await),
                None => None,
            };

            if self.index(record) {
                ack.inserted += 1;
            } else {
                ack.updated += 1;
            }

            if let Some(store) = &self.store {
                let persisted = serde_json::to_vec(record)
                    .map_err(crate::persistence::PersistenceError::from);
                let result = match persisted {
                    Ok(bytes) => store.put(&key, bytes).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    warn!(key = %key, error = %err, "Failed to persist vector record");
                }
            }
        }

        debug!(
            inserted = ack.inserted,
            updated = ack.updated,
            "Upserted vector records"
        );
        Ok(ack)
    }

    /// Store one record; `true` when the id was new.
    fn index(&self, record: &VectorRecord) -> bool {
        let namespace = self.namespace(record.effective_namespace());
        // Taking the revision under the entry lock keeps write order and revision order equal.
        let entry = namespace.entry(record.id.clone());
        let revision = self.revision.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let stored = StoredRecord {
            record: record.clone(),
            revision,
        };
        match entry {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                occupied.insert(stored);
                false
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(stored);
                true
            }
        }
    }

    fn write_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.write_locks.get(key) {
            return Arc::clone(&lock);
        }
        Arc::clone(
            &self
                .write_locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Return the `k` most similar records in `namespace` that pass `filter`.
    ///
    /// Results are ordered by descending similarity; ties prefer the most recent write.
    pub fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
        namespace: Option<&str>,
    ) -> Result<Vec<ScoredRecord>, RagError> {
        let dimension = self.dimension()?;
        check_vector("<query>", embedding, dimension)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let namespace = resolve_namespace(namespace);
        let Some(records) = self.namespaces.get(namespace).map(|entry| Arc::clone(&entry)) else {
            return Ok(Vec::new());
        };

        let metric = self.config.metric;
        let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::with_capacity(k + 1);
        for entry in records.iter() {
            let stored = entry.value();
            if !filter.matches(&stored.record.metadata) {
                continue;
            }
            let similarity = metric.score(embedding, &stored.record.embedding);
            let better_than_worst = heap.peek().is_none_or(|Reverse(worst)| {
                rank(similarity, stored.revision, worst.similarity, worst.revision)
                    == Ordering::Greater
            });
            if heap.len() < k || better_than_worst {
                heap.push(Reverse(Candidate {
                    similarity,
                    revision: stored.revision,
                    record: stored.record.clone(),
                }));
                if heap.len() > k {
                    heap.pop();
                }
            }
        }

        let results: Vec<ScoredRecord> = heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(candidate)| ScoredRecord {
                record: candidate.record,
                similarity: candidate.similarity,
            })
            .collect();
        debug!(namespace, k, hits = results.len(), "Vector query complete");
        Ok(results)
    }

    /// Fetch a record by id.
    pub fn get(&self, namespace: Option<&str>, id: &str) -> Option<VectorRecord> {
        let records = self
            .namespaces
            .get(resolve_namespace(namespace))
            .map(|entry| Arc::clone(&entry))?;
        records.get(id).map(|stored| stored.record.clone())
    }

    /// Total number of records across namespaces.
    pub fn len(&self) -> usize {
        self.namespaces.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether the engine holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of namespaces that have received records, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .namespaces
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    fn dimension(&self) -> Result<usize, RagError> {
        self.config.dimension.ok_or_else(|| {
            RagError::FatalConfiguration(
                "EMBEDDING_DIMENSION is not configured; refusing to guess a vector size".into(),
            )
        })
    }

    fn namespace(&self, name: &str) -> Namespace {
        if let Some(existing) = self.namespaces.get(name) {
            return Arc::clone(&existing);
        }
        let created = self
            .namespaces
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(namespace = name, "Created vector namespace");
                Arc::new(DashMap::new())
            });
        Arc::clone(&created)
    }
}

/// Query-only access to a shared [`RagEngine`].
#[derive(Clone)]
pub struct SearchHandle {
    engine: Arc<RagEngine>,
}

impl SearchHandle {
    /// See [`RagEngine::query`].
    pub fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
        namespace: Option<&str>,
    ) -> Result<Vec<ScoredRecord>, RagError> {
        self.engine.query(embedding, k, filter, namespace)
    }

    /// See [`RagEngine::get`].
    pub fn get(&self, namespace: Option<&str>, id: &str) -> Option<VectorRecord> {
        self.engine.get(namespace, id)
    }

    /// Dimension queries must use, if configured.
    pub fn dimension(&self) -> Option<usize> {
        self.engine.config.dimension
    }
}

fn check_vector(id: &str, embedding: &[f32], dimension: usize) -> Result<(), RagError> {
    if embedding.len() != dimension {
        return Err(RagError::DimensionMismatch {
            id: id.to_string(),
            expected: dimension,
            actual: embedding.len(),
        });
    }
    match embedding.iter().position(|value| !value.is_finite()) {
        Some(index) => Err(RagError::NonFiniteEmbedding {
            id: id.to_string(),
            index,
        }),
        None => Ok(()),
    }
}

/// Storage key for a persisted vector record.
pub fn storage_key(namespace: &str, id: &str) -> String {
    format!("vector/{namespace}/{id}")
}

struct Candidate {
    similarity: f32,
    revision: u64,
    record: VectorRecord,
}

fn rank(similarity: f32, revision: u64, other_similarity: f32, other_revision: u64) -> Ordering {
    similarity
        .total_cmp(&other_similarity)
        .then(revision.cmp(&other_revision))
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        rank(
            self.similarity,
            self.revision,
            other.similarity,
            other.revision,
        )
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}
