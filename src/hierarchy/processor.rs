use super::insight::{Insight, InsightLevel};
use super::summarize::{WeightedText, extractive_summary, merge_summaries, weighted_mean};
use crate::batch::{ItemLedger, ItemRecord, ItemState, WorkItemKind};
use crate::config::AggregationConfig;
use crate::progress::OperationId;
use crate::rag::{MetadataFilter, RagError, SearchHandle};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while aggregating results.
#[derive(Debug, Error)]
pub enum AggregationError {
    /// No items were submitted for the operation.
    #[error("no results recorded for operation {0}")]
    UnknownOperation(OperationId),
    /// Some items of the operation have not finished yet.
    #[error("operation {operation} still has {pending} pending and {running} running items")]
    IncompleteInput {
        /// Operation concerned.
        operation: OperationId,
        /// Items not yet admitted.
        pending: usize,
        /// Items in flight.
        running: usize,
    },
    /// Requested level is outside 0..=2.
    #[error("unsupported aggregation level {0}")]
    InvalidLevel(u8),
    /// Similarity lookup failed.
    #[error(transparent)]
    Rag(#[from] RagError),
}

// Completed items of one document, in position order.
struct DocumentGroup<'a> {
    document_id: &'a str,
    namespace: &'a str,
    items: Vec<&'a ItemRecord>,
}

/// Turns item-level backend results into document and corpus insights.
pub struct HierarchicalProcessor {
    ledger: Arc<ItemLedger>,
    search: SearchHandle,
    config: AggregationConfig,
}

impl HierarchicalProcessor {
    /// Build an aggregator over a ledger and a read-only index handle.
    pub fn new(ledger: Arc<ItemLedger>, search: SearchHandle, config: AggregationConfig) -> Self {
        Self {
            ledger,
            search,
            config,
        }
    }

    /// Produce the insights of `level` for an operation.
    ///
    /// Fails with [`AggregationError::IncompleteInput`] while any item is still pending or
    /// running. Failed and cancelled items contribute nothing.
    pub fn aggregate(
        &self,
        operation: OperationId,
        level: InsightLevel,
    ) -> Result<Vec<Insight>, AggregationError> {
        let records = self
            .ledger
            .items(operation)
            .ok_or(AggregationError::UnknownOperation(operation))?;

        let pending = count_state(&records, ItemState::Pending);
        let running = count_state(&records, ItemState::Running);
        if pending + running > 0 {
            debug!(operation = %operation, level = %level, pending, running, "Aggregation requested too early");
            return Err(AggregationError::IncompleteInput {
                operation,
                pending,
                running,
            });
        }

        let insights = match level {
            InsightLevel::Chunk => self.item_insights(&records),
            InsightLevel::Document => self
                .document_groups(&records)
                .iter()
                .map(|group| self.document_insight(group))
                .collect(),
            InsightLevel::Corpus => self.corpus_insights(&records)?,
        };
        info!(
            operation = %operation,
            level = %level,
            insights = insights.len(),
            "Aggregation complete"
        );
        Ok(insights)
    }

    fn item_insights(&self, records: &[ItemRecord]) -> Vec<Insight> {
        records
            .iter()
            .filter(|record| record.state == ItemState::Completed)
            .map(|record| {
                Insight::new(
                    InsightLevel::Chunk,
                    self.item_summary(record),
                    item_confidence(record),
                    vec![record.id.clone()],
                )
            })
            .collect()
    }

    fn document_insight(&self, group: &DocumentGroup<'_>) -> Insight {
        let summaries: Vec<String> = group
            .items
            .iter()
            .map(|record| self.item_summary(record))
            .collect();
        let weights: Vec<f32> = group
            .items
            .iter()
            .map(|record| self.item_weight(record))
            .collect();
        let parts: Vec<WeightedText<'_>> = summaries
            .iter()
            .zip(&weights)
            .map(|(text, &weight)| WeightedText {
                text: text.as_str(),
                weight,
            })
            .collect();
        let confidence = weighted_mean(
            group
                .items
                .iter()
                .zip(&weights)
                .map(|(record, &weight)| (item_confidence(record), weight)),
        );
        Insight::new(
            InsightLevel::Document,
            merge_summaries(&parts, self.config.max_summary_words),
            confidence,
            group.items.iter().map(|record| record.id.clone()).collect(),
        )
    }

    fn corpus_insights(&self, records: &[ItemRecord]) -> Result<Vec<Insight>, AggregationError> {
        let groups = self.document_groups(records);
        let index: HashMap<&str, usize> = groups
            .iter()
            .enumerate()
            .map(|(position, group)| (group.document_id, position))
            .collect();
        let mut clusters = DisjointSet::new(groups.len());

        // One filter per namespace covering every document of the operation; self-hits are
        // dropped after the query instead of building a per-document exclusion list.
        let mut filters: HashMap<&str, MetadataFilter> = HashMap::new();
        for group in &groups {
            filters.entry(group.namespace).or_insert_with(|| {
                MetadataFilter::new().any_of(
                    "document_id",
                    groups
                        .iter()
                        .filter(|other| other.namespace == group.namespace)
                        .map(|other| other.document_id),
                )
            });
        }

        for (position, group) in groups.iter().enumerate() {
            let Some(query) = self.document_vector(group) else {
                continue;
            };
            let Some(filter) = filters.get(group.namespace) else {
                continue;
            };
            // The document's own records can occupy up to one slot per item.
            let hits = self.search.query(
                &query,
                self.config.related_k + group.items.len(),
                filter,
                Some(group.namespace),
            )?;
            let related_hits = hits
                .iter()
                .map(|hit| {
                    let related = hit
                        .record
                        .metadata
                        .get("document_id")
                        .map_or(hit.record.id.as_str(), String::as_str);
                    (related, hit.similarity)
                })
                .filter(|(related, _)| *related != group.document_id)
                .take(self.config.related_k);
            for (related, similarity) in related_hits {
                if similarity < self.config.cluster_threshold {
                    continue;
                }
                if let Some(&other) = index.get(related) {
                    debug!(
                        document = group.document_id,
                        related,
                        similarity,
                        "Linking related documents"
                    );
                    clusters.union(position, other);
                }
            }
        }

        let mut members: Vec<Vec<usize>> = Vec::new();
        let mut slot_of_root: HashMap<usize, usize> = HashMap::new();
        for position in 0..groups.len() {
            let root = clusters.find(position);
            let slot = *slot_of_root.entry(root).or_insert_with(|| {
                members.push(Vec::new());
                members.len() - 1
            });
            members[slot].push(position);
        }

        Ok(members
            .into_iter()
            .map(|cluster| {
                let documents: Vec<Insight> = cluster
                    .iter()
                    .map(|&position| self.document_insight(&groups[position]))
                    .collect();
                let parts: Vec<WeightedText<'_>> = documents
                    .iter()
                    .map(|insight| WeightedText {
                        text: insight.summary(),
                        weight: insight.confidence(),
                    })
                    .collect();
                let confidence = weighted_mean(
                    documents
                        .iter()
                        .map(|insight| (insight.confidence(), 1.0)),
                );
                let provenance = documents
                    .iter()
                    .flat_map(|insight| insight.provenance().iter().cloned())
                    .collect();
                Insight::new(
                    InsightLevel::Corpus,
                    merge_summaries(&parts, self.config.max_summary_words),
                    confidence,
                    provenance,
                )
            })
            .collect())
    }

    // Prefer the document's own vector; otherwise average its chunk embeddings.
    fn document_vector(&self, group: &DocumentGroup<'_>) -> Option<Vec<f32>> {
        if let Some(record) = group
            .items
            .iter()
            .find(|record| record.kind == WorkItemKind::Document)
        {
            if let Some(stored) = self.search.get(Some(&record.namespace), &record.id) {
                return Some(stored.embedding);
            }
        }

        let embeddings: Vec<&Vec<f32>> = group
            .items
            .iter()
            .filter_map(|record| record.output.as_ref()?.embedding.as_ref())
            .collect();
        let dimension = embeddings.first()?.len();
        let mut centroid = vec![0.0_f32; dimension];
        let mut count = 0usize;
        for embedding in embeddings.iter().filter(|embedding| embedding.len() == dimension) {
            for (slot, value) in centroid.iter_mut().zip(embedding.iter()) {
                *slot += value;
            }
            count += 1;
        }
        let count = count as f32;
        centroid.iter_mut().for_each(|slot| *slot /= count);
        Some(centroid)
    }

    fn document_groups<'a>(&self, records: &'a [ItemRecord]) -> Vec<DocumentGroup<'a>> {
        let mut groups: Vec<DocumentGroup<'a>> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for record in records
            .iter()
            .filter(|record| record.state == ItemState::Completed)
        {
            let slot = *index.entry(record.document_id.as_str()).or_insert_with(|| {
                groups.push(DocumentGroup {
                    document_id: &record.document_id,
                    namespace: &record.namespace,
                    items: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].items.push(record);
        }
        // Document-level records sort ahead of their chunks.
        for group in &mut groups {
            group
                .items
                .sort_by_key(|record| record.position.map_or(0, |position| position + 1));
        }
        groups
    }

    fn item_summary(&self, record: &ItemRecord) -> String {
        record
            .output
            .as_ref()
            .and_then(|output| output.analysis.as_deref())
            .map(str::trim)
            .filter(|analysis| !analysis.is_empty())
            .map_or_else(
                || extractive_summary(&record.text, self.config.max_summary_words),
                str::to_string,
            )
    }

    fn item_weight(&self, record: &ItemRecord) -> f32 {
        if record.coherence_broken {
            self.config.broken_chunk_weight
        } else {
            1.0
        }
    }
}

fn count_state(records: &[ItemRecord], state: ItemState) -> usize {
    records.iter().filter(|record| record.state == state).count()
}

fn item_confidence(record: &ItemRecord) -> f32 {
    record
        .output
        .as_ref()
        .map_or(0.0, |output| output.confidence)
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    // Smaller root wins so clusters are labelled by their earliest document.
    fn union(&mut self, left: usize, right: usize) {
        let left = self.find(left);
        let right = self.find(right);
        if left != right {
            let (root, child) = if left < right { (left, right) } else { (right, left) };
            self.parent[child] = root;
        }
    }
}
