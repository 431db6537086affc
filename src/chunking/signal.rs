//! Similarity signal used to detect topic boundaries between sentences.

/// Produces a sentence embedding for boundary detection.
///
/// Implementations must be deterministic: the chunker calls this once per sentence. The pipeline
/// runs chunking on the blocking pool, so a slow signal does not stall async workers.
pub trait CoherenceSignal: Send + Sync {
    /// Embed a single sentence.
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic bag-of-words embedding using feature hashing.
///
/// Each lowercase alphanumeric word is hashed (FNV-1a) into one of `dimension` buckets; the vector
/// is then L2-normalized. Sentences that share vocabulary score high under cosine similarity,
/// unrelated sentences score near zero.
#[derive(Debug, Clone, Copy)]
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    /// Build an embedder with a fixed number of buckets (at least one).
    pub const fn new(dimension: usize) -> Self {
        Self {
            dimension: if dimension == 0 { 1 } else { dimension },
        }
    }

    /// Number of buckets in produced vectors.
    pub const fn dimension(&self) -> usize {
        self.dimension
    }
}

impl Default for HashedEmbedder {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl CoherenceSignal for HashedEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
        {
            let bucket = (fnv1a(&word.to_lowercase()) % self.dimension as u64) as usize;
            embedding[bucket] += 1.0;
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

fn fnv1a(text: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    text.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::similarity::cosine_similarity;

    #[test]
    fn identical_sentences_are_maximally_similar() {
        let embedder = HashedEmbedder::default();
        let a = embedder.embed("Quarterly budget review for the finance team.");
        let b = embedder.embed("quarterly BUDGET review for the finance team");
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_vocabulary_scores_higher_than_disjoint() {
        let embedder = HashedEmbedder::default();
        let base = embedder.embed("The budget review meeting moved to Friday.");
        let related = embedder.embed("Friday budget review needs the updated numbers.");
        let unrelated = embedder.embed("Tomatoes grow well in compost rich soil.");
        assert!(cosine_similarity(&base, &related) > cosine_similarity(&base, &unrelated));
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let embedder = HashedEmbedder::new(8);
        assert_eq!(embedder.embed("  ... "), vec![0.0; 8]);
    }
}
