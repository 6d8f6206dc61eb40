//! Deterministic local embedder used when no pretrained model is available.
//!
//! Features are unigrams and adjacent bigrams from `preprocess::tokenize`.
//! Each feature is hashed with CRC32 into one of `dimensions` buckets; a
//! second hash bit picks the sign so collisions tend to cancel instead of
//! pile up. Weights are sublinear term frequency (1 + ln tf) and the result
//! is L2-normalized.

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::semantic::embeddings::{EmbeddingError, TextEmbedder};
use crate::semantic::preprocess::tokenize;

pub const HASHED_MODEL_NAME: &str = "hashed";

/// Bigrams contribute less than single terms
const BIGRAM_WEIGHT: f32 = 0.5;

pub struct HashedEmbedder {
    dimensions: usize,
    parallel: bool,
}

impl HashedEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            parallel: true,
        }
    }

    /// Compute batches on the calling thread only.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Embed a single text. Blank text (no usable tokens) maps to the zero vector.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        if self.dimensions == 0 {
            return vector;
        }

        let tokens = tokenize(text);

        // BTreeMap keeps accumulation order fixed so float sums are reproducible
        let mut counts: BTreeMap<String, (u32, f32)> = BTreeMap::new();
        for token in &tokens {
            counts.entry(token.clone()).or_insert((0, 1.0)).0 += 1;
        }
        for pair in tokens.windows(2) {
            let feature = format!("{} {}", pair[0], pair[1]);
            counts.entry(feature).or_insert((0, BIGRAM_WEIGHT)).0 += 1;
        }

        for (feature, (tf, weight)) in &counts {
            let hash = crc32fast::hash(feature.as_bytes());
            let bucket = (hash as usize) % self.dimensions;
            let sign = if hash & 0x8000_0000 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign * weight * (1.0 + (*tf as f32).ln());
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for value in vector.iter_mut() {
                *value /= norm;
            }
        }

        vector
    }
}

impl TextEmbedder for HashedEmbedder {
    fn name(&self) -> &str {
        HASHED_MODEL_NAME
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.parallel {
            Ok(texts.par_iter().map(|text| self.embed(text)).collect())
        } else {
            Ok(texts.iter().map(|text| self.embed(text)).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_dimensions() {
        let embedder = HashedEmbedder::new(384);
        assert_eq!(embedder.embed("hello world").len(), 384);
        assert_eq!(embedder.dimensions(), 384);
    }

    #[test]
    fn test_deterministic() {
        let a = HashedEmbedder::new(64);
        let b = HashedEmbedder::new(64);
        let text = "Debugging a segfault in the rust borrow checker";
        assert_eq!(a.embed(text), a.embed(text));
        assert_eq!(a.embed(text), b.embed(text));
    }

    #[test]
    fn test_normalized() {
        let embedder = HashedEmbedder::new(128);
        let vector = embedder.embed("machine learning with neural networks");
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_stop_words_only_is_zero() {
        let embedder = HashedEmbedder::new(32);
        assert!(embedder.embed("the and of").iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_overlap_scores_higher() {
        let embedder = HashedEmbedder::new(384);
        let query = embedder.embed("python debugging help");
        let related = embedder.embed("help me with debugging this python script");
        let unrelated = embedder.embed("chocolate cake baking recipe");

        assert!(cosine(&query, &related) > cosine(&query, &unrelated));
    }

    #[test]
    fn test_batch_matches_single() {
        let texts: Vec<String> = (0..50).map(|i| format!("document number {} about topic {}", i, i % 7)).collect();

        let parallel = HashedEmbedder::new(96);
        let sequential = HashedEmbedder::new(96).sequential();

        let batch = parallel.embed_batch(&texts).unwrap();
        let seq = sequential.embed_batch(&texts).unwrap();

        assert_eq!(batch, seq);
        for (text, vector) in texts.iter().zip(&batch) {
            assert_eq!(&parallel.embed(text), vector);
        }
    }
}
