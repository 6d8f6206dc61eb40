//! Query text to ranked stored items.

use serde::Serialize;

use crate::semantic::embeddings::EmbeddingError;
use crate::semantic::generator::EmbeddingGenerator;
use crate::semantic::store::{StoreError, VectorStore};
use crate::semantic::Metadata;

#[derive(Debug, thiserror::Error)]
pub enum RetrieverError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// One retrieved row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub metadata: Metadata,
    /// Similarity in `[0, 1]`, higher is closer. Only set when scores are requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// Convert a cosine distance (`[0, 2]`) to a similarity in `[0, 1]`.
pub fn normalize_score(distance: f32) -> f32 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

pub struct Retriever<'a> {
    generator: &'a EmbeddingGenerator,
    store: &'a VectorStore,
}

impl<'a> Retriever<'a> {
    pub fn new(generator: &'a EmbeddingGenerator, store: &'a VectorStore) -> Self {
        Self { generator, store }
    }

    /// Return the `k` stored rows most similar to `query`.
    ///
    /// Blank queries and empty stores yield an empty list.
    pub fn retrieve(
        &self,
        query: &str,
        k: usize,
        return_scores: bool,
    ) -> Result<Vec<RetrievalResult>, RetrieverError> {
        if query.trim().is_empty() || self.store.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let embedding = self.generator.generate_embedding(query)?;
        let hits = self.store.search(&embedding, k, None)?;

        Ok(hits
            .into_iter()
            .map(|hit| RetrievalResult {
                metadata: hit.metadata,
                score: return_scores.then(|| normalize_score(hit.score)),
            })
            .collect())
    }

    /// Like `retrieve`, but at most one row per conversation.
    ///
    /// Rows are grouped by `conv_id` (falling back to `id`); the closest row
    /// of each conversation represents it. Rows without either key are
    /// treated as their own conversation.
    pub fn retrieve_conversations(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievalResult>, RetrieverError> {
        if query.trim().is_empty() || self.store.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let embedding = self.generator.generate_embedding(query)?;
        // Every row, so that k distinct conversations can be found
        let hits = self.store.search(&embedding, self.store.get_size(), None)?;

        let mut seen = std::collections::HashSet::new();
        let mut results = Vec::with_capacity(k);

        for (row, hit) in hits.into_iter().enumerate() {
            let key = conversation_key(&hit.metadata).unwrap_or_else(|| format!("\0row-{}", row));
            if !seen.insert(key) {
                continue;
            }

            results.push(RetrievalResult {
                metadata: hit.metadata,
                score: Some(normalize_score(hit.score)),
            });

            if results.len() == k {
                break;
            }
        }

        Ok(results)
    }
}

fn conversation_key(metadata: &Metadata) -> Option<String> {
    ["conv_id", "id"]
        .iter()
        .find_map(|key| metadata.get(*key))
        .map(|value| match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::hashed::HashedEmbedder;
    use crate::semantic::index::BackendKind;
    use serde_json::json;

    const DIMS: usize = 64;

    fn generator(dir: &tempfile::TempDir) -> EmbeddingGenerator {
        EmbeddingGenerator::with_embedder(
            Box::new(HashedEmbedder::new(DIMS)),
            dir.path().join("cache"),
        )
        .unwrap()
    }

    fn row(conv_id: &str, title: &str) -> Metadata {
        let mut m = Metadata::new();
        m.insert("conv_id".into(), json!(conv_id));
        m.insert("title".into(), json!(title));
        m
    }

    fn populated(generator: &EmbeddingGenerator) -> VectorStore {
        let texts = [
            ("c1", "rust borrow checker lifetime errors", "Rust"),
            ("c1", "debug help with rust compile errors", "Rust"),
            ("c2", "pasta carbonara recipe with eggs", "Cooking"),
            ("c3", "debug help for python stack traces", "Python"),
        ];

        let mut store = VectorStore::new(DIMS, BackendKind::Flat);
        let vectors = texts
            .iter()
            .map(|(_, text, _)| generator.generate_embedding(text).unwrap())
            .collect();
        let metadata = texts.iter().map(|(id, _, title)| row(id, title)).collect();
        store.add_vectors(vectors, metadata).unwrap();
        store
    }

    #[test]
    fn test_normalize_score_bounds() {
        assert_eq!(normalize_score(0.0), 1.0);
        assert_eq!(normalize_score(1.0), 0.5);
        assert_eq!(normalize_score(2.0), 0.0);
        assert_eq!(normalize_score(-0.1), 1.0);
        assert_eq!(normalize_score(2.5), 0.0);
    }

    #[test]
    fn test_retrieve_at_most_k() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(&dir);
        let store = populated(&generator);

        let results = Retriever::new(&generator, &store)
            .retrieve("debug help", 2, false)
            .unwrap();

        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(result.score.is_none());
            assert!(result.metadata.contains_key("conv_id"));
            assert!(result.metadata.contains_key("title"));
        }
    }

    #[test]
    fn test_retrieve_scores_descending() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(&dir);
        let store = populated(&generator);

        let results = Retriever::new(&generator, &store)
            .retrieve("carbonara recipe", 4, true)
            .unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].metadata["conv_id"], json!("c2"));
        let scores: Vec<f32> = results.iter().map(|r| r.score.unwrap()).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
    }

    #[test]
    fn test_retrieve_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(&dir);
        let store = VectorStore::new(DIMS, BackendKind::Flat);

        let results = Retriever::new(&generator, &store)
            .retrieve("anything", 5, true)
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_retrieve_blank_query() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(&dir);
        let store = populated(&generator);

        let results = Retriever::new(&generator, &store).retrieve("   ", 5, true).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_retrieve_conversations_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(&dir);
        let store = populated(&generator);

        let results = Retriever::new(&generator, &store)
            .retrieve_conversations("rust errors", 10)
            .unwrap();

        let ids: Vec<&str> = results
            .iter()
            .filter_map(|r| r.metadata["conv_id"].as_str())
            .collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], "c1");
        assert!(ids.contains(&"c2"));
        assert!(ids.contains(&"c3"));
    }

    #[test]
    fn test_retrieve_conversations_limit() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(&dir);
        let store = populated(&generator);

        let results = Retriever::new(&generator, &store)
            .retrieve_conversations("debug help", 2)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_ne!(results[0].metadata["conv_id"], results[1].metadata["conv_id"]);
    }
}
