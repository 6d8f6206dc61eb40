//! Embedding generation for conversation text.
//!
//! The generator owns one `TextEmbedder` for its whole lifetime, chosen from
//! `EmbeddingConfig` at construction: the pretrained model when it loads, the
//! hashed fallback otherwise. Blank text never reaches the backend and always
//! maps to the zero vector.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;

use crate::config::EmbeddingConfig;
use crate::conversations::Conversation;
use crate::semantic::cache::EmbeddingCache;
use crate::semantic::embeddings::{EmbeddingError, PretrainedModel, TextEmbedder};
use crate::semantic::hashed::{HashedEmbedder, HASHED_MODEL_NAME};
use crate::semantic::preprocess::{segment_conversation, EmbeddingStrategy, DEFAULT_CHUNK_SIZE};
use crate::semantic::{Embedding, Metadata};

/// Default number of texts sent to the backend per call
pub const DEFAULT_BATCH_SIZE: usize = 32;

pub struct EmbeddingGenerator {
    embedder: Box<dyn TextEmbedder>,
    cache: EmbeddingCache,
    chunk_size: usize,
    batch_size: usize,
}

impl EmbeddingGenerator {
    /// Build a generator from configuration.
    ///
    /// A pretrained model that fails to load is not fatal: the failure is
    /// logged and the hashed embedder of `config.dimension` takes its place.
    ///
    /// # Arguments
    /// * `config` - Embedding configuration
    /// * `model_dir` - Directory where pretrained models are cached
    /// * `cache_dir` - Directory for the embedding cache
    pub fn new(
        config: &EmbeddingConfig,
        model_dir: PathBuf,
        cache_dir: PathBuf,
    ) -> Result<Self, EmbeddingError> {
        let embedder: Box<dyn TextEmbedder> = if config.model.eq_ignore_ascii_case(HASHED_MODEL_NAME) {
            log::info!("Using hashed embeddings ({} dimensions)", config.dimension);
            Box::new(HashedEmbedder::new(config.dimension))
        } else {
            let timeout = Duration::from_secs(config.download_timeout_secs);
            match PretrainedModel::new(&config.model, model_dir, Some(timeout)) {
                Ok(model) => {
                    log::info!(
                        "Loaded embedding model '{}' ({} dimensions)",
                        config.model,
                        model.dimensions()
                    );
                    Box::new(model)
                }
                Err(e) => {
                    log::warn!(
                        "Embedding model '{}' unavailable ({}), falling back to hashed embeddings",
                        config.model,
                        e
                    );
                    Box::new(HashedEmbedder::new(config.dimension))
                }
            }
        };

        let cache = EmbeddingCache::open(cache_dir)?;

        Ok(Self {
            embedder,
            cache,
            chunk_size: config.chunk_size,
            batch_size: config.batch_size,
        })
    }

    /// Build a generator around an explicit embedder.
    pub fn with_embedder(
        embedder: Box<dyn TextEmbedder>,
        cache_dir: PathBuf,
    ) -> Result<Self, EmbeddingError> {
        Ok(Self {
            embedder,
            cache: EmbeddingCache::open(cache_dir)?,
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Name of the active backend.
    pub fn model_name(&self) -> &str {
        self.embedder.name()
    }

    pub fn get_embedding_dimension(&self) -> usize {
        self.embedder.dimensions()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Generate an embedding for a single text.
    pub fn generate_embedding(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.trim().is_empty() {
            return Ok(self.zero_vector());
        }

        let mut embeddings = self.embedder.embed_batch(&[text.to_string()])?;
        let embedding = embeddings
            .pop()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))?;
        self.check_dimension(&embedding)?;

        Ok(embedding)
    }

    /// Generate embeddings for multiple texts, preserving order.
    pub fn generate_embeddings_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut results: Vec<Option<Embedding>> = vec![None; texts.len()];

        let pending: Vec<(usize, String)> = texts
            .iter()
            .enumerate()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(idx, text)| (idx, text.clone()))
            .collect();

        for batch in pending.chunks(self.batch_size.max(1)) {
            let batch_texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
            let embeddings = self.embedder.embed_batch(&batch_texts)?;

            if embeddings.len() != batch.len() {
                return Err(EmbeddingError::EmbeddingFailed(format!(
                    "backend returned {} embeddings for {} texts",
                    embeddings.len(),
                    batch.len()
                )));
            }

            for ((idx, _), embedding) in batch.iter().zip(embeddings) {
                self.check_dimension(&embedding)?;
                results[*idx] = Some(embedding);
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| self.zero_vector()))
            .collect())
    }

    /// Embed a conversation according to `strategy`.
    ///
    /// Returns one embedding per segment plus a metadata record describing
    /// the whole call.
    pub fn embed_conversation(
        &self,
        conversation: &Conversation,
        strategy: EmbeddingStrategy,
    ) -> Result<(Vec<Embedding>, Metadata), EmbeddingError> {
        let segments = segment_conversation(conversation, strategy, self.chunk_size);
        let texts: Vec<String> = segments.into_iter().map(|s| s.text).collect();
        let embeddings = self.generate_embeddings_batch(&texts)?;

        let mut metadata = Metadata::new();
        metadata.insert("conv_id".into(), json!(conversation.id));
        metadata.insert("title".into(), json!(conversation.title));
        metadata.insert("strategy".into(), json!(strategy.as_str()));
        metadata.insert("num_embeddings".into(), json!(embeddings.len()));
        metadata.insert("num_messages".into(), json!(conversation.messages.len()));
        metadata.insert("dimension".into(), json!(self.get_embedding_dimension()));
        metadata.insert("model".into(), json!(self.model_name()));

        Ok((embeddings, metadata))
    }

    /// Persist one embedding and its metadata under `id`.
    pub fn cache_embedding(
        &self,
        id: &str,
        embedding: &[f32],
        metadata: &Metadata,
    ) -> Result<(), EmbeddingError> {
        self.cache.put(id, embedding, metadata)?;
        Ok(())
    }

    /// Look up a cached embedding. `None` if absent.
    pub fn load_cached_embedding(&self, id: &str) -> Result<Option<(Embedding, Metadata)>, EmbeddingError> {
        Ok(self.cache.get(id)?)
    }

    /// Remove all cached embeddings, returning how many were removed.
    pub fn clear_cache(&self) -> Result<usize, EmbeddingError> {
        Ok(self.cache.clear()?)
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    fn zero_vector(&self) -> Embedding {
        vec![0.0; self.get_embedding_dimension()]
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<(), EmbeddingError> {
        if embedding.len() != self.get_embedding_dimension() {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "backend produced {} dimensions, expected {}",
                embedding.len(),
                self.get_embedding_dimension()
            )));
        }
        Ok(())
    }
}
