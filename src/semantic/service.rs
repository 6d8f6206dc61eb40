//! Conversation memory service.
//!
//! Ties the pieces together for the CLI:
//! - Builds the embedding generator and vector store from `Config`
//! - Trains the store from conversations, reusing cached embeddings
//! - Persists the store in the data directory and answers queries

use std::collections::HashSet;
use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::json;

use crate::config::Config;
use crate::conversations::Conversation;
use crate::semantic::embeddings::EmbeddingError;
use crate::semantic::generator::EmbeddingGenerator;
use crate::semantic::index::BackendKind;
use crate::semantic::preprocess::{content_hash, segment_conversation, snippet, EmbeddingStrategy, Segment};
use crate::semantic::retriever::{RetrievalResult, Retriever, RetrieverError};
use crate::semantic::storage::VectorStorageError;
use crate::semantic::store::{StoreError, VectorStore};
use crate::semantic::{Embedding, Metadata};

/// Directory under the data directory where pretrained models are downloaded
const MODELS_DIR: &str = "models";
/// Directory under the data directory holding the embedding cache
const CACHE_DIR: &str = "cache";

/// Errors that can occur during memory operations.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Retrieval error: {0}")]
    Retriever(#[from] RetrieverError),
}

/// Outcome of a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainReport {
    /// Conversations that produced rows
    pub conversations: usize,
    /// Conversations without messages
    pub skipped: usize,
    /// Rows now in the store
    pub rows: usize,
    /// Rows whose embedding came from the cache
    pub cache_hits: usize,
    /// Rows embedded during this run
    pub embedded: usize,
}

/// Summary of the current memory.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub rows: usize,
    pub conversations: usize,
    pub dimension: usize,
    pub backend: BackendKind,
    pub model: String,
    pub strategy: String,
    pub cache_entries: usize,
    pub store_path: PathBuf,
}

pub struct MemoryService {
    config: Config,
    base_path: PathBuf,
    generator: EmbeddingGenerator,
    store: VectorStore,
    progress: bool,
}

impl MemoryService {
    /// Create a service with an empty store.
    ///
    /// # Arguments
    /// * `config` - Validated configuration
    /// * `base_path` - Data directory (models/, cache/, store files)
    pub fn new(config: Config, base_path: PathBuf) -> Result<Self, MemoryError> {
        let generator = EmbeddingGenerator::new(
            &config.embedding,
            base_path.join(MODELS_DIR),
            base_path.join(CACHE_DIR),
        )?;
        Ok(Self::with_generator(config, base_path, generator))
    }

    /// Create a service around an existing generator.
    pub fn with_generator(config: Config, base_path: PathBuf, generator: EmbeddingGenerator) -> Self {
        let store = Self::empty_store(&config, &generator);
        Self {
            config,
            base_path,
            generator,
            store,
            progress: false,
        }
    }

    /// Show a progress bar on stderr while training.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn generator(&self) -> &EmbeddingGenerator {
        &self.generator
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    /// Base path of the persisted store inside the data directory.
    pub fn store_base(&self) -> PathBuf {
        self.base_path.join(&self.config.store.name)
    }

    /// Load the saved store, or keep the empty one if there is none.
    ///
    /// A store written by another model or with another dimension cannot be
    /// searched with the current generator, and a store whose two files
    /// disagree cannot be trusted. Either is ignored and training starts
    /// fresh.
    pub fn load_or_create(&mut self) -> Result<(), MemoryError> {
        let base = self.store_base();

        if !self.store.exists(&base) {
            log::info!("No existing memory at {}, starting fresh", base.display());
            return Ok(());
        }

        match self.store.load(&base) {
            Ok(()) => {
                log::info!("Loaded {} rows from memory", self.store.get_size());
                Ok(())
            }
            Err(StoreError::Storage(VectorStorageError::ModelMismatch)) => {
                log::warn!("Model changed, creating fresh memory");
                Ok(())
            }
            Err(StoreError::Storage(VectorStorageError::VersionMismatch(file_ver, _))) => {
                log::warn!("Storage version {} unsupported, creating fresh memory", file_ver);
                Ok(())
            }
            Err(StoreError::DimensionMismatch { expected, got }) => {
                log::warn!(
                    "Stored dimension {} does not match model dimension {}, creating fresh memory",
                    got,
                    expected
                );
                Ok(())
            }
            Err(StoreError::Corrupt(reason)) => {
                log::warn!("{}, creating fresh memory", reason);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to load memory: {}", e);
                Err(e.into())
            }
        }
    }

    pub fn save(&self) -> Result<(), MemoryError> {
        self.store.save(&self.store_base())?;
        Ok(())
    }

    /// Replace the memory with rows built from `conversations`.
    ///
    /// Segment embeddings are reused from the cache when the cached entry was
    /// produced by the same model from the same text. With `rebuild` every
    /// segment is embedded again. The store is not saved.
    pub fn train(
        &mut self,
        conversations: &[Conversation],
        strategy: Option<EmbeddingStrategy>,
        rebuild: bool,
    ) -> Result<TrainReport, MemoryError> {
        let strategy = strategy.unwrap_or_else(|| self.config.embedding.strategy());
        let mut report = TrainReport::default();
        let mut store = Self::empty_store(&self.config, &self.generator);

        log::info!(
            "Training on {} conversations (strategy: {}, model: {})",
            conversations.len(),
            strategy,
            self.generator.model_name()
        );

        let pb = self.progress_bar(conversations.len());

        for conversation in conversations {
            pb.set_message(conversation.title.clone());

            if conversation.messages.is_empty() {
                log::debug!("skipping conversation '{}' without messages", conversation.id);
                report.skipped += 1;
                pb.inc(1);
                continue;
            }

            let (vectors, metadata, hits) = self.embed_rows(conversation, strategy, rebuild)?;
            report.cache_hits += hits;
            report.embedded += vectors.len() - hits;
            report.conversations += 1;

            store.add_vectors(vectors, metadata)?;
            pb.inc(1);
        }

        pb.finish_and_clear();

        report.rows = store.get_size();
        self.store = store;

        log::info!(
            "Trained {} rows from {} conversations ({} cached, {} embedded)",
            report.rows,
            report.conversations,
            report.cache_hits,
            report.embedded
        );

        Ok(report)
    }

    /// Query the memory.
    ///
    /// With `conversations` set, at most one row per conversation is returned.
    pub fn query(
        &self,
        text: &str,
        k: Option<usize>,
        return_scores: Option<bool>,
        conversations: bool,
    ) -> Result<Vec<RetrievalResult>, MemoryError> {
        let k = k.unwrap_or(self.config.retrieval.default_k);
        let return_scores = return_scores.unwrap_or(self.config.retrieval.return_scores);
        let retriever = Retriever::new(&self.generator, &self.store);

        let results = if conversations {
            let mut results = retriever.retrieve_conversations(text, k)?;
            if !return_scores {
                results.iter_mut().for_each(|r| r.score = None);
            }
            results
        } else {
            retriever.retrieve(text, k, return_scores)?
        };

        log::debug!("query '{}' returned {} results", text, results.len());
        Ok(results)
    }

    pub fn stats(&self) -> MemoryStats {
        let conversations: HashSet<&str> = self
            .store
            .metadata()
            .iter()
            .filter_map(|m| m.get("conv_id").and_then(|v| v.as_str()))
            .collect();

        MemoryStats {
            rows: self.store.get_size(),
            conversations: conversations.len(),
            dimension: self.store.dimension(),
            backend: self.store.backend(),
            model: self.generator.model_name().to_string(),
            strategy: self.config.embedding.strategy().to_string(),
            cache_entries: self.generator.cache().len(),
            store_path: self.store.matrix_path(&self.store_base()),
        }
    }

    /// Empty the memory and persist the empty store.
    pub fn clear(&mut self) -> Result<(), MemoryError> {
        self.store.clear();
        self.save()?;
        log::info!("Cleared memory");
        Ok(())
    }

    /// Remove all cached embeddings, returning how many were removed.
    pub fn clear_cache(&self) -> Result<usize, MemoryError> {
        let removed = self.generator.clear_cache()?;
        log::info!("Removed {} cached embeddings", removed);
        Ok(removed)
    }

    /// Build rows for one conversation. Returns vectors, row metadata and
    /// the number of cache hits.
    fn embed_rows(
        &self,
        conversation: &Conversation,
        strategy: EmbeddingStrategy,
        rebuild: bool,
    ) -> Result<(Vec<Embedding>, Vec<Metadata>, usize), MemoryError> {
        let segments = segment_conversation(conversation, strategy, self.generator.chunk_size());

        let metadata: Vec<Metadata> = segments
            .iter()
            .enumerate()
            .map(|(idx, segment)| self.row_metadata(conversation, strategy, idx, segment))
            .collect();

        let mut vectors: Vec<Option<Embedding>> = vec![None; segments.len()];
        let mut hits = 0;

        if !rebuild {
            for (idx, row) in metadata.iter().enumerate() {
                if let Some(embedding) = self.cached(&cache_key(conversation, strategy, idx), row)? {
                    vectors[idx] = Some(embedding);
                    hits += 1;
                }
            }
        }

        let missing: Vec<usize> = (0..segments.len()).filter(|idx| vectors[*idx].is_none()).collect();
        let texts: Vec<String> = missing.iter().map(|idx| segments[*idx].text.clone()).collect();
        let embedded = self.generator.generate_embeddings_batch(&texts)?;

        for (idx, embedding) in missing.into_iter().zip(embedded) {
            self.generator
                .cache_embedding(&cache_key(conversation, strategy, idx), &embedding, &metadata[idx])?;
            vectors[idx] = Some(embedding);
        }

        let vectors = vectors.into_iter().flatten().collect();
        Ok((vectors, metadata, hits))
    }

    /// Cached embedding for `key` if it was made from the same text by the
    /// current model.
    fn cached(&self, key: &str, row: &Metadata) -> Result<Option<Embedding>, MemoryError> {
        let Some((embedding, cached)) = self.generator.load_cached_embedding(key)? else {
            return Ok(None);
        };

        let fresh = cached.get("content_hash") == row.get("content_hash")
            && cached.get("model") == row.get("model")
            && embedding.len() == self.generator.get_embedding_dimension();

        Ok(fresh.then_some(embedding))
    }

    fn row_metadata(
        &self,
        conversation: &Conversation,
        strategy: EmbeddingStrategy,
        idx: usize,
        segment: &Segment,
    ) -> Metadata {
        let mut m = Metadata::new();
        m.insert("id".into(), json!(conversation.id));
        m.insert("conv_id".into(), json!(conversation.id));
        m.insert("title".into(), json!(conversation.title));
        m.insert("strategy".into(), json!(strategy.as_str()));
        m.insert("segment".into(), json!(idx));
        m.insert("message_start".into(), json!(segment.message_start));
        m.insert("message_count".into(), json!(segment.message_count));
        m.insert("snippet".into(), json!(snippet(&segment.text)));
        m.insert("content_hash".into(), json!(content_hash(&segment.text)));
        m.insert("model".into(), json!(self.generator.model_name()));
        if let Some(created) = conversation.created_at() {
            m.insert("create_time".into(), json!(created.to_rfc3339()));
        }
        if let Some(updated) = conversation.updated_at() {
            m.insert("update_time".into(), json!(updated.to_rfc3339()));
        }
        m
    }

    fn empty_store(config: &Config, generator: &EmbeddingGenerator) -> VectorStore {
        VectorStore::new(generator.get_embedding_dimension(), config.store.backend)
            .with_model(generator.model_name())
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} conversations ({percent}%) {wide_msg}")
        {
            pb.set_style(style.progress_chars("━━╸"));
        }
        pb
    }
}

fn cache_key(conversation: &Conversation, strategy: EmbeddingStrategy, segment: usize) -> String {
    format!("{}:{}:{}", conversation.id, strategy, segment)
}
