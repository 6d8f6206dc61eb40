//! Embedding backends.
//!
//! Provides the `TextEmbedder` seam and the pretrained model behind it:
//! - fastembed model wrapper with configurable cache directory
//! - model name parsing and dimension probing
//! - model identity hashing for storage headers

use std::path::PathBuf;
#[cfg(feature = "pretrained")]
use std::sync::Mutex;
use std::time::Duration;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Pretrained models are not available in this build")]
    PretrainedUnavailable,

    #[error("Unknown embedding strategy: {0} (expected full, messages or chunks)")]
    UnknownStrategy(String),

    #[error("Embedding cache error: {0}")]
    Cache(#[from] crate::semantic::cache::CacheError),
}

/// Something that turns text into fixed-length vectors.
///
/// Implementations must be deterministic: the same text always maps to the
/// same vector for the lifetime of the embedder.
pub trait TextEmbedder: Send + Sync {
    /// Backend name, recorded in metadata
    fn name(&self) -> &str;

    /// Output vector length
    fn dimensions(&self) -> usize;

    /// Embed a batch of non-blank texts, preserving order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Compute SHA256 hash of a model name for storage identification.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
#[cfg(feature = "pretrained")]
pub struct PretrainedModel {
    model: Mutex<fastembed::TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

#[cfg(feature = "pretrained")]
impl PretrainedModel {
    /// Create a new embedding model with the given name.
    ///
    /// The model will be downloaded on first use if not cached in `model_dir`.
    pub fn new(
        model_name: &str,
        model_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        use fastembed::{InitOptions, TextEmbedding};

        let model_enum = parse_model_name(model_name)?;
        if let Some(timeout) = download_timeout {
            log::debug!("model download timeout is {}s", timeout.as_secs());
        }

        std::fs::create_dir_all(&model_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(model_dir)
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = probe_dimensions(&mut model)?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }
}

#[cfg(not(feature = "pretrained"))]
pub struct PretrainedModel {
    model_name: String,
}

#[cfg(not(feature = "pretrained"))]
impl PretrainedModel {
    pub fn new(
        model_name: &str,
        _model_dir: PathBuf,
        _download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        log::debug!("cannot load '{}': built without the pretrained feature", model_name);
        Err(EmbeddingError::PretrainedUnavailable)
    }
}

#[cfg(feature = "pretrained")]
impl TextEmbedder for PretrainedModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "model returned {} embeddings for {} texts",
                embeddings.len(),
                texts.len()
            )));
        }

        Ok(embeddings)
    }
}

#[cfg(not(feature = "pretrained"))]
impl TextEmbedder for PretrainedModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        0
    }

    fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::PretrainedUnavailable)
    }
}

/// Parse model name string to fastembed enum.
#[cfg(feature = "pretrained")]
fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "all-minilm-l6-v2-q" | "allminiml6v2q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
        "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-small-en-v1.5-q" | "bgesmallenv15q" => {
            Ok(fastembed::EmbeddingModel::BGESmallENV15Q)
        }
        "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-base-en-v1.5-q" | "bgebaseenv15q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5 (add -q suffix for quantized), or 'hashed'",
            name
        ))),
    }
}

/// Probe the model to determine embedding dimensions.
#[cfg(feature = "pretrained")]
fn probe_dimensions(model: &mut fastembed::TextEmbedding) -> Result<usize, EmbeddingError> {
    let test_embeddings = model
        .embed(vec!["test"], None)
        .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

    test_embeddings
        .first()
        .map(|v| v.len())
        .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "pretrained")]
    #[ignore = "requires model download"]
    fn test_model_creation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = PretrainedModel::new("all-MiniLM-L6-v2", temp_dir.path().to_path_buf(), None)
            .unwrap();

        assert_eq!(model.name(), "all-MiniLM-L6-v2");
        assert_eq!(model.dimensions(), 384);

        let embedding = &model.embed_batch(&["Hello, world!".to_string()]).unwrap()[0];
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }

    #[test]
    #[cfg(feature = "pretrained")]
    fn test_invalid_model_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = PretrainedModel::new("nonexistent-model", temp_dir.path().to_path_buf(), None);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    #[cfg(not(feature = "pretrained"))]
    fn test_pretrained_unavailable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = PretrainedModel::new("all-MiniLM-L6-v2", temp_dir.path().to_path_buf(), None);
        assert!(matches!(result, Err(EmbeddingError::PretrainedUnavailable)));
    }

    #[test]
    fn test_model_id_hash_consistency() {
        assert_eq!(model_id_hash("all-MiniLM-L6-v2"), model_id_hash("all-MiniLM-L6-v2"));
        assert_ne!(model_id_hash("all-MiniLM-L6-v2"), model_id_hash("hashed"));
    }
}
