use crate::semantic::{BackendKind, EmbeddingStrategy, DEFAULT_BATCH_SIZE, DEFAULT_CHUNK_SIZE};
use crate::storage::{self, StorageManager};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.yaml";

/// Default embedding model
const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";
/// Output dimension of the default model, also used by the hashed fallback
const DEFAULT_DIMENSION: usize = 384;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
/// Default base name of the persisted store
const DEFAULT_STORE_NAME: &str = "memory";
/// Default number of results per query
const DEFAULT_K: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is not valid utf8")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Configuration for embedding generation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name (e.g., "all-MiniLM-L6-v2"), or "hashed" for the local fallback
    #[serde(default = "default_model")]
    pub model: String,

    /// Dimension of the hashed fallback
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// How conversations are split: "full", "messages" or "chunks"
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Messages per row for the "chunks" strategy
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Texts per backend call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Parallelism for embedding generation: "auto" or a positive integer
    #[serde(default = "default_parallelism")]
    pub parallelism: String,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            dimension: DEFAULT_DIMENSION,
            strategy: default_strategy(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: default_parallelism(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

impl EmbeddingConfig {
    /// Parsed `strategy`. Only valid after validation.
    pub fn strategy(&self) -> EmbeddingStrategy {
        self.strategy.parse().unwrap_or(EmbeddingStrategy::Chunks)
    }

    /// Number of rayon threads, `None` for "auto".
    pub fn threads(&self) -> Option<usize> {
        match self.parallelism.as_str() {
            "auto" => None,
            n => n.parse().ok(),
        }
    }
}

/// Configuration for the vector store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Search backend: "flat" or "parallel"
    #[serde(default)]
    pub backend: BackendKind,

    /// Base file name of the persisted store inside the data directory
    #[serde(default = "default_store_name")]
    pub name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            name: default_store_name(),
        }
    }
}

/// Configuration for query defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,

    /// Include normalized similarity scores in results
    #[serde(default)]
    pub return_scores: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: DEFAULT_K,
            return_scores: false,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_dimension() -> usize {
    DEFAULT_DIMENSION
}

fn default_strategy() -> String {
    EmbeddingStrategy::Chunks.as_str().to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_parallelism() -> String {
    "auto".to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_store_name() -> String {
    DEFAULT_STORE_NAME.to_string()
}

fn default_k() -> usize {
    DEFAULT_K
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let emb = &self.embedding;

        if emb.model.trim().is_empty() {
            return Err(ConfigError::Invalid("embedding.model must not be empty".into()));
        }

        if emb.dimension == 0 {
            return Err(ConfigError::Invalid(
                "embedding.dimension must be greater than 0".into(),
            ));
        }

        if let Err(e) = emb.strategy.parse::<EmbeddingStrategy>() {
            return Err(ConfigError::Invalid(format!("embedding.strategy: {}", e)));
        }

        if emb.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "embedding.chunk_size must be greater than 0".into(),
            ));
        }

        if emb.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "embedding.batch_size must be greater than 0".into(),
            ));
        }

        // "auto" or positive integer
        if emb.parallelism != "auto" {
            match emb.parallelism.parse::<u32>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::Invalid(format!(
                        "embedding.parallelism must be 'auto' or a positive integer, got '{}'",
                        emb.parallelism
                    )))
                }
                Ok(_) => {}
            }
        }

        if emb.download_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "embedding.download_timeout_secs must be greater than 0".into(),
            ));
        }

        let name = self.store.name.trim();
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Err(ConfigError::Invalid(format!(
                "store.name must be a plain file name, got '{}'",
                self.store.name
            )));
        }

        if self.retrieval.default_k == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.default_k must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    pub fn load_with(base_path: &str) -> Result<Self, ConfigError> {
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_string();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.embedding.model, "all-MiniLM-L6-v2");
        assert_eq!(config.embedding.dimension, 384);
        assert_eq!(config.embedding.strategy(), EmbeddingStrategy::Chunks);
        assert_eq!(config.embedding.chunk_size, 5);
        assert_eq!(config.embedding.threads(), None);
        assert_eq!(config.store.backend, BackendKind::Flat);
        assert_eq!(config.store.name, "memory");
        assert_eq!(config.retrieval.default_k, 5);
        assert!(!config.retrieval.return_scores);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();

        let config = Config::load_with(base).unwrap();
        assert!(dir.path().join(CONFIG_FILE).exists());
        assert_eq!(config.embedding.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_partial_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "embedding:\n  model: hashed\n  dimension: 64\nstore:\n  backend: parallel\n",
        )
        .unwrap();

        let config = Config::load_with(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(config.embedding.model, "hashed");
        assert_eq!(config.embedding.dimension, 64);
        assert_eq!(config.embedding.chunk_size, 5);
        assert_eq!(config.store.backend, BackendKind::Parallel);
        assert_eq!(config.retrieval.default_k, 5);

        // upgraded file now carries every field
        let saved = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(saved.contains("chunk_size"));
        assert!(saved.contains("default_k"));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();

        let mut config = Config::load_with(base).unwrap();
        config.retrieval.default_k = 9;
        config.embedding.strategy = "messages".into();
        config.save().unwrap();

        let reloaded = Config::load_with(base).unwrap();
        assert_eq!(reloaded.retrieval.default_k, 9);
        assert_eq!(reloaded.embedding.strategy(), EmbeddingStrategy::Messages);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: [fn(&mut Config); 9] = [
            |c| c.embedding.strategy = "paragraphs".into(),
            |c| c.embedding.chunk_size = 0,
            |c| c.embedding.dimension = 0,
            |c| c.embedding.batch_size = 0,
            |c| c.embedding.parallelism = "0".into(),
            |c| c.embedding.parallelism = "many".into(),
            |c| c.embedding.download_timeout_secs = 0,
            |c| c.store.name = "../escape".into(),
            |c| c.retrieval.default_k = 0,
        ];

        for mutate in cases {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_parallelism_threads() {
        let mut config = EmbeddingConfig::default();
        config.parallelism = "3".into();
        assert_eq!(config.threads(), Some(3));
    }

    #[test]
    fn test_malformed_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "embedding: [unclosed").unwrap();

        let result = Config::load_with(dir.path().to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Malformed(_))));
    }
}
