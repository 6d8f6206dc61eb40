//! On-disk cache of computed embeddings.
//!
//! One JSON file per entry, named by the SHA-256 of the entry id so that
//! arbitrary ids are safe as file names. Entries are never invalidated here;
//! callers compare a content hash kept in the metadata.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::semantic::{Embedding, Metadata};
use crate::storage::{BackendLocal, StorageManager};

const ENTRY_SUFFIX: &str = ".json";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache entry '{id}': {source}")]
    Corrupt {
        id: String,
        source: serde_json::Error,
    },

    #[error("failed to encode cache entry: {0}")]
    Encode(serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    id: String,
    embedding: Embedding,
    metadata: Metadata,
}

pub struct EmbeddingCache {
    storage: BackendLocal,
}

impl EmbeddingCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        Ok(Self {
            storage: BackendLocal::new(dir)?,
        })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.storage.base_dir
    }

    pub fn put(&self, id: &str, embedding: &[f32], metadata: &Metadata) -> Result<(), CacheError> {
        let entry = CacheEntry {
            id: id.to_string(),
            embedding: embedding.to_vec(),
            metadata: metadata.clone(),
        };
        let data = serde_json::to_vec(&entry).map_err(CacheError::Encode)?;
        self.storage.write(&Self::file_name(id), &data)?;
        Ok(())
    }

    /// Returns `None` when no entry exists for `id`.
    pub fn get(&self, id: &str) -> Result<Option<(Embedding, Metadata)>, CacheError> {
        let name = Self::file_name(id);
        if !self.storage.exists(&name) {
            return Ok(None);
        }

        let data = self.storage.read(&name)?;
        let entry: CacheEntry = serde_json::from_slice(&data).map_err(|source| CacheError::Corrupt {
            id: id.to_string(),
            source,
        })?;

        if entry.id != id {
            log::warn!("cache entry for '{}' holds id '{}', ignoring", id, entry.id);
            return Ok(None);
        }

        Ok(Some((entry.embedding, entry.metadata)))
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    /// Remove every entry. Returns the number removed.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let names: Vec<String> = self.entries().collect();
        for name in &names {
            self.storage.delete(name)?;
        }
        Ok(names.len())
    }

    fn entries(&self) -> impl Iterator<Item = String> {
        self.storage
            .list()
            .into_iter()
            .filter(|name| name.ends_with(ENTRY_SUFFIX))
    }

    fn file_name(id: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());
        format!("{}{}", hex::encode(hasher.finalize()), ENTRY_SUFFIX)
    }
}
