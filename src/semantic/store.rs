//! Vector store: embeddings plus one metadata record per row.
//!
//! Rows are addressed by insertion order. The embedding backend and the
//! metadata list always have the same length; every mutation validates its
//! whole input before touching either.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::semantic::embeddings::model_id_hash;
use crate::semantic::index::{BackendKind, VectorBackend};
use crate::semantic::storage::{write_atomic, VectorStorageError, UNKNOWN_MODEL_ID};
use crate::semantic::{Embedding, Metadata};

/// Suffix of the metadata artifact
const METADATA_SUFFIX: &str = ".meta.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Length mismatch: {vectors} vectors but {metadata} metadata records")]
    LengthMismatch { vectors: usize, metadata: usize },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("No saved store at {0}")]
    NotFound(PathBuf),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("Metadata file error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

/// One search hit: cosine distance (lower is closer) and the row's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMetadata {
    pub score: f32,
    pub metadata: Metadata,
}

pub struct VectorStore {
    backend: Box<dyn VectorBackend>,
    metadata: Vec<Metadata>,
    dimensions: usize,
    model_id: Option<[u8; 32]>,
}

impl VectorStore {
    /// Create an empty store.
    pub fn new(dimensions: usize, backend: BackendKind) -> Self {
        Self {
            backend: backend.create(dimensions),
            metadata: Vec::new(),
            dimensions,
            model_id: None,
        }
    }

    /// Tag the store with the model that produced its embeddings.
    /// Saved files carry the tag and loading a file from another model fails.
    pub fn with_model(mut self, model_name: &str) -> Self {
        self.model_id = Some(model_id_hash(model_name));
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimensions
    }

    pub fn backend(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn get_size(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Metadata of every row, in insertion order.
    pub fn metadata(&self) -> &[Metadata] {
        &self.metadata
    }

    /// Embedding at insertion position `index`.
    pub fn embedding(&self, index: usize) -> Option<&[f32]> {
        self.backend.row(index)
    }

    /// Append rows. Nothing is stored unless every row is valid.
    pub fn add_vectors(
        &mut self,
        vectors: Vec<Embedding>,
        metadata: Vec<Metadata>,
    ) -> Result<(), StoreError> {
        if vectors.len() != metadata.len() {
            return Err(StoreError::LengthMismatch {
                vectors: vectors.len(),
                metadata: metadata.len(),
            });
        }

        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                got: bad.len(),
            });
        }

        self.backend.add(&vectors);
        self.metadata.extend(metadata);

        log::debug!("added {} vectors, store size {}", vectors.len(), self.get_size());
        Ok(())
    }

    /// Find the `k` rows closest to `query` by cosine distance.
    ///
    /// # Arguments
    /// * `query` - Query embedding, must match the store dimension
    /// * `k` - Maximum number of results
    /// * `filter` - Optional predicate over row metadata; rows failing it are skipped
    ///
    /// # Returns
    /// Results sorted by distance ascending; equal distances keep insertion order.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&dyn Fn(&Metadata) -> bool>,
    ) -> Result<Vec<ScoredMetadata>, StoreError> {
        if query.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        if self.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let mask: Option<Vec<bool>> = filter.map(|f| self.metadata.iter().map(f).collect());

        let results = self
            .backend
            .search(query, k, mask.as_deref())
            .into_iter()
            .filter_map(|neighbor| {
                self.metadata.get(neighbor.index).map(|metadata| ScoredMetadata {
                    score: neighbor.distance,
                    metadata: metadata.clone(),
                })
            })
            .collect();

        Ok(results)
    }

    /// Run `search` for each query, preserving query order.
    pub fn batch_search(
        &self,
        queries: &[Embedding],
        k: usize,
    ) -> Result<Vec<Vec<ScoredMetadata>>, StoreError> {
        queries.iter().map(|q| self.search(q, k, None)).collect()
    }

    /// Remove all rows. The dimension and backend stay.
    pub fn clear(&mut self) {
        self.backend.clear();
        self.metadata.clear();
    }

    /// Path of the matrix artifact for `base`.
    pub fn matrix_path(&self, base: &Path) -> PathBuf {
        with_suffix(base, self.backend.kind().matrix_suffix())
    }

    /// Path of the metadata artifact for `base`.
    pub fn metadata_path(base: &Path) -> PathBuf {
        with_suffix(base, METADATA_SUFFIX)
    }

    /// Whether both artifacts exist for `base`.
    pub fn exists(&self, base: &Path) -> bool {
        self.matrix_path(base).exists() && Self::metadata_path(base).exists()
    }

    /// Write the store as two files next to `base`.
    pub fn save(&self, base: &Path) -> Result<(), StoreError> {
        if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let model_id = self.model_id.unwrap_or(UNKNOWN_MODEL_ID);
        self.backend.save(&self.matrix_path(base), &model_id)?;

        let metadata = serde_json::to_vec(&self.metadata)?;
        write_atomic(&Self::metadata_path(base), &metadata)?;

        log::info!(
            "saved {} vectors to {}",
            self.get_size(),
            self.matrix_path(base).display()
        );
        Ok(())
    }

    /// Replace the store content with what was saved at `base`.
    ///
    /// The store is left unchanged if anything fails.
    pub fn load(&mut self, base: &Path) -> Result<(), StoreError> {
        let matrix_path = self.matrix_path(base);
        let metadata_path = Self::metadata_path(base);

        for path in [&matrix_path, &metadata_path] {
            if !path.exists() {
                return Err(StoreError::NotFound(path.clone()));
            }
        }

        let metadata: Vec<Metadata> = serde_json::from_slice(&std::fs::read(&metadata_path)?)?;

        let mut backend = self.backend.kind().create(self.dimensions);
        let rows = backend
            .load(&matrix_path, self.model_id.as_ref())
            .map_err(|e| match e {
                VectorStorageError::DimensionMismatch { expected, got } => {
                    StoreError::DimensionMismatch { expected, got }
                }
                other => StoreError::Storage(other),
            })?;

        if rows != metadata.len() {
            return Err(StoreError::Corrupt(format!(
                "{} has {} rows but {} has {} records",
                matrix_path.display(),
                rows,
                metadata_path.display(),
                metadata.len()
            )));
        }

        self.backend = backend;
        self.metadata = metadata;

        log::info!("loaded {} vectors from {}", rows, matrix_path.display());
        Ok(())
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(id: &str) -> Metadata {
        let mut m = Metadata::new();
        m.insert("id".into(), json!(id));
        m
    }

    fn stores(dimensions: usize) -> Vec<VectorStore> {
        vec![
            VectorStore::new(dimensions, BackendKind::Flat),
            VectorStore::new(dimensions, BackendKind::Parallel),
        ]
    }

    #[test]
    fn test_add_vectors_grows_size() {
        for mut store in stores(3) {
            store
                .add_vectors(vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]], vec![meta("a"), meta("b")])
                .unwrap();
            assert_eq!(store.get_size(), 2);

            store.add_vectors(vec![vec![0.0, 0.0, 1.0]], vec![meta("c")]).unwrap();
            assert_eq!(store.get_size(), 3);
            assert_eq!(store.metadata()[2], meta("c"));
        }
    }

    #[test]
    fn test_length_mismatch_leaves_store_unchanged() {
        for mut store in stores(3) {
            store.add_vectors(vec![vec![1.0, 0.0, 0.0]], vec![meta("a")]).unwrap();

            let result = store.add_vectors(vec![vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]], vec![meta("b")]);
            assert!(matches!(
                result,
                Err(StoreError::LengthMismatch { vectors: 2, metadata: 1 })
            ));
            assert_eq!(store.get_size(), 1);
        }
    }

    #[test]
    fn test_dimension_mismatch_leaves_store_unchanged() {
        for mut store in stores(3) {
            let result = store.add_vectors(
                vec![vec![1.0, 0.0, 0.0], vec![1.0, 0.0]],
                vec![meta("a"), meta("b")],
            );
            assert!(matches!(
                result,
                Err(StoreError::DimensionMismatch { expected: 3, got: 2 })
            ));
            assert_eq!(store.get_size(), 0);
            assert!(store.embedding(0).is_none());
        }
    }

    #[test]
    fn test_search_empty_store() {
        for store in stores(3) {
            for k in [0, 1, 10] {
                assert!(store.search(&[1.0, 0.0, 0.0], k, None).unwrap().is_empty());
            }
        }
    }

    #[test]
    fn test_search_query_dimension_mismatch() {
        for store in stores(3) {
            let result = store.search(&[1.0, 0.0], 1, None);
            assert!(matches!(result, Err(StoreError::DimensionMismatch { .. })));
        }
    }

    #[test]
    fn test_search_fewer_than_k() {
        for mut store in stores(2) {
            store
                .add_vectors(
                    vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]],
                    vec![meta("x"), meta("y"), meta("z")],
                )
                .unwrap();

            let results = store.search(&[1.0, 0.2], 10, None).unwrap();
            assert_eq!(results.len(), 3);
            assert!(results.windows(2).all(|w| w[0].score <= w[1].score));
            assert_eq!(results[0].metadata, meta("x"));
        }
    }

    #[test]
    fn test_search_with_filter() {
        for mut store in stores(2) {
            store
                .add_vectors(
                    vec![vec![1.0, 0.0], vec![0.9, 0.1], vec![0.0, 1.0]],
                    vec![meta("keep-1"), meta("drop"), meta("keep-2")],
                )
                .unwrap();

            let filter = |m: &Metadata| m["id"].as_str().is_some_and(|id| id.starts_with("keep"));
            let results = store.search(&[1.0, 0.0], 10, Some(&filter)).unwrap();

            let ids: Vec<&str> = results.iter().filter_map(|r| r.metadata["id"].as_str()).collect();
            assert_eq!(ids, vec!["keep-1", "keep-2"]);
        }
    }

    #[test]
    fn test_batch_search_preserves_order() {
        for mut store in stores(2) {
            store
                .add_vectors(vec![vec![1.0, 0.0], vec![0.0, 1.0]], vec![meta("x"), meta("y")])
                .unwrap();

            let results = store
                .batch_search(&[vec![0.0, 1.0], vec![1.0, 0.0], vec![0.0, 1.0]], 1)
                .unwrap();

            assert_eq!(results.len(), 3);
            assert_eq!(results[0][0].metadata, meta("y"));
            assert_eq!(results[1][0].metadata, meta("x"));
            assert_eq!(results[2][0].metadata, meta("y"));
        }
    }

    #[test]
    fn test_clear_keeps_dimension() {
        for mut store in stores(4) {
            store.add_vectors(vec![vec![1.0; 4]], vec![meta("a")]).unwrap();
            store.clear();
            assert_eq!(store.get_size(), 0);
            assert_eq!(store.dimension(), 4);
            store.add_vectors(vec![vec![2.0; 4]], vec![meta("b")]).unwrap();
            assert_eq!(store.get_size(), 1);
        }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        for kind in [BackendKind::Flat, BackendKind::Parallel] {
            let dir = tempfile::tempdir().unwrap();
            let base = dir.path().join("memory");

            let mut store = VectorStore::new(3, kind);
            let vectors = vec![vec![0.1, 0.2, 0.3], vec![-1.0, 0.5, 2.25]];
            let mut rich = meta("b");
            rich.insert("nested".into(), json!({"tags": ["x", "y"], "n": 3}));
            store.add_vectors(vectors.clone(), vec![meta("a"), rich]).unwrap();
            store.save(&base).unwrap();
            assert!(store.exists(&base));

            let mut loaded = VectorStore::new(3, kind);
            loaded.load(&base).unwrap();

            assert_eq!(loaded.get_size(), store.get_size());
            assert_eq!(loaded.metadata(), store.metadata());
            for (i, vector) in vectors.iter().enumerate() {
                assert_eq!(loaded.embedding(i).unwrap(), vector.as_slice());
            }
        }
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::new(3, BackendKind::Flat);
        let result = store.load(&dir.path().join("nothing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_load_dimension_mismatch_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("memory");

        let mut small = VectorStore::new(2, BackendKind::Flat);
        small.add_vectors(vec![vec![1.0, 0.0]], vec![meta("a")]).unwrap();
        small.save(&base).unwrap();

        let mut other = VectorStore::new(3, BackendKind::Flat);
        other.add_vectors(vec![vec![1.0, 0.0, 0.0]], vec![meta("keep")]).unwrap();
        let result = other.load(&base);

        assert!(matches!(
            result,
            Err(StoreError::DimensionMismatch { expected: 3, got: 2 })
        ));
        assert_eq!(other.get_size(), 1);
        assert_eq!(other.metadata()[0], meta("keep"));
    }

    #[test]
    fn test_load_model_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("memory");

        let store = VectorStore::new(2, BackendKind::Flat).with_model("hashed");
        store.save(&base).unwrap();

        let mut other = VectorStore::new(2, BackendKind::Flat).with_model("all-MiniLM-L6-v2");
        let result = other.load(&base);
        assert!(matches!(
            result,
            Err(StoreError::Storage(VectorStorageError::ModelMismatch))
        ));
    }

    #[test]
    fn test_load_detects_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("memory");

        let mut store = VectorStore::new(2, BackendKind::Flat);
        store
            .add_vectors(vec![vec![1.0, 0.0], vec![0.0, 1.0]], vec![meta("a"), meta("b")])
            .unwrap();
        store.save(&base).unwrap();
        std::fs::write(VectorStore::metadata_path(&base), b"[{\"id\": \"a\"}]").unwrap();

        let mut loaded = VectorStore::new(2, BackendKind::Flat);
        assert!(matches!(loaded.load(&base), Err(StoreError::Corrupt(_))));
        assert_eq!(loaded.get_size(), 0);
    }

    #[test]
    fn test_artifact_paths() {
        let store = VectorStore::new(2, BackendKind::Parallel);
        let base = Path::new("/data/memory");
        assert_eq!(store.matrix_path(base), PathBuf::from("/data/memory.parallel.bin"));
        assert_eq!(VectorStore::metadata_path(base), PathBuf::from("/data/memory.meta.json"));
    }
}
