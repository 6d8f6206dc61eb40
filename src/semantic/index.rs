//! Vector index backends with exact cosine-distance search.
//!
//! Both backends rank by cosine distance (`1 - cosine similarity`, lower is
//! closer) and break ties by insertion order, so they are interchangeable:
//! - `FlatIndex`: one `Vec` per row, norms computed on every query
//! - `ParallelIndex`: contiguous row-major matrix with cached norms,
//!   scanned in parallel with rayon

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::semantic::storage::{VectorStorage, VectorStorageError};
use crate::semantic::Embedding;

/// Which backend a store uses. Fixed at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Flat,
    Parallel,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Flat => "flat",
            BackendKind::Parallel => "parallel",
        }
    }

    /// Suffix of the matrix artifact written by this backend.
    pub fn matrix_suffix(&self) -> &'static str {
        match self {
            BackendKind::Flat => ".flat.bin",
            BackendKind::Parallel => ".parallel.bin",
        }
    }

    /// Create an empty backend of this kind.
    pub fn create(&self, dimensions: usize) -> Box<dyn VectorBackend> {
        match self {
            BackendKind::Flat => Box::new(FlatIndex::new(dimensions)),
            BackendKind::Parallel => Box::new(ParallelIndex::new(dimensions)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "flat" | "bruteforce" | "brute-force" => Ok(BackendKind::Flat),
            "parallel" => Ok(BackendKind::Parallel),
            other => Err(format!("unknown vector backend '{}' (expected flat or parallel)", other)),
        }
    }
}

/// A search hit: row position and its cosine distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f32,
}

/// Storage and search capability shared by all backends.
///
/// Callers validate dimensions before calling `add`/`search`.
pub trait VectorBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn dimensions(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append rows in order.
    fn add(&mut self, vectors: &[Embedding]);

    /// Row at insertion position `index`.
    fn row(&self, index: usize) -> Option<&[f32]>;

    /// Return up to `k` nearest rows, ascending by distance.
    /// When `mask` is given, only rows whose mask entry is `true` qualify.
    fn search(&self, query: &[f32], k: usize, mask: Option<&[bool]>) -> Vec<Neighbor>;

    fn clear(&mut self);

    /// Write all rows to `path`.
    fn save(&self, path: &Path, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let rows: Vec<&[f32]> = (0..self.len()).filter_map(|i| self.row(i)).collect();
        VectorStorage::new(path.to_path_buf()).save(self.dimensions(), model_id, &rows)
    }

    /// Replace all rows with the content of `path`.
    fn load(&mut self, path: &Path, model_id: Option<&[u8; 32]>) -> Result<usize, VectorStorageError> {
        let rows = VectorStorage::new(path.to_path_buf()).load(model_id, self.dimensions())?;
        self.clear();
        self.add(&rows);
        Ok(rows.len())
    }
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine distance with precomputed norms.
/// Zero-norm vectors have no direction; they sit at distance 1 from everything.
pub fn cosine_distance(query: &[f32], query_norm: f32, target: &[f32], target_norm: f32) -> f32 {
    if query_norm < f32::EPSILON || target_norm < f32::EPSILON {
        return 1.0;
    }

    let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
    (1.0 - dot_product / (query_norm * target_norm)).clamp(0.0, 2.0)
}

fn by_distance_then_index(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| a.index.cmp(&b.index))
}

/// Keep the `k` best candidates, sorted ascending.
pub fn select_top_k(mut candidates: Vec<Neighbor>, k: usize) -> Vec<Neighbor> {
    if k == 0 {
        return vec![];
    }
    if k < candidates.len() {
        candidates.select_nth_unstable_by(k - 1, by_distance_then_index);
        candidates.truncate(k);
    }
    candidates.sort_by(by_distance_then_index);
    candidates
}

fn qualifies(mask: Option<&[bool]>, index: usize) -> bool {
    mask.map(|m| m.get(index).copied().unwrap_or(false))
        .unwrap_or(true)
}

/// Brute-force linear scan over row vectors.
pub struct FlatIndex {
    rows: Vec<Embedding>,
    dimensions: usize,
}

impl FlatIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            rows: Vec::new(),
            dimensions,
        }
    }
}

impl VectorBackend for FlatIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::Flat
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn add(&mut self, vectors: &[Embedding]) {
        self.rows.extend(vectors.iter().cloned());
    }

    fn row(&self, index: usize) -> Option<&[f32]> {
        self.rows.get(index).map(|r| r.as_slice())
    }

    fn search(&self, query: &[f32], k: usize, mask: Option<&[bool]>) -> Vec<Neighbor> {
        if k == 0 || self.rows.is_empty() {
            return vec![];
        }

        let query_norm = l2_norm(query);
        let candidates: Vec<Neighbor> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(index, _)| qualifies(mask, *index))
            .map(|(index, row)| Neighbor {
                index,
                distance: cosine_distance(query, query_norm, row, l2_norm(row)),
            })
            .collect();

        select_top_k(candidates, k)
    }

    fn clear(&mut self) {
        self.rows.clear();
    }
}

/// Row-major matrix with cached norms, scanned in parallel.
pub struct ParallelIndex {
    data: Vec<f32>,
    norms: Vec<f32>,
    dimensions: usize,
}

impl ParallelIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            data: Vec::new(),
            norms: Vec::new(),
            dimensions,
        }
    }
}

impl VectorBackend for ParallelIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::Parallel
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn len(&self) -> usize {
        self.norms.len()
    }

    fn add(&mut self, vectors: &[Embedding]) {
        self.data.reserve(vectors.len() * self.dimensions);
        self.norms.reserve(vectors.len());
        for vector in vectors {
            self.data.extend_from_slice(vector);
            self.norms.push(l2_norm(vector));
        }
    }

    fn row(&self, index: usize) -> Option<&[f32]> {
        if index >= self.norms.len() {
            return None;
        }
        let start = index * self.dimensions;
        self.data.get(start..start + self.dimensions)
    }

    fn search(&self, query: &[f32], k: usize, mask: Option<&[bool]>) -> Vec<Neighbor> {
        if k == 0 || self.norms.is_empty() || self.dimensions == 0 {
            return vec![];
        }

        let query_norm = l2_norm(query);
        let candidates: Vec<Neighbor> = self
            .data
            .par_chunks_exact(self.dimensions)
            .zip(self.norms.par_iter())
            .enumerate()
            .filter(|(index, _)| qualifies(mask, *index))
            .map(|(index, (row, &norm))| Neighbor {
                index,
                distance: cosine_distance(query, query_norm, row, norm),
            })
            .collect();

        select_top_k(candidates, k)
    }

    fn clear(&mut self) {
        self.data.clear();
        self.norms.clear();
    }
}
