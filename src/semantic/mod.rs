//! Retrieval core for conversation memory.
//!
//! Embeds conversation text, stores the embeddings with metadata and ranks
//! them against query text by cosine distance.
//!
//! # Architecture
//!
//! - `preprocess`: Splits conversations into segments by strategy
//! - `embeddings`: `TextEmbedder` trait and the fastembed-backed model
//! - `hashed`: Deterministic feature-hashing fallback embedder
//! - `cache`: On-disk embedding cache
//! - `generator`: Embedding generation with fallback and caching
//! - `index`: Flat and parallel exact search backends
//! - `storage`: Binary file I/O for the embedding matrix
//! - `store`: Vector store (backend + metadata, save/load)
//! - `retriever`: Query text to ranked results
//! - `service`: Training and querying over the data directory

pub mod cache;
pub mod embeddings;
pub mod generator;
pub mod hashed;
pub mod index;
pub mod preprocess;
pub mod retriever;
mod service;
pub mod storage;
pub mod store;

pub use embeddings::{EmbeddingError, TextEmbedder};
pub use generator::{EmbeddingGenerator, DEFAULT_BATCH_SIZE};
pub use index::BackendKind;
pub use preprocess::{EmbeddingStrategy, DEFAULT_CHUNK_SIZE};
pub use retriever::{RetrievalResult, Retriever};
pub use service::{MemoryError, MemoryService, MemoryStats, TrainReport};
pub use store::{StoreError, VectorStore};

/// A fixed-length embedding vector
pub type Embedding = Vec<f32>;

/// Open key/value record stored alongside each embedding
pub type Metadata = serde_json::Map<String, serde_json::Value>;
