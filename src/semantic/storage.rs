//! Binary storage for the embedding matrix.
//!
//! File format: `<base>.<backend>.bin`
//!
//! Header (49 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name, zeros if unknown)
//! - dimensions: u32 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated, insertion order):
//! - embedding: [f32; dimensions] (little-endian)
//!
//! Trailer:
//! - payload_checksum: u32 (CRC32 of all entry bytes)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::semantic::Embedding;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(4) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 49;

/// Model id written when the producing model is unknown
pub const UNKNOWN_MODEL_ID: [u8; 32] = [0u8; 32];

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Storage manager for one embedding matrix file.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load all rows from storage.
    ///
    /// # Arguments
    /// * `expected_model_id` - When set, the file must have been written for this model
    /// * `expected_dimensions` - Row length the caller expects
    pub fn load(
        &self,
        expected_model_id: Option<&[u8; 32]>,
        expected_dimensions: usize,
    ) -> Result<Vec<Embedding>, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = self.read_header(&mut reader)?;
        self.validate_header(&header, expected_model_id, expected_dimensions)?;

        let dimensions = header.dimensions as usize;
        let count = usize::try_from(header.entry_count).map_err(|_| {
            VectorStorageError::InvalidFormat(format!("entry count {} too large", header.entry_count))
        })?;

        let mut hasher = crc32fast::Hasher::new();
        let mut rows = Vec::with_capacity(count.min(1 << 20));
        let mut row_bytes = vec![0u8; dimensions * 4];

        for _ in 0..count {
            reader.read_exact(&mut row_bytes)?;
            hasher.update(&row_bytes);
            rows.push(
                row_bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            );
        }

        let mut trailer = [0u8; 4];
        reader.read_exact(&mut trailer)?;
        if u32::from_le_bytes(trailer) != hasher.finalize() {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut rest = [0u8; 1];
        if reader.read(&mut rest)? != 0 {
            return Err(VectorStorageError::InvalidFormat(
                "trailing data after payload".to_string(),
            ));
        }

        Ok(rows)
    }

    /// Save rows to storage.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(
        &self,
        dimensions: usize,
        model_id: &[u8; 32],
        rows: &[&[f32]],
    ) -> Result<(), VectorStorageError> {
        if let Some(bad) = rows.iter().find(|r| r.len() != dimensions) {
            return Err(VectorStorageError::DimensionMismatch {
                expected: dimensions,
                got: bad.len(),
            });
        }
        let dimensions = u32::try_from(dimensions).map_err(|_| {
            VectorStorageError::InvalidFormat(format!("dimension {} too large", dimensions))
        })?;

        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, dimensions, model_id, rows);

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Delete the storage file if it exists.
    pub fn delete(&self) -> Result<(), VectorStorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        dimensions: u32,
        model_id: &[u8; 32],
        rows: &[&[f32]],
    ) -> Result<(), VectorStorageError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions,
            entry_count: rows.len() as u64,
        };
        self.write_header(&mut writer, &header)?;

        let mut hasher = crc32fast::Hasher::new();
        for row in rows {
            for &value in row.iter() {
                let bytes = value.to_le_bytes();
                hasher.update(&bytes);
                writer.write_all(&bytes)?;
            }
        }
        writer.write_all(&hasher.finalize().to_le_bytes())?;

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(&self, reader: &mut impl Read) -> Result<Header, VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                VectorStorageError::InvalidFormat("file shorter than header".to_string())
            } else {
                VectorStorageError::Io(e)
            }
        })?;

        let version = header_bytes[0];

        if version > FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        let mut dimensions = [0u8; 4];
        dimensions.copy_from_slice(&header_bytes[33..37]);
        let mut entry_count = [0u8; 8];
        entry_count.copy_from_slice(&header_bytes[37..45]);
        let mut stored_checksum = [0u8; 4];
        stored_checksum.copy_from_slice(&header_bytes[45..49]);

        let computed_checksum = crc32fast::hash(&header_bytes[0..45]);
        if u32::from_le_bytes(stored_checksum) != computed_checksum {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        Ok(Header {
            version,
            model_id,
            dimensions: u32::from_le_bytes(dimensions),
            entry_count: u64::from_le_bytes(entry_count),
        })
    }

    fn validate_header(
        &self,
        header: &Header,
        expected_model_id: Option<&[u8; 32]>,
        expected_dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        if let Some(expected) = expected_model_id {
            if header.model_id != UNKNOWN_MODEL_ID && header.model_id != *expected {
                return Err(VectorStorageError::ModelMismatch);
            }
        }

        if header.dimensions as usize != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        log::debug!(
            "matrix file v{} with {} rows of {} dims",
            header.version,
            header.entry_count,
            header.dimensions
        );

        Ok(())
    }

    fn write_header(&self, writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = header.version;
        header_bytes[1..33].copy_from_slice(&header.model_id);
        header_bytes[33..37].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[37..45].copy_from_slice(&header.entry_count.to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[0..45]);
        header_bytes[45..49].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        Ok(())
    }
}

/// Write bytes through a temp file and rename into place.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let temp_path = path.with_extension("tmp");
    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    std::fs::rename(&temp_path, path)
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u32,
    entry_count: u64,
}
