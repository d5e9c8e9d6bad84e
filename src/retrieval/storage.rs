//! Persistence of the vector index as two co-located artifacts.
//!
//! documents.json:
//! - version, model name, fingerprint (hex SHA256 of the document list)
//! - documents: the chunk list, in index order
//!
//! vectors.bin header (79 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - fingerprint: [u8; 32] (must equal the documents.json fingerprint)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries follow in slot order, each `[f32; dimensions]` little-endian.
//!
//! Both files are written to temp files first and only renamed into place
//! once both writes have succeeded. The previous documents.json is held as
//! documents.json.bak during the swap and put back if the vectors rename
//! fails.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::retrieval::chunker::Chunk;
use crate::retrieval::index::{FlatL2, IndexError, VectorIndex};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// version(1) + model_id(32) + fingerprint(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 79;
const CHECKSUM_OFFSET: usize = HEADER_SIZE - 4;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed document list: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing index artifact: {0}")]
    Missing(PathBuf),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: index was built with a different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Artifacts do not belong to the same build")]
    FingerprintMismatch,

    #[error("Index error: {0}")]
    Index(#[from] IndexError),
}

/// Locations of the two index artifacts.
#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub documents: PathBuf,
    pub vectors: PathBuf,
}

impl IndexPaths {
    pub fn new(documents: PathBuf, vectors: PathBuf) -> Self {
        Self { documents, vectors }
    }

    /// Both artifacts are present.
    pub fn exist(&self) -> bool {
        self.documents.is_file() && self.vectors.is_file()
    }

    /// The older of the two artifact mtimes, or `None` if either is missing.
    pub fn mtime(&self) -> Option<SystemTime> {
        let documents = std::fs::metadata(&self.documents).ok()?.modified().ok()?;
        let vectors = std::fs::metadata(&self.vectors).ok()?.modified().ok()?;
        Some(documents.min(vectors))
    }
}

#[derive(Serialize, Deserialize)]
struct DocumentsFile {
    version: u8,
    model: String,
    fingerprint: String,
    documents: Vec<Chunk>,
}

/// Storage manager for the index artifact pair.
pub struct IndexStorage {
    paths: IndexPaths,
}

impl IndexStorage {
    pub fn new(paths: IndexPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &IndexPaths {
        &self.paths
    }

    /// Write both artifacts. On any failure the previous artifacts are
    /// left as they were.
    pub fn persist(
        &self,
        index: &VectorIndex,
        model_name: &str,
        model_id: &[u8; 32],
    ) -> Result<(), StorageError> {
        let docs_tmp = self.paths.documents.with_extension("json.tmp");
        let vectors_tmp = self.paths.vectors.with_extension("bin.tmp");

        let fingerprint = fingerprint(index.documents())?;
        let result = self
            .write_documents(&docs_tmp, index, model_name, &fingerprint)
            .and_then(|_| self.write_vectors(&vectors_tmp, index, model_id, &fingerprint));

        if let Err(err) = result {
            let _ = std::fs::remove_file(&docs_tmp);
            let _ = std::fs::remove_file(&vectors_tmp);
            return Err(err);
        }

        if let Err(err) = self.commit(&docs_tmp, &vectors_tmp) {
            let _ = std::fs::remove_file(&docs_tmp);
            let _ = std::fs::remove_file(&vectors_tmp);
            return Err(err);
        }

        log::info!(
            "persisted {} documents to {} and {}",
            index.len(),
            self.paths.documents.display(),
            self.paths.vectors.display()
        );
        Ok(())
    }

    /// Move both temp files into place. The previous document list is kept
    /// aside until the vectors are in place, and restored if they are not.
    fn commit(&self, docs_tmp: &Path, vectors_tmp: &Path) -> Result<(), StorageError> {
        let documents = &self.paths.documents;
        let backup = documents.with_extension("json.bak");

        let had_previous = documents.exists();
        if had_previous {
            std::fs::rename(documents, &backup)?;
        }

        let restore = |err: std::io::Error| -> StorageError {
            let restored = if had_previous {
                std::fs::rename(&backup, documents)
            } else {
                std::fs::remove_file(documents).or_else(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => Ok(()),
                    _ => Err(e),
                })
            };
            if let Err(restore_err) = restored {
                log::error!("could not restore {}: {restore_err}", documents.display());
            }
            err.into()
        };

        std::fs::rename(docs_tmp, documents).map_err(&restore)?;
        std::fs::rename(vectors_tmp, &self.paths.vectors).map_err(&restore)?;

        if had_previous {
            if let Err(err) = std::fs::remove_file(&backup) {
                log::warn!("could not remove {}: {err}", backup.display());
            }
        }
        Ok(())
    }

    /// Load both artifacts and check they describe the same build.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<VectorIndex, StorageError> {
        for path in [&self.paths.documents, &self.paths.vectors] {
            if !path.is_file() {
                return Err(StorageError::Missing(path.clone()));
            }
        }

        let docs_file: DocumentsFile =
            serde_json::from_reader(BufReader::new(File::open(&self.paths.documents)?))?;
        if docs_file.version > FORMAT_VERSION {
            return Err(StorageError::VersionMismatch(docs_file.version, FORMAT_VERSION));
        }

        let computed = fingerprint(&docs_file.documents)?;
        if to_hex(&computed) != docs_file.fingerprint {
            return Err(StorageError::FingerprintMismatch);
        }

        let mut reader = BufReader::new(File::open(&self.paths.vectors)?);
        let header = read_header(&mut reader)?;

        if header.model_id != *expected_model_id {
            return Err(StorageError::ModelMismatch);
        }
        if header.dimensions as usize != expected_dimensions {
            return Err(StorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }
        if header.fingerprint != computed || header.entry_count as usize != docs_file.documents.len() {
            return Err(StorageError::FingerprintMismatch);
        }

        let dimensions = header.dimensions as usize;
        let mut ann = FlatL2::with_capacity(dimensions, header.entry_count as usize);
        let mut row = vec![0f32; dimensions];
        let mut bytes = vec![0u8; dimensions * 4];
        for _ in 0..header.entry_count {
            reader.read_exact(&mut bytes)?;
            for (value, raw) in row.iter_mut().zip(bytes.chunks_exact(4)) {
                *value = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            }
            ann.add(&row)?;
        }

        let index = VectorIndex::from_flat(docs_file.documents, ann)?;
        log::info!("loaded {} documents from storage", index.len());
        Ok(index)
    }

    fn write_documents(
        &self,
        path: &Path,
        index: &VectorIndex,
        model_name: &str,
        fingerprint: &[u8; 32],
    ) -> Result<(), StorageError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let docs_file = DocumentsFile {
            version: FORMAT_VERSION,
            model: model_name.to_string(),
            fingerprint: to_hex(fingerprint),
            documents: index.documents().to_vec(),
        };
        serde_json::to_writer(&mut writer, &docs_file)?;

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    fn write_vectors(
        &self,
        path: &Path,
        index: &VectorIndex,
        model_id: &[u8; 32],
        fingerprint: &[u8; 32],
    ) -> Result<(), StorageError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let mut header = [0u8; HEADER_SIZE];
        header[0] = FORMAT_VERSION;
        header[1..33].copy_from_slice(model_id);
        header[33..65].copy_from_slice(fingerprint);
        header[65..67].copy_from_slice(&(index.dimensions() as u16).to_le_bytes());
        header[67..75].copy_from_slice(&(index.len() as u64).to_le_bytes());
        let checksum = crc32fast::hash(&header[..CHECKSUM_OFFSET]);
        header[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
        writer.write_all(&header)?;

        for vector in index.ann().iter() {
            for value in vector {
                writer.write_all(&value.to_le_bytes())?;
            }
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

#[derive(Debug)]
struct Header {
    model_id: [u8; 32],
    fingerprint: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

fn read_header(reader: &mut impl Read) -> Result<Header, StorageError> {
    let mut bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut bytes)?;

    let version = bytes[0];
    if version > FORMAT_VERSION {
        return Err(StorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored = u32::from_le_bytes([bytes[75], bytes[76], bytes[77], bytes[78]]);
    if stored != crc32fast::hash(&bytes[..CHECKSUM_OFFSET]) {
        return Err(StorageError::ChecksumMismatch);
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&bytes[1..33]);
    let mut fingerprint = [0u8; 32];
    fingerprint.copy_from_slice(&bytes[33..65]);

    let mut count = [0u8; 8];
    count.copy_from_slice(&bytes[67..75]);

    Ok(Header {
        model_id,
        fingerprint,
        dimensions: u16::from_le_bytes([bytes[65], bytes[66]]),
        entry_count: u64::from_le_bytes(count),
    })
}

/// SHA256 of the serialized document list.
fn fingerprint(documents: &[Chunk]) -> Result<[u8; 32], StorageError> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(documents)?);
    Ok(hasher.finalize().into())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn chunk(i: usize, text: &str) -> Chunk {
        Chunk {
            source_id: "gateway.html".to_string(),
            chunk_index: i,
            text: text.to_string(),
            char_span: (0, text.chars().count()),
        }
    }

    fn sample_index() -> VectorIndex {
        VectorIndex::from_parts(
            vec![chunk(0, "rate limit"), chunk(1, "jwt auth"), chunk(2, "timeouts")],
            vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]],
            3,
        )
        .unwrap()
    }

    fn storage_in(dir: &Path) -> IndexStorage {
        IndexStorage::new(IndexPaths::new(
            dir.join("documents.json"),
            dir.join("vectors.bin"),
        ))
    }

    #[test]
    fn test_persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        let index = sample_index();

        storage.persist(&index, "test-model", &model_id()).unwrap();
        assert!(storage.paths().exist());
        assert!(storage.paths().mtime().is_some());

        let loaded = storage.load(&model_id(), 3).unwrap();
        assert_eq!(loaded, index);
    }

    #[test]
    fn test_missing_artifact_is_hard_failure() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        storage.persist(&sample_index(), "test-model", &model_id()).unwrap();

        std::fs::remove_file(&storage.paths().vectors).unwrap();
        assert!(!storage.paths().exist());
        assert!(storage.paths().mtime().is_none());
        assert!(matches!(
            storage.load(&model_id(), 3),
            Err(StorageError::Missing(_))
        ));
    }

    #[test]
    fn test_failed_vectors_swap_restores_documents() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        std::fs::write(&storage.paths().documents, b"previous build").unwrap();
        // a non-empty directory where the vectors file should go
        std::fs::create_dir_all(storage.paths().vectors.join("occupied")).unwrap();

        let result = storage.persist(&sample_index(), "test-model", &model_id());
        assert!(matches!(result, Err(StorageError::Io(_))));

        assert_eq!(
            std::fs::read(&storage.paths().documents).unwrap(),
            b"previous build"
        );
        let leftovers: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".tmp") || name.ends_with(".bak"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn test_mismatched_pair_is_hard_failure() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        storage.persist(&sample_index(), "test-model", &model_id()).unwrap();
        let first_vectors = std::fs::read(&storage.paths().vectors).unwrap();

        let other = VectorIndex::from_parts(
            vec![chunk(0, "something else"), chunk(1, "entirely"), chunk(2, "different")],
            vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]],
            3,
        )
        .unwrap();
        storage.persist(&other, "test-model", &model_id()).unwrap();

        // vectors from the first build next to documents from the second
        std::fs::write(&storage.paths().vectors, first_vectors).unwrap();
        assert!(matches!(
            storage.load(&model_id(), 3),
            Err(StorageError::FingerprintMismatch)
        ));
    }

    #[test]
    fn test_model_and_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        storage.persist(&sample_index(), "test-model", &model_id()).unwrap();

        let mut wrong = model_id();
        wrong[0] = 0xFF;
        assert!(matches!(storage.load(&wrong, 3), Err(StorageError::ModelMismatch)));
        assert!(matches!(
            storage.load(&model_id(), 384),
            Err(StorageError::DimensionMismatch { expected: 384, got: 3 })
        ));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        storage.persist(&sample_index(), "test-model", &model_id()).unwrap();

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&storage.paths().vectors)
            .unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        assert!(matches!(
            storage.load(&model_id(), 3),
            Err(StorageError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_failed_persist_keeps_previous_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        storage.persist(&sample_index(), "test-model", &model_id()).unwrap();
        let before = std::fs::read(&storage.paths().documents).unwrap();

        // a directory where the vectors temp file should go makes the write fail
        std::fs::create_dir(dir.path().join("vectors.bin.tmp")).unwrap();
        let other = VectorIndex::from_parts(vec![chunk(0, "new")], vec![vec![1.0, 0.0, 0.0]], 3)
            .unwrap();
        assert!(storage.persist(&other, "test-model", &model_id()).is_err());

        assert_eq!(std::fs::read(&storage.paths().documents).unwrap(), before);
        assert!(!dir.path().join("documents.json.tmp").exists());
        assert!(storage.load(&model_id(), 3).is_ok());
    }
}
