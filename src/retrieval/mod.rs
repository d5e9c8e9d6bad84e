//! Retrieval engine: source ingestion, chunking, embedding, vector index
//! and its build-or-load lifecycle.
//!
//! # Architecture
//!
//! - `chunker`: overlapping character windows
//! - `ingest`: source discovery and HTML/PDF text extraction
//! - `embeddings`: embedder trait and the fastembed implementation
//! - `index`: exact L2 index paired with its document list
//! - `storage`: persistence of the document/vector artifact pair
//! - `lifecycle`: staleness check and rebuild
//! - `service`: shared read handle used by the pipeline

pub mod chunker;
pub mod embeddings;
pub mod index;
pub mod ingest;
pub mod lifecycle;
pub mod service;
pub mod storage;

use std::path::PathBuf;

pub use chunker::Chunk;
pub use embeddings::{Embedder, EmbeddingError, FastEmbedder};
pub use index::{IndexError, SearchResult, VectorIndex};
pub use lifecycle::{IndexDecision, IndexLifecycle, IndexOutcome};
pub use service::{RetrievalService, DEFAULT_TOP_K};
pub use storage::{IndexPaths, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("no .html, .htm or .pdf files found under {0}")]
    NoSourceContent(PathBuf),

    #[error("index build failed: {0}")]
    IndexBuild(IndexError),

    #[error("index storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("retrieval service has no index storage configured")]
    NoStorage,
}
