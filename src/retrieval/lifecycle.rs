//! Build-or-load decision for the persisted index.
//!
//! Freshness is decided by modification times alone: any recognized source
//! file newer than the older of the two artifacts forces a full rebuild.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::retrieval::embeddings::Embedder;
use crate::retrieval::index::VectorIndex;
use crate::retrieval::ingest::{self, SourceScan};
use crate::retrieval::storage::{IndexPaths, IndexStorage};
use crate::retrieval::RetrievalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexDecision {
    Load,
    Rebuild,
}

/// Load when both artifacts exist and are at least as new as every source
/// file; rebuild otherwise.
pub fn decide(scan: &SourceScan, paths: &IndexPaths) -> IndexDecision {
    let Some(index_mtime) = paths.mtime() else {
        return IndexDecision::Rebuild;
    };

    match scan.content_mtime {
        Some(content_mtime) if content_mtime > index_mtime => IndexDecision::Rebuild,
        _ => IndexDecision::Load,
    }
}

/// What [`IndexLifecycle::ensure`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum IndexOutcome {
    Loaded { documents: usize },
    Rebuilt { documents: usize },
}

pub struct IndexLifecycle {
    source_dir: PathBuf,
    storage: IndexStorage,
    chunk_size: usize,
    chunk_overlap: usize,
    embedder: Arc<dyn Embedder>,
}

impl IndexLifecycle {
    pub fn new(
        source_dir: PathBuf,
        paths: IndexPaths,
        chunk_size: usize,
        chunk_overlap: usize,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            source_dir,
            storage: IndexStorage::new(paths),
            chunk_size,
            chunk_overlap,
            embedder,
        }
    }

    pub fn paths(&self) -> &IndexPaths {
        self.storage.paths()
    }

    /// Current decision, without acting on it.
    pub fn check(&self) -> IndexDecision {
        decide(&ingest::scan(&self.source_dir), self.storage.paths())
    }

    /// Load the persisted index when fresh, otherwise rebuild and persist.
    pub fn ensure(&self) -> Result<(VectorIndex, IndexOutcome), RetrievalError> {
        let scan = ingest::scan(&self.source_dir);

        match decide(&scan, self.storage.paths()) {
            IndexDecision::Load => {
                log::info!("index is fresh, loading from storage");
                let index = self
                    .storage
                    .load(&self.embedder.model_id_hash(), self.embedder.dimensions())?;
                let documents = index.len();
                Ok((index, IndexOutcome::Loaded { documents }))
            }
            IndexDecision::Rebuild => {
                log::info!("index is missing or stale, rebuilding");
                let index = self.rebuild_from(&scan)?;
                let documents = index.len();
                Ok((index, IndexOutcome::Rebuilt { documents }))
            }
        }
    }

    /// Rebuild unconditionally.
    pub fn rebuild(&self) -> Result<VectorIndex, RetrievalError> {
        self.rebuild_from(&ingest::scan(&self.source_dir))
    }

    /// Ingest the preferred source format, build, and persist. Nothing on
    /// disk changes unless the whole build succeeds.
    fn rebuild_from(&self, scan: &SourceScan) -> Result<VectorIndex, RetrievalError> {
        let Some((format, files)) = scan.preferred() else {
            return Err(RetrievalError::NoSourceContent(self.source_dir.clone()));
        };
        log::info!(
            "ingesting {} {format:?} files from {}",
            files.len(),
            self.source_dir.display()
        );

        let chunks = ingest::load_chunks(
            &self.source_dir,
            format,
            files,
            self.chunk_size,
            self.chunk_overlap,
        );
        let index = VectorIndex::build(chunks, self.embedder.as_ref())
            .map_err(RetrievalError::IndexBuild)?;

        self.storage.persist(
            &index,
            self.embedder.model_name(),
            &self.embedder.model_id_hash(),
        )?;

        Ok(index)
    }
}
