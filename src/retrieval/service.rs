//! Process-wide retrieval handle.
//!
//! Holds at most one active [`VectorIndex`]. Readers clone an `Arc` of the
//! current index under a short read lock, so a rebuild swapping in a new
//! index never disturbs searches already in flight.

use std::sync::{Arc, RwLock};

use crate::retrieval::embeddings::Embedder;
use crate::retrieval::index::{SearchResult, VectorIndex};
use crate::retrieval::lifecycle::{IndexDecision, IndexLifecycle, IndexOutcome};
use crate::retrieval::RetrievalError;

/// Default number of neighbors returned by a search.
pub const DEFAULT_TOP_K: usize = 5;

pub struct RetrievalService {
    embedder: Arc<dyn Embedder>,
    lifecycle: Option<IndexLifecycle>,
    active: RwLock<Option<Arc<VectorIndex>>>,
}

impl RetrievalService {
    /// Service backed by on-disk artifacts. Nothing is loaded until
    /// [`initialize`](Self::initialize).
    pub fn new(embedder: Arc<dyn Embedder>, lifecycle: IndexLifecycle) -> Self {
        Self {
            embedder,
            lifecycle: Some(lifecycle),
            active: RwLock::new(None),
        }
    }

    /// Service over an index built in memory.
    pub fn with_index(embedder: Arc<dyn Embedder>, index: VectorIndex) -> Self {
        Self {
            embedder,
            lifecycle: None,
            active: RwLock::new(Some(Arc::new(index))),
        }
    }

    /// Service with no index at all.
    pub fn empty(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            lifecycle: None,
            active: RwLock::new(None),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Build or load the index and make it active.
    pub fn initialize(&self) -> Result<IndexOutcome, RetrievalError> {
        let lifecycle = self.lifecycle.as_ref().ok_or(RetrievalError::NoStorage)?;
        let (index, outcome) = lifecycle.ensure()?;
        self.install(index);
        log::info!("retrieval ready: {outcome:?}");
        Ok(outcome)
    }

    /// Rebuild from sources regardless of freshness. The active index is
    /// only replaced once the new one has been persisted.
    pub fn rebuild(&self) -> Result<IndexOutcome, RetrievalError> {
        let lifecycle = self.lifecycle.as_ref().ok_or(RetrievalError::NoStorage)?;
        let index = lifecycle.rebuild()?;
        let documents = index.len();
        self.install(index);
        Ok(IndexOutcome::Rebuilt { documents })
    }

    /// Current freshness decision for the persisted artifacts.
    pub fn check(&self) -> Option<IndexDecision> {
        self.lifecycle.as_ref().map(IndexLifecycle::check)
    }

    /// Swap in a fully built index.
    pub fn install(&self, index: VectorIndex) {
        let index = Arc::new(index);
        match self.active.write() {
            Ok(mut guard) => *guard = Some(index),
            Err(poisoned) => *poisoned.into_inner() = Some(index),
        }
    }

    pub fn current(&self) -> Option<Arc<VectorIndex>> {
        match self.active.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.current().is_some()
    }

    pub fn indexed_count(&self) -> usize {
        self.current().map(|index| index.len()).unwrap_or(0)
    }

    /// Up to `k` nearest chunks to `query`, best first.
    ///
    /// Never fails: an uninitialized index or an embedding failure is
    /// logged and yields no results.
    pub fn search(&self, query: &str, k: usize) -> Vec<SearchResult> {
        let Some(index) = self.current() else {
            log::warn!("search called before the vector index was initialized");
            return vec![];
        };

        match index.search(self.embedder.as_ref(), query, k) {
            Ok(results) => results,
            Err(err) => {
                log::error!("search failed: {err}");
                vec![]
            }
        }
    }

    /// Search results rendered as prompt snippets, one block per hit.
    pub fn snippets(&self, query: &str, k: usize) -> String {
        self.search(query, k)
            .iter()
            .map(|r| format!("[{}] {}", r.document.name(), r.document.text))
            .collect::<Vec<_>>()
            .join("\n---\n")
    }
}
