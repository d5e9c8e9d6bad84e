//! In-memory vector index over chunk embeddings.
//!
//! The nearest-neighbor structure is an exact flat index using squared
//! Euclidean distance. Position `i` in [`FlatL2`] is always document `i`
//! in the parallel document list; both are built, persisted and loaded
//! together.
//!
//! Similarity is reported as `1 - distance / 2`. For unit-length vectors
//! (every supported fastembed model normalizes its output) the squared L2
//! distance lies in `[0, 4]` and this equals cosine similarity, so values
//! fall in `[-1, 1]` with `[0, 1]` for anything not pointing away from
//! the query.

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::time::Duration;

use crate::retrieval::chunker::Chunk;
use crate::retrieval::embeddings::{Embedder, EmbeddingError};

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("No documents to index")]
    NoDocuments,

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Embedder returned {got} vectors for {expected} documents")]
    CountMismatch { expected: usize, got: usize },

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
}

/// One neighbor slot from [`FlatL2::search`]. `slot` is `None` when the
/// index holds fewer than `k` vectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub slot: Option<usize>,
    pub distance: f32,
}

/// Exact nearest-neighbor index keyed by insertion position.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatL2 {
    dimensions: usize,
    /// Row-major, `len * dimensions` values
    data: Vec<f32>,
}

impl FlatL2 {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            data: Vec::new(),
        }
    }

    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            dimensions,
            data: Vec::with_capacity(dimensions * capacity),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        if self.dimensions == 0 {
            0
        } else {
            self.data.len() / self.dimensions
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a vector; it receives the next slot.
    pub fn add(&mut self, vector: &[f32]) -> Result<usize, IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        self.data.extend_from_slice(vector);
        Ok(self.len() - 1)
    }

    /// Vector stored at `slot`.
    pub fn vector(&self, slot: usize) -> Option<&[f32]> {
        let start = slot.checked_mul(self.dimensions)?;
        self.data.get(start..start + self.dimensions)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimensions.max(1))
    }

    /// Always returns exactly `k` slots, nearest first; slots past the
    /// number of stored vectors are empty with infinite distance.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let mut scored: Vec<Neighbor> = self
            .iter()
            .enumerate()
            .map(|(slot, vector)| Neighbor {
                slot: Some(slot),
                distance: squared_l2(query, vector),
            })
            .collect();

        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        scored.truncate(k);
        scored.resize(
            k,
            Neighbor {
                slot: None,
                distance: f32::INFINITY,
            },
        );

        Ok(scored)
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub document: Chunk,
    /// Squared L2 distance to the query
    pub distance: f32,
    /// `1 - distance / 2`
    pub similarity: f32,
}

/// Chunk documents plus their nearest-neighbor structure.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    documents: Vec<Chunk>,
    ann: FlatL2,
}

impl VectorIndex {
    /// Embed every chunk in one batch call and index the vectors.
    pub fn build(documents: Vec<Chunk>, embedder: &dyn Embedder) -> Result<Self, IndexError> {
        if documents.is_empty() {
            return Err(IndexError::NoDocuments);
        }

        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(format!("embedding {} chunks", documents.len()));
        spinner.enable_steady_tick(Duration::from_millis(120));

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let embedded = embedder.embed_batch(&texts);
        spinner.finish_and_clear();
        let vectors = embedded?;

        let index = Self::from_parts(documents, vectors, embedder.dimensions())?;
        log::info!("built vector index with {} documents", index.len());
        Ok(index)
    }

    /// Pair documents with precomputed vectors by position.
    pub fn from_parts(
        documents: Vec<Chunk>,
        vectors: Vec<Vec<f32>>,
        dimensions: usize,
    ) -> Result<Self, IndexError> {
        if vectors.len() != documents.len() {
            return Err(IndexError::CountMismatch {
                expected: documents.len(),
                got: vectors.len(),
            });
        }

        let mut ann = FlatL2::with_capacity(dimensions, vectors.len());
        for vector in &vectors {
            ann.add(vector)?;
        }

        Ok(Self { documents, ann })
    }

    pub(crate) fn from_flat(documents: Vec<Chunk>, ann: FlatL2) -> Result<Self, IndexError> {
        if ann.len() != documents.len() {
            return Err(IndexError::CountMismatch {
                expected: documents.len(),
                got: ann.len(),
            });
        }
        Ok(Self { documents, ann })
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.ann.dimensions()
    }

    pub fn documents(&self) -> &[Chunk] {
        &self.documents
    }

    pub fn ann(&self) -> &FlatL2 {
        &self.ann
    }

    /// Nearest documents to an already-embedded query, best first.
    pub fn search_vector(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, IndexError> {
        let neighbors = self.ann.search(query, k)?;

        Ok(neighbors
            .into_iter()
            .filter_map(|n| {
                let document = self.documents.get(n.slot?)?;
                Some(SearchResult {
                    document: document.clone(),
                    distance: n.distance,
                    similarity: 1.0 - n.distance / 2.0,
                })
            })
            .collect())
    }

    /// Embed `query` and return up to `k` nearest documents, best first.
    pub fn search(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        k: usize,
    ) -> Result<Vec<SearchResult>, IndexError> {
        let vector = embedder.embed(query)?;
        self.search_vector(&vector, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(i: usize) -> Chunk {
        Chunk {
            source_id: "doc.html".to_string(),
            chunk_index: i,
            text: format!("chunk {i}"),
            char_span: (i * 10, i * 10 + 10),
        }
    }

    fn unit(v: [f32; 3]) -> Vec<f32> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }

    fn sample_index() -> VectorIndex {
        VectorIndex::from_parts(
            vec![doc(0), doc(1), doc(2)],
            vec![unit([1.0, 0.0, 0.0]), unit([0.0, 1.0, 0.0]), unit([1.0, 1.0, 0.0])],
            3,
        )
        .unwrap()
    }

    #[test]
    fn test_flat_search_pads_missing_slots() {
        let mut ann = FlatL2::new(2);
        ann.add(&[0.0, 0.0]).unwrap();
        ann.add(&[3.0, 4.0]).unwrap();

        let neighbors = ann.search(&[0.0, 0.0], 4).unwrap();
        assert_eq!(neighbors.len(), 4);
        assert_eq!(neighbors[0].slot, Some(0));
        assert_eq!(neighbors[1].slot, Some(1));
        assert_eq!(neighbors[1].distance, 25.0);
        assert_eq!(neighbors[2].slot, None);
        assert_eq!(neighbors[3].slot, None);
    }

    #[test]
    fn test_flat_rejects_wrong_dimensions() {
        let mut ann = FlatL2::new(3);
        assert!(matches!(
            ann.add(&[1.0]),
            Err(IndexError::DimensionMismatch { expected: 3, got: 1 })
        ));
        assert!(ann.search(&[1.0, 2.0], 1).is_err());
    }

    #[test]
    fn test_search_orders_by_distance_and_caps_k() {
        let index = sample_index();
        let results = index.search_vector(&unit([1.0, 0.1, 0.0]), 2).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].document.chunk_index, 0);
        assert_eq!(results[1].document.chunk_index, 2);
        assert!(results[0].distance <= results[1].distance);
    }

    #[test]
    fn test_search_filters_empty_slots() {
        let index = sample_index();
        let results = index.search_vector(&unit([0.0, 1.0, 0.0]), 10).unwrap();
        assert_eq!(results.len(), 3);
        for pair in results.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn test_similarity_of_unit_vectors() {
        let index = sample_index();
        let results = index.search_vector(&unit([1.0, 0.0, 0.0]), 3).unwrap();

        // identical vector
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
        // orthogonal vector: squared distance 2
        let orthogonal = results.iter().find(|r| r.document.chunk_index == 1).unwrap();
        assert!((orthogonal.distance - 2.0).abs() < 1e-6);
        assert!(orthogonal.similarity.abs() < 1e-6);
    }

    #[test]
    fn test_from_parts_count_mismatch() {
        let result = VectorIndex::from_parts(vec![doc(0), doc(1)], vec![vec![1.0, 0.0]], 2);
        assert!(matches!(
            result,
            Err(IndexError::CountMismatch { expected: 2, got: 1 })
        ));
    }
}
