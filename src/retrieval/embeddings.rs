//! Text embedding adapter.
//!
//! [`Embedder`] is the uniform "text to fixed-length vector" capability the
//! index is built on. [`FastEmbedder`] implements it with a local fastembed
//! model:
//! - Model files cached under `<base>/models`
//! - Dimensions probed once at startup
//! - Batch embedding for index builds

use fastembed::{InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("cannot load embedding model: {0}")]
    InitFailed(String),

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("unsupported embedding model {0}")]
    InvalidModel(String),
}

/// Maps text to fixed-length vectors.
pub trait Embedder: Send + Sync {
    /// Embed many texts in one call, preserving order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Length of every vector this embedder produces.
    fn dimensions(&self) -> usize;

    /// Name used to tag persisted vectors.
    fn model_name(&self) -> &str;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("empty batch result".to_string()))
    }

    /// SHA256 of the model name, stored in the vectors file header.
    fn model_id_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.model_name().as_bytes());
        hasher.finalize().into()
    }
}

/// Local fastembed model. `TextEmbedding::embed` takes `&mut self`, hence
/// the mutex.
pub struct FastEmbedder {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastEmbedder {
    /// Load `model_name`, downloading it into `cache_dir/models` on first use.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = parse_model_name(model_name)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);
        log::debug!("loading embedding model '{model_name}' (download timeout {timeout:?})");

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir)
            .map_err(|e| EmbeddingError::InitFailed(format!("{}: {e}", models_dir.display())))?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = probe_dimensions(&mut model)?;
        log::info!("embedding model '{model_name}' ready ({dimensions} dims)");

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }
}

impl Embedder for FastEmbedder {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| EmbeddingError::EmbeddingFailed("model lock poisoned".to_string()))?;

        model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Accepted spellings for each supported model.
const MODELS: &[(&[&str], fastembed::EmbeddingModel)] = &[
    (&["all-minilm-l6-v2", "allminiml6v2"], fastembed::EmbeddingModel::AllMiniLML6V2),
    (&["all-minilm-l6-v2-q", "allminiml6v2q"], fastembed::EmbeddingModel::AllMiniLML6V2Q),
    (&["bge-small-en-v1.5", "bgesmallenv15"], fastembed::EmbeddingModel::BGESmallENV15),
    (&["bge-base-en-v1.5", "bgebaseenv15"], fastembed::EmbeddingModel::BGEBaseENV15),
];

fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    let wanted = name.to_lowercase();
    MODELS
        .iter()
        .find(|(aliases, _)| aliases.contains(&wanted.as_str()))
        .map(|(_, model)| model.clone())
        .ok_or_else(|| {
            let known: Vec<&str> = MODELS.iter().map(|(aliases, _)| aliases[0]).collect();
            EmbeddingError::InvalidModel(format!("{name:?} (known: {})", known.join(", ")))
        })
}

fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
    let probe = model
        .embed(vec!["dimension probe"], None)
        .map_err(|e| EmbeddingError::InitFailed(format!("dimension probe: {e}")))?;

    match probe.first() {
        Some(v) if !v.is_empty() => Ok(v.len()),
        _ => Err(EmbeddingError::InitFailed("dimension probe returned nothing".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires model download"]
    fn test_minilm_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let model = FastEmbedder::new("all-MiniLM-L6-v2", dir.path().to_path_buf(), None).unwrap();
        assert_eq!(model.dimensions(), 384);

        let embedding = model.embed("How do I set a rate-limiting policy?").unwrap();
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_invalid_model_name() {
        let dir = tempfile::tempdir().unwrap();
        let result = FastEmbedder::new("nonexistent-model", dir.path().to_path_buf(), None);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_model_names_are_case_insensitive() {
        assert!(parse_model_name("All-MiniLM-L6-v2").is_ok());
        assert!(parse_model_name("BGE-SMALL-EN-V1.5").is_ok());
    }
}
