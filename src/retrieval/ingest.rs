//! Source discovery and text extraction.

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::retrieval::chunker::{self, Chunk};
use crate::scrape;

/// Recognized source formats, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Html,
    Pdf,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "html" | "htm" => Some(Self::Html),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }
}

/// Recognized files under a source directory.
#[derive(Debug, Default)]
pub struct SourceScan {
    pub html: Vec<PathBuf>,
    pub pdf: Vec<PathBuf>,
    /// Newest modification time across every recognized file
    pub content_mtime: Option<SystemTime>,
}

impl SourceScan {
    pub fn is_empty(&self) -> bool {
        self.html.is_empty() && self.pdf.is_empty()
    }

    /// HTML wins when both formats are present.
    pub fn preferred(&self) -> Option<(SourceFormat, &[PathBuf])> {
        if !self.html.is_empty() {
            Some((SourceFormat::Html, &self.html))
        } else if !self.pdf.is_empty() {
            Some((SourceFormat::Pdf, &self.pdf))
        } else {
            None
        }
    }
}

/// Walk `root` recursively and collect recognized files, sorted by path.
/// A missing directory scans as empty.
pub fn scan(root: &Path) -> SourceScan {
    let mut scan = SourceScan::default();

    for entry in WalkDir::new(root).follow_links(true).into_iter() {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                log::debug!("skipping unreadable entry under {}: {err}", root.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(format) = SourceFormat::from_path(entry.path()) else {
            continue;
        };

        if let Ok(modified) = entry.metadata().map_err(std::io::Error::from).and_then(|m| m.modified()) {
            scan.content_mtime = Some(match scan.content_mtime {
                Some(current) => current.max(modified),
                None => modified,
            });
        }

        match format {
            SourceFormat::Html => scan.html.push(entry.into_path()),
            SourceFormat::Pdf => scan.pdf.push(entry.into_path()),
        }
    }

    scan.html.sort();
    scan.pdf.sort();
    scan
}

/// Extract and chunk every file of the given format. Files that cannot be
/// read or yield no text are logged and skipped.
pub fn load_chunks(
    root: &Path,
    format: SourceFormat,
    files: &[PathBuf],
    chunk_size: usize,
    overlap: usize,
) -> Vec<Chunk> {
    let per_file: Vec<Vec<Chunk>> = files
        .par_iter()
        .map(|path| {
            let text = match extract_text(path, format) {
                Ok(text) => text,
                Err(err) => {
                    log::error!("failed to extract {}: {err}", path.display());
                    return vec![];
                }
            };

            let source_id = path
                .strip_prefix(root)
                .unwrap_or(path)
                .to_string_lossy()
                .to_string();
            let chunks = chunker::chunk(&source_id, &text, chunk_size, overlap);
            log::info!("ingested {source_id} into {} chunks", chunks.len());
            chunks
        })
        .collect();

    per_file.into_iter().flatten().collect()
}

fn extract_text(path: &Path, format: SourceFormat) -> Result<String, ExtractError> {
    match format {
        SourceFormat::Html => {
            let bytes = std::fs::read(path)?;
            let html = String::from_utf8_lossy(&bytes);
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            Ok(scrape::document_text(&html, &stem))
        }
        SourceFormat::Pdf => extract_pdf(path),
    }
}

#[cfg(feature = "pdf")]
fn extract_pdf(path: &Path) -> Result<String, ExtractError> {
    let bytes = std::fs::read(path)?;
    let text = pdf_extract::extract_text_from_mem(&bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(text.trim().to_string())
}

#[cfg(not(feature = "pdf"))]
fn extract_pdf(_path: &Path) -> Result<String, ExtractError> {
    Err(ExtractError::Pdf(
        "built without the `pdf` feature".to_string(),
    ))
}

#[derive(Debug, thiserror::Error)]
enum ExtractError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),
}
