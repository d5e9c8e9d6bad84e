//! Character-window chunking of source text.
//!
//! Windows are measured in characters, not bytes, so multi-byte text
//! never gets split inside a code point.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// A bounded substring of a source document, the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Source path relative to the source directory (e.g. `gateway/rate-limit.html`)
    pub source_id: String,
    /// Position of the chunk within its source
    pub chunk_index: usize,
    pub text: String,
    /// Half-open `[start, end)` window in characters
    pub char_span: (usize, usize),
}

impl Chunk {
    /// Stable display name, `<file stem>_chunk_<n>`.
    pub fn name(&self) -> String {
        let stem = Path::new(&self.source_id)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.source_id.clone());
        format!("{stem}_chunk_{}", self.chunk_index)
    }

    /// `Chunk <n> from <file name>`, without the directories.
    pub fn description(&self) -> String {
        let file_name = Path::new(&self.source_id)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.source_id.clone());
        format!("Chunk {} from {file_name}", self.chunk_index)
    }
}

/// Split `text` into overlapping windows of `chunk_size` characters.
///
/// Each window after the first starts `overlap` characters before the end
/// of the previous one. When that would not move the cursor forward (i.e.
/// `overlap >= chunk_size`) the next window starts at the previous end.
/// Empty or whitespace-only input yields no chunks.
pub fn chunk(source_id: &str, text: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    if chunk_size == 0 || text.trim().is_empty() {
        return vec![];
    }

    // byte offset of every char boundary, including the end of the text
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(idx, _)| idx)
        .chain(std::iter::once(text.len()))
        .collect();
    let len = offsets.len() - 1;

    let mut chunks = Vec::with_capacity(len / chunk_size.saturating_sub(overlap).max(1) + 1);
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(len);
        chunks.push(Chunk {
            source_id: source_id.to_string(),
            chunk_index: chunks.len(),
            text: text[offsets[start]..offsets[end]].to_string(),
            char_span: (start, end),
        });

        if end == len {
            break;
        }

        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Glue chunks back together by dropping the overlapping prefix of each.
    fn reconstruct(chunks: &[Chunk]) -> String {
        let mut out = String::new();
        let mut covered = 0;
        for c in chunks {
            let (start, _) = c.char_span;
            out.extend(c.text.chars().skip(covered - start.min(covered)));
            covered = c.char_span.1;
        }
        out
    }

    #[test]
    fn test_empty_and_whitespace_yield_nothing() {
        assert!(chunk("a.html", "", 100, 10).is_empty());
        assert!(chunk("a.html", "   \n\t  ", 100, 10).is_empty());
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunks = chunk("a.html", "hello world", 2500, 300);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].char_span, (0, 11));
    }

    #[test]
    fn test_windows_overlap_and_reconstruct() {
        let text: String = (0..10_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = chunk("doc.html", &text, 2500, 300);

        for pair in chunks.windows(2) {
            assert_eq!(pair[1].char_span.0, pair[0].char_span.1 - 300);
        }
        assert_eq!(chunks.last().unwrap().char_span.1, 10_000);
        assert_eq!(reconstruct(&chunks), text);

        let expected = (10_000f64 / (2500 - 300) as f64).ceil() as i64;
        assert!((chunks.len() as i64 - expected).abs() <= 1);
    }

    #[test]
    fn test_reconstruct_multibyte_text() {
        let text = "게이트웨이 타임아웃 설정 방법과 rate limit 정책 ".repeat(40);
        let chunks = chunk("ko.html", &text, 97, 13);
        assert_eq!(reconstruct(&chunks), text);
        for c in &chunks {
            assert!(c.text.chars().count() <= 97);
        }
    }

    #[test]
    fn test_overlap_not_smaller_than_size_still_advances() {
        let text = "x".repeat(50);
        let chunks = chunk("a.pdf", &text, 10, 10);
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[1].char_span, (10, 20));

        let chunks = chunk("a.pdf", &text, 10, 25);
        assert_eq!(chunks.len(), 5);
    }

    #[test]
    fn test_deterministic() {
        let text = "Rate limiting policies throttle calls per subscription. ".repeat(100);
        assert_eq!(chunk("a", &text, 500, 50), chunk("a", &text, 500, 50));
    }

    #[test]
    fn test_chunk_names() {
        let chunks = chunk("policies/rate-limit.html", &"y".repeat(30), 10, 0);
        assert_eq!(chunks[2].name(), "rate-limit_chunk_2");
        assert_eq!(
            chunks[2].description(),
            "Chunk 2 from rate-limit.html"
        );
        assert_eq!(chunk("jwt.html", "z", 10, 0)[0].description(), "Chunk 0 from jwt.html");
    }
}
