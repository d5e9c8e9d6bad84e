//! HTML to text helpers shared by ingestion and page observation.

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

static TITLE_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static CONTENT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h1, h2, h3, h4, p, li, code, pre").unwrap());

const HIDDEN_TAGS: [&str; 3] = ["script", "style", "noscript"];

/// Whitespace-joined text of `el`, skipping anything inside
/// `script`, `style` or `noscript`.
pub fn visible_text(el: ElementRef) -> String {
    let mut parts = Vec::new();

    for node in el.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };

        let hidden = node
            .ancestors()
            .take_while(|ancestor| ancestor.id() != el.id())
            .chain(std::iter::once(*el))
            .filter_map(|ancestor| ancestor.value().as_element())
            .any(|element| HIDDEN_TAGS.contains(&element.name()));
        if hidden {
            continue;
        }

        let trimmed = text.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed);
        }
    }

    parts.join(" ")
}

/// Document title, if present and non-empty.
pub fn title(document: &Html) -> Option<String> {
    document
        .select(&TITLE_SELECTOR)
        .next()
        .map(visible_text)
        .filter(|t| !t.is_empty())
}

/// Rebuild a documentation page as lightweight markdown:
/// `# title`, `## heading` for h1-h4, `- item` for list items and plain
/// paragraphs/code in document order.
pub fn document_text(html: &str, fallback_title: &str) -> String {
    let document = Html::parse_document(html);

    let title = title(&document).unwrap_or_else(|| fallback_title.to_string());
    let mut pieces = vec![format!("# {title}")];

    for node in document.select(&CONTENT_SELECTOR) {
        let text = visible_text(node);
        if text.is_empty() {
            continue;
        }

        match node.value().name() {
            "h1" | "h2" | "h3" | "h4" => pieces.push(format!("\n## {text}\n")),
            "li" => pieces.push(format!("- {text}")),
            _ => pieces.push(text),
        }
    }

    pieces.join("\n")
}

/// Cut `text` to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>Rate limiting</title>
        <style>.x { color: red }</style></head>
        <body>
          <script>var secret = 1;</script>
          <h1>Rate limiting policy</h1>
          <p>Limits calls per <b>subscription</b>.</p>
          <ul><li>Open the Gateway menu</li><li>Select <noscript>nojs</noscript>Policies</li></ul>
          <pre>rate-limit calls=10</pre>
        </body></html>"#;

    #[test]
    fn test_document_text_layout() {
        let text = document_text(PAGE, "fallback");
        assert!(text.starts_with("# Rate limiting\n"));
        assert!(text.contains("\n## Rate limiting policy\n"));
        assert!(text.contains("Limits calls per subscription ."));
        assert!(text.contains("- Open the Gateway menu"));
        assert!(text.contains("- Select Policies"));
        assert!(text.contains("rate-limit calls=10"));
        assert!(!text.contains("secret"));
        assert!(!text.contains("nojs"));
    }

    #[test]
    fn test_document_text_uses_fallback_title() {
        let text = document_text("<html><body><p>body only</p></body></html>", "guide");
        assert!(text.starts_with("# guide"));
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("정책설정", 2), "정책");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
