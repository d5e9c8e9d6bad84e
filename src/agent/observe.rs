//! Lossy page digests for the decision prompt.

use once_cell::sync::Lazy;
use scraper::{Html, Selector};

use crate::scrape::{self, truncate_chars, visible_text};

static HEADINGS: Lazy<Selector> = Lazy::new(|| Selector::parse("h1, h2, h3").unwrap());
static INTERACTIVE: Lazy<Selector> = Lazy::new(|| Selector::parse("a, button").unwrap());
static PARAGRAPHS: Lazy<Selector> = Lazy::new(|| Selector::parse("p, li").unwrap());
static LABELLED: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("h1, h2, h3, h4, li, tr, td, th, label, a, button, span, div").unwrap()
});

const MAX_HREF_CHARS: usize = 120;
const POLICY_LABELS: [&str; 3] = ["policy", "policies", "정책"];
const MAX_POLICY_ITEMS: usize = 10;
const MAX_POLICY_ITEM_CHARS: usize = 120;

/// Summarize a page: title, h1-h3 headings, link/button labels with their
/// targets, then paragraph and list text until the digest outgrows the
/// paragraph budget. The result is cut to `budget` characters.
pub fn observe(html: &str, budget: usize) -> String {
    let document = Html::parse_document(html);
    let mut pieces = Vec::new();

    if let Some(title) = scrape::title(&document) {
        pieces.push(format!("# {title}"));
    }

    for heading in document.select(&HEADINGS) {
        let text = visible_text(heading);
        if !text.is_empty() {
            pieces.push(format!("## {text}"));
        }
    }

    for el in document.select(&INTERACTIVE) {
        let text = visible_text(el);
        if text.is_empty() {
            continue;
        }
        match el.value().attr("href").filter(|h| !h.is_empty()) {
            Some(href) if href.chars().count() > MAX_HREF_CHARS => {
                pieces.push(format!("- {text} {}...", truncate_chars(href, MAX_HREF_CHARS)))
            }
            Some(href) => pieces.push(format!("- {text} {href}")),
            None => pieces.push(format!("- {text}")),
        }
    }

    // paragraphs stop once the digest is most of the way to the budget
    let paragraph_budget = budget * 5 / 6;
    let mut length: usize = pieces.iter().map(|p| p.chars().count() + 1).sum();
    for el in document.select(&PARAGRAPHS) {
        if length > paragraph_budget {
            break;
        }
        let text = visible_text(el);
        if !text.is_empty() {
            length += text.chars().count() + 1;
            pieces.push(text);
        }
    }

    truncate_chars(&pieces.join("\n"), budget).to_string()
}

/// Short labels on the page that mention policies, deduplicated, in
/// document order.
pub fn policy_items(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut items: Vec<String> = Vec::new();

    for el in document.select(&LABELLED) {
        let text = visible_text(el);
        let count = text.chars().count();
        if count == 0 || count > MAX_POLICY_ITEM_CHARS {
            continue;
        }

        let lower = text.to_lowercase();
        if !POLICY_LABELS.iter().any(|label| lower.contains(label)) {
            continue;
        }
        if items.iter().any(|seen| seen == &text) {
            continue;
        }

        items.push(text);
        if items.len() >= MAX_POLICY_ITEMS {
            break;
        }
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;

    const GATEWAY: &str = r#"<html><head><title>Gateway</title></head><body>
        <script>window.secret = true</script>
        <h1>Gateways</h1>
        <nav><a href="/gateway/policies">Policies</a><a href="/gateway/routes">Routes</a>
        <button>Create gateway</button></nav>
        <p>Manage your API gateways.</p>
        <ul><li>Rate limiting policy</li><li>JWT policy</li></ul>
        </body></html>"#;

    #[test]
    fn test_observation_layout() {
        let digest = observe(GATEWAY, 3000);
        assert!(digest.starts_with("# Gateway\n## Gateways"));
        assert!(digest.contains("- Policies /gateway/policies"));
        assert!(digest.contains("- Create gateway"));
        assert!(digest.contains("Manage your API gateways."));
        assert!(!digest.contains("secret"));
    }

    #[test]
    fn test_observation_is_bounded() {
        let body: String = (0..500).map(|i| format!("<p>paragraph number {i} with filler text</p>")).collect();
        let html = format!("<html><body>{body}</body></html>");
        let digest = observe(&html, 3000);
        assert!(digest.chars().count() <= 3000);
        assert!(digest.contains("paragraph number 0 "));
        assert!(!digest.contains("paragraph number 499 "));
    }

    #[test]
    fn test_long_hrefs_are_truncated() {
        let href = format!("/very/{}", "x".repeat(300));
        let html = format!(r#"<html><body><a href="{href}">Deep link</a></body></html>"#);
        let digest = observe(&html, 3000);
        let line = digest.lines().find(|l| l.starts_with("- Deep link")).unwrap();
        assert!(line.ends_with("..."));
        assert!(line.chars().count() < 140);
    }

    #[test]
    fn test_policy_items() {
        let items = policy_items(GATEWAY);
        assert!(items.contains(&"Policies".to_string()));
        assert!(items.contains(&"Rate limiting policy".to_string()));
        assert!(items.contains(&"JWT policy".to_string()));
        assert_eq!(
            items.iter().filter(|i| i.as_str() == "Policies").count(),
            1
        );
    }
}
