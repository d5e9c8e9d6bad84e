use serde::Serialize;
use serde_json::{Map, Value};

use crate::agent::react::LoopReport;
use crate::retrieval::SearchResult;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagResult {
    /// Query actually sent to the index
    pub query: String,
    pub results: Vec<SearchResult>,
}

impl RagResult {
    pub fn retrieval_text(&self) -> String {
        self.results
            .iter()
            .map(|r| r.document.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Same rendering as `RetrievalService::snippets`, without searching again.
    pub fn snippets(&self) -> String {
        self.results
            .iter()
            .map(|r| format!("[{}] {}", r.document.name(), r.document.text))
            .collect::<Vec<_>>()
            .join("\n---\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationResult {
    pub selected_portal: String,
    pub portal_url: String,
    pub target_url: String,
    pub login_completed: bool,
    pub reason: String,
}

/// State threaded through one pipeline run.
///
/// `messages` is append-only: stages add to the end and never touch what
/// earlier stages wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryContext {
    pub question: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rag_result: Option<RagResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation_result: Option<NavigationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interactive_result: Option<LoopReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl QueryContext {
    pub fn new(question: impl Into<String>) -> Self {
        let question = question.into();
        Self {
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: question.clone(),
            }],
            question,
            rag_result: None,
            summary: None,
            navigation_result: None,
            interactive_result: None,
            response: None,
        }
    }

    pub fn push(&mut self, role: &str, content: impl Into<String>) {
        self.messages.push(ChatMessage {
            role: role.to_string(),
            content: content.into(),
        });
    }

    /// Whether `self` keeps every message of `before`, in order, as a prefix.
    pub fn extends(&self, before: &QueryContext) -> bool {
        self.messages.len() >= before.messages.len()
            && self.messages[..before.messages.len()] == before.messages[..]
    }

    /// Fields that differ from `before`. `messages` holds only the
    /// appended tail.
    pub fn delta(&self, before: &QueryContext) -> Value {
        let (Ok(Value::Object(now)), Ok(Value::Object(then))) =
            (serde_json::to_value(self), serde_json::to_value(before))
        else {
            return Value::Object(Map::new());
        };

        let mut delta = Map::new();
        for (key, value) in now {
            if key == "messages" {
                let appended = self
                    .messages
                    .get(before.messages.len()..)
                    .unwrap_or_default();
                if !appended.is_empty() {
                    delta.insert(key, serde_json::to_value(appended).unwrap_or_default());
                }
            } else if then.get(&key) != Some(&value) {
                delta.insert(key, value);
            }
        }
        Value::Object(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_starts_with_question() {
        let ctx = QueryContext::new("How do I set a rate-limiting policy?");
        assert_eq!(ctx.messages.len(), 1);
        assert_eq!(ctx.messages[0].role, "user");
        assert!(ctx.response.is_none());
    }

    #[test]
    fn test_delta_contains_changed_fields_only() {
        let before = QueryContext::new("q");
        let mut after = before.clone();
        after.summary = Some("summary".to_string());
        after.push("summary_agent", "summary");

        let delta = after.delta(&before);
        assert_eq!(delta["summary"], "summary");
        assert_eq!(delta["messages"].as_array().unwrap().len(), 1);
        assert_eq!(delta["messages"][0]["role"], "summary_agent");
        assert!(delta.get("question").is_none());
        assert!(delta.get("rag_result").is_none());
    }

    #[test]
    fn test_extends_detects_rewrites() {
        let before = QueryContext::new("q");
        let mut appended = before.clone();
        appended.push("rag_agent", "x");
        assert!(appended.extends(&before));

        let mut rewritten = appended.clone();
        rewritten.messages[0].content = "changed".to_string();
        assert!(!rewritten.extends(&before));

        let mut truncated = before.clone();
        truncated.messages.clear();
        assert!(!truncated.extends(&before));
    }
}
