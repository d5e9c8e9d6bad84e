//! Structured next-action decisions extracted from free-form model output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*(\{[\s\S]*?\})\s*```").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Goto,
    Click,
    Stop,
    Answer,
}

impl Action {
    /// Unrecognized names map to `Stop`.
    fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "goto" => Self::Goto,
            "click" => Self::Click,
            "answer" => Self::Answer,
            _ => Self::Stop,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Goto => "goto",
            Self::Click => "click",
            Self::Stop => "stop",
            Self::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetBy {
    Url,
    Text,
    Href,
    Id,
}

impl TargetBy {
    fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "url" => Some(Self::Url),
            "text" => Some(Self::Text),
            "href" => Some(Self::Href),
            "id" => Some(Self::Id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<TargetBy>,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub confidence: f32,
}

impl Decision {
    /// The decision every unparseable reply collapses to.
    pub fn parse_fail() -> Self {
        Self {
            action: Action::Stop,
            target: Target::default(),
            reason: "parse_fail".to_string(),
            confidence: 0.0,
        }
    }
}

/// Result of [`parse`]. A failure still carries a usable decision.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionParse {
    Parsed(Decision),
    Failure(Decision),
}

impl DecisionParse {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn into_decision(self) -> Decision {
        match self {
            Self::Parsed(d) | Self::Failure(d) => d,
        }
    }
}

/// Wire shape; lenient about types so that e.g. an unknown action still
/// parses and a missing target is tolerated.
#[derive(Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    target: Option<RawTarget>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawTarget {
    #[serde(default)]
    by: Option<String>,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    url: Option<String>,
}

/// Extract the object text: a fenced block first, otherwise everything
/// from the first `{` to the last `}`.
pub fn extract_object(raw: &str) -> Option<&str> {
    let raw = raw.trim();

    if let Some(inner) = FENCED_JSON.captures(raw).and_then(|c| c.get(1)) {
        return Some(inner.as_str());
    }

    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Parse a decision out of model output. Never fails: anything that does
/// not yield a decision-shaped object becomes [`Decision::parse_fail`].
pub fn parse(raw: &str) -> DecisionParse {
    let Some(object) = extract_object(raw) else {
        return DecisionParse::Failure(Decision::parse_fail());
    };

    let decoded: RawDecision = match serde_json::from_str(object) {
        Ok(d) => d,
        Err(err) => {
            log::debug!("decision parse failed ({err}); raw: {}", raw.chars().take(500).collect::<String>());
            return DecisionParse::Failure(Decision::parse_fail());
        }
    };

    let target = decoded
        .target
        .map(|t| Target {
            by: t.by.as_deref().and_then(TargetBy::from_name),
            value: match t.value {
                Some(serde_json::Value::String(s)) => s,
                Some(serde_json::Value::Null) | None => t.url.unwrap_or_default(),
                Some(other) => other.to_string(),
            },
        })
        .unwrap_or_default();

    let confidence = match decoded.confidence {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0) as f32,
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };

    DecisionParse::Parsed(Decision {
        action: Action::from_name(&decoded.action),
        target,
        reason: decoded.reason.unwrap_or_default(),
        confidence: confidence.clamp(0.0, 1.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_block_with_prose() {
        let raw = "Sure, here: ```json\n{\"action\":\"click\",\"target\":{\"by\":\"text\",\"value\":\"Gateway\"},\"reason\":\"x\",\"confidence\":0.8}\n```";
        let parsed = parse(raw);
        assert!(!parsed.is_failure());
        assert_eq!(
            parsed.into_decision(),
            Decision {
                action: Action::Click,
                target: Target {
                    by: Some(TargetBy::Text),
                    value: "Gateway".to_string(),
                },
                reason: "x".to_string(),
                confidence: 0.8,
            }
        );
    }

    #[test]
    fn test_not_json_at_all() {
        let parsed = parse("not json at all");
        assert!(parsed.is_failure());

        let decision = parsed.into_decision();
        assert_eq!(decision.action, Action::Stop);
        assert_eq!(decision.reason, "parse_fail");
        assert_eq!(decision.confidence, 0.0);
    }

    #[test]
    fn test_bare_object_inside_prose() {
        let raw = r#"I think we should go. {"action":"goto","target":{"by":"url","value":"/gateway/policies"},"reason":"policies live here","confidence":0.6} Good luck!"#;
        let decision = parse(raw).into_decision();
        assert_eq!(decision.action, Action::Goto);
        assert_eq!(decision.target.by, Some(TargetBy::Url));
        assert_eq!(decision.target.value, "/gateway/policies");
    }

    #[test]
    fn test_unfenced_without_tag() {
        let raw = "```\n{\"action\":\"answer\",\"reason\":\"enough\"}\n```";
        let decision = parse(raw).into_decision();
        assert_eq!(decision.action, Action::Answer);
        assert_eq!(decision.target, Target::default());
        assert_eq!(decision.confidence, 0.0);
    }

    #[test]
    fn test_unknown_action_becomes_stop() {
        let parsed = parse(r#"{"action":"scroll","target":{"by":"css","value":"main"}}"#);
        assert!(!parsed.is_failure());
        let decision = parsed.into_decision();
        assert_eq!(decision.action, Action::Stop);
        assert_eq!(decision.target.by, None);
        assert_eq!(decision.target.value, "main");
    }

    #[test]
    fn test_shape_mismatch_is_failure() {
        assert!(parse(r#"{"target":{"by":"text","value":"x"}}"#).is_failure());
        assert!(parse(r#"{"action": 3}"#).is_failure());
        assert!(parse("} backwards {").is_failure());
        assert!(parse("").is_failure());
    }

    #[test]
    fn test_confidence_is_clamped_and_lenient() {
        let d = parse(r#"{"action":"stop","confidence":"0.4"}"#).into_decision();
        assert!((d.confidence - 0.4).abs() < 1e-6);
        let d = parse(r#"{"action":"stop","confidence":7}"#).into_decision();
        assert_eq!(d.confidence, 1.0);
    }

    #[test]
    fn test_serializes_to_wire_schema() {
        let json = serde_json::to_value(Decision::parse_fail()).unwrap();
        assert_eq!(json["action"], "stop");
        assert_eq!(json["reason"], "parse_fail");
        assert_eq!(json["confidence"], 0.0);
    }
}
