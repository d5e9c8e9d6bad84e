//! Language model capability and an OpenAI-compatible chat client.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{LlmConfig, LlmProvider};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API key environment variable {0} is not set")]
    MissingApiKey(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response shape: {0}")]
    Response(String),
}

/// "Generate text from messages."
pub trait LanguageModel: Send + Sync {
    fn generate(&self, messages: &[Message]) -> Result<String, LlmError>;
}

/// Blocking chat-completions client for OpenAI-compatible and Azure
/// OpenAI endpoints.
pub struct ChatClient {
    client: reqwest::blocking::Client,
    config: LlmConfig,
    api_key: Option<String>,
}

impl ChatClient {
    /// Build a client, reading the API key from `config.api_key_env`.
    /// Azure requires a key; OpenAI-compatible local servers may not.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() && config.provider == LlmProvider::Azure {
            return Err(LlmError::MissingApiKey(config.api_key_env.clone()));
        }
        if api_key.is_none() {
            log::warn!(
                "{} is not set, sending unauthenticated requests",
                config.api_key_env
            );
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
            api_key,
        })
    }

    /// Resolve the chat completions endpoint from the base URL.
    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match self.config.provider {
            LlmProvider::Azure => format!(
                "{base}/openai/deployments/{}/chat/completions?api-version={}",
                self.config.model, self.config.api_version
            ),
            LlmProvider::OpenAi => {
                if base.ends_with("/chat/completions") {
                    base.to_string()
                } else if base.ends_with("/v1") {
                    format!("{base}/chat/completions")
                } else {
                    format!("{base}/v1/chat/completions")
                }
            }
        }
    }
}

impl LanguageModel for ChatClient {
    fn generate(&self, messages: &[Message]) -> Result<String, LlmError> {
        let mut body = serde_json::json!({
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });
        if self.config.provider == LlmProvider::OpenAi {
            body["model"] = serde_json::Value::String(self.config.model.clone());
        }

        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            req = match self.config.provider {
                LlmProvider::Azure => req.header("api-key", key),
                LlmProvider::OpenAi => req.bearer_auth(key),
            };
        }

        log::debug!("llm request with {} messages", messages.len());
        let resp = req.send()?;
        let status = resp.status();
        let text = resp.text()?;
        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            });
        }

        let json: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| LlmError::Response(e.to_string()))?;

        json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| LlmError::Response("missing choices[0].message.content".to_string()))
    }
}
