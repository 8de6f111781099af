//! OpenAI Chat Completions API driver.
//!
//! Implements [`CompletionModel`] against `/v1/chat/completions` (or the
//! provider's equivalent URL) with a single non-streaming request per turn.

use super::{CompletionModel, LlmSettings, Message, authorize, check_status};
use crate::kg::error::{KgError, Result};

/// Driver for the OpenAI Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChatCompletionsDriver {
    /// Create a new Chat Completions driver with the given client and settings.
    #[must_use]
    pub fn new(http: reqwest::Client, settings: LlmSettings) -> Self {
        Self { http, settings }
    }
}

#[async_trait::async_trait]
impl CompletionModel for ChatCompletionsDriver {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        let url = self.settings.provider.build_chat_url(&self.settings.base_url);

        let body = serde_json::json!({
            "model": self.settings.model,
            "stream": false,
            "temperature": 0,
            "messages": messages,
        });

        let rb = authorize(self.http.post(&url).json(&body), &self.settings);
        let resp = check_status(rb.send().await?).await?;
        let v: serde_json::Value = resp.json().await?;

        extract_content(&v)
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }
}

fn extract_content(v: &serde_json::Value) -> Result<String> {
    if let Some(err) = v.get("error") {
        return Err(KgError::Provider(err.to_string()));
    }
    v["choices"][0]["message"]["content"]
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| KgError::Provider("response carried no message content".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_content() {
        let v = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "entity<|#|>Alice"}}]
        });
        assert_eq!(extract_content(&v).unwrap(), "entity<|#|>Alice");
    }

    #[test]
    fn test_extract_content_error_payload() {
        let v = serde_json::json!({"error": {"message": "rate limited"}});
        let err = extract_content(&v).unwrap_err();
        assert!(matches!(err, KgError::Provider(msg) if msg.contains("rate limited")));
    }
}
