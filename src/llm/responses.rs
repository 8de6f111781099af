//! OpenAI Responses API driver.
//!
//! Implements [`CompletionModel`] against `/v1/responses`. System turns are
//! sent as `instructions`; the remaining turns become the `input` list.

use super::{CompletionModel, LlmSettings, Message, MessageRole, authorize, check_status};
use crate::kg::error::{KgError, Result};

/// Driver for the OpenAI Responses API.
#[derive(Clone)]
pub struct ResponsesDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ResponsesDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponsesDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ResponsesDriver {
    /// Create a new Responses driver with the given client and settings.
    #[must_use]
    pub fn new(http: reqwest::Client, settings: LlmSettings) -> Self {
        Self { http, settings }
    }
}

#[async_trait::async_trait]
impl CompletionModel for ResponsesDriver {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        let url = self
            .settings
            .provider
            .build_responses_url(&self.settings.base_url);

        let instructions = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let input: Vec<&Message> = messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .collect();

        let mut body = serde_json::json!({
            "model": self.settings.model,
            "stream": false,
            "input": input,
        });
        if !instructions.is_empty() {
            body["instructions"] = serde_json::Value::String(instructions);
        }

        let rb = authorize(self.http.post(&url).json(&body), &self.settings);
        let resp = check_status(rb.send().await?).await?;
        let v: serde_json::Value = resp.json().await?;

        extract_output_text(&v)
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }
}

fn extract_output_text(v: &serde_json::Value) -> Result<String> {
    if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
        return Err(KgError::Provider(err.to_string()));
    }
    if let Some(text) = v.get("output_text").and_then(|x| x.as_str()) {
        return Ok(text.to_string());
    }

    // Walk output[].content[] for output_text parts
    let mut out = String::new();
    for item in v["output"].as_array().into_iter().flatten() {
        for part in item["content"].as_array().into_iter().flatten() {
            if part["type"] == "output_text" {
                if let Some(text) = part["text"].as_str() {
                    out.push_str(text);
                }
            }
        }
    }
    if out.is_empty() && v["output"].as_array().is_none() {
        return Err(KgError::Provider("response carried no output".to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_output_parts() {
        let v = serde_json::json!({
            "output": [
                {"type": "reasoning", "content": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "entity<|#|>A"},
                    {"type": "output_text", "text": "<|#|>person"}
                ]}
            ]
        });
        assert_eq!(extract_output_text(&v).unwrap(), "entity<|#|>A<|#|>person");
    }

    #[test]
    fn test_extract_missing_output() {
        let v = serde_json::json!({"id": "resp_1"});
        assert!(extract_output_text(&v).is_err());
    }
}
