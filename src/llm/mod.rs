//! Language-model drivers.
//!
//! Protocol-agnostic access to OpenAI-compatible completion endpoints. The
//! extraction pipeline needs whole answers rather than token streams, so the
//! drivers here return the full assistant text of one turn.
//!
//! # Drivers
//!
//! - [`ChatCompletionsDriver`]: `OpenAI` Chat Completions API (`/v1/chat/completions`)
//! - [`ResponsesDriver`]: `OpenAI` Responses API (`/v1/responses`)
//!
//! # Example
//!
//! ```rust,ignore
//! use kg_builder::llm::{build_model, LlmSettings, LlmProtocol, Message, Provider};
//!
//! let settings = LlmSettings {
//!     base_url: "https://api.openai.com".to_string(),
//!     api_key: Some("sk-...".to_string()),
//!     model: "gpt-4o-mini".to_string(),
//!     protocol: LlmProtocol::Chat,
//!     provider: Provider::OpenAI,
//! };
//! let model = build_model(settings, std::time::Duration::from_secs(120))?;
//! let answer = model.complete(&[Message::user("hello")]).await?;
//! ```

pub mod chat_completions;
pub mod provider;
pub mod responses;

pub use chat_completions::ChatCompletionsDriver;
pub use provider::Provider;
pub use responses::ResponsesDriver;

use std::sync::Arc;
use std::time::Duration;

use crate::kg::error::{KgError, Result};

/// LLM connection and model settings.
#[derive(Clone)]
pub struct LlmSettings {
    /// Base URL for the LLM API (e.g., `https://api.openai.com`).
    pub base_url: String,
    /// Optional API key for authentication.
    pub api_key: Option<String>,
    /// Model identifier (e.g., `gpt-4o-mini`).
    pub model: String,
    /// Protocol to use for communication.
    pub protocol: LlmProtocol,
    /// Provider type (auto-detected from `base_url` if not specified).
    pub provider: Provider,
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("protocol", &self.protocol)
            .field("provider", &self.provider)
            .finish()
    }
}

/// LLM protocol variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LlmProtocol {
    /// Automatically detect protocol based on the provider.
    #[default]
    Auto,
    /// `OpenAI` Responses API (`/v1/responses`).
    Responses,
    /// `OpenAI` Chat Completions API (`/v1/chat/completions`).
    Chat,
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A chat-style completion model.
///
/// Implementations send the whole conversation and return the assistant's
/// answer for the final turn.
#[async_trait::async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String>;

    /// Model identifier, for logging.
    fn model_name(&self) -> &str;
}

/// Build the driver matching the configured protocol.
///
/// `Auto` picks Chat Completions, which every OpenAI-compatible provider
/// implements.
pub fn build_model(settings: LlmSettings, timeout: Duration) -> Result<Arc<dyn CompletionModel>> {
    let http = reqwest::Client::builder().timeout(timeout).build()?;
    let model: Arc<dyn CompletionModel> = match settings.protocol {
        LlmProtocol::Responses => Arc::new(ResponsesDriver::new(http, settings)),
        LlmProtocol::Chat | LlmProtocol::Auto => {
            Arc::new(ChatCompletionsDriver::new(http, settings))
        }
    };
    Ok(model)
}

/// Attach provider-specific authentication to a request.
pub(crate) fn authorize(
    rb: reqwest::RequestBuilder,
    settings: &LlmSettings,
) -> reqwest::RequestBuilder {
    match (&settings.api_key, &settings.provider) {
        (Some(k), Provider::AzureOpenAI { .. }) => rb.header("api-key", k),
        (Some(k), _) => rb.bearer_auth(k),
        (None, _) => rb,
    }
}

/// Turn a non-success HTTP answer into a provider error carrying the body.
pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(500).collect();
    Err(KgError::Provider(format!("HTTP {status}: {snippet}")))
}
