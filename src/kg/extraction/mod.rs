//! Language-model extraction for one chunk.
//!
//! The [`Extractor`] runs the initial system + user exchange and then up to
//! `max_gleaning` continuation turns asking for missed records. The raw text
//! of all turns is returned as one document ending in a single completion
//! marker; parsing happens later, in the graph build stage.

pub mod parser;
pub mod prompt;

use std::sync::Arc;

use tracing::{debug, warn};

use self::parser::{COMPLETION_MARKER, has_records};
use self::prompt::PromptBuilder;
use crate::config::ExtractionConfig;
use crate::kg::error::{KgError, Result};
use crate::llm::{CompletionModel, Message};

/// Drives the extraction conversation for a chunk.
#[derive(Clone)]
pub struct Extractor {
    model: Arc<dyn CompletionModel>,
    prompts: PromptBuilder,
    max_gleaning: usize,
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("model", &self.model.model_name())
            .field("max_gleaning", &self.max_gleaning)
            .finish()
    }
}

impl Extractor {
    pub fn new(model: Arc<dyn CompletionModel>, config: ExtractionConfig) -> Self {
        let max_gleaning = config.max_gleaning;
        Self {
            model,
            prompts: PromptBuilder::new(config),
            max_gleaning,
        }
    }

    /// Extract records from `chunk_text`, returning the raw answer text.
    ///
    /// An empty first answer, or one with neither records nor a completion
    /// marker, is a provider error.
    pub async fn extract(&self, chunk_text: &str) -> Result<String> {
        let mut messages = self.prompts.initial_messages(chunk_text);

        let first = self.model.complete(&messages).await?;
        if first.trim().is_empty() {
            return Err(KgError::Provider("empty extraction output".to_string()));
        }
        if !has_records(&first) {
            return Err(KgError::Provider(format!(
                "malformed extraction output: {}",
                first.chars().take(200).collect::<String>()
            )));
        }

        let mut completed = first.contains(COMPLETION_MARKER);
        let mut raw = strip_marker(&first);
        messages.push(Message::assistant(first));

        for round in 1..=self.max_gleaning {
            messages.push(Message::user(self.prompts.continuation()));
            let more = match self.model.complete(&messages).await {
                Ok(more) => more,
                Err(err) => {
                    warn!(round, error = %err, "Gleaning turn failed, keeping earlier output");
                    break;
                }
            };

            completed |= more.contains(COMPLETION_MARKER);
            let addition = strip_marker(&more);
            if addition.trim().is_empty() || !has_records(&addition) {
                debug!(round, "Gleaning found nothing new");
                break;
            }
            raw.push('\n');
            raw.push_str(addition.trim());
            messages.push(Message::assistant(more));
        }

        if completed {
            raw.push('\n');
            raw.push_str(COMPLETION_MARKER);
        }
        Ok(raw)
    }
}

/// The answer text up to its completion marker.
fn strip_marker(text: &str) -> String {
    match text.find(COMPLETION_MARKER) {
        Some(pos) => text[..pos].trim_end().to_string(),
        None => text.trim_end().to_string(),
    }
}
