//! Local embeddings via `fastembed`.
//!
//! The ONNX model is loaded on first use and run on the blocking pool; the
//! model is moved into the blocking task and put back afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;
use tracing::info;

use super::{Embedder, check_vectors};
use crate::kg::error::{KgError, Result};

pub struct FastEmbedder {
    model: Arc<Mutex<Option<TextEmbedding>>>,
    kind: EmbeddingModel,
    name: String,
    dimensions: usize,
}

impl std::fmt::Debug for FastEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedder")
            .field("model", &self.name)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

/// Map a Hugging Face model id to the `fastembed` model.
pub fn model_from_name(name: &str) -> Option<EmbeddingModel> {
    let model = match name.to_lowercase().as_str() {
        "baai/bge-small-en-v1.5" | "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "baai/bge-base-en-v1.5" | "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
        "baai/bge-large-en-v1.5" | "bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
        "sentence-transformers/all-minilm-l6-v2" | "all-minilm-l6-v2" => {
            EmbeddingModel::AllMiniLML6V2
        }
        "nomic-ai/nomic-embed-text-v1.5" | "nomic-embed-text-v1.5" => {
            EmbeddingModel::NomicEmbedTextV15
        }
        "intfloat/multilingual-e5-small" | "multilingual-e5-small" => {
            EmbeddingModel::MultilingualE5Small
        }
        _ => return None,
    };
    Some(model)
}

impl FastEmbedder {
    pub fn new(name: &str, dimensions: usize) -> Result<Self> {
        let kind = model_from_name(name)
            .ok_or_else(|| KgError::Config(format!("unsupported fastembed model: {name}")))?;
        Ok(Self {
            model: Arc::new(Mutex::new(None)),
            kind,
            name: name.to_string(),
            dimensions,
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, texts: Vec<String>, dimensions: usize) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let expected = texts.len();

        let mut model_guard = self.model.lock().await;
        let mut owned_model = match model_guard.take() {
            Some(model) => model,
            None => {
                info!(model = %self.name, "Initializing fastembed model");
                let mut options = InitOptions::new(self.kind.clone());
                options.show_download_progress = false;
                tokio::task::spawn_blocking(move || TextEmbedding::try_new(options))
                    .await
                    .map_err(|e| KgError::Provider(format!("embedding task panicked: {e}")))?
                    .map_err(|e| KgError::Provider(format!("fastembed init failed: {e}")))?
            }
        };

        let (embeddings_res, returned_model) = tokio::task::spawn_blocking(move || {
            let res = owned_model.embed(texts, None);
            (res, owned_model)
        })
        .await
        .map_err(|e| KgError::Provider(format!("embedding task panicked: {e}")))?;

        *model_guard = Some(returned_model);
        let vectors = embeddings_res.map_err(|e| KgError::Provider(e.to_string()))?;
        check_vectors(&vectors, expected, dimensions)?;
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_names() {
        assert_eq!(
            model_from_name("BAAI/bge-small-en-v1.5"),
            Some(EmbeddingModel::BGESmallENV15)
        );
        assert_eq!(
            model_from_name("all-MiniLM-L6-v2"),
            Some(EmbeddingModel::AllMiniLML6V2)
        );
        assert_eq!(model_from_name("unknown/model"), None);
    }

    #[test]
    fn test_unknown_model_is_config_error() {
        assert!(matches!(
            FastEmbedder::new("nope", 384),
            Err(KgError::Config(_))
        ));
    }
}
