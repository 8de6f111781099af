//! Embedding providers for graph entities.

pub mod fastembed;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::kg::error::{KgError, Result};

pub use self::fastembed::FastEmbedder;
pub use self::openai::OpenAiEmbedder;

/// Turns a batch of texts into vectors of a fixed dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `texts`, returning one vector of `dimensions` floats per text,
    /// in input order.
    async fn embed(&self, texts: Vec<String>, dimensions: usize) -> Result<Vec<Vec<f32>>>;

    /// Dimension this embedder was configured for.
    fn dimensions(&self) -> usize;
}

/// Build the configured provider.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "fastembed" => Ok(Arc::new(FastEmbedder::new(&config.model, config.dimensions)?)),
        "openai" => {
            let base_url = config.base_url.clone().ok_or_else(|| {
                KgError::Config("embedding.base_url is required for the openai provider".to_string())
            })?;
            Ok(Arc::new(OpenAiEmbedder::new(
                base_url,
                config.api_key.clone(),
                config.model.clone(),
                config.dimensions,
            )?))
        }
        other => Err(KgError::Config(format!("unknown embedding provider: {other}"))),
    }
}

/// Check a provider answer against the request.
pub(crate) fn check_vectors(
    vectors: &[Vec<f32>],
    expected_len: usize,
    dimensions: usize,
) -> Result<()> {
    if vectors.len() != expected_len {
        return Err(KgError::Provider(format!(
            "embedding provider returned {} vectors for {expected_len} inputs",
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimensions) {
        return Err(KgError::Provider(format!(
            "embedding dimension {} does not match configured {dimensions}",
            bad.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_vectors() {
        assert!(check_vectors(&[vec![0.0; 3], vec![1.0; 3]], 2, 3).is_ok());
        assert!(check_vectors(&[vec![0.0; 3]], 2, 3).is_err());
        assert!(check_vectors(&[vec![0.0; 4]], 1, 3).is_err());
    }

    #[test]
    fn test_openai_requires_base_url() {
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 512,
            base_url: None,
            api_key: None,
        };
        assert!(matches!(build_embedder(&config), Err(KgError::Config(_))));
    }
}
