//! OpenAI-compatible `/v1/embeddings` provider.

use async_trait::async_trait;
use serde::Deserialize;

use super::{Embedder, check_vectors};
use crate::kg::error::Result;

#[derive(Clone)]
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

impl std::fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

/// Endpoint URL for a base URL with or without a `/v1` suffix.
fn embeddings_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/embeddings")
    } else {
        format!("{base}/v1/embeddings")
    }
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        dimensions: usize,
    ) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            url: embeddings_url(&base_url),
            api_key,
            model,
            dimensions,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: Vec<String>, dimensions: usize) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let expected = texts.len();

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": dimensions,
        });
        let mut rb = self.http.post(&self.url).json(&body);
        if let Some(k) = &self.api_key {
            rb = rb.bearer_auth(k);
        }

        let resp = crate::llm::check_status(rb.send().await?).await?;
        let mut parsed: EmbeddingResponse = resp.json().await?;
        parsed.data.sort_by_key(|item| item.index);

        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|item| item.embedding).collect();
        check_vectors(&vectors, expected, dimensions)?;
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
