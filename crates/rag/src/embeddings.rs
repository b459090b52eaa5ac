//! Text embedders.
//!
//! All embedders return unit-normalized vectors so cosine similarity reduces
//! to a dot product in the store. Remote endpoints batch at 100 inputs per
//! request; local-style servers at 32.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::RagError;

/// Embedding client contract.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;

    /// Output dimension; the collection must match.
    fn dim(&self) -> usize;

    /// Preferred sub-batch size when indexing in bulk.
    fn embed_batch_size(&self) -> usize;
}

pub(crate) fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// OpenAI-style `/embeddings` client.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dim: usize,
}

#[derive(Debug, Serialize)]
struct OpenAiEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        dim: usize,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
            dim,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let url = format!("{}/embeddings", self.endpoint.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&OpenAiEmbedRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RagError::Embedding(format!("embedding request failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::Embedding(format!(
                "embedding endpoint returned {status}: {body}"
            )));
        }

        let parsed: OpenAiEmbedResponse = response
            .json()
            .await
            .map_err(|e| RagError::Embedding(format!("invalid embedding response: {e}")))?;

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        let mut out: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();
        for v in &mut out {
            normalize(v);
        }
        Ok(out)
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_batch_size(&self) -> usize {
        100
    }
}

/// Ollama `/api/embed` client.
pub struct OllamaEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dim: usize,
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, dim: usize) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            dim,
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let url = format!("{}/api/embed", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&OllamaEmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| RagError::Embedding(format!("ollama request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::Embedding(format!(
                "ollama embed returned {status}: {body}"
            )));
        }

        let parsed: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| RagError::Embedding(format!("invalid ollama response: {e}")))?;

        let mut out = parsed.embeddings;
        for v in &mut out {
            normalize(v);
        }
        Ok(out)
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_batch_size(&self) -> usize {
        32
    }
}

/// Deterministic hash-based embedder. No model, no network; retrieval
/// quality is nonsense but geometry is stable, which is exactly what tests
/// need.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for (i, c) in text.chars().enumerate() {
            let idx = (c as usize + i) % self.dim;
            v[idx] += 1.0;
        }
        normalize(&mut v);
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_batch_size(&self) -> usize {
        32
    }
}
