//! Vector-search and embedding collaborators

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{SearchQuery, VectorChunk};

/// Top-K nearest-neighbour search over the reference corpus
#[async_trait]
pub trait VectorSearch: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(&self, query: &SearchQuery, top_k: usize) -> Result<Vec<VectorChunk>>;
}

/// Turns query text into an embedding vector
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Request to the vector index
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vector: Option<&'a [f32]>,
    top_k: usize,
    include_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

/// Response from the vector index
#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<VectorChunk>,
}

/// HTTP vector index speaking the `/query` match protocol
pub struct HttpVectorSearch {
    service_url: String,
    api_key: Option<String>,
    namespace: Option<String>,
    client: reqwest::Client,
}

impl HttpVectorSearch {
    pub fn new(service_url: String, api_key: Option<String>, namespace: Option<String>) -> Self {
        Self {
            service_url: service_url.trim_end_matches('/').to_string(),
            api_key,
            namespace,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl VectorSearch for HttpVectorSearch {
    fn name(&self) -> &'static str {
        "http_vector"
    }

    async fn search(&self, query: &SearchQuery, top_k: usize) -> Result<Vec<VectorChunk>> {
        let (text, vector) = match query {
            SearchQuery::Text(text) => (Some(text.as_str()), None),
            SearchQuery::Embedding(vector) => (None, Some(vector.as_slice())),
        };
        let body = QueryRequest {
            query: text,
            vector,
            top_k,
            include_metadata: true,
            namespace: self.namespace.as_deref(),
        };

        let url = format!("{}/query", self.service_url);
        let mut request = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.header("Api-Key", key);
        }
        let response = request
            .send()
            .await
            .context("Failed to call vector index")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Vector index error ({}): {}", status, error_text);
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .context("Failed to parse vector index response")?;

        tracing::debug!("Vector index returned {} matches", parsed.matches.len());
        Ok(parsed.matches)
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Embeddings over an OpenAI-compatible `/embeddings` endpoint
pub struct HttpEmbedder {
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(base_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);
        let mut request = self.client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: text,
        });
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .context("Failed to call embedding service")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding service error ({}): {}", status, error_text);
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .context("Embedding response contained no vectors")
    }
}

/// Mock vector index for testing
pub struct MockVectorSearch {
    chunks: Vec<VectorChunk>,
    delay: Option<Duration>,
}

impl MockVectorSearch {
    pub fn new(chunks: Vec<VectorChunk>) -> Self {
        Self { chunks, delay: None }
    }

    /// Sleep before answering, to exercise retrieval timeouts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl VectorSearch for MockVectorSearch {
    fn name(&self) -> &'static str {
        "mock_vector"
    }

    async fn search(&self, _query: &SearchQuery, top_k: usize) -> Result<Vec<VectorChunk>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.chunks.iter().take(top_k).cloned().collect())
    }
}

/// Vector index that always errors
pub struct FailingVectorSearch;

#[async_trait]
impl VectorSearch for FailingVectorSearch {
    fn name(&self) -> &'static str {
        "failing_vector"
    }

    async fn search(&self, _query: &SearchQuery, _top_k: usize) -> Result<Vec<VectorChunk>> {
        anyhow::bail!("vector index unavailable")
    }
}
