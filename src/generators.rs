//! Generation backends: trait, response shapes, HTTP and mock implementations

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::types::{ChatMessage, ContentBlock};

/// Raw backend bytes, chunked however the transport delivered them
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Everything a backend needs for one call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream: bool,
}

/// The shapes a backend may answer with
pub enum BackendResponse {
    /// Single completed text
    Complete(String),
    /// Structured multi-block output
    Blocks(Vec<ContentBlock>),
    /// Incremental framed byte stream
    Stream(ByteStream),
}

impl std::fmt::Debug for BackendResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendResponse::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            BackendResponse::Blocks(blocks) => f.debug_tuple("Blocks").field(blocks).finish(),
            BackendResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Concatenate the text blocks of a multi-block answer, in order
pub fn blocks_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            ContentBlock::Other => None,
        })
        .collect()
}

/// Pluggable text-generation backend
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, request: &GenerationRequest) -> Result<BackendResponse>;
}

/// Non-streaming body from the completions endpoint
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CompletionBody {
    Chat { choices: Vec<CompletionChoice> },
    Blocks { content: Vec<ContentBlock> },
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` backend
pub struct HttpGenerationBackend {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpGenerationBackend {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    fn name(&self) -> &'static str {
        "http_chat"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<BackendResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .context("Failed to call generation backend")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Generation backend error ({}): {}", status, error_text);
        }

        if request.stream {
            let bytes = response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()).map_err(anyhow::Error::from));
            return Ok(BackendResponse::Stream(Box::pin(bytes)));
        }

        let body: CompletionBody = response
            .json()
            .await
            .context("Failed to parse generation response")?;
        match body {
            CompletionBody::Chat { choices } => {
                let text = choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .context("Generation response contained no choices")?;
                Ok(BackendResponse::Complete(text))
            }
            CompletionBody::Blocks { content } => Ok(BackendResponse::Blocks(content)),
        }
    }
}

/// Canned behaviour for `MockGenerationBackend`
#[derive(Debug, Clone)]
pub enum MockBehavior {
    Complete(String),
    Blocks(Vec<String>),
    /// Raw transport chunks, replayed as-is
    Stream(Vec<Vec<u8>>),
    /// Replay chunks, then fail the transport
    StreamThenError(Vec<Vec<u8>>),
    /// Stream that never yields
    Stall,
    Fail(String),
}

/// Mock backend for testing; records every request it receives
pub struct MockGenerationBackend {
    behavior: MockBehavior,
    calls: Arc<AtomicUsize>,
    last_request: Arc<Mutex<Option<GenerationRequest>>>,
}

impl MockGenerationBackend {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared call counter, readable after the backend is boxed
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn request_log(&self) -> Arc<Mutex<Option<GenerationRequest>>> {
        Arc::clone(&self.last_request)
    }
}

#[async_trait]
impl GenerationBackend for MockGenerationBackend {
    fn name(&self) -> &'static str {
        "mock_generation"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<BackendResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(request.clone());
        }

        match &self.behavior {
            MockBehavior::Complete(text) => Ok(BackendResponse::Complete(text.clone())),
            MockBehavior::Blocks(texts) => Ok(BackendResponse::Blocks(
                texts
                    .iter()
                    .map(|t| ContentBlock::Text { text: t.clone() })
                    .collect(),
            )),
            MockBehavior::Stream(chunks) => {
                let items: Vec<Result<Vec<u8>>> = chunks.iter().cloned().map(Ok).collect();
                Ok(BackendResponse::Stream(Box::pin(stream::iter(items))))
            }
            MockBehavior::StreamThenError(chunks) => {
                let mut items: Vec<Result<Vec<u8>>> = chunks.iter().cloned().map(Ok).collect();
                items.push(Err(anyhow::anyhow!("connection reset by backend")));
                Ok(BackendResponse::Stream(Box::pin(stream::iter(items))))
            }
            MockBehavior::Stall => Ok(BackendResponse::Stream(Box::pin(stream::pending::<Result<Vec<u8>>>()))),
            MockBehavior::Fail(message) => anyhow::bail!("{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(stream: bool) -> GenerationRequest {
        GenerationRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            max_tokens: 64,
            temperature: 0.2,
            stream,
        }
    }

    #[test]
    fn test_blocks_text_skips_non_text() {
        let blocks = vec![
            ContentBlock::Text { text: "a".into() },
            ContentBlock::Other,
            ContentBlock::Text { text: "b".into() },
        ];
        assert_eq!(blocks_text(&blocks), "ab");
    }

    #[test]
    fn test_content_block_unknown_type() {
        let blocks: Vec<ContentBlock> = serde_json::from_str(
            r#"[{"type":"text","text":"x"},{"type":"tool_use","id":"t1"}]"#,
        )
        .unwrap();
        assert_eq!(blocks[1], ContentBlock::Other);
    }

    #[tokio::test]
    async fn test_http_complete_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer key"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "stream": false,
                "messages": [{"role": "system", "content": "sys"}, {"role": "user", "content": "hi"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "hello"}}]
            })))
            .mount(&server)
            .await;

        let backend = HttpGenerationBackend::new(server.uri(), Some("key".into())).unwrap();
        match backend.generate(&request(false)).await.unwrap() {
            BackendResponse::Complete(text) => assert_eq!(text, "hello"),
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_blocks_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "part one"}, {"type": "text", "text": " two"}]
            })))
            .mount(&server)
            .await;

        let backend = HttpGenerationBackend::new(server.uri(), None).unwrap();
        match backend.generate(&request(false)).await.unwrap() {
            BackendResponse::Blocks(blocks) => assert_eq!(blocks_text(&blocks), "part one two"),
            other => panic!("expected Blocks, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_stream_response() {
        let server = MockServer::start().await;
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let backend = HttpGenerationBackend::new(server.uri(), None).unwrap();
        let response = backend.generate(&request(true)).await.unwrap();
        let BackendResponse::Stream(mut stream) = response else {
            panic!("expected Stream");
        };
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend(chunk.unwrap());
        }
        assert_eq!(String::from_utf8(collected).unwrap(), body);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let backend = HttpGenerationBackend::new(server.uri(), None).unwrap();
        let err = backend.generate(&request(false)).await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn test_mock_records_calls() {
        let backend = MockGenerationBackend::new(MockBehavior::Complete("ok".into()));
        let calls = backend.call_counter();
        let log = backend.request_log();
        backend.generate(&request(false)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.lock().unwrap().as_ref().unwrap().model, "gpt-4o-mini");
    }
}
