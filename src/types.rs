//! Core type definitions for the question-answering pipeline

use serde::{Deserialize, Serialize};

/// Trimmed, non-empty user query. Construct through `SafetyGuard::check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query(String);

impl Query {
    pub(crate) fn new_unchecked(text: String) -> Self {
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of the conversation sent to generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Scored chunk returned by the vector-search collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorChunk {
    pub id: String,
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub text_snippet: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl VectorChunk {
    /// Chunk text, preferring `text_snippet` over `text`
    pub fn text(&self) -> &str {
        self.metadata
            .text_snippet
            .as_deref()
            .or(self.metadata.text.as_deref())
            .unwrap_or("")
    }
}

/// Source attribution carried by the final `done` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source: String,
    pub snippet: String,
}

/// Deduplicated context text plus the sources it was built from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextBlock {
    pub text: String,
    pub sources: Vec<SourceRef>,
}

impl ContextBlock {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Below `min_chars` the context is considered insufficient
    pub fn is_sufficient(&self, min_chars: Option<usize>) -> bool {
        match min_chars {
            Some(min) => self.text.chars().count() >= min,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Simple,
    Complex,
}

/// Canonical outbound unit of the client event protocol.
///
/// A well-formed stream is zero or more `Token` frames, an optional
/// `Error`, exactly one `Done`, then exactly one `Sentinel`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Token(String),
    Error(String),
    Done { sources: Vec<SourceRef> },
    Sentinel,
}

pub const SENTINEL: &str = "[DONE]";

impl StreamFrame {
    /// Payload placed after `data: ` on the wire
    pub fn to_data(&self) -> String {
        match self {
            StreamFrame::Token(token) => serde_json::json!({ "token": token }).to_string(),
            StreamFrame::Error(message) => serde_json::json!({ "error": message }).to_string(),
            StreamFrame::Done { sources } => {
                serde_json::json!({ "done": true, "sources": sources }).to_string()
            }
            StreamFrame::Sentinel => SENTINEL.to_string(),
        }
    }
}

/// Inbound chat request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    /// Overrides the configured delivery mode for this request
    #[serde(default)]
    pub stream: Option<bool>,
}

/// Non-streaming response body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatAnswer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
}

/// Query representation handed to the vector-search collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    Text(String),
    Embedding(Vec<f32>),
}

/// One block of a structured multi-block completion
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}
