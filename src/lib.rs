//! lexrelay - retrieval-augmented answering with streaming re-framing
//!
//! One inbound question flows through:
//! - Input screening and complexity tiering
//! - Best-effort context retrieval (relevance floor + dedup)
//! - Prompt assembly with bounded history
//! - Tier-routed generation, complete or streamed
//! - Re-framing of backend output into `token* done [DONE]` SSE frames

pub mod types;
pub mod config;
pub mod error;
pub mod safety;
pub mod classifier;
pub mod vector_search;
pub mod retriever;
pub mod prompt;
pub mod generators;
pub mod generation;
pub mod reframer;
pub mod pipeline;
pub mod server;

pub use types::*;
pub use config::{DeliveryMode, ModelTable, PipelineConfig};
pub use error::PipelineError;
pub use generators::{
    BackendResponse, GenerationBackend, GenerationRequest, HttpGenerationBackend, MockBehavior,
    MockGenerationBackend,
};
pub use pipeline::{RequestPipeline, SharedPipeline};
pub use reframer::StreamReframer;
pub use vector_search::{
    Embedder, FailingVectorSearch, HttpEmbedder, HttpVectorSearch, MockVectorSearch, VectorSearch,
};

#[cfg(test)]
mod tests;
