//! Per-request orchestration: guard, classify, retrieve, assemble, generate, relay

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::classifier::QueryClassifier;
use crate::config::{DeliveryMode, PipelineConfig};
use crate::error::PipelineError;
use crate::generation::{GenerationDispatcher, GenerationMode};
use crate::generators::{blocks_text, BackendResponse, GenerationBackend};
use crate::prompt::PromptAssembler;
use crate::reframer::{relay_stream, relay_text, StreamReframer};
use crate::retriever::ContextRetriever;
use crate::safety::SafetyGuard;
use crate::types::{
    ChatAnswer, ChatMessage, ChatRequest, ComplexityTier, ContextBlock, StreamFrame,
};
use crate::vector_search::{Embedder, VectorSearch};

/// Everything decided before the backend is called
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub tier: ComplexityTier,
    pub context: ContextBlock,
    /// `None` when the insufficient-context policy short-circuits generation
    pub messages: Option<Vec<ChatMessage>>,
}

/// Stateless across requests; share as `Arc<RequestPipeline>`
pub struct RequestPipeline {
    config: Arc<PipelineConfig>,
    guard: SafetyGuard,
    classifier: QueryClassifier,
    retriever: ContextRetriever,
    assembler: PromptAssembler,
    dispatcher: GenerationDispatcher,
}

pub type SharedPipeline = Arc<RequestPipeline>;

impl RequestPipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        search: Box<dyn VectorSearch>,
        backend: Box<dyn GenerationBackend>,
    ) -> Self {
        Self {
            guard: SafetyGuard::new(config.injection_patterns.clone(), config.max_query_chars),
            classifier: QueryClassifier::new(config.complex_patterns.clone()),
            retriever: ContextRetriever::new(search, &config),
            assembler: PromptAssembler::new(&config),
            dispatcher: GenerationDispatcher::new(backend, &config),
            config,
        }
    }

    pub fn with_embedder(mut self, embedder: Box<dyn Embedder>) -> Self {
        self.retriever = self.retriever.with_embedder(embedder);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Delivery mode for a request: its own flag, else the configured default
    pub fn delivery_for(&self, req: &ChatRequest) -> DeliveryMode {
        match req.stream {
            Some(true) => DeliveryMode::Stream,
            Some(false) => DeliveryMode::Json,
            None => self.config.delivery,
        }
    }

    /// Run every stage up to, but not including, generation
    pub async fn prepare(&self, req: &ChatRequest) -> Result<PreparedRequest, PipelineError> {
        let query = self.guard.check(&req.query)?;
        let tier = self.classifier.classify(&query);
        info!(
            "Query accepted: {} chars, {} history turns, tier={:?}",
            query.as_str().chars().count(),
            req.history.len(),
            tier
        );

        let chunks = self.retriever.retrieve(&query).await;
        let context = self.retriever.build_context(&chunks);

        let messages = if context.is_sufficient(self.config.min_context_chars) {
            Some(self.assembler.assemble(&context, &req.history, &query))
        } else {
            warn!(
                "Context of {} chars below minimum {:?}; skipping generation",
                context.text.chars().count(),
                self.config.min_context_chars
            );
            None
        };

        Ok(PreparedRequest { tier, context, messages })
    }

    /// Streaming delivery. Errors returned here happen before any frame is
    /// produced; failures after that arrive as an `error` frame.
    pub async fn stream(&self, req: &ChatRequest) -> Result<mpsc::Receiver<StreamFrame>, PipelineError> {
        let prepared = self.prepare(req).await?;
        let (tx, rx) = mpsc::channel(self.config.frame_queue_depth);
        let delay = Duration::from_millis(self.config.synthetic_delay_ms);
        let unit_chars = self.config.synthetic_chunk_chars;

        let Some(messages) = prepared.messages else {
            let reply = self.config.insufficient_context_reply.clone();
            let reframer = StreamReframer::new(Vec::new(), unit_chars);
            tokio::spawn(async move { relay_text(&reply, reframer, tx, delay).await });
            return Ok(rx);
        };

        let response = self
            .dispatcher
            .generate(prepared.tier, messages, GenerationMode::Stream)
            .await?;
        let reframer = StreamReframer::new(prepared.context.sources, unit_chars);

        match response {
            BackendResponse::Complete(text) => {
                tokio::spawn(async move { relay_text(&text, reframer, tx, delay).await });
            }
            BackendResponse::Blocks(blocks) => {
                let text = blocks_text(&blocks);
                tokio::spawn(async move { relay_text(&text, reframer, tx, delay).await });
            }
            BackendResponse::Stream(stream) => {
                let idle = self.config.stream_idle_timeout;
                tokio::spawn(relay_stream(stream, reframer, tx, idle));
            }
        }
        Ok(rx)
    }

    /// Non-streaming delivery: the whole answer as one value
    pub async fn answer(&self, req: &ChatRequest) -> Result<ChatAnswer, PipelineError> {
        let prepared = self.prepare(req).await?;
        let Some(messages) = prepared.messages else {
            return Ok(ChatAnswer {
                answer: self.config.insufficient_context_reply.clone(),
                sources: Vec::new(),
            });
        };

        let response = self
            .dispatcher
            .generate(prepared.tier, messages, GenerationMode::Complete)
            .await?;
        let answer = match response {
            BackendResponse::Complete(text) => text,
            BackendResponse::Blocks(blocks) => blocks_text(&blocks),
            BackendResponse::Stream(stream) => self.collect_stream(stream).await?,
        };

        Ok(ChatAnswer {
            answer,
            sources: prepared.context.sources,
        })
    }

    async fn collect_stream(
        &self,
        stream: crate::generators::ByteStream,
    ) -> Result<String, PipelineError> {
        let (tx, mut rx) = mpsc::channel(self.config.frame_queue_depth);
        let reframer = StreamReframer::new(Vec::new(), usize::MAX);
        tokio::spawn(relay_stream(stream, reframer, tx, self.config.stream_idle_timeout));

        let mut answer = String::new();
        while let Some(frame) = rx.recv().await {
            match frame {
                StreamFrame::Token(token) => answer.push_str(&token),
                StreamFrame::Error(message) => return Err(PipelineError::GenerationFailed(message)),
                StreamFrame::Done { .. } | StreamFrame::Sentinel => {}
            }
        }
        Ok(answer)
    }
}
