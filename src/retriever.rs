//! Best-effort context retrieval: search, relevance floor, dedup, join

use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::types::{ContextBlock, Query, SearchQuery, SourceRef, VectorChunk};
use crate::vector_search::{Embedder, VectorSearch};

pub struct ContextRetriever {
    search: Box<dyn VectorSearch>,
    embedder: Option<Box<dyn Embedder>>,
    top_k: usize,
    relevance_floor: f32,
    timeout: Duration,
    separator: String,
    snippet_chars: usize,
}

impl ContextRetriever {
    pub fn new(search: Box<dyn VectorSearch>, config: &PipelineConfig) -> Self {
        Self {
            search,
            embedder: None,
            top_k: config.top_k,
            relevance_floor: config.relevance_floor,
            timeout: config.retrieval_timeout,
            separator: config.context_separator.clone(),
            snippet_chars: config.snippet_chars,
        }
    }

    /// Query the index with an embedding instead of raw text
    pub fn with_embedder(mut self, embedder: Box<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Retrieve relevant chunks, in collaborator order.
    ///
    /// Never fails: any collaborator error or timeout yields an empty list.
    pub async fn retrieve(&self, query: &Query) -> Vec<VectorChunk> {
        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.search_once(query)).await;

        let chunks = match result {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(e)) => {
                warn!("Retrieval via {} failed, continuing without context: {:#}", self.search.name(), e);
                return Vec::new();
            }
            Err(_) => {
                warn!(
                    "Retrieval via {} timed out after {}ms, continuing without context",
                    self.search.name(),
                    self.timeout.as_millis()
                );
                return Vec::new();
            }
        };

        let total = chunks.len();
        let kept = filter_relevant(chunks, self.relevance_floor);
        info!(
            "Retrieval: kept {} of {} chunks (floor {:.2}) in {}ms",
            kept.len(),
            total,
            self.relevance_floor,
            start.elapsed().as_millis()
        );
        kept
    }

    async fn search_once(&self, query: &Query) -> anyhow::Result<Vec<VectorChunk>> {
        let search_query = match self.embedder {
            Some(ref embedder) => SearchQuery::Embedding(embedder.embed(query.as_str()).await?),
            None => SearchQuery::Text(query.as_str().to_string()),
        };
        self.search.search(&search_query, self.top_k).await
    }

    /// Deduplicate and join retained chunks into a context block
    pub fn build_context(&self, chunks: &[VectorChunk]) -> ContextBlock {
        build_context(chunks, &self.separator, self.snippet_chars)
    }
}

/// Drop chunks scored below `floor`; unscored chunks are kept
pub fn filter_relevant(chunks: Vec<VectorChunk>, floor: f32) -> Vec<VectorChunk> {
    chunks
        .into_iter()
        .filter(|c| match c.score {
            Some(score) => score >= floor,
            None => true,
        })
        .collect()
}

/// Collapse chunks with byte-identical text, first occurrence wins
pub fn dedup_chunks(chunks: &[VectorChunk]) -> Vec<VectorChunk> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .filter(|c| seen.insert(c.text().to_string()))
        .cloned()
        .collect()
}

pub fn build_context(chunks: &[VectorChunk], separator: &str, snippet_chars: usize) -> ContextBlock {
    let unique: Vec<VectorChunk> = dedup_chunks(chunks)
        .into_iter()
        .filter(|c| !c.text().is_empty())
        .collect();
    debug!("Context built from {} unique chunks", unique.len());

    let text = unique
        .iter()
        .map(|c| c.text())
        .collect::<Vec<_>>()
        .join(separator);
    let sources = unique
        .iter()
        .map(|c| SourceRef {
            source: c.metadata.source.clone(),
            snippet: truncate_chars(c.text(), snippet_chars),
        })
        .collect();

    ContextBlock { text, sources }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
