//! Immutable pipeline configuration, built once at startup

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use std::str::FromStr;
use std::time::Duration;

use crate::types::ComplexityTier;

/// Instruction-override phrasings rejected by the safety guard
pub const DEFAULT_INJECTION_PATTERNS: &[&str] = &[
    r"ignore\s+(all\s+|any\s+|the\s+|previous\s+|prior\s+)*(system|instructions|rules)",
    r"disregard\s+(all\s+|any\s+|the\s+|previous\s+|prior\s+)*(instructions|rules|system)",
    r"bypass",
    r"\bact\s+as\s+(an?\s+)?\w+",
    r"pretend\s+(to\s+be|you\s+are)",
    r"you\s+are\s+now\s+",
    r"jailbreak",
    r"reveal\s+(your\s+|the\s+)?system\s+prompt",
];

/// Phrases that route a query to the higher-capability model
pub const DEFAULT_COMPLEX_PATTERNS: &[&str] = &[
    r"\bappeal",
    r"\baudit",
    r"\bcomput",
    r"\bcalculat",
    r"cross[\s-]?border",
    r"international\s+tax",
    r"transfer\s+pricing",
    r"\blitigation",
    r"show\s?cause\s+notice",
    r"\breconcil",
];

pub const DEFAULT_SYSTEM_TEMPLATE: &str = "You are a careful assistant for tax, accounting and \
compliance professionals. Answer only from the reference context below. If the context does not \
contain the answer, say that the available context is insufficient instead of guessing. Cite the \
relevant section or notification where the context provides one.";

pub const DEFAULT_EMPTY_CONTEXT_MARKER: &str = "[NO REFERENCE CONTEXT AVAILABLE]";

pub const DEFAULT_INSUFFICIENT_CONTEXT_REPLY: &str = "I could not find enough reference material \
to answer this reliably. Please rephrase the question or add more detail.";

/// How the answer is delivered when the request does not say
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Stream,
    Json,
}

impl FromStr for DeliveryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stream" | "sse" => Ok(DeliveryMode::Stream),
            "json" => Ok(DeliveryMode::Json),
            other => anyhow::bail!("unknown delivery mode '{}'", other),
        }
    }
}

/// Static tier -> model lookup
#[derive(Debug, Clone)]
pub struct ModelTable {
    pub simple: String,
    pub complex: String,
}

impl ModelTable {
    pub fn model_for(&self, tier: ComplexityTier) -> &str {
        match tier {
            ComplexityTier::Simple => &self.simple,
            ComplexityTier::Complex => &self.complex,
        }
    }
}

impl Default for ModelTable {
    fn default() -> Self {
        Self {
            simple: "gpt-4o-mini".to_string(),
            complex: "gpt-4o".to_string(),
        }
    }
}

/// Process-wide settings; shared read-only as `Arc<PipelineConfig>`
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chat_path: String,
    pub port: u16,

    // Retrieval
    pub top_k: usize,
    pub relevance_floor: f32,
    pub context_separator: String,
    pub min_context_chars: Option<usize>,
    pub insufficient_context_reply: String,
    pub snippet_chars: usize,

    // Prompt
    pub system_template: String,
    pub empty_context_marker: String,
    pub history_cap: usize,
    pub max_query_chars: usize,

    // Generation
    pub models: ModelTable,
    pub max_tokens: u32,
    pub temperature: f32,

    // Delivery
    pub delivery: DeliveryMode,
    pub synthetic_chunk_chars: usize,
    pub synthetic_delay_ms: u64,
    pub frame_queue_depth: usize,

    // Timeouts
    pub retrieval_timeout: Duration,
    pub generation_timeout: Duration,
    pub stream_idle_timeout: Duration,

    pub injection_patterns: Vec<Regex>,
    pub complex_patterns: Vec<Regex>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chat_path: "/api/chat".to_string(),
            port: 8081,
            top_k: 5,
            relevance_floor: 0.75,
            context_separator: "\n\n---\n\n".to_string(),
            min_context_chars: None,
            insufficient_context_reply: DEFAULT_INSUFFICIENT_CONTEXT_REPLY.to_string(),
            snippet_chars: 200,
            system_template: DEFAULT_SYSTEM_TEMPLATE.to_string(),
            empty_context_marker: DEFAULT_EMPTY_CONTEXT_MARKER.to_string(),
            history_cap: 6,
            max_query_chars: 2000,
            models: ModelTable::default(),
            max_tokens: 1024,
            temperature: 0.2,
            delivery: DeliveryMode::Stream,
            synthetic_chunk_chars: 1,
            synthetic_delay_ms: 0,
            frame_queue_depth: 64,
            retrieval_timeout: Duration::from_secs(10),
            generation_timeout: Duration::from_secs(60),
            stream_idle_timeout: Duration::from_secs(30),
            injection_patterns: builtin_patterns(DEFAULT_INJECTION_PATTERNS),
            complex_patterns: builtin_patterns(DEFAULT_COMPLEX_PATTERNS),
        }
    }
}

impl PipelineConfig {
    /// Build from environment variables, falling back to defaults.
    ///
    /// Pattern tables (`INJECTION_PATTERNS`, `COMPLEX_PATTERNS`) are
    /// `;`-separated regular expressions, matched case-insensitively.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CHAT_PATH") {
            config.chat_path = if path.starts_with('/') { path } else { format!("/{}", path) };
        }
        config.port = env_parse("PORT", config.port)?;
        config.top_k = env_parse("RETRIEVAL_TOP_K", config.top_k)?;
        config.relevance_floor = env_parse("RELEVANCE_FLOOR", config.relevance_floor)?;
        if let Ok(min) = std::env::var("MIN_CONTEXT_CHARS") {
            config.min_context_chars = Some(
                min.parse()
                    .with_context(|| format!("Invalid MIN_CONTEXT_CHARS '{}'", min))?,
            );
        }
        config.snippet_chars = env_parse("SNIPPET_CHARS", config.snippet_chars)?;
        if let Ok(template) = std::env::var("SYSTEM_TEMPLATE") {
            config.system_template = template;
        }
        config.history_cap = env_parse("HISTORY_CAP", config.history_cap)?;
        config.max_query_chars = env_parse("MAX_QUERY_CHARS", config.max_query_chars)?;
        if let Ok(model) = std::env::var("SIMPLE_MODEL") {
            config.models.simple = model;
        }
        if let Ok(model) = std::env::var("COMPLEX_MODEL") {
            config.models.complex = model;
        }
        config.max_tokens = env_parse("MAX_TOKENS", config.max_tokens)?;
        config.temperature = env_parse("TEMPERATURE", config.temperature)?;
        config.delivery = env_parse("DELIVERY_MODE", config.delivery)?;
        config.synthetic_chunk_chars =
            env_parse("SYNTHETIC_CHUNK_CHARS", config.synthetic_chunk_chars)?.max(1);
        config.synthetic_delay_ms = env_parse("SYNTHETIC_DELAY_MS", config.synthetic_delay_ms)?;
        config.frame_queue_depth = env_parse("FRAME_QUEUE_DEPTH", config.frame_queue_depth)?.max(1);
        config.retrieval_timeout = Duration::from_millis(env_parse(
            "RETRIEVAL_TIMEOUT_MS",
            config.retrieval_timeout.as_millis() as u64,
        )?);
        config.generation_timeout = Duration::from_millis(env_parse(
            "GENERATION_TIMEOUT_MS",
            config.generation_timeout.as_millis() as u64,
        )?);
        config.stream_idle_timeout = Duration::from_millis(env_parse(
            "STREAM_IDLE_TIMEOUT_MS",
            config.stream_idle_timeout.as_millis() as u64,
        )?);

        if let Ok(raw) = std::env::var("INJECTION_PATTERNS") {
            config.injection_patterns = compile_patterns(split_patterns(&raw))
                .context("Invalid INJECTION_PATTERNS")?;
        }
        if let Ok(raw) = std::env::var("COMPLEX_PATTERNS") {
            config.complex_patterns = compile_patterns(split_patterns(&raw))
                .context("Invalid COMPLEX_PATTERNS")?;
        }

        Ok(config)
    }
}

/// Compile a pattern table, case-insensitive
pub fn compile_patterns<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Result<Vec<Regex>> {
    patterns
        .into_iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("Invalid pattern '{}'", p))
        })
        .collect()
}

/// Compile one of the built-in tables above.
///
/// Panics if a built-in pattern is invalid; an empty table would silently
/// disable the guard it feeds.
fn builtin_patterns(patterns: &[&str]) -> Vec<Regex> {
    compile_patterns(patterns.iter().copied()).expect("built-in pattern table must compile")
}

fn split_patterns(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(';').map(str::trim).filter(|p| !p.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}
