//! lexrelay HTTP server binary

use lexrelay::{
    ChunkMetadata, GenerationBackend, HttpEmbedder, HttpGenerationBackend, HttpVectorSearch,
    MockBehavior, MockGenerationBackend, MockVectorSearch, PipelineConfig, RequestPipeline,
    VectorChunk, VectorSearch,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    info!("lexrelay {}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(PipelineConfig::from_env()?);

    // Check for --use-real flag
    let use_real = std::env::args().any(|arg| arg == "--use-real");

    let pipeline = if use_real {
        let vector_url = std::env::var("VECTOR_SERVICE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8083".to_string());
        let llm_url = std::env::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let llm_key = std::env::var("LLM_API_KEY").ok();
        if llm_key.is_none() {
            warn!("LLM_API_KEY not set; generation calls will be unauthenticated");
        }

        info!("Mode: REAL collaborators");
        info!("Vector index: {}", vector_url);
        info!("Generation backend: {}", llm_url);

        let search: Box<dyn VectorSearch> = Box::new(HttpVectorSearch::new(
            vector_url,
            std::env::var("VECTOR_API_KEY").ok(),
            std::env::var("VECTOR_NAMESPACE").ok(),
        ));
        let backend: Box<dyn GenerationBackend> =
            Box::new(HttpGenerationBackend::new(llm_url.clone(), llm_key.clone())?);
        let pipeline = RequestPipeline::new(Arc::clone(&config), search, backend);

        match std::env::var("EMBEDDING_MODEL") {
            Ok(model) => {
                info!("Query embedding enabled: {}", model);
                pipeline.with_embedder(Box::new(HttpEmbedder::new(llm_url, llm_key, model)))
            }
            Err(_) => pipeline,
        }
    } else {
        info!("Mode: MOCK collaborators (use --use-real for HTTP backends)");
        RequestPipeline::new(
            Arc::clone(&config),
            Box::new(MockVectorSearch::new(create_mock_chunks())),
            Box::new(MockGenerationBackend::new(MockBehavior::Stream(create_mock_stream()))),
        )
    };

    lexrelay::server::run_server(Arc::new(pipeline)).await?;

    Ok(())
}

/// Reference chunks served by the mock index
fn create_mock_chunks() -> Vec<VectorChunk> {
    let chunk = |id: &str, score: f32, source: &str, text: &str| VectorChunk {
        id: id.to_string(),
        score: Some(score),
        metadata: ChunkMetadata {
            source: source.to_string(),
            text_snippet: None,
            text: Some(text.to_string()),
        },
    };

    vec![
        chunk(
            "gst-annual-1",
            0.92,
            "CGST Act 2017, Section 44",
            "Every registered person, other than an input service distributor, a person paying \
             tax under section 51 or section 52, a casual taxable person and a non-resident \
             taxable person, shall furnish an annual return for every financial year on or \
             before the thirty-first day of December following the end of such financial year.",
        ),
        chunk(
            "gst-annual-2",
            0.86,
            "CGST Rules 2017, Rule 80",
            "Every registered person whose aggregate turnover during a financial year exceeds \
             five crore rupees shall also furnish a self-certified reconciliation statement in \
             FORM GSTR-9C along with the annual return.",
        ),
        chunk(
            "late-fee",
            0.61,
            "CGST Act 2017, Section 47",
            "Late fee for delayed filing of the annual return is one hundred rupees per day.",
        ),
    ]
}

/// Canned OpenAI-style SSE body, split at awkward offsets
fn create_mock_stream() -> Vec<Vec<u8>> {
    let mut body = String::new();
    for delta in [
        "The annual return in FORM GSTR-9 ",
        "is due on or before 31 December ",
        "following the end of the financial year (Section 44).",
    ] {
        let event = serde_json::json!({ "choices": [{ "delta": { "content": delta } }] });
        body.push_str(&format!("data: {}\n\n", event));
    }
    body.push_str("data: [DONE]\n\n");

    body.into_bytes().chunks(37).map(|c| c.to_vec()).collect()
}
