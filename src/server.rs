//! HTTP surface: chat endpoint (SSE or JSON), CORS preflight, health

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::config::DeliveryMode;
use crate::error::ErrorResponse;
use crate::pipeline::{RequestPipeline, SharedPipeline};
use crate::types::{ChatRequest, StreamFrame};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

fn with_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

fn sse_response(rx: mpsc::Receiver<StreamFrame>) -> Response {
    let events = ReceiverStream::new(rx)
        .map(|frame| Ok::<_, Infallible>(Event::default().data(frame.to_data())));
    let mut response = Sse::new(events).into_response();
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

/// Chat handler
async fn chat_handler(
    State(pipeline): State<SharedPipeline>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!("Rejected request body: {}", rejection.body_text());
            let response = (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "Invalid request body".to_string(),
                    details: Some(rejection.body_text()),
                }),
            )
                .into_response();
            return with_cors(response);
        }
    };

    let response = match pipeline.delivery_for(&req) {
        DeliveryMode::Stream => match pipeline.stream(&req).await {
            Ok(rx) => sse_response(rx),
            Err(e) => e.into_response(),
        },
        DeliveryMode::Json => match pipeline.answer(&req).await {
            Ok(answer) => {
                info!("Answered {} chars with {} sources", answer.answer.len(), answer.sources.len());
                Json(answer).into_response()
            }
            Err(e) => e.into_response(),
        },
    };
    with_cors(response)
}

/// CORS preflight handler
async fn preflight_handler() -> Response {
    with_cors(StatusCode::NO_CONTENT.into_response())
}

async fn not_found_handler(method: Method) -> Response {
    info!("No route for {} request", method);
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "Not found".to_string(),
            details: None,
        }),
    )
        .into_response()
}

/// Health check handler
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "lexrelay".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Create and configure the HTTP router
pub fn create_router(pipeline: SharedPipeline) -> Router {
    let chat_path = pipeline.config().chat_path.clone();
    Router::new()
        .route("/health", get(health_handler))
        .route(
            &chat_path,
            post(chat_handler)
                .options(preflight_handler)
                .fallback(not_found_handler),
        )
        .fallback(not_found_handler)
        .with_state(pipeline)
}

/// Run the HTTP server
pub async fn run_server(pipeline: Arc<RequestPipeline>) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", pipeline.config().port);
    info!("Starting lexrelay on {} (chat at {})", addr, pipeline.config().chat_path);

    let app = create_router(pipeline);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
