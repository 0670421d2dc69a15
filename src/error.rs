//! Error types that cross the pipeline boundary

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures reported to the client.
///
/// Retrieval failures and framing anomalies are absorbed inside the
/// pipeline and never appear here.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Query was empty after trimming
    #[error("Query is empty")]
    EmptyInput,

    #[error("Query exceeds {max} characters")]
    QueryTooLong { max: usize },

    /// Injection heuristic tripped
    #[error("Query rejected by input policy")]
    InjectionSuspected,

    /// Backend error or timeout; not retried
    #[error("Generation failed: {0}")]
    GenerationFailed(String),
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::EmptyInput | PipelineError::QueryTooLong { .. } => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::InjectionSuspected => StatusCode::FORBIDDEN,
            PipelineError::GenerationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
            ErrorResponse {
                error: "Internal server error".to_string(),
                details: None,
            }
        } else {
            ErrorResponse {
                error: self.to_string(),
                details: None,
            }
        };
        (status, Json(body)).into_response()
    }
}
