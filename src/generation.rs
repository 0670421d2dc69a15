//! Tier-based backend selection and invocation

use std::time::Duration;
use tracing::{error, info};

use crate::config::{ModelTable, PipelineConfig};
use crate::error::PipelineError;
use crate::generators::{BackendResponse, GenerationBackend, GenerationRequest};
use crate::types::{ChatMessage, ComplexityTier};

/// Which response shape the caller wants from the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    Complete,
    Stream,
}

pub struct GenerationDispatcher {
    backend: Box<dyn GenerationBackend>,
    models: ModelTable,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl GenerationDispatcher {
    pub fn new(backend: Box<dyn GenerationBackend>, config: &PipelineConfig) -> Self {
        Self {
            backend,
            models: config.models.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout: config.generation_timeout,
        }
    }

    pub fn request_for(
        &self,
        tier: ComplexityTier,
        messages: Vec<ChatMessage>,
        mode: GenerationMode,
    ) -> GenerationRequest {
        GenerationRequest {
            model: self.models.model_for(tier).to_string(),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: mode == GenerationMode::Stream,
        }
    }

    /// Invoke the backend once. Errors and timeouts are not retried.
    ///
    /// For streams the timeout covers only the call that opens the stream;
    /// individual reads are bounded by the reframer driver.
    pub async fn generate(
        &self,
        tier: ComplexityTier,
        messages: Vec<ChatMessage>,
        mode: GenerationMode,
    ) -> Result<BackendResponse, PipelineError> {
        let request = self.request_for(tier, messages, mode);
        info!(
            "Dispatching to {} model={} messages={} stream={}",
            self.backend.name(),
            request.model,
            request.messages.len(),
            request.stream
        );

        match tokio::time::timeout(self.timeout, self.backend.generate(&request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                error!("Generation via {} failed: {:#}", self.backend.name(), e);
                Err(PipelineError::GenerationFailed(e.to_string()))
            }
            Err(_) => {
                error!(
                    "Generation via {} timed out after {}ms",
                    self.backend.name(),
                    self.timeout.as_millis()
                );
                Err(PipelineError::GenerationFailed("generation timed out".to_string()))
            }
        }
    }
}
