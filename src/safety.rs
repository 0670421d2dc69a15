//! Input screening run before any expensive work.
//!
//! The injection check is a heuristic denylist over known instruction-override
//! phrasings. It is best-effort only and is NOT a security boundary: a
//! reworded or obfuscated prompt will pass it. Downstream components must
//! not assume an accepted query is benign.

use regex::Regex;
use tracing::warn;

use crate::error::PipelineError;
use crate::types::Query;

pub struct SafetyGuard {
    patterns: Vec<Regex>,
    max_chars: usize,
}

impl SafetyGuard {
    pub fn new(patterns: Vec<Regex>, max_chars: usize) -> Self {
        Self { patterns, max_chars }
    }

    /// Validate raw input and return the trimmed query
    pub fn check(&self, raw: &str) -> Result<Query, PipelineError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        if trimmed.chars().count() > self.max_chars {
            return Err(PipelineError::QueryTooLong { max: self.max_chars });
        }
        if let Some(pattern) = self.patterns.iter().find(|p| p.is_match(trimmed)) {
            warn!("Injection heuristic matched pattern '{}'", pattern.as_str());
            return Err(PipelineError::InjectionSuspected);
        }
        Ok(Query::new_unchecked(trimmed.to_string()))
    }
}
