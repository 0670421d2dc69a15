//! Complexity tiering over a configurable pattern table

use regex::Regex;

use crate::types::{ComplexityTier, Query};

pub struct QueryClassifier {
    patterns: Vec<Regex>,
}

impl QueryClassifier {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    /// `Complex` if any pattern matches, otherwise `Simple`
    pub fn classify(&self, query: &Query) -> ComplexityTier {
        if self.patterns.iter().any(|p| p.is_match(query.as_str())) {
            ComplexityTier::Complex
        } else {
            ComplexityTier::Simple
        }
    }
}
