//! Message assembly for the generation backend

use crate::config::PipelineConfig;
use crate::types::{ChatMessage, ContextBlock, Query, Role};

pub struct PromptAssembler {
    system_template: String,
    empty_context_marker: String,
    history_cap: usize,
}

impl PromptAssembler {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            system_template: config.system_template.clone(),
            empty_context_marker: config.empty_context_marker.clone(),
            history_cap: config.history_cap,
        }
    }

    /// System message, then the most recent history turns oldest-first,
    /// then the current query as the single trailing user message.
    pub fn assemble(
        &self,
        context: &ContextBlock,
        history: &[ChatMessage],
        query: &Query,
    ) -> Vec<ChatMessage> {
        let context_text = if context.is_empty() {
            self.empty_context_marker.as_str()
        } else {
            context.text.as_str()
        };
        let system = format!("{}\n\nContext:\n{}", self.system_template, context_text);

        let turns = recent_turns(history, self.history_cap);
        let mut messages = Vec::with_capacity(turns.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(turns.iter().cloned());
        messages.push(ChatMessage::user(query.as_str()));
        messages
    }
}

/// Last `cap` user/assistant turns; caller-supplied system messages are dropped
pub fn recent_turns(history: &[ChatMessage], cap: usize) -> Vec<ChatMessage> {
    let turns: Vec<&ChatMessage> = history.iter().filter(|m| m.role != Role::System).collect();
    let skip = turns.len().saturating_sub(cap);
    turns.into_iter().skip(skip).cloned().collect()
}
