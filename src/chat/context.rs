//! Safe context compression.
//!
//! Decides when the conversation no longer fits the model window and
//! compresses it without losing information: pinned and recent messages
//! are always kept verbatim; everything older is summarized through the
//! interceptor and the summary is admitted only if the deterministic
//! validator confirms nothing load-bearing went missing. An invalid
//! summary falls back to plain truncation — pinned + recent, no summary.

use std::collections::BTreeSet;

use crate::llm::{LlmInterceptor, LlmMessage, LlmRequest, TokenCounter};

use super::validator::SummaryValidator;
use super::{Message, MessageRole, SessionConfig};

// ---------------------------------------------------------------------------
// Summarization prompt
// ---------------------------------------------------------------------------

const SUMMARIZATION_PROMPT: &str = "Summarize the following conversation concisely.\n\
Preserve ALL of the following:\n\
- File paths and code references\n\
- Function/method names\n\
- URLs\n\
- Decisions made (what was decided and why)\n\
- Key entities and their relationships\n\n\
Conversation to summarize:\n\
{conversation}\n\n\
Provide a comprehensive summary that captures all critical information:";

// ---------------------------------------------------------------------------
// ContextManager
// ---------------------------------------------------------------------------

/// Prepares the message window for a model call.
pub struct ContextManager {
    counter: Box<dyn TokenCounter>,
    validator: SummaryValidator,
    config: SessionConfig,
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager").finish_non_exhaustive()
    }
}

impl ContextManager {
    #[must_use]
    pub fn new(counter: Box<dyn TokenCounter>, config: SessionConfig) -> Self {
        Self {
            counter,
            validator: SummaryValidator::default(),
            config,
        }
    }

    fn total_tokens(&self, messages: &[Message]) -> u64 {
        messages
            .iter()
            .map(|m| self.counter.count(&m.content))
            .sum()
    }

    fn should_compress(&self, messages: &[Message]) -> bool {
        if messages.is_empty() {
            return false;
        }
        let threshold =
            (self.config.max_tokens as f64 * self.config.summarization_threshold) as u64;
        self.total_tokens(messages) > threshold
    }

    /// Prepare the context for a model call, compressing when over budget.
    ///
    /// Pinned and recent messages are never discarded. The summary (when
    /// admitted) leads the window as a system message.
    #[must_use]
    pub fn prepare_context(
        &self,
        messages: &[Message],
        pinned_ids: &[String],
        interceptor: &LlmInterceptor,
    ) -> Vec<Message> {
        if !self.should_compress(messages) {
            return messages.to_vec();
        }

        tracing::info!(
            total = messages.len(),
            "context exceeds threshold; compressing"
        );

        let pinned_set: BTreeSet<&String> = pinned_ids.iter().collect();
        let recent_start = messages
            .len()
            .saturating_sub(self.config.recent_messages_to_keep);
        let recent: Vec<&Message> = messages[recent_start..]
            .iter()
            .filter(|m| !pinned_set.contains(&m.id))
            .collect();
        let recent_ids: BTreeSet<&String> = recent.iter().map(|m| &m.id).collect();

        let pinned: Vec<&Message> = messages
            .iter()
            .filter(|m| pinned_set.contains(&m.id))
            .collect();
        let to_summarize: Vec<Message> = messages
            .iter()
            .filter(|m| !pinned_set.contains(&m.id) && !recent_ids.contains(&m.id))
            .cloned()
            .collect();

        if to_summarize.is_empty() {
            return messages.to_vec();
        }

        let fallback = || -> Vec<Message> {
            tracing::info!(
                pinned = pinned.len(),
                recent = recent.len(),
                "falling back to truncation"
            );
            pinned.iter().chain(recent.iter()).map(|m| (*m).clone()).collect()
        };

        let Some(summary_text) = self.generate_summary(&to_summarize, interceptor) else {
            return fallback();
        };

        let report = self.validator.validate(&to_summarize, &summary_text);
        if !report.is_valid {
            tracing::warn!(
                missing_entities = report.missing_entities.len(),
                missing_decisions = report.missing_decisions.len(),
                "summary failed validation"
            );
            return fallback();
        }

        let mut summary_message = Message::new(
            MessageRole::System,
            format!("[Previous conversation summary]\n{summary_text}"),
        );
        summary_message.metadata = serde_json::json!({
            "is_summary": true,
            "summarized_count": to_summarize.len(),
        });

        let mut window = vec![summary_message];
        window.extend(pinned.iter().map(|m| (*m).clone()));
        window.extend(recent.iter().map(|m| (*m).clone()));
        tracing::info!(from = messages.len(), to = window.len(), "compression succeeded");
        window
    }

    fn generate_summary(
        &self,
        to_summarize: &[Message],
        interceptor: &LlmInterceptor,
    ) -> Option<String> {
        let conversation = to_summarize
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str().to_uppercase(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = SUMMARIZATION_PROMPT.replace("{conversation}", &conversation);

        let mut request = LlmRequest::new(
            &self.config.model,
            vec![LlmMessage::new("user", prompt)],
        );
        request.max_tokens = 2000;
        request.temperature = 0.3;

        match interceptor.call(&request) {
            Ok(response) => Some(response.content),
            Err(err) => {
                tracing::error!(error = %err, "summary generation failed");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
