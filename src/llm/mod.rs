//! LLM call layer: request/response types, token counting, retry, and the
//! budget-enforcing interceptor.
//!
//! Nothing in the orchestrator talks to a model endpoint directly — every
//! call goes through [`interceptor::LlmInterceptor`], which estimates the
//! cost, reserves tokens, performs the provider call under the retry
//! policy, and settles the reservation with the actual usage.

pub mod interceptor;
pub mod provider;
pub mod retry;

use serde::{Deserialize, Serialize};

pub use crate::budget::TokenUsage;
pub use interceptor::LlmInterceptor;
pub use provider::{LlmProvider, ProviderError};
pub use retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// A single conversation message in provider-neutral form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmMessage {
    /// `user`, `assistant`, or `system`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl LlmMessage {
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Provider-neutral LLM request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Conversation messages.
    pub messages: Vec<LlmMessage>,
    /// Model identifier.
    pub model: String,
    /// Maximum tokens in the response; also the worst-case output estimate.
    pub max_tokens: u64,
    /// Sampling temperature.
    pub temperature: f64,
    /// Optional system prompt.
    pub system: Option<String>,
    /// Correlation id threaded through budget events.
    pub correlation_id: Option<String>,
}

impl LlmRequest {
    /// Build a request with default sampling parameters.
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<LlmMessage>) -> Self {
        Self {
            messages,
            model: model.into(),
            max_tokens: 4096,
            temperature: 1.0,
            system: None,
            correlation_id: None,
        }
    }

    /// All text the provider will see, used for input-token estimation.
    #[must_use]
    pub fn full_text(&self) -> String {
        let mut parts = Vec::with_capacity(self.messages.len() + 1);
        if let Some(system) = &self.system {
            parts.push(system.as_str());
        }
        for message in &self.messages {
            parts.push(message.content.as_str());
        }
        parts.join("\n")
    }
}

/// Provider-neutral LLM response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Response text.
    pub content: String,
    /// Actual token usage reported by the provider.
    pub usage: TokenUsage,
    /// Model that produced the response.
    pub model: String,
    /// Why generation stopped.
    pub finish_reason: String,
}

/// One chunk of a streaming response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text content of this chunk.
    pub content: String,
    /// True on the terminal chunk.
    pub is_final: bool,
    /// Usage, present only on the terminal chunk (and not from every
    /// provider).
    pub usage: Option<TokenUsage>,
}

// ---------------------------------------------------------------------------
// Token counting
// ---------------------------------------------------------------------------

/// Counts tokens for budget estimation.
pub trait TokenCounter: Send + Sync {
    /// Estimate the token count of `text`.
    fn count(&self, text: &str) -> u64;
}

/// Character-ratio fallback counter (~4 chars per token).
#[derive(Clone, Copy, Debug)]
pub struct EstimatingCounter {
    chars_per_token: u64,
}

impl Default for EstimatingCounter {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl TokenCounter for EstimatingCounter {
    fn count(&self, text: &str) -> u64 {
        (text.len() as u64 / self.chars_per_token).max(1)
    }
}

// ---------------------------------------------------------------------------
// InterceptorConfig
// ---------------------------------------------------------------------------

/// Configuration for the call interceptor.
#[derive(Clone, Debug)]
pub struct InterceptorConfig {
    /// Retry policy for transient provider failures.
    pub retry: RetryPolicy,
    /// Extra buffer applied to token estimates (0.1 = +10%).
    pub buffer_percent: f64,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            buffer_percent: 0.1,
        }
    }
}

impl InterceptorConfig {
    /// Apply the estimation buffer.
    #[must_use]
    pub fn estimate_with_buffer(&self, tokens: u64) -> u64 {
        (tokens as f64 * (1.0 + self.buffer_percent)) as u64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_text_includes_system_and_messages() {
        let mut request = LlmRequest::new(
            "test-model",
            vec![
                LlmMessage::new("user", "hello"),
                LlmMessage::new("assistant", "hi"),
            ],
        );
        request.system = Some("be brief".to_owned());
        let text = request.full_text();
        assert!(text.starts_with("be brief"));
        assert!(text.contains("hello"));
        assert!(text.contains("hi"));
    }

    #[test]
    fn estimating_counter_ratio() {
        let counter = EstimatingCounter::default();
        assert_eq!(counter.count(&"x".repeat(400)), 100);
    }

    #[test]
    fn estimating_counter_minimum_one() {
        let counter = EstimatingCounter::default();
        assert_eq!(counter.count(""), 1);
        assert_eq!(counter.count("ab"), 1);
    }

    #[test]
    fn buffer_applied_to_estimate() {
        let config = InterceptorConfig::default();
        assert_eq!(config.estimate_with_buffer(1000), 1100);
    }
}
