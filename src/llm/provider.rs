//! Provider seam: the trait the interceptor calls through, the provider
//! error taxonomy, and a minimal blocking HTTP adapter speaking the
//! OpenAI-compatible `chat/completions` shape.
//!
//! Concrete provider adapters beyond the HTTP one are out of scope; tests
//! and pipelines inject their own [`LlmProvider`] implementations.

use std::fmt;
use std::time::Duration;

use serde_json::json;

use super::{LlmRequest, LlmResponse, StreamChunk, TokenUsage};

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

/// Classified provider failure, driving the retry decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderError {
    /// Connection-level failure (DNS, refused, reset).
    Connection(String),
    /// The provider did not answer within the adapter timeout.
    Timeout(String),
    /// HTTP 429 or a rate-limit message.
    RateLimited(String),
    /// HTTP 5xx.
    Server(String),
    /// Anything else — malformed response, 4xx, bad request.
    Other(String),
}

impl ProviderError {
    /// Whether the retry wrapper should try again.
    ///
    /// Connection and timeout failures, rate limits, and server errors are
    /// transient; everything else re-raises immediately.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::RateLimited(_) | Self::Server(_)
        )
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "connection error: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::RateLimited(msg) => write!(f, "rate limited: {msg}"),
            Self::Server(msg) => write!(f, "server error: {msg}"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

// ---------------------------------------------------------------------------
// LlmProvider
// ---------------------------------------------------------------------------

/// A blocking model endpoint.
pub trait LlmProvider: Send + Sync {
    /// Perform a non-streaming call.
    ///
    /// # Errors
    /// Returns a classified [`ProviderError`] on failure.
    fn call(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError>;

    /// Perform a streaming call, returning a pull-style chunk iterator.
    ///
    /// The default implementation wraps [`LlmProvider::call`] in a single
    /// terminal chunk, for providers without streaming support.
    ///
    /// # Errors
    /// Returns a classified [`ProviderError`] if the stream cannot start.
    fn call_streaming(
        &self,
        request: &LlmRequest,
    ) -> Result<Box<dyn Iterator<Item = Result<StreamChunk, ProviderError>> + Send>, ProviderError>
    {
        let response = self.call(request)?;
        let chunk = StreamChunk {
            content: response.content,
            is_final: true,
            usage: Some(response.usage),
        };
        Ok(Box::new(std::iter::once(Ok(chunk))))
    }
}

// ---------------------------------------------------------------------------
// HttpProvider
// ---------------------------------------------------------------------------

/// Blocking HTTP adapter for OpenAI-compatible `chat/completions` endpoints.
#[derive(Debug)]
pub struct HttpProvider {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl HttpProvider {
    /// Create an adapter for `endpoint` (the full completions URL).
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    fn classify(err: &reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_connect() {
            ProviderError::Connection(err.to_string())
        } else {
            ProviderError::Other(err.to_string())
        }
    }
}

impl LlmProvider for HttpProvider {
    fn call(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError> {
        let mut messages: Vec<serde_json::Value> = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &request.messages {
            messages.push(json!({"role": message.role, "content": message.content}));
        }

        let body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| Self::classify(&e))?;

        let status = response.status();
        let text = response.text().map_err(|e| Self::classify(&e))?;

        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited(text));
        }
        if status.is_server_error() {
            return Err(ProviderError::Server(format!("{status}: {text}")));
        }
        if !status.is_success() {
            return Err(ProviderError::Other(format!("{status}: {text}")));
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Other(format!("malformed provider response: {e}")))?;

        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_owned();
        let finish_reason = parsed["choices"][0]["finish_reason"]
            .as_str()
            .unwrap_or("stop")
            .to_owned();
        let usage = TokenUsage {
            input_tokens: parsed["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: parsed["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        };

        Ok(LlmResponse {
            content,
            usage,
            model: parsed["model"]
                .as_str()
                .unwrap_or(&request.model)
                .to_owned(),
            finish_reason,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
