//! The LLM call interceptor.
//!
//! Wraps every model call in the reserve → call → settle protocol:
//!
//! 1. Estimate input tokens with the injected counter; add the request's
//!    `max_tokens` as the worst-case output, plus a configurable buffer.
//! 2. Reserve that many tokens; a refusal raises budget exhaustion and no
//!    provider traffic happens.
//! 3. Perform the provider call under the retry policy, holding the *same*
//!    reservation across retries.
//! 4. On success, commit the actual usage; on failure, roll the
//!    reservation back and re-raise.
//!
//! The streaming variant settles when the terminal chunk arrives. When a
//! provider omits usage information, the estimated total is committed and
//! a warning is logged — the call still succeeds.

use std::sync::Arc;

use crate::budget::{BudgetDecision, BudgetTracker, TokenUsage};
use crate::error::OrchestratorError;
use crate::model::types::BudgetId;

use super::provider::{LlmProvider, ProviderError};
use super::{InterceptorConfig, LlmRequest, LlmResponse, StreamChunk, TokenCounter};

// ---------------------------------------------------------------------------
// LlmInterceptor
// ---------------------------------------------------------------------------

/// Budget-enforcing wrapper around a provider.
pub struct LlmInterceptor {
    tracker: Arc<BudgetTracker>,
    counter: Box<dyn TokenCounter>,
    provider: Box<dyn LlmProvider>,
    budget_id: BudgetId,
    config: InterceptorConfig,
}

impl std::fmt::Debug for LlmInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmInterceptor")
            .field("budget_id", &self.budget_id)
            .finish_non_exhaustive()
    }
}

impl LlmInterceptor {
    /// Create an interceptor charging against `budget_id`.
    #[must_use]
    pub fn new(
        tracker: Arc<BudgetTracker>,
        counter: Box<dyn TokenCounter>,
        provider: Box<dyn LlmProvider>,
        budget_id: BudgetId,
        config: InterceptorConfig,
    ) -> Self {
        Self {
            tracker,
            counter,
            provider,
            budget_id,
            config,
        }
    }

    /// The budget this interceptor charges.
    #[must_use]
    pub const fn budget_id(&self) -> &BudgetId {
        &self.budget_id
    }

    /// The tracker this interceptor settles reservations against.
    #[must_use]
    pub fn tracker(&self) -> &Arc<BudgetTracker> {
        &self.tracker
    }

    fn estimate_total(&self, request: &LlmRequest) -> u64 {
        let estimated_input = self.counter.count(&request.full_text());
        self.config
            .estimate_with_buffer(estimated_input + request.max_tokens)
    }

    fn reserve_or_raise(
        &self,
        request: &LlmRequest,
        estimated_total: u64,
    ) -> Result<String, OrchestratorError> {
        let outcome = self.tracker.reserve(
            &self.budget_id,
            estimated_total,
            request.correlation_id.as_deref(),
        )?;
        if outcome.success {
            if let Some(id) = outcome.reservation_id {
                return Ok(id);
            }
        }
        let available = outcome.status.map_or(0, |s| s.available);
        Err(OrchestratorError::BudgetExhausted {
            budget_id: self.budget_id.as_str().to_owned(),
            requested: estimated_total,
            available,
        })
    }

    /// Make a non-streaming call with budget tracking.
    ///
    /// # Errors
    /// - [`OrchestratorError::BudgetExhausted`] when the reservation fails.
    /// - [`OrchestratorError::Timeout`] / [`OrchestratorError::Llm`] when
    ///   the provider fails after retries; the reservation is rolled back.
    pub fn call(&self, request: &LlmRequest) -> Result<LlmResponse, OrchestratorError> {
        let estimated_total = self.estimate_total(request);
        let reservation_id = self.reserve_or_raise(request, estimated_total)?;
        tracing::debug!(
            reservation = %reservation_id,
            estimated = estimated_total,
            "reserved tokens for LLM call"
        );

        match self
            .config
            .retry
            .execute(|| self.provider.call(request))
        {
            Ok(response) => {
                let actual = response.usage.total();
                self.tracker
                    .commit(&reservation_id, actual, request.correlation_id.as_deref())?;
                tracing::debug!(actual, estimated = estimated_total, "committed token usage");
                Ok(response)
            }
            Err(err) => {
                tracing::warn!(error = %err, "provider call failed, rolling back reservation");
                self.tracker.rollback(
                    &reservation_id,
                    &format!("provider error: {err}"),
                    request.correlation_id.as_deref(),
                )?;
                Err(map_provider_error(err))
            }
        }
    }

    /// Make a streaming call with budget tracking.
    ///
    /// Returns a pull-style iterator. The reservation is committed when the
    /// terminal chunk is observed (with the provider's reported usage, or
    /// the estimate when the provider omits it), rolled back on a stream
    /// error, and rolled back if the iterator is dropped mid-stream.
    ///
    /// # Errors
    /// Returns budget exhaustion if the reservation fails, or a provider
    /// error if the stream cannot start (reservation rolled back).
    pub fn call_streaming(
        &self,
        request: &LlmRequest,
    ) -> Result<BudgetedStream<'_>, OrchestratorError> {
        let estimated_total = self.estimate_total(request);
        let reservation_id = self.reserve_or_raise(request, estimated_total)?;

        let inner = match self.provider.call_streaming(request) {
            Ok(inner) => inner,
            Err(err) => {
                self.tracker.rollback(
                    &reservation_id,
                    &format!("stream start failed: {err}"),
                    request.correlation_id.as_deref(),
                )?;
                return Err(map_provider_error(err));
            }
        };

        Ok(BudgetedStream {
            interceptor: self,
            inner,
            reservation_id,
            estimated_total,
            correlation_id: request.correlation_id.clone(),
            settled: false,
        })
    }

    /// Pre-flight check without reserving — lets a UI warn before a call.
    ///
    /// # Errors
    /// Returns a database error if the budget does not exist.
    pub fn pre_check(&self, request: &LlmRequest) -> Result<BudgetDecision, OrchestratorError> {
        let estimated_total = self.estimate_total(request);
        self.tracker.pre_check(&self.budget_id, estimated_total)
    }
}

fn map_provider_error(err: ProviderError) -> OrchestratorError {
    match err {
        ProviderError::Timeout(msg) => OrchestratorError::Timeout {
            operation: format!("LLM call ({msg})"),
            seconds: 0,
        },
        other => OrchestratorError::Llm {
            detail: other.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// BudgetedStream
// ---------------------------------------------------------------------------

/// A streaming response whose reservation settles as chunks are pulled.
pub struct BudgetedStream<'a> {
    interceptor: &'a LlmInterceptor,
    inner: Box<dyn Iterator<Item = Result<StreamChunk, ProviderError>> + Send>,
    reservation_id: String,
    estimated_total: u64,
    correlation_id: Option<String>,
    settled: bool,
}

impl BudgetedStream<'_> {
    fn commit(&mut self, usage: Option<TokenUsage>) -> Result<(), OrchestratorError> {
        self.settled = true;
        let actual = match usage {
            Some(usage) => usage.total(),
            None => {
                tracing::warn!(
                    estimated = self.estimated_total,
                    "stream delivered no usage; committing the estimate"
                );
                self.estimated_total
            }
        };
        self.interceptor.tracker.commit(
            &self.reservation_id,
            actual,
            self.correlation_id.as_deref(),
        )
    }

    fn rollback(&mut self, reason: &str) {
        self.settled = true;
        if let Err(err) = self.interceptor.tracker.rollback(
            &self.reservation_id,
            reason,
            self.correlation_id.as_deref(),
        ) {
            tracing::error!(error = %err, "failed to roll back streaming reservation");
        }
    }
}

impl Iterator for BudgetedStream<'_> {
    type Item = Result<StreamChunk, OrchestratorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.settled {
            return None;
        }
        match self.inner.next() {
            Some(Ok(chunk)) => {
                if chunk.is_final {
                    if let Err(err) = self.commit(chunk.usage) {
                        return Some(Err(err));
                    }
                }
                Some(Ok(chunk))
            }
            Some(Err(err)) => {
                self.rollback(&format!("stream error: {err}"));
                Some(Err(map_provider_error(err)))
            }
            None => {
                // Stream ended without a terminal chunk: settle on the
                // estimate rather than stranding the reservation.
                if let Err(err) = self.commit(None) {
                    return Some(Err(err));
                }
                None
            }
        }
    }
}

impl Drop for BudgetedStream<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.rollback("stream dropped before completion");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
