//! Exponential backoff with jitter for provider calls.
//!
//! `delay(attempt) = min(delay_max, base · 2^attempt · (1 ± jitter))`.
//! Only transient failures are retried; everything else re-raises
//! immediately. The same budget reservation is held across retries — the
//! retry loop lives *inside* the reserve/commit window.

use std::time::Duration;

use rand::Rng;

use super::provider::ProviderError;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Retry policy for transient provider failures.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay for exponential backoff.
    pub delay_base: Duration,
    /// Ceiling for any single delay.
    pub delay_max: Duration,
    /// Random jitter factor (0.5 = ±50%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_base: Duration::from_secs(1),
            delay_max: Duration::from_secs(30),
            jitter_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.delay_base.as_secs_f64() * 2.0_f64.powi(attempt as i32);
        let jitter = 1.0 + rand::rng().random_range(-self.jitter_factor..=self.jitter_factor);
        let seconds = (exponential * jitter).min(self.delay_max.as_secs_f64());
        Duration::from_secs_f64(seconds.max(0.0))
    }

    /// Execute `operation`, retrying transient failures with backoff.
    ///
    /// # Errors
    /// Returns the last error once attempts are exhausted, or the first
    /// non-retryable error immediately.
    pub fn execute<T>(
        &self,
        mut operation: impl FnMut() -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let mut last = None;
        for attempt in 0..self.max_attempts {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_retryable() {
                        tracing::debug!(error = %err, "non-retryable provider error");
                        return Err(err);
                    }
                    if attempt + 1 >= self.max_attempts {
                        tracing::warn!(
                            attempts = self.max_attempts,
                            error = %err,
                            "retries exhausted"
                        );
                        return Err(err);
                    }
                    let delay = self.delay(attempt);
                    tracing::info!(
                        attempt = attempt + 1,
                        max = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying provider call"
                    );
                    std::thread::sleep(delay);
                    last = Some(err);
                }
            }
        }
        // Unreachable with max_attempts >= 1; kept for the degenerate config.
        Err(last.unwrap_or_else(|| ProviderError::Other("no attempts were made".to_owned())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay_base: Duration::from_millis(1),
            delay_max: Duration::from_millis(5),
            jitter_factor: 0.5,
        }
    }

    #[test]
    fn succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result = fast_policy().execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ProviderError>(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast_policy().execute(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(ProviderError::RateLimited("429".to_owned()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausts_attempts_on_persistent_failure() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy().execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Server("503".to_owned()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn non_retryable_raises_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy().execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Other("bad request".to_owned()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_is_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            let d = policy.delay(attempt);
            assert!(d <= policy.delay_max);
        }
    }

    #[test]
    fn delay_grows_exponentially_before_cap() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
    }
}
