//! Retry with exponential backoff for transient failures.

use crate::error::{AuthError, AuthResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff policy for retryable operations.
///
/// Delays double per attempt up to a cap: with the defaults the sequence
/// between attempts is 1s, 2s, capped at 30s.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Build a policy from the knobs in [`crate::Config`].
    pub fn from_config(config: &crate::Config) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delay to wait after the given zero-based attempt fails.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt);
        let delay_ms = (self.base_delay.as_millis() as u64).saturating_mul(multiplier);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Run `op`, retrying transient failures with backoff.
    ///
    /// Non-transient errors propagate immediately without further attempts.
    /// The closure receives the zero-based attempt number.
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> AuthResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AuthResult<T>>,
    {
        let mut last_err: Option<AuthError> = None;

        for attempt in 0..self.max_attempts {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = name, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(operation = name, error = %err, "retries exhausted");
                    } else {
                        debug!(operation = name, error = %err, "non-retryable failure");
                    }
                    return Err(err);
                }
            }
        }

        // max_attempts >= 1, so the loop returns before reaching here unless
        // it's zero after a bad config; treat that as exhausted.
        Err(last_err.unwrap_or(AuthError::RefreshExhausted))
    }
}
