/*!
 * Retry loop for remote calls
 *
 * Failures are classified once by [`ParsecError::class`]. Network and
 * throttle failures are retried with full-jitter exponential backoff, using a
 * server retry-after hint verbatim when one is present. An expired credential
 * gets exactly one extra attempt: the operation is expected to invalidate its
 * lease before returning `AuthExpired`, so the next attempt fetches a fresh
 * one. Everything else is returned immediately.
 */

use parsec_core_resilience::Backoff;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{ErrorClass, ParsecError, Result};

/// Bounded retry policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    /// `max_attempts` counts the first try; 0 is treated as 1
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.backoff())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retrying after `err` on 1-based `attempt`
    pub fn delay_for(&self, attempt: u32, err: &ParsecError) -> Duration {
        self.backoff.delay(attempt, err.retry_after())
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out
    ///
    /// The closure receives the 1-based attempt number. Backoff sleeps are
    /// abandoned with `Cancelled` when `cancel` fires.
    pub async fn run<F, Fut, T>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        let mut auth_retry_used = false;

        loop {
            if cancel.is_cancelled() {
                return Err(ParsecError::Cancelled);
            }
            attempt += 1;

            let err = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = err.class();
            let retry = match class {
                ErrorClass::RetryableNetwork | ErrorClass::RetryableThrottle => {
                    attempt < self.max_attempts
                }
                ErrorClass::FatalAuth if !auth_retry_used => {
                    auth_retry_used = true;
                    true
                }
                _ => false,
            };

            if !retry {
                if class.is_retryable() {
                    warn!(operation = label, attempt, error = %err, "retries exhausted");
                    return Err(err.context(format!("{} failed after {} attempts", label, attempt)));
                }
                return Err(err);
            }

            let delay = if class == ErrorClass::FatalAuth {
                Duration::ZERO
            } else {
                self.delay_for(attempt, &err)
            };
            debug!(
                operation = label,
                attempt,
                %class,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ParsecError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
