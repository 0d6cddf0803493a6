//! Exponential backoff with full jitter
//!
//! The delay before retry `n` (1-based) is drawn uniformly from
//! `[0, min(max_delay, base_delay * 2^(n-1))]`. Full jitter spreads retries of
//! many workers that failed at the same instant, which matters when the
//! failure was a throttling response shared by all of them.
//!
//! A server-supplied retry-after hint always wins over the computed delay.
//!
//! # Example
//!
//! ```
//! use parsec_core_resilience::backoff::Backoff;
//! use std::time::Duration;
//!
//! let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
//!
//! // Attempt 3 waits somewhere in [0, 400ms]
//! assert!(backoff.delay(3, None) <= Duration::from_millis(400));
//!
//! // A retry-after hint is used verbatim
//! assert_eq!(
//!     backoff.delay(3, Some(Duration::from_secs(7))),
//!     Duration::from_secs(7)
//! );
//! ```

use rand::Rng;
use std::time::Duration;

/// Full-jitter exponential backoff calculator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Ceiling of the first retry's delay
    pub base_delay: Duration,

    /// Ceiling for every delay
    pub max_delay: Duration,
}

impl Backoff {
    /// Create a new backoff calculator
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Upper bound of the delay window for a 1-based retry attempt
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay to wait before a 1-based retry attempt
    ///
    /// `retry_after` is a hint from the server and is honoured verbatim.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint;
        }

        let ceiling = self.ceiling(attempt);
        if ceiling.is_zero() {
            return Duration::ZERO;
        }

        let millis = ceiling.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(rand::rng().random_range(0..=millis))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60))
    }
}
