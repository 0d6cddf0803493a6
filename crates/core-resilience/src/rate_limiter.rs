//! Rate limiting for keeping request rates under a service's published limits
//!
//! Each [`TokenBucket`] wraps a governor GCRA limiter, which behaves like a
//! classic token bucket: `burst` permits may be spent at once, after which
//! permits trickle back at `rate_per_second`.
//!
//! # Example
//! ```no_run
//! use parsec_core_resilience::{BucketConfig, TokenBucket};
//!
//! # async fn example() -> Result<(), parsec_core_resilience::ResilienceError> {
//! // Platform allows 25 req/s; stay at 80% of that with a burst of 300
//! let bucket = TokenBucket::new(BucketConfig::with_headroom(25.0, 0.8, 300))?;
//!
//! bucket.acquire().await;
//! // ... issue the request
//! # Ok(())
//! # }
//! ```

use super::error::ResilienceError;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

/// Shape of a single token bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Sustained refill rate in permits per second
    pub rate_per_second: f64,

    /// Bucket capacity (permits that may be spent back to back)
    pub burst: u32,
}

impl BucketConfig {
    /// Create a bucket refilling at `rate_per_second` with capacity `burst`
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        Self {
            rate_per_second,
            burst,
        }
    }

    /// Derive the refill rate from a published hard limit
    ///
    /// # Arguments
    /// * `hard_limit` - The service's documented requests per second
    /// * `headroom` - Fraction of the hard limit to actually use (e.g. 0.8)
    /// * `burst` - Bucket capacity
    pub fn with_headroom(hard_limit: f64, headroom: f64, burst: u32) -> Self {
        Self::new(hard_limit * headroom, burst)
    }

    /// Interval between two refilled permits
    pub fn replenish_interval(&self) -> Result<Duration, ResilienceError> {
        if !self.rate_per_second.is_finite() || self.rate_per_second <= 0.0 {
            return Err(ResilienceError::InvalidConfig(format!(
                "rate must be positive, got {}",
                self.rate_per_second
            )));
        }
        Ok(Duration::from_secs_f64(1.0 / self.rate_per_second))
    }

    /// Build the governor quota for this bucket
    pub fn quota(&self) -> Result<Quota, ResilienceError> {
        let burst = NonZeroU32::new(self.burst)
            .ok_or_else(|| ResilienceError::InvalidConfig("burst must be > 0".to_string()))?;

        let quota = Quota::with_period(self.replenish_interval()?)
            .ok_or_else(|| ResilienceError::InvalidConfig("invalid period".to_string()))?
            .allow_burst(burst);

        Ok(quota)
    }

    /// Minimum wall time needed to admit `requests` starting from a full bucket
    pub fn minimum_duration_for(&self, requests: u32) -> Duration {
        let paced = requests.saturating_sub(self.burst);
        Duration::from_secs_f64(paced as f64 / self.rate_per_second)
    }
}

/// Shared token bucket; clone the surrounding `Arc` to share it across tasks
pub struct TokenBucket {
    config: BucketConfig,
    limiter: DefaultDirectRateLimiter,
}

impl TokenBucket {
    /// Create a new token bucket, starting full
    pub fn new(config: BucketConfig) -> Result<Self, ResilienceError> {
        let quota = config.quota()?;
        Ok(Self {
            config,
            limiter: GovernorRateLimiter::direct(quota),
        })
    }

    /// Wait until a permit is available and consume it
    ///
    /// Only the calling task waits; wrap in `tokio::select!` to make the wait
    /// cancellable.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Consume a permit if one is available right now
    pub fn try_acquire(&self) -> Result<(), ResilienceError> {
        self.limiter
            .check()
            .map_err(|_| ResilienceError::RateLimitExceeded)
    }

    /// Bucket capacity
    pub fn capacity(&self) -> u32 {
        self.config.burst
    }

    /// Sustained refill rate (permits per second)
    pub fn refill_rate(&self) -> f64 {
        self.config.rate_per_second
    }

    /// Configuration this bucket was built from
    pub fn config(&self) -> BucketConfig {
        self.config
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate_per_second", &self.config.rate_per_second)
            .field("burst", &self.config.burst)
            .finish()
    }
}
