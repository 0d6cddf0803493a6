//! Parsec Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! Building blocks for keeping a transfer engine inside a remote service's
//! limits and recovering from transient failures:
//!
//! - **Token Bucket**: governor-backed admission control with a burst allowance
//! - **Backoff**: exponential backoff with full jitter that honours retry-after hints
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Storage systems or file formats
//! - Network protocols
//! - Which request belongs to which operation class
//!
//! # Usage Example
//!
//! ```no_run
//! use parsec_core_resilience::{Backoff, BucketConfig, TokenBucket};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), parsec_core_resilience::ResilienceError> {
//! let bucket = TokenBucket::new(BucketConfig::new(20.0, 300))?;
//! let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(60));
//!
//! for attempt in 1..=3 {
//!     bucket.acquire().await;
//!     // ... on a retryable failure:
//!     tokio::time::sleep(backoff.delay(attempt, None)).await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod error;
pub mod rate_limiter;

pub use backoff::Backoff;
pub use error::ResilienceError;
pub use rate_limiter::{BucketConfig, TokenBucket};

/// Prelude module for convenient imports
pub mod prelude {
    pub use super::backoff::Backoff;
    pub use super::error::ResilienceError;
    pub use super::rate_limiter::{BucketConfig, TokenBucket};
}
