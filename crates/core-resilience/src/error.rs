//! Error type shared by the resilience primitives

use thiserror::Error;

/// Errors raised while configuring or driving a resilience primitive
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResilienceError {
    /// Configuration cannot produce a usable primitive
    #[error("invalid resilience configuration: {0}")]
    InvalidConfig(String),

    /// Non-blocking acquisition found no token available
    #[error("rate limit exceeded")]
    RateLimitExceeded,
}
