/*!
 * Request admission control per operation class
 *
 * One token bucket per [`RequestClass`], shared by every transfer. Each
 * outbound call takes one token; only the calling worker waits, and the wait
 * is abandoned as soon as the task's cancellation token fires.
 */

use parsec_core_resilience::{BucketConfig, TokenBucket};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::RateLimitConfig;
use crate::error::{ParsecError, Result};

/// Operation class of an outbound platform call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    /// Reads, listings, part writes, credential issuance
    General,
    /// Session creation, commits, single-shot puts
    Submission,
}

impl fmt::Display for RequestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestClass::General => write!(f, "general"),
            RequestClass::Submission => write!(f, "submission"),
        }
    }
}

/// Dual token-bucket limiter shared across all transfers
#[derive(Debug)]
pub struct ApiRateLimiter {
    general: TokenBucket,
    submission: TokenBucket,
    granted: AtomicU64,
}

impl ApiRateLimiter {
    /// Build both buckets from configuration
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        Self::from_buckets(config.general.bucket(), config.submission.bucket())
    }

    /// Build from explicit bucket shapes
    pub fn from_buckets(general: BucketConfig, submission: BucketConfig) -> Result<Self> {
        let general = TokenBucket::new(general)
            .map_err(|e| ParsecError::Config(format!("rate_limit.general: {}", e)))?;
        let submission = TokenBucket::new(submission)
            .map_err(|e| ParsecError::Config(format!("rate_limit.submission: {}", e)))?;

        Ok(Self {
            general,
            submission,
            granted: AtomicU64::new(0),
        })
    }

    /// Bucket backing a request class
    pub fn bucket(&self, class: RequestClass) -> &TokenBucket {
        match class {
            RequestClass::General => &self.general,
            RequestClass::Submission => &self.submission,
        }
    }

    /// Wait for a token of `class`, or return `Cancelled`
    pub async fn acquire(&self, class: RequestClass, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ParsecError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ParsecError::Cancelled),
            _ = self.bucket(class).acquire() => {}
        }

        let total = self.granted.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(%class, total, "rate limit token granted");
        Ok(())
    }

    /// Take a token only if one is available now
    pub fn try_acquire(&self, class: RequestClass) -> bool {
        let ok = self.bucket(class).try_acquire().is_ok();
        if ok {
            self.granted.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Tokens handed out since creation, all classes
    pub fn tokens_granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }
}
