/*!
 * Configuration types for Parsec
 *
 * Every field has a default, so an empty TOML document is a valid
 * configuration. Unknown keys are rejected so typos surface at load time.
 */

use parsec_core_resilience::{Backoff, BucketConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::BLOCK_SIZE;
use crate::error::{ParsecError, Result};

const MIB: u64 = 1024 * 1024;

/// Top-level configuration for the transfer engine and manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Chunking, encryption and on-disk layout
    pub engine: EngineConfig,

    /// Transfer and worker limits
    pub concurrency: ConcurrencyConfig,

    /// Retry policy for remote calls
    pub retry: RetryConfig,

    /// Request rate limits per operation class
    pub rate_limit: RateLimitConfig,

    /// Credential lease lifecycle
    pub credentials: CredentialConfig,

    /// Event delivery
    pub events: EventConfig,

    /// Diagnostic output
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Part size for multipart transfers (the final part holds the remainder)
    pub chunk_size: u64,

    /// Objects larger than this use multipart transfer
    pub multipart_threshold: u64,

    /// Streaming cipher window in bytes; must be a multiple of the block size
    pub cipher_window: usize,

    /// Encrypt uploads before they leave the machine
    pub encrypt: bool,

    /// Skip the remote duplicate check before uploading
    ///
    /// Off by default: scripted callers that can tolerate accidental
    /// duplicates may turn it on for one fewer round trip per file.
    pub fast_mode: bool,

    /// Where encrypted upload artifacts are staged (default: system temp dir)
    pub staging_dir: Option<PathBuf>,

    /// Where resume sidecars live (default: next to the local file)
    pub resume_dir: Option<PathBuf>,

    /// Resume sidecars older than this are discarded
    pub resume_max_age_secs: u64,

    /// Extra free space required on top of the output size (0.10 = 10%)
    pub disk_safety_margin: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 32 * MIB,
            multipart_threshold: 100 * MIB,
            cipher_window: 16 * 1024,
            encrypt: true,
            fast_mode: false,
            staging_dir: None,
            resume_dir: None,
            resume_max_age_secs: 7 * 24 * 60 * 60,
            disk_safety_margin: 0.10,
        }
    }
}

impl EngineConfig {
    /// Staleness window for resume sidecars
    pub fn resume_max_age(&self) -> Duration {
        Duration::from_secs(self.resume_max_age_secs)
    }

    /// Directory for staged upload artifacts
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcurrencyConfig {
    /// Transfers allowed to run at once; the rest stay queued
    pub max_concurrent_transfers: usize,

    /// Global worker pool: chunk operations in flight across all transfers
    pub max_workers: usize,

    /// Upper bound of a single transfer's share of the pool
    pub max_workers_per_file: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 4,
            max_workers: 16,
            max_workers_per_file: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts per remote call, including the first
    pub max_attempts: u32,

    /// Ceiling of the first retry's jittered delay
    pub base_delay_ms: u64,

    /// Ceiling for any computed delay (retry-after hints are not capped)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Backoff calculator for this policy
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// One token bucket's configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketSettings {
    /// Published hard limit of the platform, requests per second
    pub hard_limit_per_sec: f64,

    /// Fraction of the hard limit actually used
    #[serde(default = "default_headroom")]
    pub headroom: f64,

    /// Burst allowance
    pub burst: u32,
}

impl BucketSettings {
    pub fn bucket(&self) -> BucketConfig {
        BucketConfig::with_headroom(self.hard_limit_per_sec, self.headroom, self.burst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Reads, listings, part writes, credential issuance
    pub general: BucketSettings,

    /// Session creation, commits and other registration-class calls
    pub submission: BucketSettings,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            general: BucketSettings {
                hard_limit_per_sec: 25.0,
                headroom: default_headroom(),
                burst: 300,
            },
            submission: BucketSettings {
                hard_limit_per_sec: 2.0,
                headroom: default_headroom(),
                burst: 10,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialConfig {
    /// Interval of the background refresher
    pub refresh_interval_secs: u64,

    /// Leases expiring within this window are renewed proactively
    pub refresh_ahead_secs: u64,

    /// Attempts when issuing a lease fails transiently
    pub refresh_attempts: u32,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 10 * 60,
            refresh_ahead_secs: 5 * 60,
            refresh_attempts: 5,
        }
    }
}

impl CredentialConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn refresh_ahead(&self) -> Duration {
        Duration::from_secs(self.refresh_ahead_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventConfig {
    /// Events buffered per subscriber before the oldest are dropped
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    pub level: LogLevel,

    /// Log file path (None = stderr)
    pub file: Option<PathBuf>,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn default_headroom() -> f64 {
    0.8
}

impl TransferConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ParsecError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: TransferConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ParsecError::Config(e.to_string()))
    }

    /// Reject combinations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.chunk_size == 0 {
            return Err(ParsecError::Config("engine.chunk_size must be > 0".into()));
        }
        if engine.cipher_window == 0 || engine.cipher_window % BLOCK_SIZE != 0 {
            return Err(ParsecError::Config(format!(
                "engine.cipher_window must be a positive multiple of {}",
                BLOCK_SIZE
            )));
        }
        if !(0.0..1.0).contains(&engine.disk_safety_margin) {
            return Err(ParsecError::Config(
                "engine.disk_safety_margin must be in [0, 1)".into(),
            ));
        }

        let concurrency = &self.concurrency;
        if concurrency.max_concurrent_transfers == 0
            || concurrency.max_workers == 0
            || concurrency.max_workers_per_file == 0
        {
            return Err(ParsecError::Config(
                "concurrency limits must all be > 0".into(),
            ));
        }
        if concurrency.max_workers_per_file > concurrency.max_workers {
            return Err(ParsecError::Config(format!(
                "concurrency.max_workers_per_file ({}) exceeds concurrency.max_workers ({})",
                concurrency.max_workers_per_file, concurrency.max_workers
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(ParsecError::Config("retry.max_attempts must be > 0".into()));
        }

        for (name, bucket) in [
            ("general", &self.rate_limit.general),
            ("submission", &self.rate_limit.submission),
        ] {
            if !(bucket.headroom > 0.0 && bucket.headroom <= 1.0) {
                return Err(ParsecError::Config(format!(
                    "rate_limit.{}.headroom must be in (0, 1]",
                    name
                )));
            }
            bucket
                .bucket()
                .quota()
                .map_err(|e| ParsecError::Config(format!("rate_limit.{}: {}", name, e)))?;
        }

        if self.credentials.refresh_ahead_secs == 0 || self.credentials.refresh_attempts == 0 {
            return Err(ParsecError::Config(
                "credentials.refresh_ahead_secs and refresh_attempts must be > 0".into(),
            ));
        }

        if self.events.channel_capacity == 0 {
            return Err(ParsecError::Config(
                "events.channel_capacity must be > 0".into(),
            ));
        }

        Ok(())
    }
}
