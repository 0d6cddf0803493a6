/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::path::Path;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::error::{ParsecError, Result};

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` takes precedence over the configured level. Calling this twice
/// returns a `Config` error instead of panicking.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(config)?;

    if let Some(ref log_path) = config.file {
        init_file_logging(log_path, env_filter)
    } else {
        init_stderr_logging(env_filter)
    }
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let log_level = config.level.to_tracing_level();
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("parsec={}", log_level)))
        .map_err(|e| ParsecError::Config(format!("Failed to create log filter: {}", e)))
}

/// Initialize logging to stderr
fn init_stderr_logging(env_filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| ParsecError::Config(format!("Logging already initialized: {}", e)))
}

/// Initialize JSON logging to a file
fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(log_path)
        .map_err(|e| ParsecError::Config(format!("Failed to create log file: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| ParsecError::Config(format!("Logging already initialized: {}", e)))
}

/// Initialize logging for test harnesses (idempotent)
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parsec=debug"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_filter_from_level() {
        let config = LoggingConfig {
            level: LogLevel::Debug,
            file: None,
        };
        assert!(build_filter(&config).is_ok());
    }

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        init_test_logging();
        let config = LoggingConfig::default();
        let err = init_logging(&config).unwrap_err();
        assert!(matches!(err, ParsecError::Config(_)));
    }
}
