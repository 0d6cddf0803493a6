/*!
 * Error types for Parsec
 *
 * Every failure is classified exactly once into an [`ErrorClass`]; the retry
 * loop only ever looks at the class, never at the concrete variant.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ParsecError>;

#[derive(Error, Debug)]
pub enum ParsecError {
    /// Connection-level failure that usually clears on its own
    #[error("Network error: {0}")]
    TransientNetwork(String),

    /// Remote service asked us to slow down
    #[error("Throttled by remote service: {message}")]
    Throttled {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Storage credentials expired or were rejected
    #[error("Credentials expired or rejected: {0}")]
    AuthExpired(String),

    /// End-to-end integrity verification failed
    #[error("Checksum mismatch for {object}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        object: String,
        expected: String,
        actual: String,
    },

    /// Not enough free space for the output plus safety margin
    #[error(
        "Insufficient disk space at {}: {required} bytes required, {available} bytes available",
        .path.display()
    )]
    InsufficientDiskSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// Local path missing, not a regular file, or otherwise unsafe to use
    #[error("Invalid path {}: {reason}", .path.display())]
    PathInvalid { path: PathBuf, reason: String },

    /// Resume sidecar is stale, unreadable, or disagrees with the remote side
    #[error("Resume state invalid: {0}")]
    ResumeStateInvalid(String),

    /// Transfer was cancelled by its owner
    #[error("Transfer cancelled")]
    Cancelled,

    /// Encryption, decryption or padding failure
    #[error("Cipher error: {0}")]
    Cipher(String),

    /// Request or remote response failed validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Duplicate check found an existing object
    #[error("Remote object already exists: {key}")]
    RemoteConflict { key: String },

    /// Remote object does not exist
    #[error("Remote object not found: {0}")]
    NotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Manager no longer accepts work
    #[error("Transfer manager has been shut down")]
    Shutdown,

    /// Error with additional context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<ParsecError>,
    },
}

/// Retry classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connection reset, timeout, 5xx
    RetryableNetwork,
    /// Rate limit responses
    RetryableThrottle,
    /// Credentials missing or expired
    FatalAuth,
    /// Bad input, corrupt data, conflicts
    FatalValidation,
    /// Disk full, manager shut down
    FatalResource,
    /// Not a failure at all
    Cancelled,
}

impl ErrorClass {
    /// Only network and throttle failures are retried
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::RetryableNetwork | ErrorClass::RetryableThrottle
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::RetryableNetwork => write!(f, "retryable-network"),
            ErrorClass::RetryableThrottle => write!(f, "retryable-throttle"),
            ErrorClass::FatalAuth => write!(f, "fatal-auth"),
            ErrorClass::FatalValidation => write!(f, "fatal-validation"),
            ErrorClass::FatalResource => write!(f, "fatal-resource"),
            ErrorClass::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl ParsecError {
    /// Add context to an error
    pub fn context<S: Into<String>>(self, context: S) -> Self {
        ParsecError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers
    pub fn root(&self) -> &ParsecError {
        match self {
            ParsecError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classify this error for the retry policy
    pub fn class(&self) -> ErrorClass {
        match self {
            ParsecError::TransientNetwork(_) => ErrorClass::RetryableNetwork,
            ParsecError::Throttled { .. } => ErrorClass::RetryableThrottle,
            ParsecError::AuthExpired(_) => ErrorClass::FatalAuth,
            ParsecError::ChecksumMismatch { .. }
            | ParsecError::PathInvalid { .. }
            | ParsecError::ResumeStateInvalid(_)
            | ParsecError::Cipher(_)
            | ParsecError::Validation(_)
            | ParsecError::RemoteConflict { .. }
            | ParsecError::NotFound(_)
            | ParsecError::Config(_) => ErrorClass::FatalValidation,
            ParsecError::InsufficientDiskSpace { .. } | ParsecError::Shutdown => {
                ErrorClass::FatalResource
            }
            ParsecError::Cancelled => ErrorClass::Cancelled,
            ParsecError::Io(err) => classify_io(err),
            ParsecError::WithContext { source, .. } => source.class(),
        }
    }

    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Check if this error means credentials must be refreshed
    pub fn is_auth_expired(&self) -> bool {
        matches!(self.root(), ParsecError::AuthExpired(_))
    }

    /// Check if this error is a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), ParsecError::Cancelled)
    }

    /// Server-supplied retry-after hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self.root() {
            ParsecError::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Taxonomy name shown to users
    pub fn kind_name(&self) -> &'static str {
        match self {
            ParsecError::WithContext { source, .. } => source.kind_name(),
            ParsecError::TransientNetwork(_) => "TransientNetwork",
            ParsecError::Throttled { .. } => "Throttled",
            ParsecError::AuthExpired(_) => "AuthExpired",
            ParsecError::ChecksumMismatch { .. } => "ChecksumMismatch",
            ParsecError::InsufficientDiskSpace { .. } => "InsufficientDiskSpace",
            ParsecError::PathInvalid { .. } => "PathInvalid",
            ParsecError::ResumeStateInvalid(_) => "ResumeStateInvalid",
            ParsecError::Cancelled => "Cancelled",
            ParsecError::Cipher(_) => "Cipher",
            ParsecError::Validation(_) => "Validation",
            ParsecError::RemoteConflict { .. } => "RemoteConflict",
            ParsecError::NotFound(_) => "NotFound",
            ParsecError::Io(err) if err.kind() == io::ErrorKind::StorageFull => {
                "InsufficientDiskSpace"
            }
            ParsecError::Io(err) if classify_io(err).is_retryable() => "TransientNetwork",
            ParsecError::Io(_) => "Io",
            ParsecError::Config(_) => "Config",
            ParsecError::Shutdown => "Shutdown",
        }
    }

    /// Actionable hint for fatal errors
    pub fn remediation(&self) -> Option<&'static str> {
        match self.root() {
            ParsecError::InsufficientDiskSpace { .. } => Some(
                "free space on the destination volume, or lower `engine.disk_safety_margin`",
            ),
            ParsecError::PathInvalid { .. } => {
                Some("check that the local path exists, is a regular file, and is readable")
            }
            ParsecError::ChecksumMismatch { .. } => Some(
                "resubmit the transfer; the corrupt artifact and its resume state were discarded",
            ),
            ParsecError::RemoteConflict { .. } => Some(
                "choose another remote key, or set `engine.fast_mode = true` to skip the duplicate check",
            ),
            ParsecError::AuthExpired(_) => {
                Some("verify the platform API key; storage credentials could not be renewed")
            }
            ParsecError::TransientNetwork(_) | ParsecError::Throttled { .. } => Some(
                "resubmit the transfer; completed parts are kept in the resume state",
            ),
            ParsecError::Cipher(_) => {
                Some("the encrypted data is corrupt; resubmit to fetch it again")
            }
            ParsecError::Config(_) => Some("fix the configuration value named in the message"),
            _ => None,
        }
    }

    /// Build the user-visible failure report for an object
    pub fn to_failure(&self, object: impl Into<String>) -> TransferFailure {
        TransferFailure {
            object: object.into(),
            kind: self.kind_name().to_string(),
            class: self.class(),
            message: self.to_string(),
            remediation: self.remediation().map(str::to_string),
        }
    }
}

/// Classify a raw I/O error
pub fn classify_io(err: &io::Error) -> ErrorClass {
    use io::ErrorKind::*;
    match err.kind() {
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | BrokenPipe
        | TimedOut | Interrupted | WouldBlock | WriteZero | UnexpectedEof => {
            ErrorClass::RetryableNetwork
        }
        StorageFull => ErrorClass::FatalResource,
        NotFound | PermissionDenied | InvalidInput | InvalidData | AlreadyExists => {
            ErrorClass::FatalValidation
        }
        _ => ErrorClass::FatalResource,
    }
}

/// Failure details reported to callers and subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferFailure {
    /// Object that failed (remote key or local path)
    pub object: String,
    /// Taxonomy name, e.g. `InsufficientDiskSpace`
    pub kind: String,
    /// Retry classification
    pub class: ErrorClass,
    /// Full error message
    pub message: String,
    /// Actionable hint, when one exists
    pub remediation: Option<String>,
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.object, self.kind, self.message)?;
        if let Some(hint) = &self.remediation {
            write!(f, " (hint: {})", hint)?;
        }
        Ok(())
    }
}

impl From<toml::de::Error> for ParsecError {
    fn from(err: toml::de::Error) -> Self {
        ParsecError::Config(format!("TOML parse error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(ParsecError::TransientNetwork("reset".into()).is_retryable());
        assert!(ParsecError::Throttled {
            message: "slow down".into(),
            retry_after: None
        }
        .is_retryable());
        assert!(!ParsecError::AuthExpired("expired".into()).is_retryable());
        assert!(!ParsecError::Cancelled.is_retryable());
    }

    #[test]
    fn test_fatal_classes() {
        let err = ParsecError::ChecksumMismatch {
            object: "a".into(),
            expected: "x".into(),
            actual: "y".into(),
        };
        assert_eq!(err.class(), ErrorClass::FatalValidation);

        let err = ParsecError::InsufficientDiskSpace {
            path: PathBuf::from("/data"),
            required: 10,
            available: 1,
        };
        assert_eq!(err.class(), ErrorClass::FatalResource);

        let err = ParsecError::PathInvalid {
            path: PathBuf::from("/nope"),
            reason: "missing".into(),
        };
        assert_eq!(err.class(), ErrorClass::FatalValidation);
        assert_eq!(
            ParsecError::AuthExpired("x".into()).class(),
            ErrorClass::FatalAuth
        );
    }

    #[test]
    fn test_io_classification() {
        let err = ParsecError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(err.class(), ErrorClass::RetryableNetwork);

        let err = ParsecError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(err.is_retryable());

        let err = ParsecError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert_eq!(err.class(), ErrorClass::FatalValidation);

        let err = ParsecError::Io(io::Error::new(io::ErrorKind::StorageFull, "full"));
        assert_eq!(err.class(), ErrorClass::FatalResource);
        assert_eq!(err.kind_name(), "InsufficientDiskSpace");
    }

    #[test]
    fn test_context_preserves_class() {
        let err = ParsecError::Throttled {
            message: "429".into(),
            retry_after: Some(Duration::from_secs(3)),
        }
        .context("uploading part 4");

        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(err.kind_name(), "Throttled");
        assert_eq!(err.to_string(), "uploading part 4: Throttled by remote service: 429");

        let nested = ParsecError::NotFound("jobs/a".into())
            .context("reading part 2")
            .context("downloading jobs/a");
        assert_eq!(nested.kind_name(), "NotFound");
    }

    #[test]
    fn test_fatal_errors_carry_remediation() {
        let err = ParsecError::RemoteConflict {
            key: "jobs/input.tar".into(),
        };
        let failure = err.to_failure("jobs/input.tar");
        assert_eq!(failure.kind, "RemoteConflict");
        assert_eq!(failure.class, ErrorClass::FatalValidation);
        assert!(failure.remediation.unwrap().contains("engine.fast_mode"));

        let err = ParsecError::InsufficientDiskSpace {
            path: PathBuf::from("/data"),
            required: 100,
            available: 1,
        };
        assert!(err.remediation().unwrap().contains("disk_safety_margin"));
    }

    #[test]
    fn test_failure_display() {
        let failure = ParsecError::PathInvalid {
            path: PathBuf::from("/tmp/x"),
            reason: "not a regular file".into(),
        }
        .to_failure("/tmp/x");

        let text = failure.to_string();
        assert!(text.starts_with("/tmp/x [PathInvalid]: Invalid path /tmp/x: not a regular file"));
        assert!(text.contains("hint:"));
    }

    #[test]
    fn test_cancelled_is_not_failure_class() {
        assert_eq!(ParsecError::Cancelled.class(), ErrorClass::Cancelled);
        assert!(ParsecError::Cancelled.context("part 3").is_cancelled());
        assert_eq!(ParsecError::Cancelled.remediation(), None);
    }
}
