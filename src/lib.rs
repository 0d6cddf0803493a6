/*!
 * Parsec - resilient chunked transfer engine
 *
 * Moves large files between local disk and a remote object platform:
 * - Chunked parallel uploads and downloads with a global worker pool
 * - Resume from a sidecar state file after crashes or cancellation
 * - Streaming AES-256-CBC encryption with per-object derived keys
 * - SHA-512 end-to-end integrity checks
 * - Two-class adaptive rate limiting with throttle back-off
 * - Short-lived storage credentials renewed in the background
 * - Task queue with lifecycle and progress events
 */

pub mod config;
pub mod core;
pub mod credentials;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod logging;
pub mod manager;
pub mod remote;

// Re-export commonly used types
pub use config::TransferConfig;
pub use core::{
    Direction, EventClass, EventStream, ManagerStats, ProgressSnapshot, TaskId, TaskState,
    TransferEvent, TransferTask,
};
pub use credentials::{CredentialLease, CredentialManager};
pub use crypto::MasterSecret;
pub use engine::{PauseGate, ProgressReporter, TransferEngine, TransferJob, TransferOutcome};
pub use error::{ErrorClass, ParsecError, Result, TransferFailure};
pub use manager::{Allocation, Priority, TaskHandle, TransferManager, TransferRequest};
pub use remote::{CredentialIssuer, MemoryPlatform, ObjectStore, StorageContext};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
