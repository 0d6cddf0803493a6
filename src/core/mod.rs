/*!
 * Core building blocks shared by the engine and the manager
 */

pub mod checksum;
pub mod disk_guardian;
pub mod events;
pub mod rate_limit;
pub mod resume;
pub mod retry;
pub mod task;

pub use checksum::StreamingHasher;
pub use disk_guardian::{AvailableSpace, PlatformSpace};
pub use events::{EventBus, EventClass, EventStream, ManagerStats, TransferEvent};
pub use rate_limit::{ApiRateLimiter, RequestClass};
pub use resume::{CompletedChunk, ResumeState, ResumeStore};
pub use retry::RetryPolicy;
pub use task::{BatchInfo, Direction, ProgressSnapshot, TaskId, TaskState, TransferTask};
