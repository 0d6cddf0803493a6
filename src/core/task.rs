/*!
 * Transfer tasks and their state machine
 *
 * ```text
 * Queued -> Initializing -> Active -> Completed | Failed | Cancelled
 *                           Active <-> Paused
 * ```
 *
 * Terminal states are irreversible. Cancellation is accepted from every
 * non-terminal state. Terminal timestamps are written exactly once.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{ParsecError, Result, TransferFailure};

/// Smoothing factor of the throughput average
const SPEED_ALPHA: f64 = 0.3;

/// Opaque task identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which way the bytes move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Initializing,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Cancelled) => true,
            (Queued, Initializing) => true,
            (Initializing, Active) => true,
            (Active, Paused) | (Paused, Active) => true,
            (Initializing | Active, Completed) => true,
            (Queued | Initializing | Active | Paused, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Queued => "queued",
            TaskState::Initializing => "initializing",
            TaskState::Active => "active",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Optional grouping of tasks submitted together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub id: String,
    pub label: String,
}

/// Point-in-time progress of a task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// 0.0 ..= 1.0
    pub fraction: f64,
    /// Smoothed throughput
    pub bytes_per_second: f64,
    pub bytes_done: u64,
    pub total: u64,
}

/// One upload or download as seen by callers
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub id: TaskId,
    pub direction: Direction,
    /// Display name (local file name)
    pub name: String,
    pub local_path: PathBuf,
    pub remote_key: String,
    /// Declared plaintext size
    pub size: u64,
    pub origin: String,
    pub batch: Option<BatchInfo>,
    state: TaskState,
    bytes_done: u64,
    bytes_per_second: f64,
    error: Option<TransferFailure>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_sample: Option<(Instant, u64)>,
}

impl TransferTask {
    pub fn new(
        direction: Direction,
        local_path: impl Into<PathBuf>,
        remote_key: impl Into<String>,
        size: u64,
        origin: impl Into<String>,
    ) -> Self {
        let local_path = local_path.into();
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| local_path.display().to_string());

        Self {
            id: TaskId::new(),
            direction,
            name,
            local_path,
            remote_key: remote_key.into(),
            size,
            origin: origin.into(),
            batch: None,
            state: TaskState::Queued,
            bytes_done: 0,
            bytes_per_second: 0.0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_sample: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn error(&self) -> Option<&TransferFailure> {
        self.error.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When the task reached its terminal state
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    /// Move to `next`, enforcing the state machine
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ParsecError::Validation(format!(
                "task {}: illegal transition {} -> {}",
                self.id, self.state, next
            )));
        }

        let now = Utc::now();
        if next == TaskState::Initializing && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
        if next == TaskState::Completed {
            self.bytes_done = self.size;
        }
        if next != TaskState::Active {
            self.last_sample = None;
        }
        self.state = next;
        Ok(())
    }

    /// Terminal failure with its report
    pub fn fail(&mut self, failure: TransferFailure) -> Result<()> {
        self.transition(TaskState::Failed)?;
        self.error = Some(failure);
        Ok(())
    }

    /// Bytes already done before this run started (resumed parts); no speed sample
    pub fn set_baseline(&mut self, bytes_done: u64) {
        self.bytes_done = self.bytes_done.max(bytes_done.min(self.size));
        self.last_sample = None;
    }

    /// Record cumulative progress; never moves backwards
    pub fn record_progress(&mut self, bytes_done: u64, now: Instant) {
        if self.state.is_terminal() {
            return;
        }
        let bytes_done = bytes_done.min(self.size).max(self.bytes_done);

        if let Some((last_at, last_bytes)) = self.last_sample {
            let elapsed = now.saturating_duration_since(last_at).as_secs_f64();
            if elapsed > 0.0 {
                let instant = (bytes_done - last_bytes) as f64 / elapsed;
                self.bytes_per_second = if self.bytes_per_second == 0.0 {
                    instant
                } else {
                    SPEED_ALPHA * instant + (1.0 - SPEED_ALPHA) * self.bytes_per_second
                };
                self.last_sample = Some((now, bytes_done));
            }
        } else {
            self.last_sample = Some((now, bytes_done));
        }

        self.bytes_done = bytes_done;
    }

    pub fn fraction(&self) -> f64 {
        if self.size == 0 {
            return if self.state == TaskState::Completed { 1.0 } else { 0.0 };
        }
        (self.bytes_done as f64 / self.size as f64).clamp(0.0, 1.0)
    }

    pub fn progress(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            fraction: self.fraction(),
            bytes_per_second: self.bytes_per_second,
            bytes_done: self.bytes_done,
            total: self.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task() -> TransferTask {
        TransferTask::new(Direction::Upload, "/data/model.h5", "jobs/model.h5", 1000, "cli")
    }

    #[test]
    fn test_happy_path() {
        let mut t = task();
        assert_eq!(t.name, "model.h5");
        assert_eq!(t.state(), TaskState::Queued);
        t.transition(TaskState::Initializing).unwrap();
        assert!(t.started_at().is_some());
        t.transition(TaskState::Active).unwrap();
        t.transition(TaskState::Paused).unwrap();
        t.transition(TaskState::Active).unwrap();
        t.transition(TaskState::Completed).unwrap();
        assert!(t.finished_at().is_some());
        assert_eq!(t.fraction(), 1.0);
    }

    #[test]
    fn test_terminal_states_are_irreversible() {
        let mut t = task();
        t.transition(TaskState::Cancelled).unwrap();
        let finished = t.finished_at();

        assert!(t.transition(TaskState::Active).is_err());
        assert!(t.transition(TaskState::Failed).is_err());
        assert!(t.transition(TaskState::Cancelled).is_err());
        assert_eq!(t.finished_at(), finished);
        assert_eq!(t.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_cancel_from_every_live_state() {
        for path in [
            vec![],
            vec![TaskState::Initializing],
            vec![TaskState::Initializing, TaskState::Active],
            vec![TaskState::Initializing, TaskState::Active, TaskState::Paused],
        ] {
            let mut t = task();
            for s in path {
                t.transition(s).unwrap();
            }
            t.transition(TaskState::Cancelled).unwrap();
        }
    }

    #[test]
    fn test_illegal_skips_rejected() {
        let mut t = task();
        assert!(t.transition(TaskState::Active).is_err());
        assert!(t.transition(TaskState::Paused).is_err());
        assert!(t.transition(TaskState::Completed).is_err());
    }

    #[test]
    fn test_progress_is_monotonic_and_smoothed() {
        let mut t = task();
        t.transition(TaskState::Initializing).unwrap();
        t.transition(TaskState::Active).unwrap();

        let start = Instant::now();
        t.record_progress(100, start);
        t.record_progress(300, start + Duration::from_secs(1));
        assert_eq!(t.bytes_done(), 300);
        assert!((t.progress().bytes_per_second - 200.0).abs() < 1e-6);

        // A late, smaller report does not move progress backwards
        t.record_progress(250, start + Duration::from_secs(2));
        assert_eq!(t.bytes_done(), 300);
        assert!(t.progress().bytes_per_second < 200.0);

        t.record_progress(5000, start + Duration::from_secs(3));
        assert_eq!(t.bytes_done(), 1000);
        assert_eq!(t.fraction(), 1.0);
    }

    #[test]
    fn test_failure_recorded_once() {
        let mut t = task();
        t.transition(TaskState::Initializing).unwrap();
        t.fail(ParsecError::Cancelled.to_failure("x")).unwrap();
        assert!(t.error().is_some());
        assert!(t.fail(ParsecError::Shutdown.to_failure("x")).is_err());
        assert_eq!(t.error().unwrap().kind, "Cancelled");
    }

    #[test]
    fn test_zero_byte_fraction() {
        let mut t = TransferTask::new(Direction::Download, "/tmp/empty", "e", 0, "gui");
        assert_eq!(t.fraction(), 0.0);
        t.transition(TaskState::Initializing).unwrap();
        t.transition(TaskState::Completed).unwrap();
        assert_eq!(t.fraction(), 1.0);
    }
}
