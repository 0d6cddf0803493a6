/*!
 * Transfer manager: the task queue in front of the engine
 *
 * The manager owns every [`TransferTask`]. Submitted tasks wait for one of
 * `concurrency.max_concurrent_transfers` slots, receive a worker allocation
 * sized by file size and free capacity, and run on the shared
 * [`TransferEngine`]. Task bookkeeping sits behind one synchronous lock that
 * is never held across an await; events are built under the lock and
 * published after it is released, so a slow subscriber can never stall a
 * transfer.
 *
 * # Example
 *
 * ```no_run
 * use std::sync::Arc;
 * use parsec::{
 *     Direction, MasterSecret, MemoryPlatform, TransferConfig, TransferManager, TransferRequest,
 * };
 *
 * # async fn example() -> parsec::Result<()> {
 * let platform = Arc::new(MemoryPlatform::new());
 * let manager = TransferManager::new(
 *     TransferConfig::default(),
 *     platform.clone(),
 *     platform,
 *     MasterSecret::generate(),
 * )?;
 *
 * let handle = manager.submit(TransferRequest::new(
 *     Direction::Upload,
 *     "/data/run-42/mesh.h5",
 *     "jobs/run-42/mesh.h5",
 *     1_073_741_824,
 *     "cli",
 * ))?;
 * manager.wait(&handle).await?;
 * # Ok(())
 * # }
 * ```
 */

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::core::events::{
    now_millis, EventBus, EventClass, EventStream, ManagerStats, TransferEvent,
};
use crate::core::task::{BatchInfo, Direction, ProgressSnapshot, TaskId, TaskState, TransferTask};
use crate::crypto::MasterSecret;
use crate::engine::{PauseGate, ProgressReporter, TransferEngine, TransferJob, TransferOutcome};
use crate::error::{ParsecError, Result};
use crate::remote::{CredentialIssuer, ObjectStore};

const GIB: u64 = 1024 * 1024 * 1024;

/// Scheduling priority of an allocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Half the usual share
    Low,
    #[default]
    Normal,
    /// Ignores current utilisation
    High,
}

/// Worker sub-allocation for one transfer
///
/// Released exactly once: by [`Allocation::complete`] or on drop.
#[derive(Debug)]
pub struct Allocation {
    workers: usize,
    pool: Arc<Mutex<usize>>,
    released: AtomicBool,
}

impl Allocation {
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Return the workers to the pool; later calls do nothing
    pub fn complete(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            let mut allocated = self.pool.lock();
            *allocated = allocated.saturating_sub(self.workers);
        }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Workers a file of `size` bytes asks for before capacity is considered
pub fn workers_for_size(size: u64, multipart_threshold: u64, per_file_max: usize) -> usize {
    let wanted = if size <= multipart_threshold {
        1
    } else if size < GIB {
        3
    } else if size < 5 * GIB {
        5
    } else {
        per_file_max
    };
    wanted.clamp(1, per_file_max.max(1))
}

/// What to transfer
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_key: String,
    /// Declared plaintext size
    pub size: u64,
    /// Free-form provenance tag
    pub origin: String,
    pub batch: Option<BatchInfo>,
    pub priority: Priority,
}

impl TransferRequest {
    pub fn new(
        direction: Direction,
        local_path: impl Into<PathBuf>,
        remote_key: impl Into<String>,
        size: u64,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            direction,
            local_path: local_path.into(),
            remote_key: remote_key.into(),
            size,
            origin: origin.into(),
            batch: None,
            priority: Priority::Normal,
        }
    }

    pub fn with_batch(mut self, id: impl Into<String>, label: impl Into<String>) -> Self {
        self.batch = Some(BatchInfo {
            id: id.into(),
            label: label.into(),
        });
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Caller's reference to a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(TaskId);

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.0
    }
}

struct TaskEntry {
    task: TransferTask,
    priority: Priority,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    finished: watch::Receiver<bool>,
}

#[derive(Default)]
struct TaskTable {
    entries: HashMap<TaskId, TaskEntry>,
    order: Vec<TaskId>,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

struct ManagerInner {
    engine: TransferEngine,
    events: EventBus,
    slots: Arc<Semaphore>,
    allocated: Arc<Mutex<usize>>,
    tasks: Mutex<TaskTable>,
    shutdown: CancellationToken,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

/// Task queue, concurrency control and event fan-out
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<ManagerInner>,
}

impl TransferManager {
    /// Build the engine and the manager; must run inside a Tokio runtime
    pub fn new(
        config: TransferConfig,
        store: Arc<dyn ObjectStore>,
        issuer: Arc<dyn CredentialIssuer>,
        master: MasterSecret,
    ) -> Result<Self> {
        let engine = TransferEngine::new(Arc::new(config), store, issuer, master)?;
        Ok(Self::with_engine(engine))
    }

    /// Manager around an existing engine; must run inside a Tokio runtime
    pub fn with_engine(engine: TransferEngine) -> Self {
        let config = engine.config();
        let max_transfers = config.concurrency.max_concurrent_transfers;
        let capacity = config.events.channel_capacity;
        let shutdown = CancellationToken::new();
        let refresher = engine
            .credentials()
            .spawn_refresher(config.credentials.refresh_interval(), shutdown.child_token());

        info!(
            max_transfers,
            max_workers = config.concurrency.max_workers,
            "transfer manager started"
        );

        Self {
            inner: Arc::new(ManagerInner {
                events: EventBus::new(capacity),
                slots: Arc::new(Semaphore::new(max_transfers)),
                allocated: Arc::new(Mutex::new(0)),
                tasks: Mutex::new(TaskTable::default()),
                refresher: Mutex::new(Some(refresher)),
                shutdown,
                engine,
            }),
        }
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.inner.engine
    }

    /// Queue a transfer; it starts once a transfer slot is free
    pub fn submit(&self, request: TransferRequest) -> Result<TaskHandle> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ParsecError::Shutdown);
        }

        let mut task = TransferTask::new(
            request.direction,
            request.local_path,
            request.remote_key,
            request.size,
            request.origin,
        );
        task.batch = request.batch;
        let id = task.id;

        let cancel = self.inner.shutdown.child_token();
        let (pause_tx, pause_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);

        let queued = TransferEvent::Queued {
            task_id: id,
            name: task.name.clone(),
            direction: task.direction,
            total_bytes: task.size,
            timestamp: now_millis(),
        };
        debug!(task_id = %id, key = %task.remote_key, direction = %task.direction, "task queued");

        {
            let mut tasks = self.inner.tasks.lock();
            tasks.order.push(id);
            tasks.entries.insert(
                id,
                TaskEntry {
                    task,
                    priority: request.priority,
                    cancel: cancel.clone(),
                    pause: pause_tx,
                    finished: finished_rx,
                },
            );
        }
        self.inner.events.publish(queued);
        self.inner.publish_stats();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.drive(id, cancel, pause_rx).await;
            let _ = finished_tx.send(true);
        });

        Ok(TaskHandle(id))
    }

    /// Cancel a task; it becomes `Cancelled` immediately
    pub fn cancel(&self, handle: &TaskHandle) -> Result<()> {
        let event = {
            let mut tasks = self.inner.tasks.lock();
            let table = &mut *tasks;
            let entry = table
                .entries
                .get_mut(&handle.0)
                .ok_or_else(|| unknown_task(handle))?;
            if entry.task.state().is_terminal() {
                return Ok(());
            }
            entry.task.transition(TaskState::Cancelled)?;
            entry.cancel.cancel();
            table.cancelled += 1;
            TransferEvent::Cancelled {
                task_id: handle.0,
                bytes_transferred: entry.task.bytes_done(),
                timestamp: now_millis(),
            }
        };

        info!(task_id = %handle.0, "task cancelled");
        self.inner.events.publish(event);
        self.inner.publish_stats();
        Ok(())
    }

    /// Stop an active task at its next part boundary
    pub fn pause(&self, handle: &TaskHandle) -> Result<()> {
        self.inner.set_paused(handle, true)
    }

    /// Let a paused task continue
    pub fn resume(&self, handle: &TaskHandle) -> Result<()> {
        self.inner.set_paused(handle, false)
    }

    pub fn state(&self, handle: &TaskHandle) -> Option<TaskState> {
        self.inner
            .tasks
            .lock()
            .entries
            .get(&handle.0)
            .map(|entry| entry.task.state())
    }

    pub fn progress(&self, handle: &TaskHandle) -> Option<ProgressSnapshot> {
        self.inner
            .tasks
            .lock()
            .entries
            .get(&handle.0)
            .map(|entry| entry.task.progress())
    }

    /// Snapshot of one task
    pub fn task(&self, handle: &TaskHandle) -> Option<TransferTask> {
        self.inner
            .tasks
            .lock()
            .entries
            .get(&handle.0)
            .map(|entry| entry.task.clone())
    }

    /// Snapshots of all visible tasks, in submission order
    pub fn tasks(&self) -> Vec<TransferTask> {
        let tasks = self.inner.tasks.lock();
        tasks
            .order
            .iter()
            .filter_map(|id| tasks.entries.get(id))
            .map(|entry| entry.task.clone())
            .collect()
    }

    pub fn subscribe(&self, class: EventClass) -> EventStream {
        self.inner.events.subscribe(class)
    }

    pub fn stats(&self) -> ManagerStats {
        self.inner.stats()
    }

    /// Compute a worker allocation for a file of `size` bytes
    pub fn allocate_transfer(&self, size: u64, priority: Priority) -> Result<Allocation> {
        self.inner.allocate(size, priority)
    }

    /// Wait until the task has finished, including its cleanup
    pub async fn wait(&self, handle: &TaskHandle) -> Result<TaskState> {
        let mut finished = {
            let tasks = self.inner.tasks.lock();
            tasks
                .entries
                .get(&handle.0)
                .map(|entry| entry.finished.clone())
                .ok_or_else(|| unknown_task(handle))?
        };

        while !*finished.borrow_and_update() {
            if finished.changed().await.is_err() {
                break;
            }
        }

        self.state(handle).ok_or_else(|| unknown_task(handle))
    }

    /// Drop terminal tasks from the visible set
    pub fn purge_terminal(&self) -> usize {
        let mut tasks = self.inner.tasks.lock();
        let table = &mut *tasks;
        let before = table.entries.len();
        table
            .entries
            .retain(|_, entry| !entry.task.state().is_terminal());
        let entries = &table.entries;
        table.order.retain(|id| entries.contains_key(id));
        before - table.entries.len()
    }

    /// Cancel every task and stop accepting work
    ///
    /// Returns once every running task has finished its cleanup.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("transfer manager shutting down");

        let handles: Vec<TaskHandle> = {
            let tasks = self.inner.tasks.lock();
            tasks.order.iter().copied().map(TaskHandle).collect()
        };
        for handle in &handles {
            if let Err(err) = self.cancel(handle) {
                debug!(task_id = %handle.0, error = %err, "cancel during shutdown failed");
            }
        }
        self.inner.shutdown.cancel();

        for handle in &handles {
            let _ = self.wait(handle).await;
        }

        let refresher = self.inner.refresher.lock().take();
        if let Some(refresher) = refresher {
            let _ = refresher.await;
        }
    }
}

fn unknown_task(handle: &TaskHandle) -> ParsecError {
    ParsecError::Validation(format!("unknown task {}", handle.0))
}

impl ManagerInner {
    async fn drive(
        self: Arc<Self>,
        id: TaskId,
        cancel: CancellationToken,
        pause: watch::Receiver<bool>,
    ) {
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let (job, priority) = {
            let mut tasks = self.tasks.lock();
            let Some(entry) = tasks.entries.get_mut(&id) else {
                return;
            };
            if entry.task.transition(TaskState::Initializing).is_err() {
                return;
            }
            let task = &entry.task;
            let job = TransferJob::new(
                task.direction,
                &task.local_path,
                &task.remote_key,
                task.size,
            )
            .with_task_id(id)
            .with_cancel(cancel.clone())
            .with_pause(PauseGate::new(pause));
            (job, entry.priority)
        };
        self.publish_stats();

        let result = match self.allocate(job.declared_size, priority) {
            Ok(allocation) => {
                let job = job
                    .with_parallelism(allocation.workers())
                    .with_reporter(Arc::new(TaskReporter {
                        inner: Arc::clone(&self),
                        id,
                    }));
                debug!(task_id = %id, workers = allocation.workers(), "transfer starting");
                let result = self.engine.run(&job).await;
                allocation.complete();
                result.map_err(|err| (err, job.object_name()))
            }
            Err(err) => {
                let object = job.object_name();
                Err((err, object))
            }
        };
        drop(slot);

        self.finish(id, result);
        self.publish_stats();
    }

    fn finish(
        &self,
        id: TaskId,
        result: std::result::Result<TransferOutcome, (ParsecError, String)>,
    ) {
        let event = {
            let mut tasks = self.tasks.lock();
            let table = &mut *tasks;
            let Some(entry) = table.entries.get_mut(&id) else {
                return;
            };
            let task = &mut entry.task;
            if task.state().is_terminal() {
                // Cancelled while the engine was winding down
                return;
            }

            match result {
                Ok(outcome) => {
                    if task.state() == TaskState::Paused {
                        let _ = task.transition(TaskState::Active);
                    }
                    if let Err(err) = task.transition(TaskState::Completed) {
                        warn!(task_id = %id, error = %err, "cannot complete task");
                        return;
                    }
                    table.completed += 1;
                    let duration_ms = task
                        .started_at()
                        .zip(task.finished_at())
                        .map(|(start, end)| (end - start).num_milliseconds().max(0) as u64)
                        .unwrap_or(0);
                    info!(task_id = %id, bytes = outcome.bytes, duration_ms, "task completed");
                    TransferEvent::Completed {
                        task_id: id,
                        total_bytes: outcome.bytes,
                        duration_ms,
                        checksum: Some(outcome.checksum),
                        timestamp: now_millis(),
                    }
                }
                Err((err, _)) if err.is_cancelled() => {
                    if task.transition(TaskState::Cancelled).is_err() {
                        return;
                    }
                    table.cancelled += 1;
                    TransferEvent::Cancelled {
                        task_id: id,
                        bytes_transferred: task.bytes_done(),
                        timestamp: now_millis(),
                    }
                }
                Err((err, object)) => {
                    let failure = err.to_failure(object);
                    warn!(task_id = %id, failure = %failure, "task failed");
                    if task.fail(failure.clone()).is_err() {
                        return;
                    }
                    table.failed += 1;
                    TransferEvent::Failed {
                        task_id: id,
                        failure,
                        bytes_transferred: task.bytes_done(),
                        timestamp: now_millis(),
                    }
                }
            }
        };
        self.events.publish(event);
    }

    fn allocate(&self, size: u64, priority: Priority) -> Result<Allocation> {
        if self.shutdown.is_cancelled() {
            return Err(ParsecError::Shutdown);
        }

        let config = self.engine.config();
        let per_file = config.concurrency.max_workers_per_file;
        let mut wanted = workers_for_size(size, config.engine.multipart_threshold, per_file);
        if priority == Priority::Low {
            wanted = (wanted / 2).max(1);
        }

        let mut allocated = self.allocated.lock();
        let workers = match priority {
            Priority::High => wanted,
            Priority::Normal | Priority::Low => {
                let free = config.concurrency.max_workers.saturating_sub(*allocated);
                wanted.min(free).max(1)
            }
        }
        .clamp(1, per_file.max(1));
        *allocated += workers;

        Ok(Allocation {
            workers,
            pool: Arc::clone(&self.allocated),
            released: AtomicBool::new(false),
        })
    }

    fn set_paused(&self, handle: &TaskHandle, paused: bool) -> Result<()> {
        let (from, to) = if paused {
            (TaskState::Active, TaskState::Paused)
        } else {
            (TaskState::Paused, TaskState::Active)
        };

        let event = {
            let mut tasks = self.tasks.lock();
            let entry = tasks
                .entries
                .get_mut(&handle.0)
                .ok_or_else(|| unknown_task(handle))?;
            if entry.task.state() == to {
                return Ok(());
            }
            if entry.task.state() != from {
                return Err(ParsecError::Validation(format!(
                    "task {} is {}, cannot move to {}",
                    handle.0,
                    entry.task.state(),
                    to
                )));
            }
            entry.task.transition(to)?;
            entry.pause.send_replace(paused);
            progress_event(&entry.task)
        };

        debug!(task_id = %handle.0, paused, "pause state changed");
        self.events.publish(event);
        Ok(())
    }

    fn stats(&self) -> ManagerStats {
        let total_slots = self.engine.config().concurrency.max_workers;
        let active_slots = total_slots.saturating_sub(self.engine.workers().available_permits());

        let tasks = self.tasks.lock();
        let mut stats = ManagerStats {
            total_slots,
            active_slots,
            completed: tasks.completed,
            failed: tasks.failed,
            cancelled: tasks.cancelled,
            ..ManagerStats::default()
        };
        for entry in tasks.entries.values() {
            match entry.task.state() {
                TaskState::Queued => stats.queued_transfers += 1,
                TaskState::Initializing | TaskState::Active | TaskState::Paused => {
                    stats.active_transfers += 1
                }
                _ => {}
            }
        }
        stats
    }

    fn publish_stats(&self) {
        let stats = self.stats();
        self.events.publish(TransferEvent::QueueStatsUpdated {
            stats,
            timestamp: now_millis(),
        });
    }
}

fn progress_event(task: &TransferTask) -> TransferEvent {
    let progress = task.progress();
    TransferEvent::Progress {
        task_id: task.id,
        state: task.state(),
        bytes_transferred: progress.bytes_done,
        total_bytes: progress.total,
        bytes_per_second: progress.bytes_per_second,
        timestamp: now_millis(),
    }
}

/// Feeds engine progress into the task table
struct TaskReporter {
    inner: Arc<ManagerInner>,
    id: TaskId,
}

impl ProgressReporter for TaskReporter {
    fn started(&self, resumed: u64, total: u64) {
        let event = {
            let mut tasks = self.inner.tasks.lock();
            let Some(entry) = tasks.entries.get_mut(&self.id) else {
                return;
            };
            if entry.task.state() != TaskState::Initializing
                || entry.task.transition(TaskState::Active).is_err()
            {
                return;
            }
            entry.task.set_baseline(resumed);
            TransferEvent::Started {
                task_id: self.id,
                resumed_bytes: resumed,
                total_bytes: total,
                timestamp: now_millis(),
            }
        };
        self.inner.events.publish(event);
    }

    fn advanced(&self, bytes_done: u64) {
        let event = {
            let mut tasks = self.inner.tasks.lock();
            let Some(entry) = tasks.entries.get_mut(&self.id) else {
                return;
            };
            if entry.task.state().is_terminal() {
                return;
            }
            entry.task.record_progress(bytes_done, Instant::now());
            progress_event(&entry.task)
        };
        self.inner.events.publish(event);
    }
}
