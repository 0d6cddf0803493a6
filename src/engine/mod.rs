/*!
 * Transfer engine: moves one file between local disk and remote storage
 *
 * A transfer is cut into fixed-size parts. Every part is independently
 * retried, gated by the API rate limiter, authorized through the shared
 * credential manager, and recorded in the resume sidecar as soon as it
 * commits. Parts run concurrently up to the job's parallelism, and each one
 * also holds a permit of the engine-wide worker pool, so the number of part
 * operations in flight never exceeds `concurrency.max_workers` no matter how
 * many transfers run at once.
 *
 * Uploads and downloads live in their own modules; this one holds the shared
 * machinery: the job description, the part scheduler and the wrapper every
 * remote call goes through.
 */

mod download;
mod upload;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::TransferConfig;
use crate::core::disk_guardian::{AvailableSpace, PlatformSpace};
use crate::core::rate_limit::{ApiRateLimiter, RequestClass};
use crate::core::resume::{CompletedChunk, ResumeState, ResumeStore};
use crate::core::retry::RetryPolicy;
use crate::core::task::{Direction, TaskId};
use crate::credentials::{CredentialLease, CredentialManager};
use crate::crypto::MasterSecret;
use crate::error::{ParsecError, Result};
use crate::remote::{CredentialIssuer, ObjectStore, StorageContext};

/// Receives progress from a running transfer, in plaintext bytes
pub trait ProgressReporter: Send + Sync {
    /// Planning finished; `resumed` bytes were already done by an earlier run
    fn started(&self, resumed: u64, total: u64);

    /// Cumulative bytes done
    fn advanced(&self, bytes_done: u64);
}

/// Reporter that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn started(&self, _resumed: u64, _total: u64) {}
    fn advanced(&self, _bytes_done: u64) {}
}

/// Pause switch honoured at part boundaries
///
/// `true` on the watched channel means paused.
#[derive(Debug, Clone, Default)]
pub struct PauseGate(Option<watch::Receiver<bool>>);

impl PauseGate {
    pub fn new(receiver: watch::Receiver<bool>) -> Self {
        Self(Some(receiver))
    }

    pub fn is_paused(&self) -> bool {
        self.0.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Wait until not paused; cancellation wins
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(receiver) = &self.0 else {
            return Ok(());
        };
        let mut receiver = receiver.clone();
        loop {
            if !*receiver.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ParsecError::Cancelled),
                changed = receiver.changed() => {
                    // Sender gone: nobody can pause us any more
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// One transfer to execute
pub struct TransferJob {
    pub task_id: TaskId,
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_key: String,
    /// Plaintext size the caller expects
    pub declared_size: u64,
    /// Concurrent parts for this transfer
    pub parallelism: usize,
    pub cancel: CancellationToken,
    pub pause: PauseGate,
    pub reporter: Arc<dyn ProgressReporter>,
}

impl TransferJob {
    pub fn new(
        direction: Direction,
        local_path: impl Into<PathBuf>,
        remote_key: impl Into<String>,
        declared_size: u64,
    ) -> Self {
        Self {
            task_id: TaskId::new(),
            direction,
            local_path: local_path.into(),
            remote_key: remote_key.into(),
            declared_size,
            parallelism: 1,
            cancel: CancellationToken::new(),
            pause: PauseGate::default(),
            reporter: Arc::new(NoopReporter),
        }
    }

    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_pause(mut self, pause: PauseGate) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Object identity used in failure reports
    pub fn object_name(&self) -> String {
        match self.direction {
            Direction::Upload => self.remote_key.clone(),
            Direction::Download => self.local_path.display().to_string(),
        }
    }
}

/// Result of a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Plaintext bytes
    pub bytes: u64,
    /// SHA-512 hex of the plaintext
    pub checksum: String,
    /// Parts moved over the wire by this run
    pub parts_written: usize,
    /// Parts reused from an earlier run
    pub resumed_parts: usize,
    /// Integrity token of the remote object
    pub remote_etag: String,
}

/// Executes transfers against one platform
///
/// Cheap to clone; clones share the credential cache, the rate limiter and
/// the worker pool.
#[derive(Clone)]
pub struct TransferEngine {
    config: Arc<TransferConfig>,
    store: Arc<dyn ObjectStore>,
    credentials: Arc<CredentialManager>,
    limiter: Arc<ApiRateLimiter>,
    retry: RetryPolicy,
    workers: Arc<Semaphore>,
    resume: ResumeStore,
    space: Arc<dyn AvailableSpace>,
    master: Arc<MasterSecret>,
}

impl TransferEngine {
    pub fn new(
        config: Arc<TransferConfig>,
        store: Arc<dyn ObjectStore>,
        issuer: Arc<dyn CredentialIssuer>,
        master: MasterSecret,
    ) -> Result<Self> {
        config.validate()?;

        let limiter = Arc::new(ApiRateLimiter::new(&config.rate_limit)?);
        let credentials = Arc::new(CredentialManager::new(
            issuer,
            Arc::clone(&limiter),
            &config.credentials,
            &config.retry,
        ));

        Ok(Self {
            retry: RetryPolicy::from_config(&config.retry),
            workers: Arc::new(Semaphore::new(config.concurrency.max_workers)),
            resume: ResumeStore::from_config(&config.engine),
            space: Arc::new(PlatformSpace),
            master: Arc::new(master),
            store,
            credentials,
            limiter,
            config,
        })
    }

    /// Replace the free-space source
    pub fn with_space(mut self, space: Arc<dyn AvailableSpace>) -> Self {
        self.space = space;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Engine-wide worker pool
    pub fn workers(&self) -> &Arc<Semaphore> {
        &self.workers
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub fn limiter(&self) -> &Arc<ApiRateLimiter> {
        &self.limiter
    }

    pub fn resume_store(&self) -> &ResumeStore {
        &self.resume
    }

    /// Run one transfer to completion, failure or cancellation
    pub async fn run(&self, job: &TransferJob) -> Result<TransferOutcome> {
        let span = info_span!(
            "transfer",
            task_id = %job.task_id,
            direction = %job.direction,
            key = %job.remote_key
        );

        async {
            if job.cancel.is_cancelled() {
                return Err(ParsecError::Cancelled);
            }
            match job.direction {
                Direction::Upload => self.upload(job).await,
                Direction::Download => self.download(job).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Part size for an object of `total` stored bytes
    ///
    /// Objects at or under the multipart threshold travel as one part.
    fn chunk_size_for(&self, total: u64) -> u64 {
        if total > self.config.engine.multipart_threshold {
            self.config.engine.chunk_size
        } else {
            total.max(1)
        }
    }

    /// Lease-less platform call (metadata lookups)
    async fn platform_call<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let limiter = &self.limiter;
        let op = &op;
        self.retry
            .run(label, cancel, move |_| async move {
                limiter.acquire(RequestClass::General, cancel).await?;
                op().await
            })
            .await
    }

    /// Storage call made with a lease for `storage`
    ///
    /// A rejected lease is evicted before the error reaches the retry loop,
    /// so the single extra attempt it grants runs with fresh credentials.
    async fn storage_call<T, F, Fut>(
        &self,
        label: &str,
        class: RequestClass,
        storage: &StorageContext,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: Fn(Arc<CredentialLease>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let limiter = &self.limiter;
        let credentials = &self.credentials;
        let op = &op;
        self.retry
            .run(label, cancel, move |_| async move {
                limiter.acquire(class, cancel).await?;
                let lease = credentials.get(storage, cancel).await?;
                let result = op(Arc::clone(&lease)).await;
                if let Err(err) = &result {
                    if err.is_auth_expired() {
                        credentials.invalidate(storage, &lease);
                    }
                }
                result
            })
            .await
    }

    /// Run every pending part of `state`, recording each as it commits
    ///
    /// `op` builds the future for one part index. The state is persisted
    /// after every committed part. Returns the number of parts moved.
    async fn run_parts<F, Fut>(
        &self,
        job: &TransferJob,
        state: &mut ResumeState,
        op: F,
    ) -> Result<usize>
    where
        F: Fn(u32, CancellationToken) -> Fut,
        Fut: Future<Output = Result<CompletedChunk>> + Send + 'static,
    {
        let pending = state.pending_parts();
        if pending.is_empty() {
            return Ok(0);
        }

        let parallelism = job.parallelism.max(1);
        let cancel = job.cancel.child_token();
        let mut set: JoinSet<Result<CompletedChunk>> = JoinSet::new();
        let mut progress = PartProgress::default();

        debug!(
            pending = pending.len(),
            parts = state.part_count(),
            parallelism,
            "scheduling parts"
        );

        for index in pending {
            while set.len() >= parallelism {
                match set.join_next().await {
                    Some(joined) => self.absorb(joined, job, state, &mut progress, &cancel),
                    None => break,
                }
            }
            if progress.failure.is_some() {
                break;
            }

            // Chunk boundary: honour pause and cancellation before taking a worker
            if let Err(err) = job.pause.wait(&cancel).await {
                progress.note_failure(err);
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    progress.note_failure(ParsecError::Cancelled);
                    break;
                }
                permit = Arc::clone(&self.workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        progress.note_failure(ParsecError::Shutdown);
                        break;
                    }
                },
            };

            let part = op(index, cancel.clone());
            let part_cancel = cancel.clone();
            set.spawn(async move {
                let _permit = permit;
                tokio::select! {
                    biased;
                    _ = part_cancel.cancelled() => Err(ParsecError::Cancelled),
                    result = part => result,
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            self.absorb(joined, job, state, &mut progress, &cancel);
        }

        if job.cancel.is_cancelled() {
            return Err(ParsecError::Cancelled);
        }
        match progress.failure {
            Some(err) => Err(err),
            None => Ok(progress.written),
        }
    }

    fn absorb(
        &self,
        joined: std::result::Result<Result<CompletedChunk>, JoinError>,
        job: &TransferJob,
        state: &mut ResumeState,
        progress: &mut PartProgress,
        cancel: &CancellationToken,
    ) {
        match joined {
            Ok(Ok(chunk)) => {
                let index = chunk.index;
                state.record_part(chunk);
                progress.written += 1;
                if let Err(err) = self.resume.save(state) {
                    warn!(part = index, error = %err, "failed to persist resume state");
                    progress.note_failure(err);
                    cancel.cancel();
                    return;
                }
                debug!(
                    part = index,
                    bytes = state.bytes_transferred,
                    total = state.total_size,
                    "part committed"
                );
                job.reporter.advanced(plaintext_done(state));
            }
            Ok(Err(err)) => {
                if !err.is_cancelled() {
                    warn!(error = %err, "part failed, stopping transfer");
                }
                progress.note_failure(err);
                cancel.cancel();
            }
            Err(join_err) => {
                progress.note_failure(ParsecError::Validation(format!(
                    "part worker panicked: {}",
                    join_err
                )));
                cancel.cancel();
            }
        }
    }

    fn persist_or_discard(&self, state: &ResumeState, err: &ParsecError) {
        if matches!(err.root(), ParsecError::ChecksumMismatch { .. }) {
            self.discard_state(&state.local_path);
            return;
        }
        if state.completed_parts.is_empty() {
            return;
        }
        match self.resume.save(state) {
            Ok(()) => debug!(
                parts = state.completed_parts.len(),
                bytes = state.bytes_transferred,
                "resume state kept for the next attempt"
            ),
            Err(save_err) => warn!(error = %save_err, "failed to persist resume state"),
        }
    }

    fn discard_state(&self, local_path: &Path) {
        if let Err(err) = self.resume.remove(local_path) {
            warn!(path = %local_path.display(), error = %err, "failed to delete resume state");
        }
    }
}

#[derive(Default)]
struct PartProgress {
    written: usize,
    failure: Option<ParsecError>,
}

impl PartProgress {
    /// Keep the first real failure; cancellations caused by it do not replace it
    fn note_failure(&mut self, err: ParsecError) {
        match &self.failure {
            None => self.failure = Some(err),
            Some(current) if current.is_cancelled() && !err.is_cancelled() => {
                self.failure = Some(err)
            }
            Some(_) => {}
        }
    }
}

/// Stored-byte progress mapped onto plaintext bytes
fn plaintext_done(state: &ResumeState) -> u64 {
    if state.total_size == 0 {
        return 0;
    }
    let scaled =
        state.bytes_transferred as u128 * state.plaintext_size as u128 / state.total_size as u128;
    (scaled as u64).min(state.plaintext_size)
}

/// `<dir>/<file name>.<extension>` beside `path`
fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

/// Remove a scratch file, ignoring absence
fn remove_scratch(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove scratch file");
        }
    }
}

/// Run blocking file work off the async workers
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ParsecError::Validation(format!("blocking worker failed: {}", e)))?
}
