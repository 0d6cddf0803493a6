//! Upload pipeline
//!
//! The plaintext is encrypted once into a staging artifact (or, with
//! encryption off, read straight from the local file) while its SHA-512 is
//! computed. Parts are cut from that artifact. Small objects go up in a single
//! put; larger ones through a multipart session whose id is kept in the
//! resume state so an interrupted upload can pick up the parts the platform
//! already holds.

use bytes::Bytes;
use std::fs::File;
use std::io::{BufReader, BufWriter, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{blocking, plaintext_done, remove_scratch, TransferEngine, TransferJob, TransferOutcome};
use crate::core::checksum::{checksum_file, checksums_match, StreamingHasher};
use crate::core::disk_guardian::ensure_sufficient_space;
use crate::core::rate_limit::RequestClass;
use crate::core::resume::{part_len, CompletedChunk, ResumeState};
use crate::core::task::Direction;
use crate::crypto::{self, derive_key, DerivedKey, StreamingCipher};
use crate::error::{ParsecError, Result};
use crate::remote::{CompletedPart, ObjectMetadata, RemoteObject, StorageContext};

const ARTIFACT_EXTENSION: &str = "parsec-enc";

struct UploadPlan {
    state: ResumeState,
    /// Bytes that go on the wire
    artifact: PathBuf,
    /// Artifact is a staging file we own
    staged: bool,
    multipart: bool,
    resumed: bool,
    resumed_parts: usize,
}

impl UploadPlan {
    fn metadata(&self) -> ObjectMetadata {
        let encrypted = self.state.encryption.is_some();
        ObjectMetadata {
            plaintext_size: self.state.plaintext_size,
            plaintext_checksum: self.state.plaintext_checksum.clone(),
            encryption: self.state.encryption.clone(),
            suffix: encrypted.then(|| self.state.suffix.clone()),
        }
    }
}

impl TransferEngine {
    pub(super) async fn upload(&self, job: &TransferJob) -> Result<TransferOutcome> {
        let plaintext_size = self.inspect_source(job).await?;

        let store = &self.store;
        let key = job.remote_key.as_str();
        let storage = self
            .platform_call("upload_target", &job.cancel, || store.upload_target(key))
            .await?;

        let mut plan = match self.resume_upload(job, plaintext_size, &storage).await? {
            Some(plan) => plan,
            None => self.fresh_upload(job, plaintext_size, storage.clone()).await?,
        };
        job.reporter.started(plaintext_done(&plan.state), plaintext_size);

        let result = match self.execute_upload(job, &mut plan).await {
            Err(err)
                if plan.resumed && matches!(err.root(), ParsecError::ResumeStateInvalid(_)) =>
            {
                warn!(
                    error = %err,
                    "resumed upload rejected by the platform, restarting from scratch"
                );
                self.abandon_upload(&plan.state, &plan.artifact, plan.staged).await;
                plan = self.fresh_upload(job, plaintext_size, storage).await?;
                self.execute_upload(job, &mut plan).await
            }
            other => other,
        };

        match result {
            Ok(outcome) => {
                self.discard_state(&job.local_path);
                if plan.staged {
                    remove_scratch(&plan.artifact);
                }
                info!(
                    bytes = outcome.bytes,
                    parts_written = outcome.parts_written,
                    resumed_parts = outcome.resumed_parts,
                    etag = %outcome.remote_etag,
                    "upload complete"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.persist_or_discard(&plan.state, &err);
                let corrupt = matches!(err.root(), ParsecError::ChecksumMismatch { .. });
                if corrupt || plan.state.completed_parts.is_empty() {
                    // Nothing worth resuming: drop the session and the artifact
                    if plan.staged {
                        remove_scratch(&plan.artifact);
                    }
                    if let Some(upload_id) = &plan.state.session_id {
                        self.abort_quietly(&plan.state.storage, key, upload_id).await;
                    }
                }
                Err(err)
            }
        }
    }

    /// Check the local file and return its size
    async fn inspect_source(&self, job: &TransferJob) -> Result<u64> {
        let path = &job.local_path;
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ParsecError::PathInvalid {
                    path: path.clone(),
                    reason: "file does not exist".into(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        if !metadata.is_file() {
            return Err(ParsecError::PathInvalid {
                path: path.clone(),
                reason: "not a regular file".into(),
            });
        }
        if metadata.len() != job.declared_size {
            return Err(ParsecError::Validation(format!(
                "{} is {} bytes, but {} bytes were declared",
                path.display(),
                metadata.len(),
                job.declared_size
            )));
        }
        Ok(metadata.len())
    }

    /// Plan from an existing resume sidecar, if it still describes this upload
    async fn resume_upload(
        &self,
        job: &TransferJob,
        plaintext_size: u64,
        storage: &StorageContext,
    ) -> Result<Option<UploadPlan>> {
        let mut state = match self.resume.load(&job.local_path) {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(None),
            Err(err) if matches!(err.root(), ParsecError::ResumeStateInvalid(_)) => {
                warn!(error = %err, "resume state unusable, restarting upload");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let staged = state.encryption.is_some();
        let artifact = if staged {
            self.stage_path(&job.local_path, &state.suffix)?
        } else {
            job.local_path.clone()
        };

        if let Err(reason) = self
            .check_upload_state(job, plaintext_size, storage, &state, &artifact)
            .await
        {
            info!(reason = %reason, "resume state does not match this upload, restarting");
            self.abandon_upload(&state, &artifact, staged).await;
            return Ok(None);
        }

        // Keep only parts the platform still holds with the same content
        if let (Some(upload_id), false) = (state.session_id.clone(), state.is_complete()) {
            let store = &self.store;
            let key = job.remote_key.as_str();
            let id = upload_id.as_str();
            let listed = self
                .storage_call(
                    "list_parts",
                    RequestClass::General,
                    storage,
                    &job.cancel,
                    move |lease| async move { store.list_parts(&lease, key, id).await },
                )
                .await;

            match listed {
                Ok(remote) => {
                    let before = state.completed_parts.len();
                    state.retain_parts(|chunk| {
                        remote
                            .iter()
                            .any(|p| p.part_number == chunk.index + 1 && p.etag == chunk.etag)
                    });
                    if state.completed_parts.len() < before {
                        warn!(
                            dropped = before - state.completed_parts.len(),
                            "recorded parts missing from the platform will be sent again"
                        );
                    }
                }
                Err(err) if matches!(err.root(), ParsecError::NotFound(_)) => {
                    info!(upload_id = %upload_id, "multipart session expired, restarting upload");
                    self.abandon_upload(&state, &artifact, staged).await;
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        }

        let resumed_parts = state.completed_parts.len();
        info!(
            resumed_parts,
            parts = state.part_count(),
            bytes = state.bytes_transferred,
            "resuming upload"
        );
        Ok(Some(UploadPlan {
            multipart: state.total_size > self.config.engine.multipart_threshold,
            state,
            artifact,
            staged,
            resumed: true,
            resumed_parts,
        }))
    }

    async fn check_upload_state(
        &self,
        job: &TransferJob,
        plaintext_size: u64,
        storage: &StorageContext,
        state: &ResumeState,
        artifact: &Path,
    ) -> std::result::Result<(), String> {
        if state.direction != Direction::Upload {
            return Err("sidecar belongs to a download".into());
        }
        if state.remote_key != job.remote_key {
            return Err(format!("sidecar targets {}", state.remote_key));
        }
        if state.plaintext_size != plaintext_size {
            return Err("local file size changed".into());
        }
        if &state.storage != storage {
            return Err(format!("upload target moved to {}", storage));
        }
        if state.encryption.is_some() != self.config.engine.encrypt {
            return Err("encryption setting changed".into());
        }
        if state.chunk_size != self.chunk_size_for(state.total_size) {
            return Err("part size changed".into());
        }
        let multipart = state.total_size > self.config.engine.multipart_threshold;
        if multipart != state.session_id.is_some() {
            return Err("multipart session id missing or unexpected".into());
        }
        let Some(expected) = state.plaintext_checksum.clone() else {
            return Err("no plaintext checksum recorded".into());
        };

        match tokio::fs::metadata(artifact).await {
            Ok(metadata) if metadata.len() == state.total_size => {}
            Ok(_) => return Err("artifact size changed".into()),
            Err(_) => return Err(format!("artifact {} is gone", artifact.display())),
        }

        // The staged artifact and the recorded checksum both describe the old plaintext
        let path = job.local_path.clone();
        match blocking(move || checksum_file(&path)).await {
            Ok(actual) if checksums_match(&expected, &actual) => Ok(()),
            Ok(_) => Err("local file content changed".into()),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Plan a new upload: duplicate check, staging, checksum
    async fn fresh_upload(
        &self,
        job: &TransferJob,
        plaintext_size: u64,
        storage: StorageContext,
    ) -> Result<UploadPlan> {
        let engine = &self.config.engine;

        if !engine.fast_mode {
            let store = &self.store;
            let key = job.remote_key.as_str();
            let exists = self
                .platform_call("exists", &job.cancel, || store.exists(key))
                .await?;
            if exists {
                return Err(ParsecError::RemoteConflict {
                    key: job.remote_key.clone(),
                });
            }
        }

        let suffix = crypto::random_suffix();
        let (artifact, staged, total, checksum, encryption) = if engine.encrypt {
            let derived = derive_key(&self.master, &format!("{}#{}", job.remote_key, suffix))?;
            let params = derived.to_params();
            let artifact = self.stage_path(&job.local_path, &suffix)?;
            let (total, checksum) = self
                .encrypt_to_staging(job, derived, &artifact, plaintext_size)
                .await?;
            (artifact, true, total, checksum, Some(params))
        } else {
            let path = job.local_path.clone();
            let checksum = blocking(move || checksum_file(&path)).await?;
            (job.local_path.clone(), false, plaintext_size, checksum, None)
        };

        let mut state = ResumeState::new(
            &job.local_path,
            &job.remote_key,
            Direction::Upload,
            total,
            plaintext_size,
            self.chunk_size_for(total),
            suffix,
            storage,
        );
        state.encryption = encryption;
        state.plaintext_checksum = Some(checksum);

        debug!(
            total,
            plaintext_size,
            parts = state.part_count(),
            encrypted = state.encryption.is_some(),
            "upload planned"
        );
        Ok(UploadPlan {
            multipart: total > engine.multipart_threshold,
            state,
            artifact,
            staged,
            resumed: false,
            resumed_parts: 0,
        })
    }

    fn stage_path(&self, local_path: &Path, suffix: &str) -> Result<PathBuf> {
        let name = local_path
            .file_name()
            .ok_or_else(|| ParsecError::PathInvalid {
                path: local_path.to_path_buf(),
                reason: "path has no file name".into(),
            })?
            .to_string_lossy();
        Ok(self
            .config
            .engine
            .staging_dir()
            .join(format!("{}.{}.{}", name, suffix, ARTIFACT_EXTENSION)))
    }

    /// Encrypt the local file into `artifact`; returns (stored size, plaintext SHA-512)
    async fn encrypt_to_staging(
        &self,
        job: &TransferJob,
        key: DerivedKey,
        artifact: &Path,
        plaintext_size: u64,
    ) -> Result<(u64, String)> {
        let staging = self.config.engine.staging_dir();
        tokio::fs::create_dir_all(&staging).await?;
        ensure_sufficient_space(
            self.space.as_ref(),
            &staging,
            crypto::encrypted_len(plaintext_size),
            self.config.engine.disk_safety_margin,
        )?;

        let cipher = StreamingCipher::new(key, self.config.engine.cipher_window)?;
        let source = job.local_path.clone();
        let target = artifact.to_path_buf();
        let cancel = job.cancel.clone();

        let staged = blocking(move || {
            let reader = BufReader::new(File::open(&source)?);
            let file = File::create(&target)?;
            let mut hasher = StreamingHasher::new();
            let stats = cipher.encrypt(reader, BufWriter::new(&file), |window| {
                if cancel.is_cancelled() {
                    return Err(ParsecError::Cancelled);
                }
                hasher.update(window);
                Ok(())
            })?;
            file.sync_all()?;
            Ok((stats, hasher.finalize_hex()))
        })
        .await;

        match staged {
            Ok((stats, _)) if stats.plaintext_bytes != plaintext_size => {
                remove_scratch(artifact);
                Err(ParsecError::Validation(format!(
                    "{} changed size while being staged",
                    job.local_path.display()
                )))
            }
            Ok((stats, checksum)) => {
                debug!(
                    artifact = %artifact.display(),
                    plaintext = stats.plaintext_bytes,
                    ciphertext = stats.ciphertext_bytes,
                    "staged encrypted artifact"
                );
                Ok((stats.ciphertext_bytes, checksum))
            }
            Err(err) => {
                remove_scratch(artifact);
                Err(err)
            }
        }
    }

    async fn execute_upload(
        &self,
        job: &TransferJob,
        plan: &mut UploadPlan,
    ) -> Result<TransferOutcome> {
        let checksum = plan.state.plaintext_checksum.clone().ok_or_else(|| {
            ParsecError::ResumeStateInvalid("no plaintext checksum recorded".into())
        })?;

        if plan.resumed && plan.state.is_complete() {
            if let Some(object) = self.already_committed(job, &plan.state, &checksum).await? {
                info!("object already committed by an earlier run");
                return Ok(TransferOutcome {
                    bytes: plan.state.plaintext_size,
                    checksum,
                    parts_written: 0,
                    resumed_parts: plan.resumed_parts,
                    remote_etag: object.etag,
                });
            }
        }

        let metadata = plan.metadata();
        let (object, parts_written) = if plan.multipart {
            self.upload_multipart(job, plan, &metadata).await?
        } else {
            self.upload_single(job, plan, &metadata).await?
        };

        self.verify_upload(job, &plan.state, &object, &checksum)?;
        Ok(TransferOutcome {
            bytes: plan.state.plaintext_size,
            checksum,
            parts_written,
            resumed_parts: plan.resumed_parts,
            remote_etag: object.etag,
        })
    }

    /// The remote object, if it already holds exactly what we would commit
    async fn already_committed(
        &self,
        job: &TransferJob,
        state: &ResumeState,
        checksum: &str,
    ) -> Result<Option<RemoteObject>> {
        let store = &self.store;
        let key = job.remote_key.as_str();
        match self
            .platform_call("describe", &job.cancel, || store.describe(key))
            .await
        {
            Ok(object) => {
                let same_size = object.size == state.total_size;
                let same_content = object
                    .metadata
                    .plaintext_checksum
                    .as_deref()
                    .is_some_and(|remote| checksums_match(checksum, remote));
                Ok((same_size && same_content).then_some(object))
            }
            Err(err) if matches!(err.root(), ParsecError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn upload_single(
        &self,
        job: &TransferJob,
        plan: &mut UploadPlan,
        metadata: &ObjectMetadata,
    ) -> Result<(RemoteObject, usize)> {
        if job.cancel.is_cancelled() {
            return Err(ParsecError::Cancelled);
        }
        job.pause.wait(&job.cancel).await?;

        let body = Bytes::from(tokio::fs::read(&plan.artifact).await?);
        if body.len() as u64 != plan.state.total_size {
            return Err(ParsecError::Validation(format!(
                "{} changed size before upload",
                plan.artifact.display()
            )));
        }

        let store = &self.store;
        let key = job.remote_key.as_str();
        let body = &body;
        let object = self
            .storage_call(
                "put_object",
                RequestClass::Submission,
                &plan.state.storage,
                &job.cancel,
                move |lease| async move {
                    store
                        .put_object(&lease, key, body.clone(), metadata)
                        .await
                },
            )
            .await?;

        if plan.state.total_size > 0 {
            plan.state.record_part(CompletedChunk {
                index: 0,
                etag: object.etag.clone(),
                size: plan.state.total_size,
            });
            self.resume.save(&plan.state)?;
        }
        job.reporter.advanced(plan.state.plaintext_size);
        Ok((object, 1))
    }

    async fn upload_multipart(
        &self,
        job: &TransferJob,
        plan: &mut UploadPlan,
        metadata: &ObjectMetadata,
    ) -> Result<(RemoteObject, usize)> {
        let store = &self.store;
        let key = job.remote_key.as_str();
        let storage = plan.state.storage.clone();

        let upload_id = match plan.state.session_id.clone() {
            Some(upload_id) => upload_id,
            None => {
                let upload_id = self
                    .storage_call(
                        "create_upload",
                        RequestClass::Submission,
                        &storage,
                        &job.cancel,
                        move |lease| async move {
                            store.create_upload(&lease, key, metadata).await
                        },
                    )
                    .await?;
                debug!(upload_id = %upload_id, "multipart session opened");
                plan.state.session_id = Some(upload_id.clone());
                upload_id
            }
        };

        let engine = self.clone();
        let artifact: Arc<Path> = Arc::from(plan.artifact.as_path());
        let shared_key: Arc<str> = Arc::from(key);
        let shared_id: Arc<str> = Arc::from(upload_id.as_str());
        let part_storage = storage.clone();
        let chunk = plan.state.chunk_size;
        let total = plan.state.total_size;

        let written = self
            .run_parts(job, &mut plan.state, |index, cancel| {
                let engine = engine.clone();
                let artifact = Arc::clone(&artifact);
                let key = Arc::clone(&shared_key);
                let upload_id = Arc::clone(&shared_id);
                let storage = part_storage.clone();
                async move {
                    engine
                        .send_part(
                            &artifact, &key, &upload_id, &storage, chunk, total, index, &cancel,
                        )
                        .await
                }
            })
            .await?;

        if plan.state.bytes_transferred != plan.state.total_size {
            return Err(ParsecError::Validation(format!(
                "committed parts cover {} of {} bytes",
                plan.state.bytes_transferred, plan.state.total_size
            )));
        }

        let parts: Vec<CompletedPart> = plan
            .state
            .completed_parts
            .iter()
            .map(|chunk| CompletedPart {
                part_number: chunk.index + 1,
                etag: chunk.etag.clone(),
                size: chunk.size,
            })
            .collect();
        let parts = &parts;
        let id = upload_id.as_str();

        let committed = self
            .storage_call(
                "complete_upload",
                RequestClass::Submission,
                &storage,
                &job.cancel,
                move |lease| async move { store.complete_upload(&lease, key, id, parts).await },
            )
            .await;

        match committed {
            Ok(object) => Ok((object, written)),
            Err(err) if matches!(err.root(), ParsecError::NotFound(_)) => {
                Err(ParsecError::ResumeStateInvalid(format!(
                    "multipart session {} no longer exists",
                    upload_id
                )))
            }
            Err(err) => Err(err),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_part(
        &self,
        artifact: &Path,
        key: &str,
        upload_id: &str,
        storage: &StorageContext,
        chunk: u64,
        total: u64,
        index: u32,
        cancel: &CancellationToken,
    ) -> Result<CompletedChunk> {
        let size = part_len(total, chunk, index);
        let body = read_range(artifact, index as u64 * chunk, size).await?;
        let part_number = index + 1;

        let store = &self.store;
        let body = &body;
        let etag = self
            .storage_call(
                "upload_part",
                RequestClass::General,
                storage,
                cancel,
                move |lease| async move {
                    store
                        .upload_part(&lease, key, upload_id, part_number, body.clone())
                        .await
                },
            )
            .await
            .map_err(|e| e.context(format!("part {}", part_number)))?;

        Ok(CompletedChunk { index, etag, size })
    }

    fn verify_upload(
        &self,
        job: &TransferJob,
        state: &ResumeState,
        object: &RemoteObject,
        checksum: &str,
    ) -> Result<()> {
        if object.size != state.total_size {
            return Err(ParsecError::ChecksumMismatch {
                object: job.remote_key.clone(),
                expected: format!("{} bytes", state.total_size),
                actual: format!("{} bytes", object.size),
            });
        }
        match object.metadata.plaintext_checksum.as_deref() {
            Some(remote) if checksums_match(checksum, remote) => Ok(()),
            other => Err(ParsecError::ChecksumMismatch {
                object: job.remote_key.clone(),
                expected: checksum.to_string(),
                actual: other.unwrap_or("<none>").to_string(),
            }),
        }
    }

    /// Throw away a plan that cannot be resumed
    async fn abandon_upload(&self, state: &ResumeState, artifact: &Path, staged: bool) {
        self.discard_state(&state.local_path);
        if staged {
            remove_scratch(artifact);
        }
        if let Some(upload_id) = &state.session_id {
            self.abort_quietly(&state.storage, &state.remote_key, upload_id).await;
        }
    }

    /// Best-effort abort of a multipart session; runs even after cancellation
    async fn abort_quietly(&self, storage: &StorageContext, key: &str, upload_id: &str) {
        let cancel = CancellationToken::new();
        let aborted: Result<()> = async {
            let lease = self.credentials.get(storage, &cancel).await?;
            self.store.abort_upload(&lease, key, upload_id).await
        }
        .await;

        match aborted {
            Ok(()) => debug!(upload_id, "multipart session aborted"),
            Err(err) => debug!(upload_id, error = %err, "could not abort multipart session"),
        }
    }
}

async fn read_range(path: &Path, offset: u64, len: u64) -> Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
