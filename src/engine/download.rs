//! Download pipeline
//!
//! Parts are fetched with ranged reads and written at their offsets into
//! `<file>.parsec-partial`, so they may land in any order. Once every part is
//! in, the partial file is decrypted (or copied) into `<file>.parsec-tmp`
//! while the plaintext SHA-512 is computed, verified against the checksum the
//! platform published, and only then renamed over the destination.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    blocking, plaintext_done, remove_scratch, sibling, TransferEngine, TransferJob,
    TransferOutcome,
};
use crate::core::checksum::{checksums_match, StreamingHasher};
use crate::core::disk_guardian::ensure_sufficient_space;
use crate::core::rate_limit::RequestClass;
use crate::core::resume::{part_len, CompletedChunk, ResumeState};
use crate::core::task::Direction;
use crate::crypto::{self, DerivedKey, StreamingCipher};
use crate::error::{ParsecError, Result};
use crate::remote::{RemoteObject, StorageContext};

const PARTIAL_EXTENSION: &str = "parsec-partial";
const TMP_EXTENSION: &str = "parsec-tmp";

impl TransferEngine {
    pub(super) async fn download(&self, job: &TransferJob) -> Result<TransferOutcome> {
        let store = &self.store;
        let key = job.remote_key.as_str();
        let object = self
            .platform_call("describe", &job.cancel, || store.describe(key))
            .await?;
        self.check_remote(job, &object)?;

        let dir = self.destination_dir(job).await?;
        let partial = sibling(&job.local_path, PARTIAL_EXTENSION);

        let (mut state, resumed_parts) = match self.resume_download(job, &object, &partial)? {
            Some(state) => {
                let parts = state.completed_parts.len();
                (state, parts)
            }
            None => (self.fresh_download(job, &object), 0),
        };
        job.reporter.started(plaintext_done(&state), state.plaintext_size);

        let result = self
            .execute_download(job, &mut state, &dir, &partial, resumed_parts)
            .await;

        match result {
            Ok(outcome) => {
                info!(
                    bytes = outcome.bytes,
                    parts_written = outcome.parts_written,
                    resumed_parts = outcome.resumed_parts,
                    path = %job.local_path.display(),
                    "download complete"
                );
                Ok(outcome)
            }
            Err(err) => {
                let corrupt = matches!(
                    err.root(),
                    ParsecError::ChecksumMismatch { .. } | ParsecError::Cipher(_)
                );
                if corrupt {
                    self.discard_state(&job.local_path);
                    remove_scratch(&partial);
                } else {
                    self.persist_or_discard(&state, &err);
                    if state.completed_parts.is_empty() {
                        remove_scratch(&partial);
                    }
                }
                Err(err)
            }
        }
    }

    /// Sanity checks on the remote object before any bytes move
    fn check_remote(&self, job: &TransferJob, object: &RemoteObject) -> Result<()> {
        let plaintext = object.metadata.plaintext_size;
        if plaintext != job.declared_size {
            return Err(ParsecError::Validation(format!(
                "{} holds {} plaintext bytes, but {} were declared",
                object.key, plaintext, job.declared_size
            )));
        }

        let size_ok = if object.metadata.encryption.is_some() {
            crypto::is_valid_encrypted_size(plaintext, object.size)
        } else {
            object.size == plaintext
        };
        if !size_ok {
            return Err(ParsecError::Validation(format!(
                "{} stores {} bytes, which cannot hold {} plaintext bytes",
                object.key, object.size, plaintext
            )));
        }
        Ok(())
    }

    async fn destination_dir(&self, job: &TransferJob) -> Result<PathBuf> {
        let local = &job.local_path;
        if local.file_name().is_none() {
            return Err(ParsecError::PathInvalid {
                path: local.clone(),
                reason: "path has no file name".into(),
            });
        }
        if let Ok(metadata) = tokio::fs::metadata(local).await {
            if metadata.is_dir() {
                return Err(ParsecError::PathInvalid {
                    path: local.clone(),
                    reason: "destination is a directory".into(),
                });
            }
        }

        let dir = match local.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Sidecar state, if it was taken from the same remote content
    fn resume_download(
        &self,
        job: &TransferJob,
        object: &RemoteObject,
        partial: &Path,
    ) -> Result<Option<ResumeState>> {
        let state = match self.resume.load(&job.local_path) {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(None),
            Err(err) if matches!(err.root(), ParsecError::ResumeStateInvalid(_)) => {
                warn!(error = %err, "resume state unusable, restarting download");
                remove_scratch(partial);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if let Err(reason) = self.check_download_state(job, object, &state, partial) {
            info!(reason = %reason, "discarding resume state, restarting from byte 0");
            self.discard_state(&job.local_path);
            remove_scratch(partial);
            return Ok(None);
        }

        info!(
            resumed_parts = state.completed_parts.len(),
            parts = state.part_count(),
            bytes = state.bytes_transferred,
            "resuming download"
        );
        Ok(Some(state))
    }

    fn check_download_state(
        &self,
        job: &TransferJob,
        object: &RemoteObject,
        state: &ResumeState,
        partial: &Path,
    ) -> std::result::Result<(), String> {
        if state.direction != Direction::Download {
            return Err("sidecar belongs to an upload".into());
        }
        if state.remote_key != job.remote_key {
            return Err(format!("sidecar was taken from {}", state.remote_key));
        }
        if state.remote_etag.as_deref() != Some(object.etag.as_str()) {
            return Err("remote object changed since the last attempt".into());
        }
        if state.total_size != object.size || state.plaintext_size != object.metadata.plaintext_size
        {
            return Err("remote object size changed".into());
        }
        if state.storage != object.storage {
            return Err(format!("object moved to {}", object.storage));
        }
        if state.encryption != object.metadata.encryption {
            return Err("encryption parameters changed".into());
        }
        if state.chunk_size != self.chunk_size_for(object.size) {
            return Err("part size changed".into());
        }
        match std::fs::metadata(partial) {
            Ok(metadata) if metadata.len() == state.total_size => Ok(()),
            Ok(_) => Err("partial file has the wrong length".into()),
            Err(_) => Err("partial file is gone".into()),
        }
    }

    fn fresh_download(&self, job: &TransferJob, object: &RemoteObject) -> ResumeState {
        let mut state = ResumeState::new(
            &job.local_path,
            &job.remote_key,
            Direction::Download,
            object.size,
            object.metadata.plaintext_size,
            self.chunk_size_for(object.size),
            object.metadata.suffix.clone().unwrap_or_default(),
            object.storage.clone(),
        );
        state.remote_etag = Some(object.etag.clone());
        state.encryption = object.metadata.encryption.clone();
        state.plaintext_checksum = object.metadata.plaintext_checksum.clone();
        state
    }

    async fn execute_download(
        &self,
        job: &TransferJob,
        state: &mut ResumeState,
        dir: &Path,
        partial: &Path,
        resumed_parts: usize,
    ) -> Result<TransferOutcome> {
        // Room for the rest of the partial file plus the plaintext output
        let remaining = state.total_size - state.bytes_transferred;
        ensure_sufficient_space(
            self.space.as_ref(),
            dir,
            remaining + state.plaintext_size,
            self.config.engine.disk_safety_margin,
        )?;

        if resumed_parts == 0 {
            let file = tokio::fs::File::create(partial).await?;
            file.set_len(state.total_size).await?;
        }

        let engine = self.clone();
        let shared_partial: Arc<Path> = Arc::from(partial);
        let shared_key: Arc<str> = Arc::from(job.remote_key.as_str());
        let storage = state.storage.clone();
        let chunk = state.chunk_size;
        let total = state.total_size;

        let written = self
            .run_parts(job, state, |index, cancel| {
                let engine = engine.clone();
                let partial = Arc::clone(&shared_partial);
                let key = Arc::clone(&shared_key);
                let storage = storage.clone();
                async move {
                    engine
                        .fetch_part(&partial, &key, &storage, chunk, total, index, &cancel)
                        .await
                }
            })
            .await?;

        if state.bytes_transferred != state.total_size {
            return Err(ParsecError::Validation(format!(
                "fetched parts cover {} of {} bytes",
                state.bytes_transferred, state.total_size
            )));
        }

        let tmp = sibling(&job.local_path, TMP_EXTENSION);
        let checksum = self.assemble(job, state, partial, &tmp).await?;

        match state.plaintext_checksum.as_deref() {
            Some(expected) if !checksums_match(expected, &checksum) => {
                remove_scratch(&tmp);
                return Err(ParsecError::ChecksumMismatch {
                    object: job.remote_key.clone(),
                    expected: expected.to_string(),
                    actual: checksum,
                });
            }
            Some(_) => {}
            None => warn!("platform published no checksum, integrity not verified"),
        }

        self.discard_state(&job.local_path);
        tokio::fs::rename(&tmp, &job.local_path).await?;
        remove_scratch(partial);

        Ok(TransferOutcome {
            bytes: state.plaintext_size,
            checksum,
            parts_written: written,
            resumed_parts,
            remote_etag: state.remote_etag.clone().unwrap_or_default(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_part(
        &self,
        partial: &Path,
        key: &str,
        storage: &StorageContext,
        chunk: u64,
        total: u64,
        index: u32,
        cancel: &CancellationToken,
    ) -> Result<CompletedChunk> {
        let offset = index as u64 * chunk;
        let size = part_len(total, chunk, index);

        let store = &self.store;
        let body = self
            .storage_call(
                "get_range",
                RequestClass::General,
                storage,
                cancel,
                move |lease| async move {
                    let body = store.get_range(&lease, key, offset..offset + size).await?;
                    if body.len() as u64 != size {
                        return Err(ParsecError::TransientNetwork(format!(
                            "short read: {} of {} bytes",
                            body.len(),
                            size
                        )));
                    }
                    Ok(body)
                },
            )
            .await
            .map_err(|e| e.context(format!("part {}", index + 1)))?;

        write_at(partial, offset, &body).await?;
        Ok(CompletedChunk {
            index,
            etag: part_digest(&body),
            size,
        })
    }

    /// Decrypt or copy the partial file into `tmp`; returns the plaintext SHA-512
    async fn assemble(
        &self,
        job: &TransferJob,
        state: &ResumeState,
        partial: &Path,
        tmp: &Path,
    ) -> Result<String> {
        let key = state
            .encryption
            .as_ref()
            .map(DerivedKey::from_params)
            .transpose()?;
        let window = self.config.engine.cipher_window;
        let source = partial.to_path_buf();
        let target = tmp.to_path_buf();
        let cancel = job.cancel.clone();

        let assembled = blocking(move || {
            let reader = BufReader::new(File::open(&source)?);
            let file = File::create(&target)?;
            let mut hasher = StreamingHasher::new();
            let mut observe = |data: &[u8]| -> Result<()> {
                if cancel.is_cancelled() {
                    return Err(ParsecError::Cancelled);
                }
                hasher.update(data);
                Ok(())
            };

            let written = match key {
                Some(key) => {
                    StreamingCipher::new(key, window)?
                        .decrypt(reader, BufWriter::new(&file), &mut observe)?
                        .plaintext_bytes
                }
                None => copy_observed(reader, BufWriter::new(&file), window, &mut observe)?,
            };
            file.sync_all()?;
            Ok((written, hasher.finalize_hex()))
        })
        .await;

        let plaintext = state.plaintext_size;
        match assembled {
            Ok((written, checksum)) if written == plaintext => {
                debug!(bytes = written, "assembled plaintext");
                Ok(checksum)
            }
            Ok((written, _)) => {
                remove_scratch(tmp);
                Err(ParsecError::ChecksumMismatch {
                    object: job.remote_key.clone(),
                    expected: format!("{} bytes", plaintext),
                    actual: format!("{} bytes", written),
                })
            }
            Err(err) => {
                remove_scratch(tmp);
                Err(err)
            }
        }
    }
}

async fn write_at(path: &Path, offset: u64, data: &Bytes) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

/// Short content digest recorded per fetched part
fn part_digest(data: &[u8]) -> String {
    hex::encode(&Sha256::digest(data)[..8])
}

fn copy_observed<R, W, F>(
    mut reader: R,
    mut writer: W,
    window: usize,
    mut observer: F,
) -> Result<u64>
where
    R: Read,
    W: Write,
    F: FnMut(&[u8]) -> Result<()>,
{
    let mut buf = vec![0u8; window];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        observer(&buf[..n])?;
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}
