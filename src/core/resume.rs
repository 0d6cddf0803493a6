/*!
 * Resume sidecars for interrupted transfers
 *
 * One JSON document per in-flight transfer, written atomically (temp file in
 * the same directory, fsync, rename) after every completed part. Readers
 * ignore fields they do not know; a missing required field, a newer schema
 * version or inconsistent contents make the state invalid, which callers
 * treat as "start over", never as a crash.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::core::task::Direction;
use crate::crypto::{self, EncryptionParams};
use crate::error::{ParsecError, Result};
use crate::remote::StorageContext;

/// Current sidecar schema version
pub const RESUME_VERSION: u32 = 1;

/// File extension of resume sidecars
pub const RESUME_EXTENSION: &str = "parsec-resume";

/// One committed part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedChunk {
    /// 0-based part index
    pub index: u32,
    /// Integrity token returned by the remote side
    pub etag: String,
    /// Bytes in this part
    pub size: u64,
}

/// Durable progress of one transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub version: u32,
    pub local_path: PathBuf,
    pub remote_key: String,
    pub direction: Direction,
    /// Multipart upload id; `None` for downloads and single-shot uploads
    pub session_id: Option<String>,
    /// Size of the bytes on the wire (encrypted size when encrypted)
    pub total_size: u64,
    pub plaintext_size: u64,
    pub bytes_transferred: u64,
    pub chunk_size: u64,
    /// Sorted by index, no duplicates
    pub completed_parts: Vec<CompletedChunk>,
    /// Derived key material, never the master secret
    pub encryption: Option<EncryptionParams>,
    /// Random per-attempt suffix mixed into key derivation
    pub suffix: String,
    pub storage: StorageContext,
    /// Remote integrity token the partial download was taken from
    pub remote_etag: Option<String>,
    pub plaintext_checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResumeState {
    /// Fresh state with no completed parts
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_key: impl Into<String>,
        direction: Direction,
        total_size: u64,
        plaintext_size: u64,
        chunk_size: u64,
        suffix: impl Into<String>,
        storage: StorageContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: RESUME_VERSION,
            local_path: local_path.into(),
            remote_key: remote_key.into(),
            direction,
            session_id: None,
            total_size,
            plaintext_size,
            bytes_transferred: 0,
            chunk_size,
            completed_parts: Vec::new(),
            encryption: None,
            suffix: suffix.into(),
            storage,
            remote_etag: None,
            plaintext_checksum: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of parts `total_size` splits into
    pub fn part_count(&self) -> u32 {
        part_count(self.total_size, self.chunk_size)
    }

    /// Record a finished part; completions may arrive in any order
    pub fn record_part(&mut self, chunk: CompletedChunk) {
        match self
            .completed_parts
            .binary_search_by_key(&chunk.index, |c| c.index)
        {
            Ok(pos) => self.completed_parts[pos] = chunk,
            Err(pos) => self.completed_parts.insert(pos, chunk),
        }
        self.bytes_transferred = self.completed_parts.iter().map(|c| c.size).sum();
        self.updated_at = Utc::now();
    }

    pub fn is_part_complete(&self, index: u32) -> bool {
        self.completed_parts
            .binary_search_by_key(&index, |c| c.index)
            .is_ok()
    }

    /// Indices still to transfer, ascending
    pub fn pending_parts(&self) -> Vec<u32> {
        (0..self.part_count())
            .filter(|index| !self.is_part_complete(*index))
            .collect()
    }

    /// Keep only the parts `keep` accepts
    pub fn retain_parts<F>(&mut self, keep: F)
    where
        F: FnMut(&CompletedChunk) -> bool,
    {
        self.completed_parts.retain(keep);
        self.bytes_transferred = self.completed_parts.iter().map(|c| c.size).sum();
        self.updated_at = Utc::now();
    }

    /// Every part recorded and all bytes accounted for
    pub fn is_complete(&self) -> bool {
        self.completed_parts.len() as u64 == self.part_count() as u64
            && self.bytes_transferred == self.total_size
    }

    /// Whether the state was last written longer than `max_age` ago
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.updated_at);
        age.to_std().map(|age| age > max_age).unwrap_or(false)
    }

    /// Structural checks independent of the remote side
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 || self.version > RESUME_VERSION {
            return Err(invalid(format!(
                "unsupported schema version {}",
                self.version
            )));
        }
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size is zero"));
        }

        let size_ok = if self.encryption.is_some() {
            crypto::is_valid_encrypted_size(self.plaintext_size, self.total_size)
        } else {
            self.total_size == self.plaintext_size
        };
        if !size_ok {
            return Err(invalid(format!(
                "stored size {} is not valid for plaintext size {}",
                self.total_size, self.plaintext_size
            )));
        }

        let parts = self.part_count();
        let mut previous: Option<u32> = None;
        for chunk in &self.completed_parts {
            if previous.is_some_and(|p| p >= chunk.index) {
                return Err(invalid("completed parts are not strictly ordered"));
            }
            previous = Some(chunk.index);

            if chunk.index >= parts {
                return Err(invalid(format!(
                    "part {} out of range ({} parts)",
                    chunk.index, parts
                )));
            }
            let expected = part_len(self.total_size, self.chunk_size, chunk.index);
            if chunk.size != expected {
                return Err(invalid(format!(
                    "part {} has size {}, expected {}",
                    chunk.index, chunk.size, expected
                )));
            }
        }

        let sum: u64 = self.completed_parts.iter().map(|c| c.size).sum();
        if sum != self.bytes_transferred {
            return Err(invalid(format!(
                "bytes_transferred {} does not equal the sum of completed parts {}",
                self.bytes_transferred, sum
            )));
        }

        Ok(())
    }
}

/// Number of parts for `total` bytes cut into `chunk`-sized pieces
pub fn part_count(total: u64, chunk: u64) -> u32 {
    if chunk == 0 {
        return 0;
    }
    total.div_ceil(chunk) as u32
}

/// Length of part `index`; the last part holds the remainder
pub fn part_len(total: u64, chunk: u64, index: u32) -> u64 {
    let start = index as u64 * chunk;
    total.saturating_sub(start).min(chunk)
}

fn invalid(reason: impl Into<String>) -> ParsecError {
    ParsecError::ResumeStateInvalid(reason.into())
}

/// Location and lifecycle of resume sidecars
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: Option<PathBuf>,
    max_age: Duration,
}

impl ResumeStore {
    /// Sidecars go to `dir` when set, otherwise next to each local file
    pub fn new(dir: Option<PathBuf>, max_age: Duration) -> Self {
        Self { dir, max_age }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.resume_dir.clone(), config.resume_max_age())
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Deterministic sidecar path for a local file
    pub fn path_for(&self, local_path: &Path) -> Result<PathBuf> {
        let file_name = local_path
            .file_name()
            .ok_or_else(|| ParsecError::PathInvalid {
                path: local_path.to_path_buf(),
                reason: "path has no file name".into(),
            })?
            .to_string_lossy();

        match &self.dir {
            Some(dir) => {
                let digest = Sha256::digest(local_path.as_os_str().to_string_lossy().as_bytes());
                let prefix = &hex::encode(digest)[..16];
                Ok(dir.join(format!("{}-{}.{}", prefix, file_name, RESUME_EXTENSION)))
            }
            None => {
                let parent = local_path.parent().unwrap_or_else(|| Path::new(""));
                Ok(parent.join(format!("{}.{}", file_name, RESUME_EXTENSION)))
            }
        }
    }

    /// Load and validate the sidecar for `local_path`
    ///
    /// Returns `Ok(None)` when there is nothing usable to resume from. Stale
    /// sidecars are deleted. Unreadable or inconsistent sidecars are deleted
    /// and reported as `ResumeStateInvalid`.
    pub fn load(&self, local_path: &Path) -> Result<Option<ResumeState>> {
        let path = self.path_for(local_path)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state = match parse_state(&contents) {
            Ok(state) => state,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "discarding invalid resume state");
                discard(&path);
                return Err(err);
            }
        };

        if state.is_stale(self.max_age) {
            info!(
                path = %path.display(),
                updated_at = %state.updated_at,
                "discarding stale resume state"
            );
            discard(&path);
            return Ok(None);
        }

        debug!(
            path = %path.display(),
            parts = state.completed_parts.len(),
            bytes = state.bytes_transferred,
            "loaded resume state"
        );
        Ok(Some(state))
    }

    /// Atomically replace the sidecar with `state`
    pub fn save(&self, state: &ResumeState) -> Result<()> {
        let path = self.path_for(&state.local_path)?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if self.dir.is_some() {
            fs::create_dir_all(&parent)?;
        }

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| ParsecError::ResumeStateInvalid(format!("cannot serialize: {}", e)))?;

        let mut tmp = NamedTempFile::new_in(&parent)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Delete the sidecar for `local_path`, if any
    pub fn remove(&self, local_path: &Path) -> Result<()> {
        let path = self.path_for(local_path)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Purge stale or unreadable sidecars from the configured resume directory
    pub fn purge_stale(&self) -> Result<usize> {
        match &self.dir {
            Some(dir) => self.purge_stale_in(dir),
            None => Ok(0),
        }
    }

    /// Purge stale or unreadable sidecars from `dir`
    pub fn purge_stale_in(&self, dir: &Path) -> Result<usize> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut purged = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RESUME_EXTENSION) {
                continue;
            }

            let remove = match fs::read_to_string(&path) {
                Ok(contents) => match parse_state(&contents) {
                    Ok(state) => state.is_stale(self.max_age),
                    Err(_) => true,
                },
                Err(_) => false,
            };

            if remove && fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "purged resume state");
                purged += 1;
            }
        }

        if purged > 0 {
            info!(dir = %dir.display(), purged, "purged stale resume states");
        }
        Ok(purged)
    }
}

fn parse_state(contents: &str) -> Result<ResumeState> {
    let state: ResumeState = serde_json::from_str(contents)
        .map_err(|e| ParsecError::ResumeStateInvalid(format!("unreadable sidecar: {}", e)))?;
    state.validate()?;
    Ok(state)
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to delete resume state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn storage() -> StorageContext {
        StorageContext::new("memory", "bucket-a")
    }

    fn chunk(index: u32, etag: &str, size: u64) -> CompletedChunk {
        CompletedChunk {
            index,
            etag: etag.into(),
            size,
        }
    }

    fn upload_state(local: &Path) -> ResumeState {
        ResumeState::new(
            local,
            "jobs/input.bin",
            Direction::Upload,
            100,
            100,
            30,
            "abcd",
            storage(),
        )
    }

    #[test]
    fn test_part_arithmetic() {
        assert_eq!(part_count(100, 30), 4);
        assert_eq!(part_count(90, 30), 3);
        assert_eq!(part_count(0, 30), 0);
        assert_eq!(part_len(100, 30, 0), 30);
        assert_eq!(part_len(100, 30, 3), 10);
        assert_eq!(part_len(100, 30, 4), 0);
    }

    #[test]
    fn test_out_of_order_completion() {
        let mut state = upload_state(Path::new("/data/input.bin"));
        state.record_part(chunk(3, "d", 10));
        state.record_part(chunk(0, "a", 30));
        state.record_part(chunk(2, "c", 30));
        // Duplicate completion replaces, never double counts
        state.record_part(chunk(2, "c2", 30));

        let indices: Vec<u32> = state.completed_parts.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 2, 3]);
        assert_eq!(state.bytes_transferred, 70);
        assert!(!state.is_complete());
        assert!(state.validate().is_ok());

        assert_eq!(state.pending_parts(), vec![1]);

        state.record_part(chunk(1, "b", 30));
        assert!(state.is_complete());
        assert!(state.pending_parts().is_empty());

        // Parts the remote side no longer has are dropped
        state.retain_parts(|c| c.index != 2);
        assert_eq!(state.bytes_transferred, 70);
        assert_eq!(state.pending_parts(), vec![2]);
    }

    #[test]
    fn test_save_load_roundtrip_beside_file() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("input.bin");
        let store = ResumeStore::new(None, Duration::from_secs(3600));

        let mut state = upload_state(&local);
        state.session_id = Some("upload-1".into());
        state.record_part(chunk(1, "b", 30));
        store.save(&state).unwrap();

        assert_eq!(
            store.path_for(&local).unwrap(),
            dir.path().join("input.bin.parsec-resume")
        );
        let loaded = store.load(&local).unwrap().unwrap();
        assert_eq!(loaded, state);

        store.remove(&local).unwrap();
        assert!(store.load(&local).unwrap().is_none());
        store.remove(&local).unwrap();
    }

    #[test]
    fn test_resume_dir_naming_is_deterministic() {
        let dir = tempdir().unwrap();
        let store = ResumeStore::new(Some(dir.path().join("resume")), Duration::from_secs(60));

        let a = store.path_for(Path::new("/x/data.bin")).unwrap();
        let b = store.path_for(Path::new("/x/data.bin")).unwrap();
        let c = store.path_for(Path::new("/y/data.bin")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("-data.bin.parsec-resume"));
        assert_eq!(name.find('-'), Some(16));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("input.bin");
        let store = ResumeStore::new(None, Duration::from_secs(3600));
        store.save(&upload_state(&local)).unwrap();

        let path = store.path_for(&local).unwrap();
        let mut value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["written_by"] = serde_json::json!("parsec 0.2");
        fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        assert!(store.load(&local).unwrap().is_some());
    }

    #[test]
    fn test_missing_required_field_is_invalid_and_discarded() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("input.bin");
        let store = ResumeStore::new(None, Duration::from_secs(3600));
        store.save(&upload_state(&local)).unwrap();

        let path = store.path_for(&local).unwrap();
        let mut value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("chunk_size");
        fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        let err = store.load(&local).unwrap_err();
        assert!(matches!(err, ParsecError::ResumeStateInvalid(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_newer_version_is_invalid() {
        let mut state = upload_state(Path::new("/data/input.bin"));
        state.version = RESUME_VERSION + 1;
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_inconsistent_byte_count_is_invalid() {
        let mut state = upload_state(Path::new("/data/input.bin"));
        state.record_part(chunk(0, "a", 30));
        state.bytes_transferred = 45;
        assert!(state.validate().is_err());

        let mut state = upload_state(Path::new("/data/input.bin"));
        state.record_part(chunk(3, "a", 30));
        assert!(state.validate().is_err(), "last part must hold the remainder");
    }

    #[test]
    fn test_encrypted_size_uses_padding_range() {
        let mut state = upload_state(Path::new("/data/input.bin"));
        state.encryption = Some(EncryptionParams {
            key_hex: "00".repeat(32),
            iv_hex: "00".repeat(16),
        });
        state.plaintext_size = 95;
        state.total_size = 96;
        assert!(state.validate().is_ok());
        state.total_size = 111;
        assert!(state.validate().is_ok());
        state.total_size = 112;
        assert!(state.validate().is_err());
        state.total_size = 95;
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_stale_state_is_deleted_on_load() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("input.bin");
        let store = ResumeStore::new(None, Duration::from_secs(7 * 24 * 3600));

        let mut state = upload_state(&local);
        state.updated_at = Utc::now() - chrono::Duration::days(8);
        store.save(&state).unwrap();

        assert!(store.load(&local).unwrap().is_none());
        assert!(!store.path_for(&local).unwrap().exists());
    }

    #[test]
    fn test_purge_stale_keeps_fresh_states() {
        let dir = tempdir().unwrap();
        let store = ResumeStore::new(Some(dir.path().to_path_buf()), Duration::from_secs(3600));

        let fresh = upload_state(Path::new("/data/fresh.bin"));
        let mut old = upload_state(Path::new("/data/old.bin"));
        old.updated_at = Utc::now() - chrono::Duration::hours(2);
        store.save(&fresh).unwrap();
        store.save(&old).unwrap();
        fs::write(dir.path().join("garbage.parsec-resume"), "{ not json").unwrap();
        fs::write(dir.path().join("unrelated.txt"), "keep me").unwrap();

        assert_eq!(store.purge_stale().unwrap(), 2);
        assert!(store.load(Path::new("/data/fresh.bin")).unwrap().is_some());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("input.bin");
        let store = ResumeStore::new(None, Duration::from_secs(3600));

        let mut state = upload_state(&local);
        for index in 0..3 {
            state.record_part(CompletedChunk { index, etag: format!("e{index}"), size: 30 });
            store.save(&state).unwrap();
        }

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["input.bin.parsec-resume".to_string()]);
    }
}
