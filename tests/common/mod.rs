#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parsec::config::BucketSettings;
use parsec::core::checksum::StreamingHasher;
use parsec::core::AvailableSpace;
use parsec::remote::ObjectMetadata;
use parsec::{
    Direction, MasterSecret, MemoryPlatform, Result, StorageContext, TransferConfig,
    TransferEngine, TransferJob,
};
use tempfile::TempDir;

pub const CHUNK: u64 = 1024;

/// Small parts, fast retries and a rate limit that never gets in the way
pub fn test_config(root: &Path) -> TransferConfig {
    parsec::logging::init_test_logging();
    let mut config = TransferConfig::default();
    config.engine.chunk_size = CHUNK;
    config.engine.multipart_threshold = CHUNK;
    config.engine.encrypt = false;
    config.engine.staging_dir = Some(root.join("staging"));
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 20;
    config.rate_limit.general = BucketSettings {
        hard_limit_per_sec: 100_000.0,
        headroom: 1.0,
        burst: 10_000,
    };
    config.rate_limit.submission = BucketSettings {
        hard_limit_per_sec: 100_000.0,
        headroom: 1.0,
        burst: 10_000,
    };
    config
}

pub struct Harness {
    pub dir: TempDir,
    pub platform: Arc<MemoryPlatform>,
    pub engine: TransferEngine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut TransferConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let platform = Arc::new(MemoryPlatform::new());
        let engine = build_engine(dir.path(), &platform, tweak);
        Self {
            dir,
            platform,
            engine,
        }
    }

    /// Second engine over the same directory and platform, as after a relaunch
    pub fn relaunch(&self, tweak: impl FnOnce(&mut TransferConfig)) -> TransferEngine {
        build_engine(self.dir.path(), &self.platform, tweak)
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write `len` bytes of patterned data to `name`
    pub fn local_file(&self, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let path = self.path(name);
        let data = pattern(len, name.len() as u8);
        fs::write(&path, &data).unwrap();
        (path, data)
    }

    pub fn upload_job(&self, path: &Path, key: &str) -> TransferJob {
        let size = fs::metadata(path).unwrap().len();
        TransferJob::new(Direction::Upload, path, key, size)
    }

    pub fn download_job(&self, path: &Path, key: &str, size: u64) -> TransferJob {
        TransferJob::new(Direction::Download, path, key, size)
    }

    /// Store an unencrypted object directly on the platform
    pub fn seed_object(&self, key: &str, data: &[u8]) {
        self.platform.insert_object(
            key,
            data.to_vec(),
            StorageContext::new("memory", "primary"),
            ObjectMetadata {
                plaintext_size: data.len() as u64,
                plaintext_checksum: Some(sha512_hex(data)),
                encryption: None,
                suffix: None,
            },
        );
    }
}

fn build_engine(
    root: &Path,
    platform: &Arc<MemoryPlatform>,
    tweak: impl FnOnce(&mut TransferConfig),
) -> TransferEngine {
    let mut config = test_config(root);
    tweak(&mut config);
    TransferEngine::new(
        Arc::new(config),
        platform.clone(),
        platform.clone(),
        MasterSecret::new(vec![7u8; 32]).unwrap(),
    )
    .unwrap()
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + seed as usize) % 251) as u8)
        .collect()
}

pub fn sha512_hex(data: &[u8]) -> String {
    let mut hasher = StreamingHasher::new();
    hasher.update(data);
    hasher.finalize_hex()
}

/// Volume that reports a fixed amount of free space
pub struct FixedSpace(pub u64);

impl AvailableSpace for FixedSpace {
    fn available_space(&self, _path: &Path) -> Result<u64> {
        Ok(self.0)
    }
}
