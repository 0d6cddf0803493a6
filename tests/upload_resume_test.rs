mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{pattern, sha512_hex, FixedSpace, Harness, CHUNK};
use parsec::remote::{FaultKind, FaultOp};
use parsec::{Direction, ObjectStore, ParsecError, TransferJob};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_failed_part_resumes_without_resending_earlier_parts() {
    let h = Harness::new();
    let (path, data) = h.local_file("mesh.h5", 5 * CHUNK as usize);
    h.platform.inject(FaultOp::UploadPart(3), FaultKind::Fatal, 1);

    let job = h.upload_job(&path, "jobs/mesh.h5");
    let err = h.engine.run(&job).await.unwrap_err();
    assert_eq!(err.kind_name(), "Validation");
    assert_eq!(h.platform.part_log(), vec![1, 2]);

    let sidecar = h.engine.resume_store().load(&path).unwrap().unwrap();
    assert_eq!(sidecar.completed_parts.len(), 2);
    assert!(sidecar.session_id.is_some());
    assert!(h.platform.object("jobs/mesh.h5").is_none());

    let before = h.platform.counters().part_writes;
    let outcome = h.engine.run(&h.upload_job(&path, "jobs/mesh.h5")).await.unwrap();

    assert_eq!(h.platform.part_log(), vec![1, 2, 3, 4, 5]);
    assert_eq!(h.platform.counters().part_writes - before, 3);
    assert_eq!(outcome.parts_written, 3);
    assert_eq!(outcome.resumed_parts, 2);
    assert_eq!(outcome.checksum, sha512_hex(&data));
    assert_eq!(h.platform.object_bytes("jobs/mesh.h5").unwrap(), data);
    assert!(h.engine.resume_store().load(&path).unwrap().is_none());
    assert_eq!(h.platform.open_uploads(), 0);
}

fn staged_files(h: &Harness) -> usize {
    std::fs::read_dir(h.path("staging")).map(|dir| dir.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_encrypted_upload_resumes_from_staged_artifact() {
    let h = Harness::with_config(|c| c.engine.encrypt = true);
    let (path, data) = h.local_file("mesh.h5", 5 * CHUNK as usize);
    h.platform.inject(FaultOp::UploadPart(3), FaultKind::Fatal, 1);

    assert!(h.engine.run(&h.upload_job(&path, "jobs/mesh.h5")).await.is_err());
    assert_eq!(h.platform.part_log(), vec![1, 2]);
    assert_eq!(staged_files(&h), 1);

    let sidecar = h.engine.resume_store().load(&path).unwrap().unwrap();
    assert!(sidecar.encryption.is_some());
    // Aligned plaintext gains a full padding block
    assert_eq!(sidecar.total_size, 5 * CHUNK + 16);
    assert_eq!(sidecar.part_count(), 6);

    let before = h.platform.counters().part_writes;
    let outcome = h.engine.run(&h.upload_job(&path, "jobs/mesh.h5")).await.unwrap();

    assert_eq!(h.platform.part_log(), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(h.platform.counters().part_writes - before, 4);
    assert_eq!(outcome.resumed_parts, 2);
    assert_eq!(outcome.parts_written, 4);
    assert_eq!(outcome.checksum, sha512_hex(&data));
    assert_eq!(staged_files(&h), 0);

    let object = h.platform.object("jobs/mesh.h5").unwrap();
    assert_eq!(object.metadata.suffix.as_deref(), Some(sidecar.suffix.as_str()));

    let target = h.path("mesh.out");
    let job = h.download_job(&target, "jobs/mesh.h5", data.len() as u64);
    h.engine.run(&job).await.unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), data);
}

#[tokio::test]
async fn test_changed_encryption_setting_restarts_upload() {
    let h = Harness::new();
    let (path, data) = h.local_file("switch.bin", 4 * CHUNK as usize);
    h.platform.inject(FaultOp::UploadPart(3), FaultKind::Fatal, 1);
    assert!(h.engine.run(&h.upload_job(&path, "switch.bin")).await.is_err());
    assert_eq!(h.platform.open_uploads(), 1);

    let encrypted = h.relaunch(|c| c.engine.encrypt = true);
    let outcome = encrypted.run(&h.upload_job(&path, "switch.bin")).await.unwrap();

    assert_eq!(outcome.resumed_parts, 0);
    assert_eq!(outcome.parts_written, 5);
    assert_eq!(h.platform.open_uploads(), 0);
    assert!(h.platform.object("switch.bin").unwrap().metadata.encryption.is_some());

    let target = h.path("switch.out");
    let job = h.download_job(&target, "switch.bin", data.len() as u64);
    encrypted.run(&job).await.unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), data);
}

#[tokio::test]
async fn test_rewritten_plaintext_discards_staged_artifact() {
    let h = Harness::with_config(|c| c.engine.encrypt = true);
    let (path, _) = h.local_file("notes.txt", 3 * CHUNK as usize);
    h.platform.inject(FaultOp::UploadPart(2), FaultKind::Fatal, 1);
    assert!(h.engine.run(&h.upload_job(&path, "notes.txt")).await.is_err());
    assert_eq!(staged_files(&h), 1);

    // Same size, different content
    let rewritten = pattern(3 * CHUNK as usize, 200);
    std::fs::write(&path, &rewritten).unwrap();

    let outcome = h.engine.run(&h.upload_job(&path, "notes.txt")).await.unwrap();
    assert_eq!(outcome.resumed_parts, 0);
    assert_eq!(outcome.checksum, sha512_hex(&rewritten));
    assert_eq!(staged_files(&h), 0);

    let target = h.path("notes.out");
    let job = h.download_job(&target, "notes.txt", rewritten.len() as u64);
    h.engine.run(&job).await.unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), rewritten);
}

#[tokio::test]
async fn test_relaunch_after_failed_commit_sends_no_parts() {
    let h = Harness::new();
    let (path, data) = h.local_file("restart.bin", 4 * CHUNK as usize);
    h.platform.inject(FaultOp::Complete, FaultKind::Fatal, 1);

    assert!(h.engine.run(&h.upload_job(&path, "restart.bin")).await.is_err());
    assert_eq!(h.platform.counters().part_writes, 4);

    let outcome = h.engine.run(&h.upload_job(&path, "restart.bin")).await.unwrap();
    assert_eq!(outcome.parts_written, 0);
    assert_eq!(h.platform.counters().part_writes, 4);
    assert_eq!(h.platform.object_bytes("restart.bin").unwrap(), data);
}

#[tokio::test]
async fn test_expired_session_restarts_upload() {
    let h = Harness::new();
    let (path, data) = h.local_file("session.bin", 3 * CHUNK as usize);
    h.platform.inject(FaultOp::UploadPart(2), FaultKind::Fatal, 1);
    assert!(h.engine.run(&h.upload_job(&path, "session.bin")).await.is_err());

    // Platform forgets the session between runs
    let sidecar = h.engine.resume_store().load(&path).unwrap().unwrap();
    let upload_id = sidecar.session_id.clone().unwrap();
    let lease = h
        .engine
        .credentials()
        .get(&sidecar.storage, &CancellationToken::new())
        .await
        .unwrap();
    h.platform
        .abort_upload(&lease, "session.bin", &upload_id)
        .await
        .unwrap();

    let outcome = h.engine.run(&h.upload_job(&path, "session.bin")).await.unwrap();
    assert_eq!(outcome.resumed_parts, 0);
    assert_eq!(outcome.parts_written, 3);
    assert_eq!(h.platform.object_bytes("session.bin").unwrap(), data);
}

#[tokio::test]
async fn test_encrypted_upload_round_trips() {
    let h = Harness::with_config(|c| c.engine.encrypt = true);
    let (path, data) = h.local_file("secret.dat", 3 * CHUNK as usize + 100);

    let outcome = h
        .engine
        .run(&h.upload_job(&path, "vault/secret.dat"))
        .await
        .unwrap();
    assert_eq!(outcome.bytes, data.len() as u64);

    let object = h.platform.object("vault/secret.dat").unwrap();
    let plain = data.len() as u64;
    assert!(object.size >= plain + 1 && object.size <= plain + 16);
    assert!(object.metadata.encryption.is_some());
    assert_ne!(&h.platform.object_bytes("vault/secret.dat").unwrap()[..64], &data[..64]);

    // Staged artifact is gone
    let staged: Vec<_> = std::fs::read_dir(h.path("staging")).unwrap().collect();
    assert!(staged.is_empty());

    let target = h.path("restored.dat");
    let job = h.download_job(&target, "vault/secret.dat", plain);
    let restored = h.engine.run(&job).await.unwrap();
    assert_eq!(restored.checksum, outcome.checksum);
    assert_eq!(std::fs::read(&target).unwrap(), data);
}

#[tokio::test]
async fn test_existing_object_is_a_conflict() {
    let h = Harness::new();
    let (path, _) = h.local_file("dup.txt", 100);
    h.seed_object("dup.txt", b"already here");

    let err = h.engine.run(&h.upload_job(&path, "dup.txt")).await.unwrap_err();
    assert!(matches!(err, ParsecError::RemoteConflict { .. }));
    assert_eq!(h.platform.counters().puts, 0);
}

#[tokio::test]
async fn test_fast_mode_skips_duplicate_check() {
    let h = Harness::with_config(|c| c.engine.fast_mode = true);
    let (path, data) = h.local_file("fast.txt", 100);
    h.seed_object("other.txt", b"x");

    h.engine.run(&h.upload_job(&path, "fast.txt")).await.unwrap();
    assert_eq!(h.platform.counters().exists_checks, 0);
    assert_eq!(h.platform.object_bytes("fast.txt").unwrap(), data);
}

#[tokio::test]
async fn test_zero_byte_file() {
    let h = Harness::with_config(|c| c.engine.encrypt = true);
    let (path, _) = h.local_file("empty", 0);

    let outcome = h.engine.run(&h.upload_job(&path, "empty")).await.unwrap();
    assert_eq!(outcome.bytes, 0);
    assert_eq!(h.platform.object("empty").unwrap().size, 16);

    let target = h.path("empty.out");
    h.engine.run(&h.download_job(&target, "empty", 0)).await.unwrap();
    assert_eq!(std::fs::read(&target).unwrap().len(), 0);
}

#[tokio::test]
async fn test_missing_or_mismatched_source() {
    let h = Harness::new();
    let missing = h.path("missing.bin");
    let job = TransferJob::new(Direction::Upload, &missing, "k", 10);
    let err = h.engine.run(&job).await.unwrap_err();
    assert!(matches!(err, ParsecError::PathInvalid { .. }));

    let (path, _) = h.local_file("short.bin", 10);
    let job = TransferJob::new(Direction::Upload, &path, "short.bin", 11);
    let err = h.engine.run(&job).await.unwrap_err();
    assert!(matches!(err, ParsecError::Validation(_)));
}

#[tokio::test]
async fn test_insufficient_staging_space() {
    let h = Harness::with_config(|c| c.engine.encrypt = true);
    let engine = h.engine.clone().with_space(Arc::new(FixedSpace(1024)));
    let (path, _) = h.local_file("big.bin", 4 * CHUNK as usize);

    let err = engine.run(&h.upload_job(&path, "big.bin")).await.unwrap_err();
    assert!(matches!(err, ParsecError::InsufficientDiskSpace { .. }));
    assert_eq!(h.platform.counters().uploads_created, 0);
}

#[tokio::test]
async fn test_throttled_and_reset_parts_are_retried() {
    let h = Harness::new();
    let (path, data) = h.local_file("flaky.bin", 4 * CHUNK as usize);
    h.platform.inject(
        FaultOp::AnyUploadPart,
        FaultKind::Throttle(Some(Duration::from_millis(5))),
        3,
    );
    h.platform.inject(FaultOp::UploadPart(4), FaultKind::Transient, 2);

    let outcome = h
        .engine
        .run(&h.upload_job(&path, "flaky.bin").with_parallelism(2))
        .await
        .unwrap();
    assert_eq!(outcome.parts_written, 4);
    assert_eq!(h.platform.object_bytes("flaky.bin").unwrap(), data);
}

#[tokio::test]
async fn test_revoked_credentials_are_renewed() {
    let h = Harness::new();
    let (first, _) = h.local_file("one.bin", 2 * CHUNK as usize);
    let (second, data) = h.local_file("two.bin", 2 * CHUNK as usize);

    h.engine.run(&h.upload_job(&first, "one.bin")).await.unwrap();
    let issued = h.platform.counters().credential_issues;

    h.platform.expire_leases();
    h.engine.run(&h.upload_job(&second, "two.bin")).await.unwrap();

    assert!(h.platform.counters().credential_issues > issued);
    assert_eq!(h.platform.object_bytes("two.bin").unwrap(), data);
}

#[tokio::test]
async fn test_cancel_leaves_valid_or_no_sidecar() {
    let h = Harness::new();
    h.platform.set_latency(Duration::from_millis(20));
    let (path, _) = h.local_file("cancel.bin", 20 * CHUNK as usize);

    let cancel = CancellationToken::new();
    let job = h
        .upload_job(&path, "cancel.bin")
        .with_parallelism(2)
        .with_cancel(cancel.clone());
    let engine = h.engine.clone();
    let running = tokio::spawn(async move { engine.run(&job).await });

    tokio::time::sleep(Duration::from_millis(70)).await;
    cancel.cancel();
    let err = running.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());

    if let Some(state) = h.engine.resume_store().load(&path).unwrap() {
        state.validate().unwrap();
        assert!(!state.completed_parts.is_empty());
        assert!(!state.is_complete());
    }
    assert!(h.platform.object("cancel.bin").is_none());
}
