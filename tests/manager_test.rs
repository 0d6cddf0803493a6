mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{pattern, test_config, CHUNK};
use parsec::remote::{FaultKind, FaultOp};
use parsec::{
    Direction, EventClass, MasterSecret, MemoryPlatform, ParsecError, Priority, TaskHandle,
    TaskState, TransferConfig, TransferEvent, TransferManager, TransferRequest,
};
use tempfile::TempDir;

struct Setup {
    dir: TempDir,
    platform: Arc<MemoryPlatform>,
    manager: TransferManager,
}

fn setup(tweak: impl FnOnce(&mut TransferConfig)) -> Setup {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let platform = Arc::new(MemoryPlatform::new());
    let manager = TransferManager::new(
        config,
        platform.clone(),
        platform.clone(),
        MasterSecret::generate(),
    )
    .unwrap();
    Setup {
        dir,
        platform,
        manager,
    }
}

impl Setup {
    fn upload(&self, name: &str, len: usize) -> TransferRequest {
        let path = self.dir.path().join(name);
        std::fs::write(&path, pattern(len, 1)).unwrap();
        TransferRequest::new(Direction::Upload, path, name, len as u64, "test")
    }

    async fn wait_for(&self, handle: &TaskHandle, state: TaskState) {
        for _ in 0..500 {
            if self.manager.state(handle) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never reached {}", state);
    }
}

fn drain(events: &mut parsec::EventStream) -> Vec<TransferEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_completed_task_lifecycle_events() {
    let s = setup(|_| {});
    let mut lifecycle = s.manager.subscribe(EventClass::Lifecycle);

    let handle = s
        .manager
        .submit(s.upload("report.csv", 3 * CHUNK as usize).with_batch("b-1", "nightly"))
        .unwrap();
    assert_eq!(s.manager.wait(&handle).await.unwrap(), TaskState::Completed);

    let events = drain(&mut lifecycle);
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            TransferEvent::Queued { .. } => "queued",
            TransferEvent::Started { .. } => "started",
            TransferEvent::Completed { .. } => "completed",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["queued", "started", "completed"]);
    match events.last().unwrap() {
        TransferEvent::Completed {
            total_bytes,
            checksum,
            ..
        } => {
            assert_eq!(*total_bytes, 3 * CHUNK);
            assert!(checksum.is_some());
        }
        other => panic!("unexpected event {:?}", other),
    }

    let task = s.manager.task(&handle).unwrap();
    assert_eq!(task.progress().fraction, 1.0);
    assert_eq!(task.batch.as_ref().unwrap().label, "nightly");
    assert!(task.finished_at().is_some());

    let stats = s.manager.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.active_transfers, 0);
    assert_eq!(stats.active_slots, 0);
}

#[tokio::test]
async fn test_failed_task_carries_failure_report() {
    let s = setup(|_| {});
    let missing = s.dir.path().join("gone.bin");
    let handle = s
        .manager
        .submit(TransferRequest::new(
            Direction::Upload,
            &missing,
            "gone.bin",
            10,
            "test",
        ))
        .unwrap();

    assert_eq!(s.manager.wait(&handle).await.unwrap(), TaskState::Failed);
    let task = s.manager.task(&handle).unwrap();
    let failure = task.error().unwrap();
    assert_eq!(failure.kind, "PathInvalid");
    assert_eq!(failure.object, "gone.bin");
    assert_eq!(s.manager.stats().failed, 1);
}

#[tokio::test]
async fn test_fatal_platform_error_fails_task_once() {
    let s = setup(|_| {});
    s.platform.inject(FaultOp::Complete, FaultKind::Fatal, 1);
    let mut lifecycle = s.manager.subscribe(EventClass::Lifecycle);

    let handle = s.manager.submit(s.upload("x.bin", 2 * CHUNK as usize)).unwrap();
    assert_eq!(s.manager.wait(&handle).await.unwrap(), TaskState::Failed);

    let failed = drain(&mut lifecycle)
        .into_iter()
        .filter(|e| matches!(e, TransferEvent::Failed { .. }))
        .count();
    assert_eq!(failed, 1);
}

#[tokio::test]
async fn test_cancel_is_immediate_and_final() {
    let s = setup(|_| {});
    s.platform.set_latency(Duration::from_millis(30));
    let handle = s.manager.submit(s.upload("slow.bin", 20 * CHUNK as usize)).unwrap();

    s.manager.cancel(&handle).unwrap();
    assert_eq!(s.manager.state(&handle), Some(TaskState::Cancelled));
    // Second cancel is a no-op
    s.manager.cancel(&handle).unwrap();

    assert_eq!(s.manager.wait(&handle).await.unwrap(), TaskState::Cancelled);
    let stats = s.manager.stats();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.failed, 0);
    assert!(s.platform.object("slow.bin").is_none());
}

#[tokio::test]
async fn test_pause_holds_parts_until_resume() {
    let s = setup(|c| c.concurrency.max_workers_per_file = 2);
    s.platform.set_latency(Duration::from_millis(20));
    let handle = s.manager.submit(s.upload("big.bin", 30 * CHUNK as usize)).unwrap();

    s.wait_for(&handle, TaskState::Active).await;
    s.manager.pause(&handle).unwrap();
    assert_eq!(s.manager.state(&handle), Some(TaskState::Paused));

    // Parts already in flight drain, then nothing moves
    tokio::time::sleep(Duration::from_millis(100)).await;
    let frozen = s.platform.counters().part_writes;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(s.platform.counters().part_writes, frozen);
    assert!(frozen < 30);

    // Repeated requests are no-ops
    assert!(s.manager.pause(&handle).is_ok());
    s.manager.resume(&handle).unwrap();
    assert!(s.manager.resume(&handle).is_ok());

    assert_eq!(s.manager.wait(&handle).await.unwrap(), TaskState::Completed);
    assert_eq!(s.platform.counters().part_writes, 30);
}

#[tokio::test]
async fn test_pause_requires_active_task() {
    let s = setup(|c| c.concurrency.max_concurrent_transfers = 1);
    s.platform.set_latency(Duration::from_millis(20));
    let first = s.manager.submit(s.upload("a.bin", 10 * CHUNK as usize)).unwrap();
    let second = s.manager.submit(s.upload("b.bin", 10 * CHUNK as usize)).unwrap();

    // Second task waits for the only slot
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(s.manager.state(&second), Some(TaskState::Queued));
    let err = s.manager.pause(&second).unwrap_err();
    assert!(matches!(err, ParsecError::Validation(_)));

    s.manager.wait(&first).await.unwrap();
    s.manager.wait(&second).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_global_worker_pool_bounds_parallel_parts() {
    let s = setup(|c| {
        c.concurrency.max_workers = 3;
        c.concurrency.max_workers_per_file = 3;
        c.concurrency.max_concurrent_transfers = 4;
    });
    s.platform.set_latency(Duration::from_millis(5));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            s.manager
                .submit(s.upload(&format!("f{}.bin", i), 8 * CHUNK as usize))
                .unwrap()
        })
        .collect();
    for handle in &handles {
        assert_eq!(s.manager.wait(handle).await.unwrap(), TaskState::Completed);
    }

    let counters = s.platform.counters();
    assert_eq!(counters.part_writes, 32);
    assert!(counters.peak_in_flight <= 3, "peak {}", counters.peak_in_flight);
    assert_eq!(s.manager.tasks().len(), 4);
    assert_eq!(s.manager.purge_terminal(), 4);
    assert!(s.manager.tasks().is_empty());
}

#[tokio::test]
async fn test_high_priority_allocation_ignores_load() {
    let s = setup(|c| {
        c.concurrency.max_workers = 4;
        c.concurrency.max_workers_per_file = 4;
        c.engine.multipart_threshold = 100 * 1024 * 1024;
    });
    let size = 2 * 1024 * 1024 * 1024;
    let hog = s.manager.allocate_transfer(size, Priority::Normal).unwrap();
    assert_eq!(hog.workers(), 4);
    assert_eq!(
        s.manager.allocate_transfer(size, Priority::Normal).unwrap().workers(),
        1
    );
    assert_eq!(
        s.manager.allocate_transfer(size, Priority::High).unwrap().workers(),
        4
    );
}

#[tokio::test]
async fn test_shutdown_cancels_everything() {
    let s = setup(|c| c.concurrency.max_concurrent_transfers = 1);
    s.platform.set_latency(Duration::from_millis(20));
    let running = s.manager.submit(s.upload("r.bin", 20 * CHUNK as usize)).unwrap();
    let queued = s.manager.submit(s.upload("q.bin", 20 * CHUNK as usize)).unwrap();

    s.manager.shutdown().await;
    assert_eq!(s.manager.state(&running), Some(TaskState::Cancelled));
    assert_eq!(s.manager.state(&queued), Some(TaskState::Cancelled));
    assert!(matches!(
        s.manager.submit(s.upload("late.bin", 10)),
        Err(ParsecError::Shutdown)
    ));
}
