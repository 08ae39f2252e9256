//! End-to-end tests for write-then-catch-up against a simulated metadata topic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use helix_rlmm::{
    encode_event, encode_key, BrokerId, CheckpointStore, FileCheckpointStore, HandlerError,
    HashPartitioner, InMemoryCheckpointStore, LogFaultConfig, LogProducer, MetadataEvent,
    MetadataEventHandler, MetadataPartition, PartitionAssignment, PartitionId, RemoteLogSegmentId,
    RemoteLogSegmentMetadata, RlmmConfig, RlmmError, SegmentId, SimulatedLog,
    SynchronizationManager, TaskState, TopicId, TopicIdPartition,
};

const PARTITIONS: u32 = 8;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
struct CountingHandler {
    handled: AtomicU64,
}

impl MetadataEventHandler for CountingHandler {
    fn handle(&self, _event: &MetadataEvent) -> Result<(), HandlerError> {
        self.handled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn manager_with(
    log: &SimulatedLog,
    store: Arc<dyn CheckpointStore>,
    handler: Arc<dyn MetadataEventHandler>,
) -> SynchronizationManager {
    SynchronizationManager::new(
        RlmmConfig::for_testing().with_metadata_partitions(PARTITIONS),
        Arc::new(PartitionAssignment::new(Arc::new(HashPartitioner::new(PARTITIONS)))),
        Box::new(log.consumer()),
        store,
        handler,
    )
    .unwrap()
}

fn manager(log: &SimulatedLog) -> SynchronizationManager {
    manager_with(
        log,
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(CountingHandler::default()),
    )
}

/// Produces `count` segment events to `partition`, returning the last offset.
async fn produce(log: &SimulatedLog, partition: MetadataPartition, count: u64) -> u64 {
    let producer = log.producer();
    let tp = TopicIdPartition::new(TopicId::new(1), PartitionId::new(0));
    let mut last = 0;
    for segment in 0..count {
        let event = MetadataEvent::SegmentAdded(RemoteLogSegmentMetadata::new(
            RemoteLogSegmentId::new(tp, SegmentId::new(segment)),
            segment * 10,
            segment * 10 + 9,
            0,
            BrokerId::new(1),
            0,
            10,
            [(0, segment * 10)].into_iter().collect(),
        ));
        let record = producer
            .produce(partition, encode_key(&tp), encode_event(&event))
            .await
            .unwrap();
        assert_eq!(record.partition, partition);
        last = record.offset;
    }
    last
}

// -----------------------------------------------------------------------------
// Catch-up
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_produced_record_is_caught_up() {
    init_tracing();
    let log = SimulatedLog::new(PARTITIONS, 7);
    let p3 = MetadataPartition::new(3);
    let manager = manager(&log);
    manager.add_assignments([p3]);
    manager.start().unwrap();

    let offset = produce(&log, p3, 43).await;
    assert_eq!(offset, 42);

    manager
        .wait_for_offset(p3, 42, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(manager.received_offset(p3) >= Some(42));

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_removed_partition_is_not_assigned() {
    init_tracing();
    let log = SimulatedLog::new(PARTITIONS, 7);
    let p0 = MetadataPartition::new(0);
    let p1 = MetadataPartition::new(1);
    let manager = manager(&log);
    manager.add_assignments([p0, p1]);
    manager.remove_assignments([p1]);
    manager.start().unwrap();

    let started = Instant::now();
    let err = manager
        .wait_for_offset(p1, 5, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err, RlmmError::NotAssigned { partition: p1 });
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(manager.is_assigned(p0));

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_wait_keeps_last_progress_after_unassign() {
    init_tracing();
    let log = SimulatedLog::new(PARTITIONS, 7);
    let p0 = MetadataPartition::new(0);
    let manager = Arc::new(manager(&log));
    manager.add_assignments([p0]);
    manager.start().unwrap();
    let offset = produce(&log, p0, 3).await;
    manager
        .wait_for_offset(p0, offset, Duration::from_secs(5))
        .await
        .unwrap();

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .wait_for_offset(p0, 10, Duration::from_millis(600))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    manager.remove_assignments([p0]);

    let err = waiter.await.unwrap().unwrap_err();
    match err {
        RlmmError::CatchUpTimeout {
            partition,
            last_seen,
            target,
            ..
        } => {
            assert_eq!(partition, p0);
            assert_eq!(last_seen, Some(2));
            assert_eq!(target, 10);
        }
        other => panic!("unexpected error: {other}"),
    }
    // The consumer has dropped the partition by now.
    assert_eq!(manager.received_offset(p0), None);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_many_waiters_across_partitions() {
    init_tracing();
    let log = SimulatedLog::new(PARTITIONS, 7);
    let manager = Arc::new(manager(&log));
    let partitions: Vec<_> = (0..PARTITIONS).map(MetadataPartition::new).collect();
    manager.add_assignments(partitions.iter().copied());
    manager.start().unwrap();

    let mut waiters = Vec::new();
    for partition in &partitions {
        let manager = Arc::clone(&manager);
        let partition = *partition;
        waiters.push(tokio::spawn(async move {
            manager
                .wait_for_offset(partition, 4, Duration::from_secs(5))
                .await
        }));
    }
    for partition in &partitions {
        produce(&log, *partition, 5).await;
    }

    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_flaky_log_still_catches_up() {
    init_tracing();
    let log = SimulatedLog::with_faults(PARTITIONS, 99, LogFaultConfig::flaky());
    let p2 = MetadataPartition::new(2);
    let manager = manager(&log);
    manager.add_assignments([p2]);
    manager.start().unwrap();

    let offset = produce(&log, p2, 100).await;
    manager
        .wait_for_offset(p2, offset, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(manager.failure().is_none());

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_fatal_error_fails_pending_and_future_waits() {
    init_tracing();
    let log = SimulatedLog::new(PARTITIONS, 7);
    let p0 = MetadataPartition::new(0);
    let manager = Arc::new(manager(&log));
    manager.add_assignments([p0]);
    manager.start().unwrap();

    let pending = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.wait_for_offset(p0, 100, Duration::from_secs(30)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    log.fault_config().poll_fatal = true;

    let err = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RlmmError::ConsumerTerminated { .. }), "{err}");

    let err = manager
        .wait_for_offset(p0, 100, Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, RlmmError::ConsumerTerminated { .. }), "{err}");

    manager.close().await.unwrap();
    assert_eq!(manager.state(), TaskState::Closed);
}

// -----------------------------------------------------------------------------
// Lifecycle
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_close_twice_is_noop() {
    init_tracing();
    let log = SimulatedLog::new(PARTITIONS, 7);
    let manager = manager(&log);
    manager.add_assignments([MetadataPartition::new(0)]);
    manager.start().unwrap();

    assert!(manager.close().await.is_ok());
    let state = manager.state();
    assert!(manager.close().await.is_ok());
    assert_eq!(manager.state(), state);
    assert_eq!(state, TaskState::Closed);
}

#[tokio::test]
async fn test_restart_resumes_from_checkpoint_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let log = SimulatedLog::new(PARTITIONS, 7);
    let p5 = MetadataPartition::new(5);

    let first = Arc::new(CountingHandler::default());
    let manager = manager_with(
        &log,
        Arc::new(FileCheckpointStore::for_testing(dir.path())),
        Arc::clone(&first) as Arc<dyn MetadataEventHandler>,
    );
    manager.add_assignments([p5]);
    manager.start().unwrap();
    let offset = produce(&log, p5, 10).await;
    manager
        .wait_for_offset(p5, offset, Duration::from_secs(5))
        .await
        .unwrap();
    manager.close().await.unwrap();
    assert_eq!(first.handled.load(Ordering::Relaxed), 10);

    let saved = FileCheckpointStore::for_testing(dir.path()).load().await.unwrap();
    assert_eq!(saved.get(&p5), Some(&9));

    let second = Arc::new(CountingHandler::default());
    let manager = manager_with(
        &log,
        Arc::new(FileCheckpointStore::for_testing(dir.path())),
        Arc::clone(&second) as Arc<dyn MetadataEventHandler>,
    );
    manager.add_assignments([p5]);
    manager.start().unwrap();
    let offset = produce(&log, p5, 5).await;
    assert_eq!(offset, 14);
    manager
        .wait_for_offset(p5, offset, Duration::from_secs(5))
        .await
        .unwrap();
    manager.close().await.unwrap();

    // Only the new records were replayed.
    assert_eq!(second.handled.load(Ordering::Relaxed), 5);
}

#[tokio::test]
async fn test_garbage_records_do_not_block_catch_up() {
    init_tracing();
    let log = SimulatedLog::new(PARTITIONS, 7);
    let p4 = MetadataPartition::new(4);
    let handler = Arc::new(CountingHandler::default());
    let manager = manager_with(
        &log,
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::clone(&handler) as Arc<dyn MetadataEventHandler>,
    );
    manager.add_assignments([p4]);
    manager.start().unwrap();

    log.append(p4, Bytes::from_static(b"?"), Bytes::from_static(b"not an event"))
        .unwrap();
    let offset = produce(&log, p4, 1).await;
    manager
        .wait_for_offset(p4, offset, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(handler.handled.load(Ordering::Relaxed), 1);

    manager.close().await.unwrap();
}
