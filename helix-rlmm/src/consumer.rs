//! Background consumer task.
//!
//! The task is the only user of the log consumer, the checkpoint store and
//! the event handler. It shares two things with the rest of the process: the
//! `PartitionAssignment` it reads and the `OffsetTracker` it writes.
//!
//! # State Machine
//!
//! ```text
//! Created ──run──▶ Running ──shutdown or fatal error──▶ Closing ──▶ Closed
//! ```
//!
//! The shutdown flag is checked once per iteration, so a close request is
//! observed after at most one poll timeout plus the processing of one batch.
//!
//! # Replay
//!
//! When a user partition becomes primary, its metadata partition already
//! holds events this instance never applied for it. The partition is then
//! re-read from offset 0 up to the offset consumed so far, applying only the
//! events of the promoted user partitions. Progress is not advanced while
//! replaying. Once the replay reaches that offset, or the consumer's position
//! passes it because compaction removed the record there, the user partitions
//! are marked ready and consumption continues where it stopped. After a restart
//! this covers every primary user partition, since nothing was applied yet.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::assignment::{AssignmentSet, PartitionAssignment};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::codec::{decode_event, decode_key};
use crate::config::RlmmConfig;
use crate::error::{ClientError, RlmmError, RlmmResult};
use crate::event::MetadataEvent;
use crate::handler::MetadataEventHandler;
use crate::log::{ConsumedRecord, LogConsumer};
use crate::tracker::OffsetTracker;
use crate::types::{MetadataPartition, TopicIdPartition};

// -----------------------------------------------------------------------------
// TaskState / TaskStatus
// -----------------------------------------------------------------------------

/// Lifecycle state of the consumer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Built but not started.
    Created,
    /// Polling.
    Running,
    /// Shutting down: final checkpoint and client release in progress.
    Closing,
    /// Stopped. Nothing is consumed anymore.
    Closed,
}

impl TaskState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Status shared between the consumer task and its owner.
#[derive(Debug)]
pub struct TaskStatus {
    state: AtomicU8,
    shutdown: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(TaskState::Created.to_u8()),
            shutdown: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }
}

impl TaskStatus {
    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sets the shutdown flag. A running task moves to `Closing`.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.transition(TaskState::Running, TaskState::Closing);
    }

    /// Returns true once shutdown was requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Returns the fatal error that stopped the task, if any.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().expect("status lock poisoned").clone()
    }

    fn record_failure(&self, reason: String) {
        let mut failure = self.failure.lock().expect("status lock poisoned");
        if failure.is_none() {
            *failure = Some(reason);
        }
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set(&self, state: TaskState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }
}

// -----------------------------------------------------------------------------
// Replay
// -----------------------------------------------------------------------------

/// Re-read of a metadata partition for user partitions that became primary.
#[derive(Debug, Clone)]
struct Replay {
    /// Highest offset consumed before the replay started.
    until: u64,
    /// Highest offset replayed so far.
    replayed: Option<u64>,
    /// User partitions whose events are applied while replaying.
    partitions: BTreeSet<TopicIdPartition>,
}

impl Replay {
    fn next_offset(&self) -> u64 {
        self.replayed.map_or(0, |offset| offset.saturating_add(1))
    }
}

// -----------------------------------------------------------------------------
// ConsumerTask
// -----------------------------------------------------------------------------

/// Reads the metadata topic and drives the event handler.
pub struct ConsumerTask {
    config: RlmmConfig,
    assignment: Arc<PartitionAssignment>,
    tracker: Arc<OffsetTracker>,
    status: Arc<TaskStatus>,
    consumer: Box<dyn LogConsumer>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    handler: Arc<dyn MetadataEventHandler>,

    /// Last checkpoint loaded or successfully saved.
    persisted: Checkpoint,
    /// Partitions the consumer is currently assigned.
    subscribed: BTreeSet<MetadataPartition>,
    /// Assignment the current subscription was built from.
    applied: AssignmentSet,
    replays: BTreeMap<MetadataPartition, Replay>,
    subscribed_version: Option<u64>,
    last_subscription: Option<Instant>,
    last_checkpoint: Instant,
}

impl std::fmt::Debug for ConsumerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerTask")
            .field("state", &self.status.state())
            .field("subscribed", &self.subscribed)
            .field("replaying", &self.replays.keys())
            .field("persisted", &self.persisted)
            .finish_non_exhaustive()
    }
}

impl ConsumerTask {
    /// Creates a task in `Created` state.
    #[must_use]
    pub fn new(
        config: RlmmConfig,
        assignment: Arc<PartitionAssignment>,
        consumer: Box<dyn LogConsumer>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        handler: Arc<dyn MetadataEventHandler>,
    ) -> Self {
        Self {
            config,
            assignment,
            tracker: Arc::new(OffsetTracker::new()),
            status: Arc::new(TaskStatus::default()),
            consumer,
            checkpoint_store,
            handler,
            persisted: Checkpoint::new(),
            subscribed: BTreeSet::new(),
            applied: AssignmentSet::default(),
            replays: BTreeMap::new(),
            subscribed_version: None,
            last_subscription: None,
            last_checkpoint: Instant::now(),
        }
    }

    /// Returns the tracker this task advances.
    #[must_use]
    pub fn tracker(&self) -> Arc<OffsetTracker> {
        Arc::clone(&self.tracker)
    }

    /// Returns the shared status.
    #[must_use]
    pub fn status(&self) -> Arc<TaskStatus> {
        Arc::clone(&self.status)
    }

    /// Runs the task until shutdown is requested or a fatal error occurs.
    ///
    /// A fatal error during consumption is recorded in the status, not
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the task was already run, or if the final checkpoint
    /// or releasing the consumer fails.
    pub async fn run(mut self) -> RlmmResult<()> {
        if !self.status.transition(TaskState::Created, TaskState::Running) {
            return Err(RlmmError::InvalidState {
                message: format!("consumer task is {:?}", self.status.state()),
            });
        }
        info!("Consumer task started");

        match self.checkpoint_store.load().await {
            Ok(checkpoint) => {
                debug!(partitions = checkpoint.len(), "Loaded checkpoint");
                self.persisted = checkpoint;
                self.consume().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to load checkpoint");
                self.status.record_failure(e.to_string());
            }
        }

        self.shutdown().await
    }

    async fn consume(&mut self) {
        while !self.status.is_shutdown_requested() {
            if let Err(e) = self.maybe_resubscribe().await {
                if self.fail_if_fatal(&e) {
                    break;
                }
            }

            if self.subscribed.is_empty() {
                tokio::time::sleep(self.config.poll_timeout).await;
            } else {
                match self.consumer.poll(self.config.poll_timeout).await {
                    Ok(records) => {
                        self.process(records);
                        self.finish_passed_replays();
                    }
                    Err(e) => {
                        if self.fail_if_fatal(&e) {
                            break;
                        }
                    }
                }
            }

            if self.last_checkpoint.elapsed() >= self.config.checkpoint_interval {
                if let Err(e) = self.checkpoint().await {
                    warn!(error = %e, "Periodic checkpoint failed");
                }
            }
        }
    }

    /// Logs a client error. Returns true and records the failure if it is fatal.
    fn fail_if_fatal(&self, e: &ClientError) -> bool {
        if e.is_fatal() {
            error!(error = %e, "Fatal log client error, stopping consumer");
            self.status.record_failure(e.to_string());
            true
        } else {
            warn!(error = %e, "Transient log client error");
            false
        }
    }

    async fn maybe_resubscribe(&mut self) -> Result<(), ClientError> {
        let version = self.assignment.version();
        if self.subscribed_version == Some(version) {
            return Ok(());
        }
        if self
            .last_subscription
            .is_some_and(|last| last.elapsed() < self.config.subscription_interval)
        {
            return Ok(());
        }
        self.last_subscription = Some(Instant::now());

        let (assignment, promoted) = self.assignment.checkout();
        let wanted = assignment.partitions();

        let mut promoted_by_partition: BTreeMap<MetadataPartition, Vec<TopicIdPartition>> =
            BTreeMap::new();
        for tp in &promoted {
            if let Some(partition) = assignment.partition_of(tp) {
                promoted_by_partition.entry(partition).or_default().push(*tp);
            }
        }

        let mut positions = BTreeMap::new();
        let mut replays = BTreeMap::new();
        let mut reset = Vec::new();
        let mut ready = Vec::new();
        for partition in &wanted {
            let continuing = self.subscribed.contains(partition);
            let consumed = if continuing {
                self.tracker.progress(*partition)
            } else {
                self.persisted.get(partition).copied()
            };
            let mut replay = if continuing {
                self.replays.get(partition).cloned()
            } else {
                None
            };
            if let Some(replay) = &mut replay {
                replay.partitions.retain(|tp| assignment.is_primary(tp));
            }

            let added = promoted_by_partition.remove(partition).unwrap_or_default();
            if !added.is_empty() {
                reset.extend(added.iter().copied());
                if let Some(until) = consumed {
                    // Restarts from 0, so partitions already replaying are
                    // reset and re-read as well.
                    let mut partitions = replay.map(|replay| replay.partitions).unwrap_or_default();
                    reset.extend(partitions.iter().copied());
                    partitions.extend(added);
                    replay = Some(Replay {
                        until,
                        replayed: None,
                        partitions,
                    });
                } else {
                    ready.extend(added);
                }
            }

            let next = match &replay {
                Some(replay) => Some(replay.next_offset()),
                None => consumed.map_or(Some(0), |offset| offset.checked_add(1)),
            };
            match next {
                Some(next) => {
                    positions.insert(*partition, next);
                }
                None => warn!(%partition, "Partition is at the last offset, not consuming it"),
            }
            if let Some(replay) = replay {
                replays.insert(*partition, replay);
            }
        }

        if let Err(e) = self.consumer.assign(&positions).await {
            self.assignment.requeue(promoted);
            return Err(e);
        }

        for partition in self.subscribed.difference(&wanted) {
            self.tracker.remove(*partition);
        }
        for partition in wanted.difference(&self.subscribed) {
            self.tracker
                .reset(*partition, self.persisted.get(partition).copied());
        }
        if !reset.is_empty() {
            self.handler.reset(&reset);
        }
        self.assignment.mark_ready(ready);

        info!(
            version,
            partitions = ?assignment.roles(),
            promoted = promoted.len(),
            replaying = replays.len(),
            "Consumer subscription updated"
        );
        self.subscribed = wanted;
        self.applied = assignment;
        self.replays = replays;
        self.subscribed_version = Some(version);
        Ok(())
    }

    fn process(&mut self, records: Vec<ConsumedRecord>) {
        for record in records {
            if !self.subscribed.contains(&record.partition) {
                debug!(
                    partition = %record.partition,
                    offset = record.offset,
                    "Dropping record for unsubscribed partition"
                );
                continue;
            }
            if record.offset == u64::MAX {
                warn!(partition = %record.partition, "Dropping record at the last offset");
                continue;
            }
            if self.replay(&record) {
                continue;
            }
            if self
                .tracker
                .progress(record.partition)
                .is_some_and(|consumed| record.offset <= consumed)
            {
                continue;
            }

            if let Some(event) = decode(&record) {
                if self
                    .applied
                    .should_handle(&event.topic_partition(), record.partition)
                {
                    self.apply(&record, &event);
                }
            }

            // Only after the handler: waiters rely on its side effects.
            self.tracker.record_consumed(record.partition, record.offset);
        }
    }

    /// Handles a record of a partition being replayed. Returns false if the
    /// record lies past the replayed range and must be processed normally.
    fn replay(&mut self, record: &ConsumedRecord) -> bool {
        let Some(replay) = self.replays.get_mut(&record.partition) else {
            return false;
        };
        if record.offset > replay.until {
            // The log skipped past the end of the range.
            self.finish_replay(record.partition);
            return false;
        }
        if replay
            .replayed
            .is_some_and(|replayed| record.offset <= replayed)
        {
            return true;
        }
        replay.replayed = Some(record.offset);
        let done = record.offset == replay.until;

        // The key names the user partition, so most records are skipped
        // without decoding the value.
        let wanted = decode_key(&record.key).map_or(true, |tp| replay.partitions.contains(&tp));
        let event = if wanted { decode(record) } else { None };
        let event = event.filter(|event| replay.partitions.contains(&event.topic_partition()));
        if let Some(event) = &event {
            self.apply(record, event);
        }

        if done {
            self.finish_replay(record.partition);
        }
        true
    }

    /// Ends replays whose range the consumer has read past without seeing its
    /// last record, which happens when compaction removed it.
    fn finish_passed_replays(&mut self) {
        let passed: Vec<_> = self
            .replays
            .iter()
            .filter(|(partition, replay)| {
                self.consumer
                    .position(**partition)
                    .is_some_and(|next| next > replay.until)
            })
            .map(|(partition, _)| *partition)
            .collect();
        for partition in passed {
            self.finish_replay(partition);
        }
    }

    fn finish_replay(&mut self, partition: MetadataPartition) {
        if let Some(replay) = self.replays.remove(&partition) {
            info!(
                %partition,
                until = replay.until,
                user_partitions = replay.partitions.len(),
                "Replay finished"
            );
            self.assignment.mark_ready(replay.partitions);
        }
    }

    fn apply(&self, record: &ConsumedRecord, event: &MetadataEvent) {
        if let Err(e) = self.handler.handle(event) {
            warn!(
                partition = %record.partition,
                offset = record.offset,
                kind = event.kind(),
                error = %e,
                "Failed to handle metadata event, skipping"
            );
        }
    }

    async fn checkpoint(&mut self) -> RlmmResult<()> {
        self.last_checkpoint = Instant::now();

        let mut checkpoint = self.persisted.clone();
        for partition in &self.subscribed {
            if let Some(offset) = self.tracker.progress(*partition) {
                checkpoint.insert(*partition, offset);
            }
        }
        if checkpoint == self.persisted {
            return Ok(());
        }

        self.checkpoint_store.save(&checkpoint).await?;
        debug!(partitions = checkpoint.len(), "Saved checkpoint");
        self.persisted = checkpoint;
        Ok(())
    }

    async fn shutdown(&mut self) -> RlmmResult<()> {
        self.status.set(TaskState::Closing);

        let checkpoint = self.checkpoint().await;
        if let Err(e) = &checkpoint {
            error!(error = %e, "Final checkpoint failed");
        }
        let close = self.consumer.close().await.map_err(RlmmError::from);
        if let Err(e) = &close {
            error!(error = %e, "Failed to close log consumer");
        }

        self.status.set(TaskState::Closed);
        info!(failed = self.status.failure().is_some(), "Consumer task stopped");
        checkpoint.and(close)
    }
}

fn decode(record: &ConsumedRecord) -> Option<MetadataEvent> {
    match decode_event(&record.value) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(
                partition = %record.partition,
                offset = record.offset,
                error = %e,
                "Failed to decode metadata record, skipping"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::codec::{encode_event, encode_key};
    use crate::error::HandlerError;
    use crate::event::{MetadataEvent, RemoteLogSegmentId, RemoteLogSegmentMetadata};
    use crate::log::SimulatedLog;
    use crate::partitioner::HashPartitioner;
    use crate::types::{BrokerId, PartitionId, Role, SegmentId, TopicId};

    const P0: MetadataPartition = MetadataPartition::new(0);
    const P1: MetadataPartition = MetadataPartition::new(1);

    #[derive(Debug, Default)]
    struct RecordingHandler {
        events: Mutex<Vec<MetadataEvent>>,
        resets: Mutex<Vec<TopicIdPartition>>,
        fail: AtomicBool,
    }

    impl RecordingHandler {
        fn segment_ids(&self) -> Vec<u64> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    MetadataEvent::SegmentAdded(m) => Some(m.segment_id.id.get()),
                    _ => None,
                })
                .collect()
        }
    }

    impl MetadataEventHandler for RecordingHandler {
        fn handle(&self, event: &MetadataEvent) -> Result<(), HandlerError> {
            self.events.lock().unwrap().push(event.clone());
            if self.fail.load(Ordering::Relaxed) {
                return Err(HandlerError::Other {
                    message: "boom".into(),
                });
            }
            Ok(())
        }

        fn reset(&self, topic_partitions: &[TopicIdPartition]) {
            self.resets.lock().unwrap().extend_from_slice(topic_partitions);
        }
    }

    struct Fixture {
        log: SimulatedLog,
        assignment: Arc<PartitionAssignment>,
        store: InMemoryCheckpointStore,
        handler: Arc<RecordingHandler>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                log: SimulatedLog::new(4, 42),
                assignment: Arc::new(PartitionAssignment::new(Arc::new(HashPartitioner::new(4)))),
                store: InMemoryCheckpointStore::new(),
                handler: Arc::new(RecordingHandler::default()),
            }
        }

        fn task(&self) -> ConsumerTask {
            ConsumerTask::new(
                RlmmConfig::for_testing(),
                Arc::clone(&self.assignment),
                Box::new(self.log.consumer()),
                Arc::new(self.store.clone()),
                Arc::clone(&self.handler) as Arc<dyn MetadataEventHandler>,
            )
        }

        fn append_segment(&self, partition: MetadataPartition, segment: u64) {
            let tp = TopicIdPartition::new(
                TopicId::new(1),
                PartitionId::new(u64::from(partition.get())),
            );
            self.append_event(partition, tp, segment);
        }

        /// Appends a segment of `tp` to the metadata partition it maps to.
        fn append_for(&self, tp: TopicIdPartition, segment: u64) -> MetadataPartition {
            let partition = self.assignment.partitioner().partition_for(&tp);
            self.append_event(partition, tp, segment);
            partition
        }

        /// Returns two user partitions sharing a metadata partition.
        fn colocated(&self) -> (TopicIdPartition, TopicIdPartition) {
            let first = TopicIdPartition::new(TopicId::new(7), PartitionId::new(0));
            let target = self.assignment.partitioner().partition_for(&first);
            let second = (1..)
                .map(|p| TopicIdPartition::new(TopicId::new(7), PartitionId::new(p)))
                .find(|tp| self.assignment.partitioner().partition_for(tp) == target)
                .unwrap();
            (first, second)
        }

        fn append_event(&self, partition: MetadataPartition, tp: TopicIdPartition, segment: u64) {
            let event = MetadataEvent::SegmentAdded(RemoteLogSegmentMetadata::new(
                RemoteLogSegmentId::new(tp, SegmentId::new(segment)),
                0,
                9,
                0,
                BrokerId::new(1),
                0,
                10,
                [(0, 0)].into_iter().collect(),
            ));
            self.log
                .append(partition, encode_key(&tp), encode_event(&event))
                .unwrap();
        }
    }

    async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_consumes_in_order_and_tracks_progress() {
        let fx = Fixture::new();
        fx.assignment.add_partitions([P0]);
        for segment in 0..5 {
            fx.append_segment(P0, segment);
        }

        let task = fx.task();
        let tracker = task.tracker();
        let status = task.status();
        let handle = tokio::spawn(task.run());

        eventually("offset 4", || tracker.progress(P0) == Some(4)).await;
        assert_eq!(status.state(), TaskState::Running);
        assert_eq!(fx.handler.segment_ids(), vec![0, 1, 2, 3, 4]);

        status.request_shutdown();
        handle.await.unwrap().unwrap();
        assert_eq!(status.state(), TaskState::Closed);
        assert!(status.failure().is_none());
        assert_eq!(fx.store.saved().get(&P0), Some(&4));
    }

    #[tokio::test]
    async fn test_secondary_partition_is_tracked_but_not_handled() {
        let fx = Fixture::new();
        fx.assignment.add_secondary_partitions([P1]);
        fx.append_segment(P1, 7);

        let task = fx.task();
        let tracker = task.tracker();
        let status = task.status();
        let handle = tokio::spawn(task.run());

        eventually("offset 0", || tracker.progress(P1) == Some(0)).await;
        assert!(fx.handler.segment_ids().is_empty());

        status.request_shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_records_are_skipped_but_counted() {
        let fx = Fixture::new();
        fx.assignment.add_partitions([P0]);
        fx.handler.fail.store(true, Ordering::Relaxed);
        fx.append_segment(P0, 1);
        fx.log
            .append(P0, Bytes::from_static(b"k"), Bytes::from_static(b"garbage"))
            .unwrap();
        fx.append_segment(P0, 3);

        let task = fx.task();
        let tracker = task.tracker();
        let status = task.status();
        let handle = tokio::spawn(task.run());

        eventually("offset 2", || tracker.progress(P0) == Some(2)).await;
        assert_eq!(fx.handler.segment_ids(), vec![1, 3]);

        status.request_shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resumes_after_checkpoint() {
        let mut fx = Fixture::new();
        fx.store = InMemoryCheckpointStore::with_checkpoint([(P0, 2)].into_iter().collect());
        fx.assignment.add_partitions([P0]);
        for segment in 0..5 {
            fx.append_segment(P0, segment);
        }

        let task = fx.task();
        let tracker = task.tracker();
        let status = task.status();
        let handle = tokio::spawn(task.run());

        eventually("offset 4", || tracker.progress(P0) == Some(4)).await;
        assert_eq!(fx.handler.segment_ids(), vec![3, 4]);

        status.request_shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_promotion_replays_history_of_promoted_partition() {
        let fx = Fixture::new();
        let (follower, leader) = fx.colocated();
        fx.assignment.assign_user_partitions([follower], Role::Secondary);
        fx.assignment.assign_user_partitions([leader], Role::Primary);
        let partition = fx.append_for(follower, 1);
        fx.append_for(leader, 2);

        let task = fx.task();
        let tracker = task.tracker();
        let status = task.status();
        let handle = tokio::spawn(task.run());

        eventually("offset 1", || tracker.progress(partition) == Some(1)).await;
        eventually("leader ready", || fx.assignment.is_ready(&leader)).await;
        assert_eq!(fx.handler.segment_ids(), vec![2]);

        fx.assignment.assign_user_partitions([follower], Role::Primary);
        assert!(!fx.assignment.is_ready(&follower));
        eventually("promoted ready", || fx.assignment.is_ready(&follower)).await;

        // Only the promoted partition's history was applied again.
        assert_eq!(fx.handler.segment_ids(), vec![2, 1]);
        assert!(fx.handler.resets.lock().unwrap().contains(&follower));
        assert_eq!(tracker.progress(partition), Some(1));

        fx.append_for(follower, 3);
        eventually("offset 2", || tracker.progress(partition) == Some(2)).await;
        assert_eq!(fx.handler.segment_ids(), vec![2, 1, 3]);

        status.request_shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_restart_replays_primary_partitions_before_checkpoint() {
        let mut fx = Fixture::new();
        let (first, second) = fx.colocated();
        let partition = fx.append_for(first, 1);
        fx.append_for(second, 2);
        fx.append_for(first, 3);
        fx.store = InMemoryCheckpointStore::with_checkpoint([(partition, 1)].into_iter().collect());
        fx.assignment.assign_user_partitions([first], Role::Primary);

        let task = fx.task();
        let tracker = task.tracker();
        let status = task.status();
        let handle = tokio::spawn(task.run());

        eventually("offset 2", || tracker.progress(partition) == Some(2)).await;
        eventually("ready", || fx.assignment.is_ready(&first)).await;
        // Offset 0 replayed, offset 1 belongs to another partition, offset 2 is new.
        assert_eq!(fx.handler.segment_ids(), vec![1, 3]);

        status.request_shutdown();
        handle.await.unwrap().unwrap();
        assert_eq!(fx.store.saved().get(&partition), Some(&2));
    }

    #[tokio::test]
    async fn test_replay_ends_at_compacted_tail() {
        let fx = Fixture::new();
        let (follower, other) = fx.colocated();
        fx.assignment.assign_user_partitions([follower], Role::Secondary);
        let partition = fx.append_for(follower, 1);
        fx.append_for(other, 2);

        let task = fx.task();
        let tracker = task.tracker();
        let status = task.status();
        let handle = tokio::spawn(task.run());

        eventually("offset 1", || tracker.progress(partition) == Some(1)).await;
        // The last record of the range is gone and nothing follows it.
        fx.log.compact(partition, [1]);

        fx.assignment.assign_user_partitions([follower], Role::Primary);
        eventually("promoted ready", || fx.assignment.is_ready(&follower)).await;
        assert_eq!(fx.handler.segment_ids(), vec![1]);
        assert_eq!(tracker.progress(partition), Some(1));

        fx.append_for(follower, 3);
        eventually("offset 2", || tracker.progress(partition) == Some(2)).await;
        assert_eq!(fx.handler.segment_ids(), vec![1, 3]);

        status.request_shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_replay_ends_when_log_skips_past_range() {
        let mut fx = Fixture::new();
        let (first, second) = fx.colocated();
        let partition = fx.append_for(first, 1);
        fx.append_for(second, 2);
        fx.append_for(first, 3);
        fx.log.compact(partition, [1]);
        fx.store = InMemoryCheckpointStore::with_checkpoint([(partition, 1)].into_iter().collect());
        fx.assignment.assign_user_partitions([first], Role::Primary);

        let task = fx.task();
        let tracker = task.tracker();
        let status = task.status();
        let handle = tokio::spawn(task.run());

        eventually("offset 2", || tracker.progress(partition) == Some(2)).await;
        eventually("ready", || fx.assignment.is_ready(&first)).await;
        assert_eq!(fx.handler.segment_ids(), vec![1, 3]);

        status.request_shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_assignment_change_picked_up() {
        let fx = Fixture::new();
        fx.assignment.add_partitions([P0]);
        fx.append_segment(P0, 0);
        fx.append_segment(P1, 1);

        let task = fx.task();
        let tracker = task.tracker();
        let status = task.status();
        let handle = tokio::spawn(task.run());

        eventually("P0 consumed", || tracker.progress(P0) == Some(0)).await;
        assert_eq!(tracker.progress(P1), None);

        fx.assignment.add_partitions([P1]);
        fx.assignment.remove_partitions([P0]);
        eventually("P1 consumed", || tracker.progress(P1) == Some(0)).await;
        eventually("P0 dropped", || tracker.progress(P0).is_none()).await;

        status.request_shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fatal_client_error_stops_task() {
        let fx = Fixture::new();
        fx.assignment.add_partitions([P0]);
        fx.log.fault_config().poll_fatal = true;

        let task = fx.task();
        let status = task.status();
        tokio::spawn(task.run()).await.unwrap().unwrap();

        assert_eq!(status.state(), TaskState::Closed);
        assert!(status.failure().unwrap().contains("authorization"));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let fx = Fixture::new();
        fx.log.fault_config().poll_fail_rate = 0.5;
        fx.assignment.add_partitions([P0]);
        for segment in 0..20 {
            fx.append_segment(P0, segment);
        }

        let task = fx.task();
        let tracker = task.tracker();
        let status = task.status();
        let handle = tokio::spawn(task.run());

        eventually("offset 19", || tracker.progress(P0) == Some(19)).await;
        assert!(status.failure().is_none());

        status.request_shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_load_failure_is_fatal() {
        let fx = Fixture::new();
        fx.store.fault_config().force_load_fail = true;

        let task = fx.task();
        let status = task.status();
        tokio::spawn(task.run()).await.unwrap().unwrap();

        assert_eq!(status.state(), TaskState::Closed);
        assert!(status.failure().unwrap().contains("checkpoint"));
    }

    #[tokio::test]
    async fn test_close_failure_is_returned() {
        let fx = Fixture::new();
        fx.log.fault_config().force_close_fail = true;

        let task = fx.task();
        let status = task.status();
        status.request_shutdown();
        let result = tokio::spawn(task.run()).await.unwrap();

        assert!(matches!(result, Err(RlmmError::Client(_))));
        assert_eq!(status.state(), TaskState::Closed);
    }

    #[tokio::test]
    async fn test_run_twice_rejected() {
        let fx = Fixture::new();
        let task = fx.task();
        task.status().set(TaskState::Running);
        assert!(matches!(task.run().await, Err(RlmmError::InvalidState { .. })));
    }
}
