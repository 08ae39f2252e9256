//! Write-then-catch-up synchronization.
//!
//! `SynchronizationManager` owns the consumer task and exposes the two things
//! writers need: control over which metadata partitions are consumed, and a
//! way to wait until a produced record has been consumed and handled.
//!
//! Waiters never touch the log client. They poll the `OffsetTracker` at
//! `recheck_interval` until the target is reached, the consumer task dies or
//! the deadline passes. A partition removed while a wait is in flight is not
//! noticed by that wait; it runs against the last tracked progress until it
//! times out.

#![allow(clippy::significant_drop_tightening)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::assignment::PartitionAssignment;
use crate::checkpoint::CheckpointStore;
use crate::config::RlmmConfig;
use crate::consumer::{ConsumerTask, TaskState, TaskStatus};
use crate::error::{RlmmError, RlmmResult};
use crate::handler::MetadataEventHandler;
use crate::log::LogConsumer;
use crate::tracker::OffsetTracker;
use crate::types::{MetadataPartition, PartitionProgress, RecordMetadata, Role, TopicIdPartition};

/// Coordinates writers with the background consumer task.
pub struct SynchronizationManager {
    config: RlmmConfig,
    assignment: Arc<PartitionAssignment>,
    tracker: Arc<OffsetTracker>,
    status: Arc<TaskStatus>,
    /// Taken by `start`.
    task: Mutex<Option<ConsumerTask>>,
    handle: Mutex<Option<JoinHandle<RlmmResult<()>>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SynchronizationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizationManager")
            .field("state", &self.status.state())
            .field("closed", &self.closed)
            .field("assignment", &self.assignment)
            .finish_non_exhaustive()
    }
}

impl SynchronizationManager {
    /// Creates a manager. The consumer task is built but not started.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: RlmmConfig,
        assignment: Arc<PartitionAssignment>,
        consumer: Box<dyn LogConsumer>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        handler: Arc<dyn MetadataEventHandler>,
    ) -> RlmmResult<Self> {
        config.validate()?;

        let task = ConsumerTask::new(
            config.clone(),
            Arc::clone(&assignment),
            consumer,
            checkpoint_store,
            handler,
        );
        Ok(Self {
            config,
            assignment,
            tracker: task.tracker(),
            status: task.status(),
            task: Mutex::new(Some(task)),
            handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawns the consumer task on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` on a second call and `Closed` after `close`.
    ///
    /// # Panics
    ///
    /// Panics if a lock is poisoned.
    pub fn start(&self) -> RlmmResult<()> {
        // Held until the handle is stored, so `close` either joins the task
        // or finds it never started.
        let mut handle = self.handle.lock().expect("handle lock poisoned");
        if self.closed.load(Ordering::Acquire) {
            return Err(RlmmError::Closed);
        }
        let task = self
            .task
            .lock()
            .expect("task lock poisoned")
            .take()
            .ok_or_else(|| {
                if self.closed.load(Ordering::Acquire) {
                    RlmmError::Closed
                } else {
                    RlmmError::AlreadyStarted
                }
            })?;

        *handle = Some(tokio::spawn(task.run()));
        drop(handle);
        info!("Synchronization manager started");
        Ok(())
    }

    /// Stops the consumer task and waits for it to exit.
    ///
    /// Only failures while stopping are returned. A consumer that already died
    /// of a fatal error closes cleanly. Calls after the first are no-ops.
    ///
    /// # Errors
    ///
    /// Returns `Shutdown` if the final checkpoint or releasing the log client
    /// failed, or if the task panicked.
    ///
    /// # Panics
    ///
    /// Panics if a lock is poisoned.
    pub async fn close(&self) -> RlmmResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.status.request_shutdown();

        // Never started: nothing was opened.
        if self.task.lock().expect("task lock poisoned").take().is_some() {
            self.status.set(TaskState::Closed);
        }

        let handle = self.handle.lock().expect("handle lock poisoned").take();
        let Some(handle) = handle else {
            info!("Synchronization manager closed");
            return Ok(());
        };

        let result = match handle.await {
            Ok(result) => result.map_err(|e| RlmmError::Shutdown {
                message: e.to_string(),
            }),
            Err(e) => Err(RlmmError::Shutdown {
                message: format!("consumer task panicked: {e}"),
            }),
        };
        match &result {
            Ok(()) => info!("Synchronization manager closed"),
            Err(e) => error!(error = %e, "Synchronization manager closed with error"),
        }
        result
    }

    // -------------------------------------------------------------------------
    // Catch-up
    // -------------------------------------------------------------------------

    /// Waits until `target` has been consumed on `partition`.
    ///
    /// Returns as soon as the tracked offset is at or past `target`, without
    /// sleeping if that is already the case.
    ///
    /// Must not be called from inside the event handler.
    ///
    /// # Errors
    ///
    /// - `Closed` if the manager has been closed.
    /// - `NotAssigned` if the partition is not assigned.
    /// - `ConsumerTerminated` if the consumer task died.
    /// - `CatchUpTimeout` if `max_wait` elapsed first.
    pub async fn wait_for_offset(
        &self,
        partition: MetadataPartition,
        target: u64,
        max_wait: Duration,
    ) -> RlmmResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RlmmError::Closed);
        }
        if !self.assignment.is_assigned(partition) {
            return Err(RlmmError::NotAssigned { partition });
        }

        let started = Instant::now();
        let deadline = started + max_wait;
        // Kept across iterations: the tracker forgets a partition once it is
        // unassigned.
        let mut last_seen = None;
        loop {
            last_seen = last_seen.max(self.tracker.progress(partition));
            if last_seen.is_some_and(|consumed| consumed >= target) {
                debug!(
                    %partition,
                    target,
                    waited_ms = elapsed_ms(started),
                    "Caught up"
                );
                return Ok(());
            }
            if let Some(reason) = self.status.failure() {
                return Err(RlmmError::ConsumerTerminated { reason });
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(RlmmError::Closed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RlmmError::CatchUpTimeout {
                    partition,
                    last_seen,
                    target,
                    waited_ms: elapsed_ms(started),
                });
            }
            tokio::time::sleep(self.config.recheck_interval.min(deadline - now)).await;
        }
    }

    /// Waits until a produced record has been consumed, bounded by
    /// `consume_wait`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::wait_for_offset`].
    pub async fn wait_for_record(&self, record: &RecordMetadata) -> RlmmResult<()> {
        self.wait_for_offset(record.partition, record.offset, self.config.consume_wait)
            .await
    }

    /// Waits until the metadata of a primary user partition has been loaded.
    ///
    /// A user partition that just became primary is not ready until the
    /// consumer has re-read the events recorded for it before the promotion.
    ///
    /// # Errors
    ///
    /// - `Closed` if the manager has been closed.
    /// - `UserPartitionNotAssigned` if this instance is not primary for it.
    /// - `ConsumerTerminated` if the consumer task died.
    /// - `PartitionNotReady` if `max_wait` elapsed first.
    pub async fn wait_until_ready(
        &self,
        topic_partition: &TopicIdPartition,
        max_wait: Duration,
    ) -> RlmmResult<()> {
        let started = Instant::now();
        let deadline = started + max_wait;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(RlmmError::Closed);
            }
            if !self.assignment.is_primary(topic_partition) {
                return Err(RlmmError::UserPartitionNotAssigned {
                    topic_partition: *topic_partition,
                });
            }
            if self.assignment.is_ready(topic_partition) {
                return Ok(());
            }
            if let Some(reason) = self.status.failure() {
                return Err(RlmmError::ConsumerTerminated { reason });
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    %topic_partition,
                    waited_ms = elapsed_ms(started),
                    "User partition still loading"
                );
                return Err(RlmmError::PartitionNotReady {
                    topic_partition: *topic_partition,
                });
            }
            tokio::time::sleep(self.config.recheck_interval.min(deadline - now)).await;
        }
    }

    // -------------------------------------------------------------------------
    // Assignment
    // -------------------------------------------------------------------------

    /// Assigns metadata partitions as primary.
    pub fn add_assignments(&self, partitions: impl IntoIterator<Item = MetadataPartition>) {
        self.assignment.add_partitions(partitions);
    }

    /// Removes directly assigned metadata partitions.
    pub fn remove_assignments(&self, partitions: impl IntoIterator<Item = MetadataPartition>) {
        self.assignment.remove_partitions(partitions);
    }

    /// Returns true if `partition` is assigned.
    #[must_use]
    pub fn is_assigned(&self, partition: MetadataPartition) -> bool {
        self.assignment.is_assigned(partition)
    }

    /// Assigns user partitions with `role`.
    pub fn assign_user_partitions(
        &self,
        topic_partitions: impl IntoIterator<Item = TopicIdPartition>,
        role: Role,
    ) {
        self.assignment.assign_user_partitions(topic_partitions, role);
    }

    /// Removes user partitions.
    pub fn remove_user_partitions(
        &self,
        topic_partitions: impl IntoIterator<Item = TopicIdPartition>,
    ) {
        self.assignment.remove_user_partitions(topic_partitions);
    }

    /// Returns true if this instance is primary for the user partition.
    #[must_use]
    pub fn is_primary(&self, topic_partition: &TopicIdPartition) -> bool {
        self.assignment.is_primary(topic_partition)
    }

    /// Returns true once the metadata of a primary user partition is loaded.
    #[must_use]
    pub fn is_ready(&self, topic_partition: &TopicIdPartition) -> bool {
        self.assignment.is_ready(topic_partition)
    }

    /// Returns the metadata partition carrying events for `topic_partition`.
    #[must_use]
    pub fn partition_for(&self, topic_partition: &TopicIdPartition) -> MetadataPartition {
        self.assignment.partitioner().partition_for(topic_partition)
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Returns the highest consumed offset of `partition`.
    #[must_use]
    pub fn received_offset(&self, partition: MetadataPartition) -> Option<u64> {
        self.tracker.progress(partition)
    }

    /// Returns consumed progress for every tracked partition.
    #[must_use]
    pub fn progress(&self) -> Vec<PartitionProgress> {
        self.tracker.snapshot()
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &RlmmConfig {
        &self.config
    }

    /// Returns the consumer task state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.status.state()
    }

    /// Returns the fatal error that stopped the consumer, if any.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.status.failure()
    }

    /// Returns true once `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
