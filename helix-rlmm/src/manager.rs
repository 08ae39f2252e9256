//! Topic-based remote log metadata manager.
//!
//! Writes go to the metadata topic and return once the local consumer has
//! read them back and applied them to the metadata store, so a successful
//! write is immediately visible to reads on the same instance.
//!
//! Only the primary of a user partition writes or reads its metadata. Events
//! for secondary partitions are tailed for progress but not applied. When a
//! partition becomes primary, or the instance restarts, its earlier events are
//! re-read first: reads fail with `PartitionNotReady` and writes wait until
//! that is done.

use std::sync::Arc;

use tracing::{debug, info};

use crate::assignment::PartitionAssignment;
use crate::checkpoint::CheckpointStore;
use crate::codec::{encode_event, encode_key};
use crate::config::RlmmConfig;
use crate::error::{RlmmError, RlmmResult};
use crate::event::{
    MetadataEvent, RemoteLogSegmentMetadata, RemoteLogSegmentMetadataUpdate,
    RemotePartitionDeleteMetadata, SegmentState,
};
use crate::handler::MetadataEventHandler;
use crate::log::{LogConsumer, LogProducer};
use crate::metadata::RemotePartitionMetadataStore;
use crate::partitioner::Partitioner;
use crate::sync::SynchronizationManager;
use crate::types::{Role, TopicIdPartition};

/// Remote log metadata manager backed by the metadata topic.
pub struct TopicBasedMetadataManager {
    producer: Arc<dyn LogProducer>,
    store: Arc<RemotePartitionMetadataStore>,
    sync: SynchronizationManager,
}

impl std::fmt::Debug for TopicBasedMetadataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicBasedMetadataManager")
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

impl TopicBasedMetadataManager {
    /// Creates a manager. Call [`Self::start`] before writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the partitioner
    /// disagrees with the configured metadata partition count.
    pub fn new(
        config: RlmmConfig,
        partitioner: Arc<dyn Partitioner>,
        producer: Arc<dyn LogProducer>,
        consumer: Box<dyn LogConsumer>,
        checkpoint_store: Arc<dyn CheckpointStore>,
    ) -> RlmmResult<Self> {
        if partitioner.partition_count() != config.metadata_partitions {
            return Err(RlmmError::InvalidState {
                message: format!(
                    "partitioner has {} partitions, config has {}",
                    partitioner.partition_count(),
                    config.metadata_partitions
                ),
            });
        }

        let store = Arc::new(RemotePartitionMetadataStore::new());
        let sync = SynchronizationManager::new(
            config,
            Arc::new(PartitionAssignment::new(partitioner)),
            consumer,
            checkpoint_store,
            Arc::clone(&store) as Arc<dyn MetadataEventHandler>,
        )?;
        Ok(Self {
            producer,
            store,
            sync,
        })
    }

    /// Starts consuming the metadata topic.
    ///
    /// # Errors
    ///
    /// Returns an error if already started or closed.
    pub fn start(&self) -> RlmmResult<()> {
        self.sync.start()
    }

    /// Stops consuming. Calls after the first are no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error if stopping the consumer failed.
    pub async fn close(&self) -> RlmmResult<()> {
        self.sync.close().await
    }

    /// Returns the synchronization manager.
    #[must_use]
    pub const fn sync(&self) -> &SynchronizationManager {
        &self.sync
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Records a segment whose copy to remote storage has started.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is not in `CopySegmentStarted`, this
    /// instance is not primary for its partition, the produce fails, or the
    /// record is not consumed back in time.
    pub async fn add_remote_log_segment_metadata(
        &self,
        metadata: RemoteLogSegmentMetadata,
    ) -> RlmmResult<()> {
        if metadata.state != SegmentState::CopySegmentStarted {
            return Err(RlmmError::InvalidState {
                message: format!(
                    "new segment {} must be COPY_SEGMENT_STARTED, got {}",
                    metadata.segment_id,
                    metadata.state.name()
                ),
            });
        }
        self.publish(MetadataEvent::SegmentAdded(metadata)).await
    }

    /// Records a state change of an existing segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the update moves back to `CopySegmentStarted`, or
    /// for the same reasons as [`Self::add_remote_log_segment_metadata`].
    pub async fn update_remote_log_segment_metadata(
        &self,
        update: RemoteLogSegmentMetadataUpdate,
    ) -> RlmmResult<()> {
        if update.state == SegmentState::CopySegmentStarted {
            return Err(RlmmError::InvalidState {
                message: format!("update of {} cannot be COPY_SEGMENT_STARTED", update.segment_id),
            });
        }
        self.publish(MetadataEvent::SegmentUpdated(update)).await
    }

    /// Records a deletion state of a user partition.
    ///
    /// # Errors
    ///
    /// Same as [`Self::add_remote_log_segment_metadata`].
    pub async fn put_remote_partition_delete_metadata(
        &self,
        delete: RemotePartitionDeleteMetadata,
    ) -> RlmmResult<()> {
        self.publish(MetadataEvent::PartitionDeleted(delete)).await
    }

    async fn publish(&self, event: MetadataEvent) -> RlmmResult<()> {
        let topic_partition = event.topic_partition();
        self.ensure_primary(&topic_partition)?;
        // Writing before the history is applied would race the replay.
        self.sync
            .wait_until_ready(&topic_partition, self.sync.config().consume_wait)
            .await?;

        let partition = self.sync.partition_for(&topic_partition);
        let record = self
            .producer
            .produce(partition, encode_key(&topic_partition), encode_event(&event))
            .await?;
        debug!(
            kind = event.kind(),
            %topic_partition,
            partition = %record.partition,
            offset = record.offset,
            "Produced metadata event"
        );

        self.sync.wait_for_record(&record).await
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Returns the remote segment holding `offset` in leader `epoch`.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager is closed, not primary for the
    /// partition, or still loading its metadata.
    pub fn remote_log_segment_metadata(
        &self,
        topic_partition: &TopicIdPartition,
        epoch: u32,
        offset: u64,
    ) -> RlmmResult<Option<RemoteLogSegmentMetadata>> {
        self.ensure_loaded(topic_partition)?;
        Ok(self
            .store
            .remote_log_segment_metadata(topic_partition, epoch, offset))
    }

    /// Returns the highest remote offset for leader `epoch`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::remote_log_segment_metadata`].
    pub fn highest_offset_for_epoch(
        &self,
        topic_partition: &TopicIdPartition,
        epoch: u32,
    ) -> RlmmResult<Option<u64>> {
        self.ensure_loaded(topic_partition)?;
        Ok(self.store.highest_offset_for_epoch(topic_partition, epoch))
    }

    /// Returns every known remote segment of the partition.
    ///
    /// # Errors
    ///
    /// Same as [`Self::remote_log_segment_metadata`].
    pub fn list_segments(
        &self,
        topic_partition: &TopicIdPartition,
    ) -> RlmmResult<Vec<RemoteLogSegmentMetadata>> {
        self.ensure_loaded(topic_partition)?;
        Ok(self.store.list_segments(topic_partition))
    }

    /// Returns readable remote segments of the partition in leader `epoch`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::remote_log_segment_metadata`].
    pub fn list_segments_for_epoch(
        &self,
        topic_partition: &TopicIdPartition,
        epoch: u32,
    ) -> RlmmResult<Vec<RemoteLogSegmentMetadata>> {
        self.ensure_loaded(topic_partition)?;
        Ok(self.store.list_segments_for_epoch(topic_partition, epoch))
    }

    // -------------------------------------------------------------------------
    // Partition lifecycle
    // -------------------------------------------------------------------------

    /// Applies leadership changes: leaders become primary, followers secondary.
    pub fn on_partition_leadership_changes(
        &self,
        leaders: impl IntoIterator<Item = TopicIdPartition>,
        followers: impl IntoIterator<Item = TopicIdPartition>,
    ) {
        let leaders: Vec<_> = leaders.into_iter().collect();
        let followers: Vec<_> = followers.into_iter().collect();
        info!(
            leaders = leaders.len(),
            followers = followers.len(),
            "Partition leadership changed"
        );
        self.sync.assign_user_partitions(leaders, Role::Primary);
        self.sync.assign_user_partitions(followers, Role::Secondary);
    }

    /// Stops tracking user partitions and drops their cached metadata.
    pub fn on_stop_partitions(&self, topic_partitions: impl IntoIterator<Item = TopicIdPartition>) {
        let topic_partitions: Vec<_> = topic_partitions.into_iter().collect();
        info!(partitions = topic_partitions.len(), "Stopping partitions");
        self.sync.remove_user_partitions(topic_partitions.iter().copied());
        self.store.clear(topic_partitions);
    }

    fn ensure_loaded(&self, topic_partition: &TopicIdPartition) -> RlmmResult<()> {
        self.ensure_primary(topic_partition)?;
        if !self.sync.is_ready(topic_partition) {
            return Err(RlmmError::PartitionNotReady {
                topic_partition: *topic_partition,
            });
        }
        Ok(())
    }

    fn ensure_primary(&self, topic_partition: &TopicIdPartition) -> RlmmResult<()> {
        if self.sync.is_closed() {
            return Err(RlmmError::Closed);
        }
        if !self.sync.is_primary(topic_partition) {
            return Err(RlmmError::UserPartitionNotAssigned {
                topic_partition: *topic_partition,
            });
        }
        Ok(())
    }
}
