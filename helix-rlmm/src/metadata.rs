//! Materialized remote log metadata.
//!
//! `RemotePartitionMetadataStore` is the event handler the metadata manager
//! installs. It keeps one `RemoteLogMetadataCache` per user partition and
//! answers segment lookups from it.
//!
//! Only segments in `CopySegmentFinished` are visible to offset and epoch
//! lookups. Once deletion starts the segment drops out of the epoch index,
//! and once deletion finishes it is forgotten entirely.

#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use tracing::debug;

use crate::error::HandlerError;
use crate::event::{
    MetadataEvent, PartitionDeleteState, RemoteLogSegmentMetadata,
    RemoteLogSegmentMetadataUpdate, RemotePartitionDeleteMetadata, SegmentState,
};
use crate::handler::MetadataEventHandler;
use crate::types::{SegmentId, TopicIdPartition};

// -----------------------------------------------------------------------------
// RemoteLogMetadataCache
// -----------------------------------------------------------------------------

/// Segment metadata of a single user partition.
#[derive(Debug, Clone, Default)]
pub struct RemoteLogMetadataCache {
    segments: HashMap<SegmentId, RemoteLogSegmentMetadata>,
    /// epoch → first offset of the epoch in a segment → segment.
    epoch_index: BTreeMap<u32, BTreeMap<u64, SegmentId>>,
}

impl RemoteLogMetadataCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a segment whose copy has started.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is not in `CopySegmentStarted` or is
    /// already known in a later state.
    pub fn add_segment(&mut self, metadata: RemoteLogSegmentMetadata) -> Result<(), HandlerError> {
        if metadata.state != SegmentState::CopySegmentStarted {
            return Err(HandlerError::InvalidTransition {
                segment: metadata.segment_id.to_string(),
                from: "NONE",
                to: metadata.state.name(),
            });
        }
        if let Some(existing) = self.segments.get(&metadata.segment_id.id) {
            if existing.state != SegmentState::CopySegmentStarted {
                return Err(HandlerError::InvalidTransition {
                    segment: metadata.segment_id.to_string(),
                    from: existing.state.name(),
                    to: metadata.state.name(),
                });
            }
        }

        self.segments.insert(metadata.segment_id.id, metadata);
        Ok(())
    }

    /// Applies a state change to a known segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is unknown or the transition is invalid.
    pub fn update_segment(
        &mut self,
        update: &RemoteLogSegmentMetadataUpdate,
    ) -> Result<(), HandlerError> {
        let id = update.segment_id.id;
        let existing = self
            .segments
            .get(&id)
            .ok_or_else(|| HandlerError::UnknownSegment {
                segment: update.segment_id.to_string(),
            })?;

        if !existing.state.can_transition_to(update.state) {
            return Err(HandlerError::InvalidTransition {
                segment: update.segment_id.to_string(),
                from: existing.state.name(),
                to: update.state.name(),
            });
        }

        let updated = existing.with_update(update);
        match update.state {
            SegmentState::CopySegmentStarted => {
                self.segments.insert(id, updated);
            }
            SegmentState::CopySegmentFinished => {
                self.index(&updated);
                self.segments.insert(id, updated);
            }
            SegmentState::DeleteSegmentStarted => {
                self.unindex(&updated);
                self.segments.insert(id, updated);
            }
            SegmentState::DeleteSegmentFinished => {
                self.unindex(&updated);
                self.segments.remove(&id);
            }
        }
        Ok(())
    }

    fn index(&mut self, metadata: &RemoteLogSegmentMetadata) {
        for (epoch, start) in &metadata.segment_leader_epochs {
            self.epoch_index
                .entry(*epoch)
                .or_default()
                .insert(*start, metadata.segment_id.id);
        }
    }

    fn unindex(&mut self, metadata: &RemoteLogSegmentMetadata) {
        for (epoch, start) in &metadata.segment_leader_epochs {
            if let Some(offsets) = self.epoch_index.get_mut(epoch) {
                if offsets.get(start) == Some(&metadata.segment_id.id) {
                    offsets.remove(start);
                }
                if offsets.is_empty() {
                    self.epoch_index.remove(epoch);
                }
            }
        }
    }

    /// Returns the readable segment holding `offset` within leader `epoch`.
    #[must_use]
    pub fn segment_for(&self, epoch: u32, offset: u64) -> Option<&RemoteLogSegmentMetadata> {
        let offsets = self.epoch_index.get(&epoch)?;
        let (_, id) = offsets.range(..=offset).next_back()?;
        let metadata = self.segments.get(id)?;
        (offset <= metadata.end_offset_for_epoch(epoch)?).then_some(metadata)
    }

    /// Returns the highest offset stored remotely for leader `epoch`.
    #[must_use]
    pub fn highest_offset_for_epoch(&self, epoch: u32) -> Option<u64> {
        let offsets = self.epoch_index.get(&epoch)?;
        offsets
            .values()
            .filter_map(|id| self.segments.get(id)?.end_offset_for_epoch(epoch))
            .max()
    }

    /// Returns all known segments ordered by start offset.
    #[must_use]
    pub fn segments(&self) -> Vec<RemoteLogSegmentMetadata> {
        let mut segments: Vec<_> = self.segments.values().cloned().collect();
        segments.sort_by_key(|s| (s.start_offset, s.segment_id.id));
        segments
    }

    /// Returns readable segments containing leader `epoch`, ordered by offset.
    #[must_use]
    pub fn segments_for_epoch(&self, epoch: u32) -> Vec<RemoteLogSegmentMetadata> {
        self.epoch_index.get(&epoch).map_or_else(Vec::new, |offsets| {
            offsets
                .values()
                .filter_map(|id| self.segments.get(id).cloned())
                .collect()
        })
    }

    /// Returns the number of known segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true if no segment is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

// -----------------------------------------------------------------------------
// RemotePartitionMetadataStore
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PartitionEntry {
    cache: RemoteLogMetadataCache,
    delete_state: Option<PartitionDeleteState>,
}

/// Metadata of every user partition this instance handles events for.
#[derive(Debug, Default)]
pub struct RemotePartitionMetadataStore {
    partitions: RwLock<HashMap<TopicIdPartition, PartitionEntry>>,
}

impl RemotePartitionMetadataStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the readable segment holding `offset` in leader `epoch`.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn remote_log_segment_metadata(
        &self,
        topic_partition: &TopicIdPartition,
        epoch: u32,
        offset: u64,
    ) -> Option<RemoteLogSegmentMetadata> {
        let partitions = self.partitions.read().expect("metadata lock poisoned");
        partitions
            .get(topic_partition)?
            .cache
            .segment_for(epoch, offset)
            .cloned()
    }

    /// Returns the highest remote offset for leader `epoch`.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn highest_offset_for_epoch(
        &self,
        topic_partition: &TopicIdPartition,
        epoch: u32,
    ) -> Option<u64> {
        let partitions = self.partitions.read().expect("metadata lock poisoned");
        partitions
            .get(topic_partition)?
            .cache
            .highest_offset_for_epoch(epoch)
    }

    /// Returns every known segment of the partition.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn list_segments(
        &self,
        topic_partition: &TopicIdPartition,
    ) -> Vec<RemoteLogSegmentMetadata> {
        let partitions = self.partitions.read().expect("metadata lock poisoned");
        partitions
            .get(topic_partition)
            .map_or_else(Vec::new, |entry| entry.cache.segments())
    }

    /// Returns readable segments of the partition containing leader `epoch`.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn list_segments_for_epoch(
        &self,
        topic_partition: &TopicIdPartition,
        epoch: u32,
    ) -> Vec<RemoteLogSegmentMetadata> {
        let partitions = self.partitions.read().expect("metadata lock poisoned");
        partitions
            .get(topic_partition)
            .map_or_else(Vec::new, |entry| entry.cache.segments_for_epoch(epoch))
    }

    /// Returns the deletion state of the partition, if deletion was requested.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn delete_state(&self, topic_partition: &TopicIdPartition) -> Option<PartitionDeleteState> {
        let partitions = self.partitions.read().expect("metadata lock poisoned");
        partitions.get(topic_partition)?.delete_state
    }

    /// Forgets everything about `topic_partitions`.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn clear(&self, topic_partitions: impl IntoIterator<Item = TopicIdPartition>) {
        let mut partitions = self.partitions.write().expect("metadata lock poisoned");
        for tp in topic_partitions {
            partitions.remove(&tp);
        }
    }

    fn handle_partition_delete(
        &self,
        delete: &RemotePartitionDeleteMetadata,
    ) -> Result<(), HandlerError> {
        let mut partitions = self.partitions.write().expect("metadata lock poisoned");
        let current = partitions
            .get(&delete.topic_partition)
            .and_then(|entry| entry.delete_state);

        let valid = current.map_or(
            delete.state == PartitionDeleteState::DeletePartitionMarked,
            |current| current.can_transition_to(delete.state),
        );
        if !valid {
            return Err(HandlerError::InvalidTransition {
                segment: delete.topic_partition.to_string(),
                from: current.map_or("NONE", PartitionDeleteState::name),
                to: delete.state.name(),
            });
        }

        if delete.state == PartitionDeleteState::DeletePartitionFinished {
            partitions.remove(&delete.topic_partition);
            debug!(partition = %delete.topic_partition, "Remote partition deleted");
        } else {
            partitions
                .entry(delete.topic_partition)
                .or_default()
                .delete_state = Some(delete.state);
        }
        Ok(())
    }
}

impl MetadataEventHandler for RemotePartitionMetadataStore {
    fn handle(&self, event: &MetadataEvent) -> Result<(), HandlerError> {
        match event {
            MetadataEvent::SegmentAdded(metadata) => {
                let mut partitions = self.partitions.write().expect("metadata lock poisoned");
                let entry = partitions.entry(metadata.topic_partition()).or_default();
                if let Some(state) = entry.delete_state {
                    return Err(HandlerError::Other {
                        message: format!(
                            "cannot add segment {} to partition in {}",
                            metadata.segment_id,
                            state.name()
                        ),
                    });
                }
                entry.cache.add_segment(metadata.clone())
            }
            MetadataEvent::SegmentUpdated(update) => {
                let mut partitions = self.partitions.write().expect("metadata lock poisoned");
                let entry = partitions
                    .get_mut(&update.segment_id.topic_partition)
                    .ok_or_else(|| HandlerError::UnknownSegment {
                        segment: update.segment_id.to_string(),
                    })?;
                entry.cache.update_segment(update)
            }
            MetadataEvent::PartitionDeleted(delete) => self.handle_partition_delete(delete),
        }
    }

    fn reset(&self, topic_partitions: &[TopicIdPartition]) {
        self.clear(topic_partitions.iter().copied());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RemoteLogSegmentId;
    use crate::types::{BrokerId, PartitionId, TopicId};

    fn tp() -> TopicIdPartition {
        TopicIdPartition::new(TopicId::new(1), PartitionId::new(0))
    }

    fn segment(id: u64, start: u64, end: u64, epochs: &[(u32, u64)]) -> RemoteLogSegmentMetadata {
        RemoteLogSegmentMetadata::new(
            RemoteLogSegmentId::new(tp(), SegmentId::new(id)),
            start,
            end,
            0,
            BrokerId::new(1),
            0,
            1024,
            epochs.iter().copied().collect(),
        )
    }

    fn update(id: u64, state: SegmentState) -> MetadataEvent {
        MetadataEvent::SegmentUpdated(RemoteLogSegmentMetadataUpdate {
            segment_id: RemoteLogSegmentId::new(tp(), SegmentId::new(id)),
            event_timestamp_ms: 1,
            state,
            broker_id: BrokerId::new(1),
        })
    }

    fn delete(state: PartitionDeleteState) -> MetadataEvent {
        MetadataEvent::PartitionDeleted(RemotePartitionDeleteMetadata {
            topic_partition: tp(),
            state,
            event_timestamp_ms: 1,
            broker_id: BrokerId::new(1),
        })
    }

    #[test]
    fn test_segment_visible_only_after_copy_finished() {
        let store = RemotePartitionMetadataStore::new();
        store
            .handle(&MetadataEvent::SegmentAdded(segment(1, 0, 99, &[(0, 0)])))
            .unwrap();

        assert_eq!(store.list_segments(&tp()).len(), 1);
        assert!(store.remote_log_segment_metadata(&tp(), 0, 50).is_none());

        store.handle(&update(1, SegmentState::CopySegmentFinished)).unwrap();
        let found = store.remote_log_segment_metadata(&tp(), 0, 50).unwrap();
        assert_eq!(found.segment_id.id, SegmentId::new(1));
        assert_eq!(found.state, SegmentState::CopySegmentFinished);
        assert!(store.remote_log_segment_metadata(&tp(), 0, 100).is_none());
    }

    #[test]
    fn test_lookup_across_epochs() {
        let store = RemotePartitionMetadataStore::new();
        for event in [
            MetadataEvent::SegmentAdded(segment(1, 0, 99, &[(0, 0), (1, 60)])),
            update(1, SegmentState::CopySegmentFinished),
            MetadataEvent::SegmentAdded(segment(2, 100, 199, &[(1, 100)])),
            update(2, SegmentState::CopySegmentFinished),
        ] {
            store.handle(&event).unwrap();
        }

        let id = |epoch, offset| {
            store
                .remote_log_segment_metadata(&tp(), epoch, offset)
                .map(|s| s.segment_id.id.get())
        };
        assert_eq!(id(0, 10), Some(1));
        assert_eq!(id(0, 60), None, "offset 60 belongs to epoch 1");
        assert_eq!(id(1, 60), Some(1));
        assert_eq!(id(1, 150), Some(2));
        assert_eq!(id(2, 150), None);

        assert_eq!(store.highest_offset_for_epoch(&tp(), 0), Some(59));
        assert_eq!(store.highest_offset_for_epoch(&tp(), 1), Some(199));
        assert_eq!(store.list_segments_for_epoch(&tp(), 1).len(), 2);
    }

    #[test]
    fn test_delete_lifecycle() {
        let store = RemotePartitionMetadataStore::new();
        store
            .handle(&MetadataEvent::SegmentAdded(segment(1, 0, 9, &[(0, 0)])))
            .unwrap();
        store.handle(&update(1, SegmentState::CopySegmentFinished)).unwrap();

        store.handle(&update(1, SegmentState::DeleteSegmentStarted)).unwrap();
        assert!(store.remote_log_segment_metadata(&tp(), 0, 5).is_none());
        assert_eq!(store.list_segments(&tp()).len(), 1);

        store.handle(&update(1, SegmentState::DeleteSegmentFinished)).unwrap();
        assert!(store.list_segments(&tp()).is_empty());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let store = RemotePartitionMetadataStore::new();

        let err = store.handle(&update(1, SegmentState::CopySegmentFinished)).unwrap_err();
        assert!(matches!(err, HandlerError::UnknownSegment { .. }));

        store
            .handle(&MetadataEvent::SegmentAdded(segment(1, 0, 9, &[(0, 0)])))
            .unwrap();
        let err = store.handle(&update(1, SegmentState::DeleteSegmentFinished)).unwrap_err();
        assert!(matches!(err, HandlerError::InvalidTransition { .. }));

        // Replaying the add is accepted.
        store
            .handle(&MetadataEvent::SegmentAdded(segment(1, 0, 9, &[(0, 0)])))
            .unwrap();
    }

    #[test]
    fn test_partition_delete() {
        let store = RemotePartitionMetadataStore::new();
        store
            .handle(&MetadataEvent::SegmentAdded(segment(1, 0, 9, &[(0, 0)])))
            .unwrap();

        let err = store
            .handle(&delete(PartitionDeleteState::DeletePartitionStarted))
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidTransition { .. }));

        store.handle(&delete(PartitionDeleteState::DeletePartitionMarked)).unwrap();
        assert_eq!(
            store.delete_state(&tp()),
            Some(PartitionDeleteState::DeletePartitionMarked)
        );
        assert!(store
            .handle(&MetadataEvent::SegmentAdded(segment(2, 10, 19, &[(0, 10)])))
            .is_err());

        store.handle(&delete(PartitionDeleteState::DeletePartitionStarted)).unwrap();
        store.handle(&delete(PartitionDeleteState::DeletePartitionFinished)).unwrap();
        assert_eq!(store.delete_state(&tp()), None);
        assert!(store.list_segments(&tp()).is_empty());
    }

    #[test]
    fn test_clear() {
        let store = RemotePartitionMetadataStore::new();
        store
            .handle(&MetadataEvent::SegmentAdded(segment(1, 0, 9, &[(0, 0)])))
            .unwrap();
        store.clear([tp()]);
        assert!(store.list_segments(&tp()).is_empty());
    }

    #[test]
    fn test_reset_allows_replaying_the_same_events() {
        let store = RemotePartitionMetadataStore::new();
        let events = [
            MetadataEvent::SegmentAdded(segment(1, 0, 9, &[(0, 0)])),
            update(1, SegmentState::CopySegmentFinished),
        ];
        for event in &events {
            store.handle(event).unwrap();
        }
        assert!(store.handle(&events[0]).is_err(), "a finished segment cannot be added again");

        store.reset(&[tp()]);
        for event in &events {
            store.handle(event).unwrap();
        }
        assert_eq!(store.list_segments(&tp()).len(), 1);
        assert!(store.remote_log_segment_metadata(&tp(), 0, 5).is_some());
    }
}
