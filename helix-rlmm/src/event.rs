//! Remote log metadata events carried by the internal topic.
//!
//! Three event kinds exist: a segment is added (copy started), a segment's
//! state is updated, or a whole user partition is being deleted. Replaying
//! the same event twice is allowed: every state may transition to itself.

use std::collections::BTreeMap;
use std::fmt;

use crate::types::{BrokerId, SegmentId, TopicIdPartition};

// -----------------------------------------------------------------------------
// States
// -----------------------------------------------------------------------------

/// Lifecycle state of a remote log segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentState {
    /// Copy to remote storage has started.
    CopySegmentStarted,
    /// Copy to remote storage has finished; the segment is readable.
    CopySegmentFinished,
    /// Deletion from remote storage has started.
    DeleteSegmentStarted,
    /// Deletion from remote storage has finished.
    DeleteSegmentFinished,
}

impl SegmentState {
    /// Returns true if a segment may move from `self` to `target`.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match (self, target) {
            (Self::CopySegmentStarted, Self::CopySegmentStarted)
            | (Self::CopySegmentStarted, Self::CopySegmentFinished)
            | (Self::CopySegmentStarted, Self::DeleteSegmentStarted)
            | (Self::CopySegmentFinished, Self::CopySegmentFinished)
            | (Self::CopySegmentFinished, Self::DeleteSegmentStarted)
            | (Self::DeleteSegmentStarted, Self::DeleteSegmentStarted)
            | (Self::DeleteSegmentStarted, Self::DeleteSegmentFinished)
            | (Self::DeleteSegmentFinished, Self::DeleteSegmentFinished) => true,
            _ => false,
        }
    }

    /// Returns the wire id of the state.
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::CopySegmentStarted => 0,
            Self::CopySegmentFinished => 1,
            Self::DeleteSegmentStarted => 2,
            Self::DeleteSegmentFinished => 3,
        }
    }

    /// Parses a wire id.
    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::CopySegmentStarted),
            1 => Some(Self::CopySegmentFinished),
            2 => Some(Self::DeleteSegmentStarted),
            3 => Some(Self::DeleteSegmentFinished),
            _ => None,
        }
    }

    /// Returns a static name for logging and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CopySegmentStarted => "COPY_SEGMENT_STARTED",
            Self::CopySegmentFinished => "COPY_SEGMENT_FINISHED",
            Self::DeleteSegmentStarted => "DELETE_SEGMENT_STARTED",
            Self::DeleteSegmentFinished => "DELETE_SEGMENT_FINISHED",
        }
    }
}

/// Lifecycle state of a user partition's remote deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionDeleteState {
    /// Deletion requested.
    DeletePartitionMarked,
    /// Segment deletion in progress.
    DeletePartitionStarted,
    /// All remote data removed.
    DeletePartitionFinished,
}

impl PartitionDeleteState {
    /// Returns true if a partition may move from `self` to `target`.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match (self, target) {
            (Self::DeletePartitionMarked, Self::DeletePartitionMarked)
            | (Self::DeletePartitionMarked, Self::DeletePartitionStarted)
            | (Self::DeletePartitionStarted, Self::DeletePartitionStarted)
            | (Self::DeletePartitionStarted, Self::DeletePartitionFinished)
            | (Self::DeletePartitionFinished, Self::DeletePartitionFinished) => true,
            _ => false,
        }
    }

    /// Returns the wire id of the state.
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::DeletePartitionMarked => 0,
            Self::DeletePartitionStarted => 1,
            Self::DeletePartitionFinished => 2,
        }
    }

    /// Parses a wire id.
    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::DeletePartitionMarked),
            1 => Some(Self::DeletePartitionStarted),
            2 => Some(Self::DeletePartitionFinished),
            _ => None,
        }
    }

    /// Returns a static name for logging and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::DeletePartitionMarked => "DELETE_PARTITION_MARKED",
            Self::DeletePartitionStarted => "DELETE_PARTITION_STARTED",
            Self::DeletePartitionFinished => "DELETE_PARTITION_FINISHED",
        }
    }
}

// -----------------------------------------------------------------------------
// Segment identity
// -----------------------------------------------------------------------------

/// Identity of a remote segment: its user partition plus a unique id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemoteLogSegmentId {
    /// User partition the segment belongs to.
    pub topic_partition: TopicIdPartition,
    /// Segment id, unique within the partition.
    pub id: SegmentId,
}

impl RemoteLogSegmentId {
    /// Creates a segment identity.
    #[must_use]
    pub const fn new(topic_partition: TopicIdPartition, id: SegmentId) -> Self {
        Self {
            topic_partition,
            id,
        }
    }
}

impl fmt::Display for RemoteLogSegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic_partition, self.id)
    }
}

// -----------------------------------------------------------------------------
// Events
// -----------------------------------------------------------------------------

/// Full metadata of a remote log segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLogSegmentMetadata {
    /// Segment identity.
    pub segment_id: RemoteLogSegmentId,
    /// First offset in the segment (inclusive).
    pub start_offset: u64,
    /// Last offset in the segment (inclusive).
    pub end_offset: u64,
    /// Largest record timestamp in the segment (ms since epoch).
    pub max_timestamp_ms: i64,
    /// Broker that produced the event.
    pub broker_id: BrokerId,
    /// When the event was created (ms since epoch).
    pub event_timestamp_ms: i64,
    /// Segment size in bytes.
    pub segment_size_bytes: u64,
    /// Leader epoch → first offset of that epoch within the segment.
    pub segment_leader_epochs: BTreeMap<u32, u64>,
    /// Current state.
    pub state: SegmentState,
}

impl RemoteLogSegmentMetadata {
    /// Creates metadata for a segment whose copy has just started.
    ///
    /// # Panics
    ///
    /// Panics if `start_offset > end_offset` or no leader epochs are given.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        segment_id: RemoteLogSegmentId,
        start_offset: u64,
        end_offset: u64,
        max_timestamp_ms: i64,
        broker_id: BrokerId,
        event_timestamp_ms: i64,
        segment_size_bytes: u64,
        segment_leader_epochs: BTreeMap<u32, u64>,
    ) -> Self {
        assert!(
            start_offset <= end_offset,
            "start_offset ({start_offset}) must be <= end_offset ({end_offset})"
        );
        assert!(
            !segment_leader_epochs.is_empty(),
            "segment_leader_epochs must not be empty"
        );

        Self {
            segment_id,
            start_offset,
            end_offset,
            max_timestamp_ms,
            broker_id,
            event_timestamp_ms,
            segment_size_bytes,
            segment_leader_epochs,
            state: SegmentState::CopySegmentStarted,
        }
    }

    /// Returns the user partition of the segment.
    #[must_use]
    pub const fn topic_partition(&self) -> TopicIdPartition {
        self.segment_id.topic_partition
    }

    /// Returns the highest leader epoch covered by the segment.
    #[must_use]
    pub fn max_leader_epoch(&self) -> Option<u32> {
        self.segment_leader_epochs.keys().next_back().copied()
    }

    /// Returns the last offset belonging to `epoch` within the segment.
    #[must_use]
    pub fn end_offset_for_epoch(&self, epoch: u32) -> Option<u64> {
        self.segment_leader_epochs.get(&epoch)?;
        match self.segment_leader_epochs.range(epoch + 1..).next() {
            Some((_, next_start)) => Some(next_start.saturating_sub(1)),
            None => Some(self.end_offset),
        }
    }

    /// Returns a copy with `update` applied.
    #[must_use]
    pub fn with_update(&self, update: &RemoteLogSegmentMetadataUpdate) -> Self {
        assert_eq!(self.segment_id, update.segment_id, "update for a different segment");
        Self {
            broker_id: update.broker_id,
            event_timestamp_ms: update.event_timestamp_ms,
            state: update.state,
            ..self.clone()
        }
    }
}

/// State change of an existing remote segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLogSegmentMetadataUpdate {
    /// Segment identity.
    pub segment_id: RemoteLogSegmentId,
    /// When the event was created (ms since epoch).
    pub event_timestamp_ms: i64,
    /// New state.
    pub state: SegmentState,
    /// Broker that produced the event.
    pub broker_id: BrokerId,
}

/// State change of a user partition's remote deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePartitionDeleteMetadata {
    /// User partition being deleted.
    pub topic_partition: TopicIdPartition,
    /// New state.
    pub state: PartitionDeleteState,
    /// When the event was created (ms since epoch).
    pub event_timestamp_ms: i64,
    /// Broker that produced the event.
    pub broker_id: BrokerId,
}

/// An event on the metadata topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataEvent {
    /// A new segment is being copied.
    SegmentAdded(RemoteLogSegmentMetadata),
    /// An existing segment changed state.
    SegmentUpdated(RemoteLogSegmentMetadataUpdate),
    /// A user partition's remote data is being deleted.
    PartitionDeleted(RemotePartitionDeleteMetadata),
}

impl MetadataEvent {
    /// Returns the user partition the event belongs to.
    #[must_use]
    pub const fn topic_partition(&self) -> TopicIdPartition {
        match self {
            Self::SegmentAdded(meta) => meta.segment_id.topic_partition,
            Self::SegmentUpdated(update) => update.segment_id.topic_partition,
            Self::PartitionDeleted(delete) => delete.topic_partition,
        }
    }

    /// Returns a static name of the event kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SegmentAdded(_) => "segment_added",
            Self::SegmentUpdated(_) => "segment_updated",
            Self::PartitionDeleted(_) => "partition_deleted",
        }
    }
}
