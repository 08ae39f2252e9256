//! Strongly-typed identifiers for remote log metadata.
//!
//! User-facing partitions (`TopicIdPartition`) and partitions of the internal
//! metadata topic (`MetadataPartition`) are distinct types so that a wait on a
//! metadata partition can never be issued with a user partition id.

use std::fmt;

/// Generates a u64-backed identifier wrapper.
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }
    };
}

define_id!(TopicId, "topic", "Unique identifier for a user topic.");
define_id!(PartitionId, "partition", "Partition of a user topic.");
define_id!(SegmentId, "segment", "Unique identifier for a remote log segment.");
define_id!(BrokerId, "broker", "Broker that produced a metadata event.");

// -----------------------------------------------------------------------------
// MetadataPartition
// -----------------------------------------------------------------------------

/// Partition of the internal metadata topic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct MetadataPartition(u32);

impl MetadataPartition {
    /// Creates a metadata partition id.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw partition number.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for MetadataPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mp({})", self.0)
    }
}

impl fmt::Display for MetadataPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "__remote_log_metadata-{}", self.0)
    }
}

impl From<u32> for MetadataPartition {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

// -----------------------------------------------------------------------------
// TopicIdPartition
// -----------------------------------------------------------------------------

/// A user topic partition whose segments are tiered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicIdPartition {
    /// Topic identifier.
    pub topic_id: TopicId,
    /// Partition within the topic.
    pub partition_id: PartitionId,
}

impl TopicIdPartition {
    /// Creates a new topic partition key.
    #[must_use]
    pub const fn new(topic_id: TopicId, partition_id: PartitionId) -> Self {
        Self {
            topic_id,
            partition_id,
        }
    }
}

impl fmt::Display for TopicIdPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic_id, self.partition_id)
    }
}

// -----------------------------------------------------------------------------
// Role
// -----------------------------------------------------------------------------

/// Responsibility of this instance for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Handles events (side effects) for the partition.
    Primary,
    /// Tails the partition without handling its events.
    Secondary,
}

// -----------------------------------------------------------------------------
// Records
// -----------------------------------------------------------------------------

/// Position of a record produced to the metadata topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Metadata partition the record landed on.
    pub partition: MetadataPartition,
    /// Offset assigned by the log.
    pub offset: u64,
}

impl RecordMetadata {
    /// Creates record metadata.
    #[must_use]
    pub const fn new(partition: MetadataPartition, offset: u64) -> Self {
        Self { partition, offset }
    }
}

/// Consumption progress of one metadata partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionProgress {
    /// The metadata partition.
    pub partition: MetadataPartition,
    /// Highest consumed offset, `None` until the first record is processed.
    pub consumed_offset: Option<u64>,
}
