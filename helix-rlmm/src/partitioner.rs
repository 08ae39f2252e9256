//! Mapping from user partitions to metadata topic partitions.

use xxhash_rust::xxh3::xxh3_64;

use crate::types::{MetadataPartition, TopicIdPartition};

/// Maps a user partition to the metadata partition carrying its events.
///
/// Implementations must be pure: the same key always maps to the same
/// partition for the lifetime of the metadata topic.
pub trait Partitioner: Send + Sync {
    /// Returns the metadata partition for `key`.
    fn partition_for(&self, key: &TopicIdPartition) -> MetadataPartition;

    /// Returns the number of metadata partitions.
    fn partition_count(&self) -> u32;
}

/// Hash partitioner using xxh3 over the topic and partition ids.
#[derive(Debug, Clone, Copy)]
pub struct HashPartitioner {
    partition_count: u32,
}

impl HashPartitioner {
    /// Creates a partitioner for a topic with `partition_count` partitions.
    ///
    /// # Panics
    ///
    /// Panics if `partition_count` is zero.
    #[must_use]
    pub const fn new(partition_count: u32) -> Self {
        assert!(partition_count > 0, "partition_count must be positive");
        Self { partition_count }
    }
}

impl Partitioner for HashPartitioner {
    fn partition_for(&self, key: &TopicIdPartition) -> MetadataPartition {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&key.topic_id.get().to_le_bytes());
        buf[8..].copy_from_slice(&key.partition_id.get().to_le_bytes());
        let hash = xxh3_64(&buf);

        #[allow(clippy::cast_possible_truncation)] // Result is < partition_count.
        let partition = (hash % u64::from(self.partition_count)) as u32;
        MetadataPartition::new(partition)
    }

    fn partition_count(&self) -> u32 {
        self.partition_count
    }
}
