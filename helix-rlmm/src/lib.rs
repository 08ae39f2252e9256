//! Helix RLMM - topic-based remote log metadata synchronization.
//!
//! Remote segment metadata is written as events to an internal, partitioned
//! metadata topic. Every instance consumes the partitions it is responsible
//! for in a single background task and applies the events to a local store.
//! A writer produces its event and then waits until its own consumer has read
//! the record back, so the write is visible locally once the call returns.
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Single owner**: Only the consumer task touches the log consumer, the
//!   checkpoint store and the event handler
//! - **Fail fast**: Waits on unassigned partitions or a dead consumer return
//!   immediately
//! - **Deterministic testing**: `SimulatedLog` and `InMemoryCheckpointStore`
//!   inject faults from a seed
//! - **No unsafe code**: Safety > Performance
//!
//! # Components
//!
//! - [`OffsetTracker`]: Highest consumed offset per metadata partition
//! - [`PartitionAssignment`]: Which metadata and user partitions this
//!   instance owns, and in which role
//! - [`ConsumerTask`]: The background loop
//! - [`SynchronizationManager`]: Lifecycle and catch-up waits
//! - [`TopicBasedMetadataManager`]: Segment metadata reads and writes on top
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use helix_rlmm::{
//!     HashPartitioner, InMemoryCheckpointStore, RlmmConfig, SimulatedLog,
//!     TopicBasedMetadataManager,
//! };
//!
//! let config = RlmmConfig::for_testing();
//! let log = SimulatedLog::new(config.metadata_partitions, 42);
//! let manager = TopicBasedMetadataManager::new(
//!     config.clone(),
//!     Arc::new(HashPartitioner::new(config.metadata_partitions)),
//!     Arc::new(log.producer()),
//!     Box::new(log.consumer()),
//!     Arc::new(InMemoryCheckpointStore::new()),
//! )?;
//! manager.start()?;
//!
//! manager.on_partition_leadership_changes([topic_partition], []);
//! manager.add_remote_log_segment_metadata(segment).await?;
//! // The segment is now in the local store.
//! let segments = manager.list_segments(&topic_partition)?;
//!
//! manager.close().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod assignment;
mod checkpoint;
mod codec;
mod config;
mod consumer;
mod error;
mod event;
mod handler;
mod log;
mod manager;
mod metadata;
mod partitioner;
mod sync;
mod tracker;
mod types;

pub use assignment::{AssignmentSet, PartitionAssignment};
pub use checkpoint::{
    Checkpoint, CheckpointFaultConfig, CheckpointStore, FileCheckpointStore,
    InMemoryCheckpointStore,
};
pub use codec::{decode_event, decode_key, encode_event, encode_key, CODEC_VERSION};
pub use config::{ConfigError, RlmmConfig};
pub use consumer::{ConsumerTask, TaskState, TaskStatus};
pub use error::{ClientError, ClientResult, HandlerError, RlmmError, RlmmResult};
pub use event::{
    MetadataEvent, PartitionDeleteState, RemoteLogSegmentId, RemoteLogSegmentMetadata,
    RemoteLogSegmentMetadataUpdate, RemotePartitionDeleteMetadata, SegmentState,
};
pub use handler::{MetadataEventHandler, NoopEventHandler};
pub use log::{
    ConsumedRecord, LogConsumer, LogFaultConfig, LogProducer, SimulatedConsumer, SimulatedLog,
    SimulatedProducer,
};
pub use manager::TopicBasedMetadataManager;
pub use metadata::{RemoteLogMetadataCache, RemotePartitionMetadataStore};
pub use partitioner::{HashPartitioner, Partitioner};
pub use sync::SynchronizationManager;
pub use tracker::OffsetTracker;
pub use types::{
    BrokerId, MetadataPartition, PartitionId, PartitionProgress, RecordMetadata, Role, SegmentId,
    TopicId, TopicIdPartition,
};

/// Metadata synchronization limits.
pub mod limits {
    /// Interval at which a waiter re-checks consumed progress (milliseconds).
    pub const CONSUME_RECHECK_INTERVAL_MS: u64 = 50;

    /// Default number of metadata topic partitions.
    pub const METADATA_PARTITIONS_DEFAULT: u32 = 50;

    /// Maximum number of metadata topic partitions.
    pub const METADATA_PARTITIONS_MAX: u32 = 4096;

    /// Maximum number of leader epochs carried by one segment.
    pub const LEADER_EPOCHS_PER_SEGMENT_MAX: u32 = 10_000;
}
