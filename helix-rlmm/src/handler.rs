//! Downstream handling of consumed metadata events.

use crate::error::HandlerError;
use crate::event::MetadataEvent;
use crate::types::TopicIdPartition;

/// Applies metadata events read by the consumer task.
///
/// Called only from the consumer task, in partition offset order. A failure is
/// logged by the caller and the event is counted as consumed anyway.
pub trait MetadataEventHandler: Send + Sync {
    /// Applies one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be applied.
    fn handle(&self, event: &MetadataEvent) -> Result<(), HandlerError>;

    /// Drops any state held for `topic_partitions`.
    ///
    /// Called before their events are re-read from the start of the metadata
    /// topic, so each event is applied once after the call.
    fn reset(&self, _topic_partitions: &[TopicIdPartition]) {}
}

/// Handler that drops every event. Useful for instances that only tail.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventHandler;

impl MetadataEventHandler for NoopEventHandler {
    fn handle(&self, _event: &MetadataEvent) -> Result<(), HandlerError> {
        Ok(())
    }
}
