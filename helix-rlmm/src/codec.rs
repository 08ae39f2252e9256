//! Binary encoding of metadata events.
//!
//! # Format
//!
//! All integers are little-endian.
//!
//! ```text
//! +---------+------+---------------------+
//! | version | kind | body                |
//! |   u8    |  u8  | (kind specific)     |
//! +---------+------+---------------------+
//!
//! segment id     = topic_id u64, partition_id u64, segment_id u64
//! segment_added  = segment id, start u64, end u64, max_ts i64, broker u64,
//!                  event_ts i64, size u64, epoch_count u32,
//!                  (epoch u32, start_offset u64) * epoch_count, state u8
//! segment_update = segment id, event_ts i64, state u8, broker u64
//! partition_del  = topic_id u64, partition_id u64, state u8, event_ts i64, broker u64
//! ```

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RlmmError, RlmmResult};
use crate::event::{
    MetadataEvent, PartitionDeleteState, RemoteLogSegmentId, RemoteLogSegmentMetadata,
    RemoteLogSegmentMetadataUpdate, RemotePartitionDeleteMetadata, SegmentState,
};
use crate::limits::LEADER_EPOCHS_PER_SEGMENT_MAX;
use crate::types::{BrokerId, PartitionId, SegmentId, TopicId, TopicIdPartition};

/// Current format version.
pub const CODEC_VERSION: u8 = 0;

const KIND_SEGMENT_ADDED: u8 = 0;
const KIND_SEGMENT_UPDATED: u8 = 1;
const KIND_PARTITION_DELETED: u8 = 2;

/// Encodes the record key for a user partition.
#[must_use]
pub fn encode_key(topic_partition: &TopicIdPartition) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    put_topic_partition(&mut buf, topic_partition);
    buf.freeze()
}

/// Decodes a record key produced by [`encode_key`].
///
/// # Errors
///
/// Returns `RlmmError::Codec` if the key is not exactly one user partition.
pub fn decode_key(mut buf: &[u8]) -> RlmmResult<TopicIdPartition> {
    let topic_partition = get_topic_partition(&mut buf)?;
    if buf.has_remaining() {
        return Err(codec_error(format!("{} trailing key bytes", buf.remaining())));
    }
    Ok(topic_partition)
}

/// Encodes an event as a record value.
#[must_use]
pub fn encode_event(event: &MetadataEvent) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_u8(CODEC_VERSION);

    match event {
        MetadataEvent::SegmentAdded(meta) => {
            buf.put_u8(KIND_SEGMENT_ADDED);
            put_segment_id(&mut buf, &meta.segment_id);
            buf.put_u64_le(meta.start_offset);
            buf.put_u64_le(meta.end_offset);
            buf.put_i64_le(meta.max_timestamp_ms);
            buf.put_u64_le(meta.broker_id.get());
            buf.put_i64_le(meta.event_timestamp_ms);
            buf.put_u64_le(meta.segment_size_bytes);
            #[allow(clippy::cast_possible_truncation)] // Bounded by the epoch limit.
            buf.put_u32_le(meta.segment_leader_epochs.len() as u32);
            for (epoch, offset) in &meta.segment_leader_epochs {
                buf.put_u32_le(*epoch);
                buf.put_u64_le(*offset);
            }
            buf.put_u8(meta.state.id());
        }
        MetadataEvent::SegmentUpdated(update) => {
            buf.put_u8(KIND_SEGMENT_UPDATED);
            put_segment_id(&mut buf, &update.segment_id);
            buf.put_i64_le(update.event_timestamp_ms);
            buf.put_u8(update.state.id());
            buf.put_u64_le(update.broker_id.get());
        }
        MetadataEvent::PartitionDeleted(delete) => {
            buf.put_u8(KIND_PARTITION_DELETED);
            put_topic_partition(&mut buf, &delete.topic_partition);
            buf.put_u8(delete.state.id());
            buf.put_i64_le(delete.event_timestamp_ms);
            buf.put_u64_le(delete.broker_id.get());
        }
    }

    buf.freeze()
}

/// Decodes a record value produced by [`encode_event`].
///
/// # Errors
///
/// Returns `RlmmError::Codec` if the buffer is truncated, has trailing bytes,
/// or carries an unknown version, kind or state.
pub fn decode_event(mut buf: &[u8]) -> RlmmResult<MetadataEvent> {
    let version = get_u8(&mut buf, "version")?;
    if version != CODEC_VERSION {
        return Err(codec_error(format!("unsupported version {version}")));
    }

    let event = match get_u8(&mut buf, "kind")? {
        KIND_SEGMENT_ADDED => {
            let segment_id = get_segment_id(&mut buf)?;
            let start_offset = get_u64(&mut buf, "start_offset")?;
            let end_offset = get_u64(&mut buf, "end_offset")?;
            let max_timestamp_ms = get_i64(&mut buf, "max_timestamp")?;
            let broker_id = BrokerId::new(get_u64(&mut buf, "broker_id")?);
            let event_timestamp_ms = get_i64(&mut buf, "event_timestamp")?;
            let segment_size_bytes = get_u64(&mut buf, "segment_size")?;

            let epoch_count = get_u32(&mut buf, "epoch_count")?;
            if epoch_count == 0 || epoch_count > LEADER_EPOCHS_PER_SEGMENT_MAX {
                return Err(codec_error(format!("invalid leader epoch count {epoch_count}")));
            }
            let mut segment_leader_epochs = BTreeMap::new();
            for _ in 0..epoch_count {
                let epoch = get_u32(&mut buf, "epoch")?;
                let offset = get_u64(&mut buf, "epoch_offset")?;
                segment_leader_epochs.insert(epoch, offset);
            }

            let state = segment_state(get_u8(&mut buf, "state")?)?;
            if start_offset > end_offset {
                return Err(codec_error(format!(
                    "start_offset {start_offset} > end_offset {end_offset}"
                )));
            }

            MetadataEvent::SegmentAdded(RemoteLogSegmentMetadata {
                segment_id,
                start_offset,
                end_offset,
                max_timestamp_ms,
                broker_id,
                event_timestamp_ms,
                segment_size_bytes,
                segment_leader_epochs,
                state,
            })
        }
        KIND_SEGMENT_UPDATED => {
            let segment_id = get_segment_id(&mut buf)?;
            let event_timestamp_ms = get_i64(&mut buf, "event_timestamp")?;
            let state = segment_state(get_u8(&mut buf, "state")?)?;
            let broker_id = BrokerId::new(get_u64(&mut buf, "broker_id")?);
            MetadataEvent::SegmentUpdated(RemoteLogSegmentMetadataUpdate {
                segment_id,
                event_timestamp_ms,
                state,
                broker_id,
            })
        }
        KIND_PARTITION_DELETED => {
            let topic_partition = get_topic_partition(&mut buf)?;
            let state_id = get_u8(&mut buf, "state")?;
            let state = PartitionDeleteState::from_id(state_id)
                .ok_or_else(|| codec_error(format!("unknown partition delete state {state_id}")))?;
            let event_timestamp_ms = get_i64(&mut buf, "event_timestamp")?;
            let broker_id = BrokerId::new(get_u64(&mut buf, "broker_id")?);
            MetadataEvent::PartitionDeleted(RemotePartitionDeleteMetadata {
                topic_partition,
                state,
                event_timestamp_ms,
                broker_id,
            })
        }
        kind => return Err(codec_error(format!("unknown event kind {kind}"))),
    };

    if buf.has_remaining() {
        return Err(codec_error(format!("{} trailing bytes", buf.remaining())));
    }
    Ok(event)
}

fn put_topic_partition(buf: &mut BytesMut, tp: &TopicIdPartition) {
    buf.put_u64_le(tp.topic_id.get());
    buf.put_u64_le(tp.partition_id.get());
}

fn put_segment_id(buf: &mut BytesMut, id: &RemoteLogSegmentId) {
    put_topic_partition(buf, &id.topic_partition);
    buf.put_u64_le(id.id.get());
}

fn get_topic_partition(buf: &mut &[u8]) -> RlmmResult<TopicIdPartition> {
    let topic_id = TopicId::new(get_u64(buf, "topic_id")?);
    let partition_id = PartitionId::new(get_u64(buf, "partition_id")?);
    Ok(TopicIdPartition::new(topic_id, partition_id))
}

fn get_segment_id(buf: &mut &[u8]) -> RlmmResult<RemoteLogSegmentId> {
    let topic_partition = get_topic_partition(buf)?;
    let id = SegmentId::new(get_u64(buf, "segment_id")?);
    Ok(RemoteLogSegmentId::new(topic_partition, id))
}

fn segment_state(id: u8) -> RlmmResult<SegmentState> {
    SegmentState::from_id(id).ok_or_else(|| codec_error(format!("unknown segment state {id}")))
}

fn ensure(buf: &[u8], len: usize, field: &'static str) -> RlmmResult<()> {
    if buf.remaining() < len {
        return Err(codec_error(format!("truncated at {field}")));
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8], field: &'static str) -> RlmmResult<u8> {
    ensure(buf, 1, field)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8], field: &'static str) -> RlmmResult<u32> {
    ensure(buf, 4, field)?;
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut &[u8], field: &'static str) -> RlmmResult<u64> {
    ensure(buf, 8, field)?;
    Ok(buf.get_u64_le())
}

fn get_i64(buf: &mut &[u8], field: &'static str) -> RlmmResult<i64> {
    ensure(buf, 8, field)?;
    Ok(buf.get_i64_le())
}

fn codec_error(message: String) -> RlmmError {
    RlmmError::Codec { message }
}
