//! Per-partition consumed offset tracking.
//!
//! The consumer task is the only writer; any number of waiters read. Each
//! partition's offset lives in its own atomic, so advancing an existing
//! partition only needs the shared side of the map lock and never waits on a
//! reader. The exclusive side is taken when a partition is added or removed.

#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::types::{MetadataPartition, PartitionProgress};

/// Sentinel for "assigned but nothing consumed yet".
const NOTHING_CONSUMED: u64 = u64::MAX;

/// Thread-safe map from metadata partition to highest consumed offset.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    offsets: RwLock<HashMap<MetadataPartition, AtomicU64>>,
}

impl OffsetTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `offset` has been consumed on `partition`.
    ///
    /// Offsets at or below the tracked value are ignored, as is `u64::MAX`,
    /// which no log can reach. Returns true if the tracked value advanced.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn record_consumed(&self, partition: MetadataPartition, offset: u64) -> bool {
        if offset == NOTHING_CONSUMED {
            return false;
        }

        {
            let offsets = self.offsets.read().expect("tracker lock poisoned");
            if let Some(slot) = offsets.get(&partition) {
                return advance(slot, offset);
            }
        }

        let mut offsets = self.offsets.write().expect("tracker lock poisoned");
        let slot = offsets
            .entry(partition)
            .or_insert_with(|| AtomicU64::new(NOTHING_CONSUMED));
        advance(slot, offset)
    }

    /// Returns the highest consumed offset, or `None` if nothing is known.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn progress(&self, partition: MetadataPartition) -> Option<u64> {
        let offsets = self.offsets.read().expect("tracker lock poisoned");
        offsets.get(&partition).and_then(load)
    }

    /// Replaces the entry for `partition` with a fresh one.
    ///
    /// Used when a partition is (re)assigned: the seed comes from the persisted
    /// checkpoint, never from a previous in-memory value.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn reset(&self, partition: MetadataPartition, seed: Option<u64>) {
        let mut offsets = self.offsets.write().expect("tracker lock poisoned");
        offsets.insert(partition, AtomicU64::new(seed.unwrap_or(NOTHING_CONSUMED)));
    }

    /// Forgets `partition`. Returns the offset it had reached.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn remove(&self, partition: MetadataPartition) -> Option<u64> {
        let mut offsets = self.offsets.write().expect("tracker lock poisoned");
        offsets.remove(&partition).as_ref().and_then(load)
    }

    /// Returns progress for every tracked partition, ordered by partition.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PartitionProgress> {
        let offsets = self.offsets.read().expect("tracker lock poisoned");
        let mut rows: Vec<PartitionProgress> = offsets
            .iter()
            .map(|(partition, slot)| PartitionProgress {
                partition: *partition,
                consumed_offset: load(slot),
            })
            .collect();
        rows.sort_by_key(|row| row.partition);
        rows
    }
}

fn load(slot: &AtomicU64) -> Option<u64> {
    match slot.load(Ordering::Acquire) {
        NOTHING_CONSUMED => None,
        offset => Some(offset),
    }
}

fn advance(slot: &AtomicU64, offset: u64) -> bool {
    let mut current = slot.load(Ordering::Acquire);
    loop {
        if current != NOTHING_CONSUMED && current >= offset {
            return false;
        }
        match slot.compare_exchange_weak(current, offset, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}
