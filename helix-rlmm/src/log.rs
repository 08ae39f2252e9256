//! Log client abstraction for the internal metadata topic.
//!
//! The producer side is shared by writers. The consumer side is owned by the
//! consumer task alone; `LogConsumer` methods take `&mut self` so the type
//! system keeps it single-owner.
//!
//! `SimulatedLog` is an in-memory topic with deterministic fault injection,
//! used by the tests and by anyone embedding the manager without a broker.

#![allow(clippy::significant_drop_tightening)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::{ClientError, ClientResult};
use crate::types::{MetadataPartition, RecordMetadata};

// -----------------------------------------------------------------------------
// Traits
// -----------------------------------------------------------------------------

/// A record read from the metadata topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    /// Partition the record was read from.
    pub partition: MetadataPartition,
    /// Offset of the record.
    pub offset: u64,
    /// Record key.
    pub key: Bytes,
    /// Record value.
    pub value: Bytes,
}

/// Producer side of the log client.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Appends a record to `partition` and returns where it landed.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be appended.
    async fn produce(
        &self,
        partition: MetadataPartition,
        key: Bytes,
        value: Bytes,
    ) -> ClientResult<RecordMetadata>;
}

/// Consumer side of the log client.
///
/// Records returned by one `poll` are ordered by partition and, within a
/// partition, by offset.
#[async_trait]
pub trait LogConsumer: Send {
    /// Replaces the assignment. Each partition resumes at the given offset
    /// (the next offset to read).
    ///
    /// # Errors
    ///
    /// Returns an error if the assignment cannot be applied.
    async fn assign(&mut self, positions: &BTreeMap<MetadataPartition, u64>) -> ClientResult<()>;

    /// Waits up to `timeout` for records on the assigned partitions.
    ///
    /// # Errors
    ///
    /// Returns a transient error for retryable failures, fatal otherwise.
    async fn poll(&mut self, timeout: Duration) -> ClientResult<Vec<ConsumedRecord>>;

    /// Returns the next offset `poll` will read from `partition`, or `None` if
    /// the partition is not assigned.
    ///
    /// The position can be ahead of the last returned record when records
    /// were removed by compaction.
    fn position(&self, partition: MetadataPartition) -> Option<u64>;

    /// Releases the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the client could not be released cleanly.
    async fn close(&mut self) -> ClientResult<()>;
}

// -----------------------------------------------------------------------------
// Fault Configuration
// -----------------------------------------------------------------------------

/// Fault configuration for the simulated log.
#[derive(Debug, Clone, Default)]
pub struct LogFaultConfig {
    /// Probability of a poll failing transiently (0.0 - 1.0).
    pub poll_fail_rate: f64,
    /// Probability of a produce failing transiently (0.0 - 1.0).
    pub produce_fail_rate: f64,
    /// Fail every poll fatally (e.g. revoked authorization).
    pub poll_fatal: bool,
    /// Fail the next close.
    pub force_close_fail: bool,
}

impl LogFaultConfig {
    /// No faults.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            poll_fail_rate: 0.0,
            produce_fail_rate: 0.0,
            poll_fatal: false,
            force_close_fail: false,
        }
    }

    /// Flaky network: transient poll failures.
    #[must_use]
    pub const fn flaky() -> Self {
        Self {
            poll_fail_rate: 0.2,
            produce_fail_rate: 0.0,
            poll_fatal: false,
            force_close_fail: false,
        }
    }

    /// Builder: set poll fail rate.
    #[must_use]
    pub const fn with_poll_fail_rate(mut self, rate: f64) -> Self {
        self.poll_fail_rate = rate;
        self
    }

    /// Builder: set produce fail rate.
    #[must_use]
    pub const fn with_produce_fail_rate(mut self, rate: f64) -> Self {
        self.produce_fail_rate = rate;
        self
    }
}

// -----------------------------------------------------------------------------
// Simulated Log
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Entry {
    key: Bytes,
    value: Bytes,
}

#[derive(Debug)]
struct Shared {
    /// `None` marks a record removed by compaction. Offsets never shift.
    partitions: Mutex<Vec<Vec<Option<Entry>>>>,
    appended: Notify,
    fault_config: Mutex<LogFaultConfig>,
    seed: u64,
    counter: AtomicU64,
}

impl Shared {
    /// Deterministic fault decision from `(seed + counter)`.
    fn should_inject_fault(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let hash = self
            .seed
            .wrapping_add(counter)
            .wrapping_mul(0x9e37_79b9_7f4a_7c15);
        #[allow(clippy::cast_precision_loss)]
        let normalized = (hash as f64) / (u64::MAX as f64);
        normalized < rate
    }

    fn append(
        &self,
        partition: MetadataPartition,
        key: Bytes,
        value: Bytes,
    ) -> ClientResult<RecordMetadata> {
        let offset = {
            let mut partitions = self.partitions.lock().expect("log lock poisoned");
            let log = partitions
                .get_mut(partition.get() as usize)
                .ok_or_else(|| unknown_partition("produce", partition))?;
            log.push(Some(Entry { key, value }));
            (log.len() - 1) as u64
        };
        self.appended.notify_waiters();
        Ok(RecordMetadata::new(partition, offset))
    }

    /// Reads from `positions` and returns the records with the next position
    /// of every partition that was scanned. Compacted offsets are stepped over.
    fn read(
        &self,
        positions: &BTreeMap<MetadataPartition, u64>,
        max_records: usize,
    ) -> (Vec<ConsumedRecord>, BTreeMap<MetadataPartition, u64>) {
        let partitions = self.partitions.lock().expect("log lock poisoned");
        let mut records = Vec::new();
        let mut advanced = BTreeMap::new();
        for (partition, next) in positions {
            let Some(log) = partitions.get(partition.get() as usize) else {
                continue;
            };
            #[allow(clippy::cast_possible_truncation)] // Simulated logs fit in memory.
            let start = (*next as usize).min(log.len());
            for (index, slot) in log.iter().enumerate().skip(start) {
                let Some(entry) = slot else {
                    advanced.insert(*partition, index as u64 + 1);
                    continue;
                };
                if records.len() >= max_records {
                    return (records, advanced);
                }
                records.push(ConsumedRecord {
                    partition: *partition,
                    offset: index as u64,
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                });
                advanced.insert(*partition, index as u64 + 1);
            }
        }
        (records, advanced)
    }
}

fn unknown_partition(operation: &'static str, partition: MetadataPartition) -> ClientError {
    ClientError::Fatal {
        operation,
        message: format!("unknown partition {partition}"),
    }
}

/// In-memory metadata topic.
///
/// Clones share the same topic.
#[derive(Debug, Clone)]
pub struct SimulatedLog {
    shared: Arc<Shared>,
}

impl SimulatedLog {
    /// Maximum records returned by one simulated poll.
    pub const MAX_POLL_RECORDS: usize = 500;

    /// Creates a topic with `partition_count` empty partitions and no faults.
    #[must_use]
    pub fn new(partition_count: u32, seed: u64) -> Self {
        Self::with_faults(partition_count, seed, LogFaultConfig::none())
    }

    /// Creates a topic with fault injection.
    #[must_use]
    pub fn with_faults(partition_count: u32, seed: u64, config: LogFaultConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                partitions: Mutex::new(vec![Vec::new(); partition_count as usize]),
                appended: Notify::new(),
                fault_config: Mutex::new(config),
                seed,
                counter: AtomicU64::new(0),
            }),
        }
    }

    /// Returns fault config for modification.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn fault_config(&self) -> std::sync::MutexGuard<'_, LogFaultConfig> {
        self.shared.fault_config.lock().expect("fault config lock poisoned")
    }

    /// Returns a producer handle.
    #[must_use]
    pub fn producer(&self) -> SimulatedProducer {
        SimulatedProducer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns a new consumer with an empty assignment.
    #[must_use]
    pub fn consumer(&self) -> SimulatedConsumer {
        SimulatedConsumer {
            shared: Arc::clone(&self.shared),
            positions: BTreeMap::new(),
            closed: false,
        }
    }

    /// Appends directly, bypassing faults.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition does not exist.
    pub fn append(
        &self,
        partition: MetadataPartition,
        key: Bytes,
        value: Bytes,
    ) -> ClientResult<RecordMetadata> {
        self.shared.append(partition, key, value)
    }

    /// Removes the records at `offsets` from `partition`, as log compaction
    /// would. Later offsets are unchanged.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn compact(&self, partition: MetadataPartition, offsets: impl IntoIterator<Item = u64>) {
        let mut partitions = self.shared.partitions.lock().expect("log lock poisoned");
        let Some(log) = partitions.get_mut(partition.get() as usize) else {
            return;
        };
        for offset in offsets {
            #[allow(clippy::cast_possible_truncation)] // Simulated logs fit in memory.
            let index = offset as usize;
            if let Some(slot) = log.get_mut(index) {
                *slot = None;
            }
        }
    }

    /// Returns the log end offset of `partition` (compacted records count).
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn len(&self, partition: MetadataPartition) -> u64 {
        let partitions = self.shared.partitions.lock().expect("log lock poisoned");
        partitions
            .get(partition.get() as usize)
            .map_or(0, |log| log.len() as u64)
    }
}

/// Producer handle of a [`SimulatedLog`].
#[derive(Debug, Clone)]
pub struct SimulatedProducer {
    shared: Arc<Shared>,
}

#[async_trait]
impl LogProducer for SimulatedProducer {
    async fn produce(
        &self,
        partition: MetadataPartition,
        key: Bytes,
        value: Bytes,
    ) -> ClientResult<RecordMetadata> {
        let rate = self.shared.fault_config.lock().expect("lock").produce_fail_rate;
        if self.shared.should_inject_fault(rate) {
            return Err(ClientError::Transient {
                operation: "produce",
                message: "simulated failure (random)".into(),
            });
        }
        self.shared.append(partition, key, value)
    }
}

/// Consumer handle of a [`SimulatedLog`].
#[derive(Debug)]
pub struct SimulatedConsumer {
    shared: Arc<Shared>,
    positions: BTreeMap<MetadataPartition, u64>,
    closed: bool,
}

impl SimulatedConsumer {
    fn check_faults(&self) -> ClientResult<()> {
        let (fatal, rate) = {
            let config = self.shared.fault_config.lock().expect("lock");
            (config.poll_fatal, config.poll_fail_rate)
        };
        if fatal {
            return Err(ClientError::Fatal {
                operation: "poll",
                message: "simulated authorization failure".into(),
            });
        }
        if self.shared.should_inject_fault(rate) {
            return Err(ClientError::Transient {
                operation: "poll",
                message: "simulated failure (random)".into(),
            });
        }
        Ok(())
    }

    fn take(&mut self) -> Vec<ConsumedRecord> {
        let (records, advanced) = self
            .shared
            .read(&self.positions, SimulatedLog::MAX_POLL_RECORDS);
        self.positions.extend(advanced);
        records
    }
}

#[async_trait]
impl LogConsumer for SimulatedConsumer {
    async fn assign(&mut self, positions: &BTreeMap<MetadataPartition, u64>) -> ClientResult<()> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        {
            let partitions = self.shared.partitions.lock().expect("log lock poisoned");
            if let Some(partition) = positions
                .keys()
                .find(|p| p.get() as usize >= partitions.len())
            {
                return Err(unknown_partition("assign", *partition));
            }
        }
        self.positions.clone_from(positions);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> ClientResult<Vec<ConsumedRecord>> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        self.check_faults()?;

        let shared = Arc::clone(&self.shared);
        let notified = shared.appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let records = self.take();
        if !records.is_empty() {
            return Ok(records);
        }

        let _ = tokio::time::timeout(timeout, notified).await;
        Ok(self.take())
    }

    fn position(&self, partition: MetadataPartition) -> Option<u64> {
        self.positions.get(&partition).copied()
    }

    async fn close(&mut self) -> ClientResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut config = self.shared.fault_config.lock().expect("lock poisoned");
        if config.force_close_fail {
            config.force_close_fail = false;
            return Err(ClientError::Fatal {
                operation: "close",
                message: "simulated failure (forced)".into(),
            });
        }
        Ok(())
    }
}
