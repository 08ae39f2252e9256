//! Committed offsets checkpoint.
//!
//! The checkpoint maps each metadata partition to the last offset whose event
//! has been processed. It is read once at consumer startup and written by the
//! consumer task every checkpoint interval and on shutdown.
//!
//! # File Format
//!
//! [`FileCheckpointStore`] writes a text file named `_rlmm_committed_offsets`:
//!
//! ```text
//! 0            <- format version
//! 2            <- number of entries
//! 0 41         <- partition offset
//! 3 7
//! ```

#![allow(clippy::significant_drop_tightening)]

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::config::RlmmConfig;
use crate::error::{RlmmError, RlmmResult};
use crate::types::MetadataPartition;

/// Last processed offset per metadata partition.
pub type Checkpoint = BTreeMap<MetadataPartition, u64>;

/// Persistence for the checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the last saved checkpoint. Returns an empty map if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint exists but cannot be read.
    async fn load(&self) -> RlmmResult<Checkpoint>;

    /// Replaces the saved checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be persisted.
    async fn save(&self, checkpoint: &Checkpoint) -> RlmmResult<()>;
}

// -----------------------------------------------------------------------------
// InMemoryCheckpointStore
// -----------------------------------------------------------------------------

/// Fault configuration for [`InMemoryCheckpointStore`].
#[derive(Debug, Clone, Default)]
pub struct CheckpointFaultConfig {
    /// Force the next load to fail (one-shot).
    pub force_load_fail: bool,
    /// Force the next save to fail (one-shot).
    pub force_save_fail: bool,
}

/// In-memory checkpoint store for tests.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    saved: Arc<Mutex<Checkpoint>>,
    fault_config: Arc<Mutex<CheckpointFaultConfig>>,
    save_count: Arc<AtomicU64>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `checkpoint`.
    #[must_use]
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        let store = Self::new();
        *store.saved.lock().expect("checkpoint lock poisoned") = checkpoint;
        store
    }

    /// Returns fault config for modification.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub fn fault_config(&self) -> std::sync::MutexGuard<'_, CheckpointFaultConfig> {
        self.fault_config.lock().expect("fault config lock poisoned")
    }

    /// Returns the saved checkpoint (bypasses faults).
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn saved(&self) -> Checkpoint {
        self.saved.lock().expect("checkpoint lock poisoned").clone()
    }

    /// Returns how many saves succeeded.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self) -> RlmmResult<Checkpoint> {
        {
            let mut config = self.fault_config.lock().expect("lock poisoned");
            if config.force_load_fail {
                config.force_load_fail = false;
                return Err(RlmmError::Checkpoint {
                    operation: "load",
                    message: "simulated failure (forced)".into(),
                });
            }
        }
        Ok(self.saved())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> RlmmResult<()> {
        {
            let mut config = self.fault_config.lock().expect("lock poisoned");
            if config.force_save_fail {
                config.force_save_fail = false;
                return Err(RlmmError::Checkpoint {
                    operation: "save",
                    message: "simulated failure (forced)".into(),
                });
            }
        }
        self.saved
            .lock()
            .expect("checkpoint lock poisoned")
            .clone_from(checkpoint);
        self.save_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// FileCheckpointStore
// -----------------------------------------------------------------------------

/// Checkpoint store backed by a file in the log directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
    sync_on_write: bool,
}

impl FileCheckpointStore {
    /// Name of the checkpoint file inside the log directory.
    pub const FILE_NAME: &'static str = "_rlmm_committed_offsets";

    const VERSION: u32 = 0;

    /// Creates a store for `log_dir/_rlmm_committed_offsets`.
    #[must_use]
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        Self {
            path: log_dir.as_ref().join(Self::FILE_NAME),
            sync_on_write: true,
        }
    }

    /// Creates a store in the configured log directory.
    #[must_use]
    pub fn from_config(config: &RlmmConfig) -> Self {
        Self::new(&config.log_dir)
    }

    /// Creates a store that skips fsync (for tests).
    #[must_use]
    pub fn for_testing(log_dir: impl AsRef<Path>) -> Self {
        Self {
            sync_on_write: false,
            ..Self::new(log_dir)
        }
    }

    /// Returns the checkpoint file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, text: &str) -> RlmmResult<Checkpoint> {
        let mut lines = text.lines();

        let version: u32 = self.parse_field(lines.next(), "version")?;
        if version != Self::VERSION {
            return Err(self.corrupt(format!("unsupported version {version}")));
        }
        let count: usize = self.parse_field(lines.next(), "count")?;

        let mut checkpoint = Checkpoint::new();
        for line in lines.by_ref().take(count) {
            let mut fields = line.split_whitespace();
            let partition: u32 = self.parse_field(fields.next(), "partition")?;
            let offset: u64 = self.parse_field(fields.next(), "offset")?;
            if fields.next().is_some() {
                return Err(self.corrupt(format!("malformed entry '{line}'")));
            }
            checkpoint.insert(MetadataPartition::new(partition), offset);
        }

        if checkpoint.len() != count {
            return Err(self.corrupt(format!(
                "expected {count} entries, found {}",
                checkpoint.len()
            )));
        }
        if lines.any(|line| !line.trim().is_empty()) {
            return Err(self.corrupt("unexpected trailing lines".to_string()));
        }
        Ok(checkpoint)
    }

    fn parse_field<T: std::str::FromStr>(&self, field: Option<&str>, name: &str) -> RlmmResult<T> {
        let raw = field.ok_or_else(|| self.corrupt(format!("missing {name}")))?;
        raw.trim()
            .parse()
            .map_err(|_| self.corrupt(format!("invalid {name} '{raw}'")))
    }

    fn corrupt(&self, message: String) -> RlmmError {
        RlmmError::Checkpoint {
            operation: "load",
            message: format!("{}: {message}", self.path.display()),
        }
    }

    fn render(checkpoint: &Checkpoint) -> String {
        let mut text = format!("{}\n{}\n", Self::VERSION, checkpoint.len());
        for (partition, offset) in checkpoint {
            let _ = writeln!(text, "{} {offset}", partition.get());
        }
        text
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> RlmmResult<Checkpoint> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => self.parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Checkpoint::new()),
            Err(e) => Err(RlmmError::Checkpoint {
                operation: "load",
                message: format!("failed to read '{}': {e}", self.path.display()),
            }),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> RlmmResult<()> {
        let io_error = |operation: &'static str, e: std::io::Error| RlmmError::Checkpoint {
            operation,
            message: format!("{}: {e}", self.path.display()),
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create_dir", e))?;
        }

        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_error("create", e))?;
        file.write_all(Self::render(checkpoint).as_bytes())
            .await
            .map_err(|e| io_error("write", e))?;
        if self.sync_on_write {
            file.sync_all().await.map_err(|e| io_error("sync", e))?;
        }
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error("rename", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(entries: &[(u32, u64)]) -> Checkpoint {
        entries
            .iter()
            .map(|(p, o)| (MetadataPartition::new(*p), *o))
            .collect()
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.load().await.unwrap().is_empty());

        store.save(&checkpoint(&[(0, 5)])).await.unwrap();
        assert_eq!(store.load().await.unwrap(), checkpoint(&[(0, 5)]));
        assert_eq!(store.save_count(), 1);

        store.fault_config().force_save_fail = true;
        assert!(store.save(&checkpoint(&[(0, 9)])).await.is_err());
        assert_eq!(store.saved(), checkpoint(&[(0, 5)]));

        // One-shot: the next save succeeds.
        store.save(&checkpoint(&[(0, 9)])).await.unwrap();
        assert_eq!(store.saved(), checkpoint(&[(0, 9)]));
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::for_testing(dir.path());
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let expected = checkpoint(&[(0, 41), (3, 7), (49, 0)]);

        FileCheckpointStore::for_testing(dir.path())
            .save(&expected)
            .await
            .unwrap();

        let store = FileCheckpointStore::for_testing(dir.path());
        assert_eq!(store.load().await.unwrap(), expected);

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.starts_with("0\n3\n0 41\n"));
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_from_config_uses_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = RlmmConfig::for_testing().with_log_dir(dir.path());
        let store = FileCheckpointStore::from_config(&config);
        assert_eq!(store.path(), dir.path().join(FileCheckpointStore::FILE_NAME));

        store.save(&checkpoint(&[(2, 8)])).await.unwrap();
        let reopened = FileCheckpointStore::new(dir.path());
        assert_eq!(reopened.load().await.unwrap(), checkpoint(&[(2, 8)]));
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::for_testing(dir.path());

        for text in ["", "1\n0\n", "0\n2\n0 1\n", "0\n1\n0 x\n", "0\n1\n0 1 2\n"] {
            std::fs::write(store.path(), text).unwrap();
            let err = store.load().await.unwrap_err();
            assert!(matches!(err, RlmmError::Checkpoint { .. }), "{text:?}: {err}");
        }
    }
}
