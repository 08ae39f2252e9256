//! Configuration for metadata synchronization.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::limits;

/// Configuration for the consumer task and catch-up waits.
#[derive(Debug, Clone)]
pub struct RlmmConfig {
    /// Upper bound on how long a writer waits for its record to be consumed.
    pub consume_wait: Duration,
    /// Interval at which a waiter re-checks consumed progress.
    pub recheck_interval: Duration,
    /// Upper bound on a single consumer poll.
    pub poll_timeout: Duration,
    /// Minimum interval between two subscription re-evaluations.
    pub subscription_interval: Duration,
    /// Interval between checkpoint writes.
    pub checkpoint_interval: Duration,
    /// Number of partitions of the internal metadata topic.
    pub metadata_partitions: u32,
    /// Directory holding the committed offsets file.
    pub log_dir: PathBuf,
}

impl Default for RlmmConfig {
    fn default() -> Self {
        Self {
            consume_wait: Duration::from_secs(10),
            recheck_interval: Duration::from_millis(limits::CONSUME_RECHECK_INTERVAL_MS),
            poll_timeout: Duration::from_millis(100),
            subscription_interval: Duration::from_secs(1),
            checkpoint_interval: Duration::from_secs(30),
            metadata_partitions: limits::METADATA_PARTITIONS_DEFAULT,
            log_dir: PathBuf::from("data"),
        }
    }
}

impl RlmmConfig {
    /// Creates config suitable for testing (short intervals).
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            consume_wait: Duration::from_secs(5),
            recheck_interval: Duration::from_millis(5),
            poll_timeout: Duration::from_millis(10),
            subscription_interval: Duration::from_millis(10),
            checkpoint_interval: Duration::from_millis(50),
            metadata_partitions: 8,
            log_dir: std::env::temp_dir(),
        }
    }

    /// Sets the catch-up wait bound.
    #[must_use]
    pub const fn with_consume_wait(mut self, wait: Duration) -> Self {
        self.consume_wait = wait;
        self
    }

    /// Sets the waiter recheck interval.
    #[must_use]
    pub const fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    /// Sets the consumer poll timeout.
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the subscription re-evaluation interval.
    #[must_use]
    pub const fn with_subscription_interval(mut self, interval: Duration) -> Self {
        self.subscription_interval = interval;
        self
    }

    /// Sets the checkpoint interval.
    #[must_use]
    pub const fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Sets the metadata topic partition count.
    #[must_use]
    pub const fn with_metadata_partitions(mut self, count: u32) -> Self {
        self.metadata_partitions = count;
        self
    }

    /// Sets the log directory.
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if an interval is zero, the recheck interval exceeds
    /// the wait bound, or the partition count is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("consume_wait", self.consume_wait),
            ("recheck_interval", self.recheck_interval),
            ("poll_timeout", self.poll_timeout),
            ("subscription_interval", self.subscription_interval),
            ("checkpoint_interval", self.checkpoint_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::ZeroInterval { name });
            }
        }

        if self.recheck_interval > self.consume_wait {
            return Err(ConfigError::InvalidTiming {
                message: "recheck_interval must be <= consume_wait".to_string(),
            });
        }

        if self.metadata_partitions == 0
            || self.metadata_partitions > limits::METADATA_PARTITIONS_MAX
        {
            return Err(ConfigError::PartitionCount {
                count: self.metadata_partitions,
                max: limits::METADATA_PARTITIONS_MAX,
            });
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration that must be positive is zero.
    #[error("{name} must be non-zero")]
    ZeroInterval {
        /// Name of the setting.
        name: &'static str,
    },

    /// Timing settings are inconsistent.
    #[error("invalid timing: {message}")]
    InvalidTiming {
        /// Description of the problem.
        message: String,
    },

    /// Metadata partition count is out of range.
    #[error("metadata partition count {count} must be in 1..={max}")]
    PartitionCount {
        /// Configured count.
        count: u32,
        /// Maximum allowed.
        max: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RlmmConfig::default().validate().is_ok());
        assert!(RlmmConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = RlmmConfig::for_testing().with_poll_timeout(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval {
                name: "poll_timeout"
            })
        );
    }

    #[test]
    fn test_recheck_longer_than_wait_rejected() {
        let config = RlmmConfig::for_testing()
            .with_consume_wait(Duration::from_millis(10))
            .with_recheck_interval(Duration::from_millis(20));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTiming { .. })
        ));
    }

    #[test]
    fn test_partition_count_bounds() {
        let config = RlmmConfig::for_testing().with_metadata_partitions(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PartitionCount { count: 0, .. })
        ));
    }
}
