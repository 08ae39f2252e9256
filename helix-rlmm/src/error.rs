//! Error types for remote log metadata synchronization.
//!
//! `RlmmError` is what callers see. `ClientError` comes from the log client and
//! is classified as transient (re-polled) or fatal (terminates the consumer).
//! `HandlerError` never reaches a caller: the consumer logs it and moves on.

use thiserror::Error;

use crate::config::ConfigError;
use crate::types::{MetadataPartition, TopicIdPartition};

/// Result type for metadata synchronization operations.
pub type RlmmResult<T> = Result<T, RlmmError>;

/// Result type for log client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the synchronization manager and the metadata manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RlmmError {
    /// The metadata partition is not assigned to this instance.
    #[error("metadata partition {partition} is not assigned to this consumer")]
    NotAssigned {
        /// The partition the caller asked about.
        partition: MetadataPartition,
    },

    /// The user partition is not owned by this instance as primary.
    #[error("user partition {topic_partition} is not assigned to this instance as primary")]
    UserPartitionNotAssigned {
        /// The user partition.
        topic_partition: TopicIdPartition,
    },

    /// The user partition's metadata is still being loaded after it became
    /// primary.
    #[error("metadata of user partition {topic_partition} is still loading")]
    PartitionNotReady {
        /// The user partition.
        topic_partition: TopicIdPartition,
    },

    /// Consumption did not reach the target offset in time.
    #[error(
        "timed out after {waited_ms}ms catching up on {partition}: consumed {}, target {target}",
        .last_seen.map_or_else(|| "none".to_string(), |o| o.to_string())
    )]
    CatchUpTimeout {
        /// The partition being waited on.
        partition: MetadataPartition,
        /// Last consumed offset observed before giving up.
        last_seen: Option<u64>,
        /// The offset the caller waited for.
        target: u64,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The background consumer exited with a fatal error.
    #[error("consumer task terminated: {reason}")]
    ConsumerTerminated {
        /// The failure that stopped the consumer.
        reason: String,
    },

    /// The manager has been closed.
    #[error("metadata synchronization manager is closed")]
    Closed,

    /// `start` was called more than once.
    #[error("consumer task already started")]
    AlreadyStarted,

    /// The operation is not valid for the current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// What was wrong.
        message: String,
    },

    /// The log client failed.
    #[error("log client error: {0}")]
    Client(#[from] ClientError),

    /// Loading or saving the checkpoint failed.
    #[error("checkpoint error: {operation}: {message}")]
    Checkpoint {
        /// The operation that failed.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// A metadata event could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Error message.
        message: String,
    },

    /// Stopping the consumer task failed.
    #[error("shutdown error: {message}")]
    Shutdown {
        /// Error message.
        message: String,
    },

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Errors reported by the external log client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Retryable failure such as a network timeout.
    #[error("transient: {operation}: {message}")]
    Transient {
        /// The client operation.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// Unrecoverable failure such as an authorization error.
    #[error("fatal: {operation}: {message}")]
    Fatal {
        /// The client operation.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// The client has already been closed.
    #[error("client closed")]
    Closed,
}

impl ClientError {
    /// Returns true if the consumer must stop on this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::Closed)
    }
}

/// Failure of a single metadata event's side effect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The segment state change is not allowed.
    #[error("invalid state transition for {segment}: {from} -> {to}")]
    InvalidTransition {
        /// The segment or partition the event refers to.
        segment: String,
        /// Current state.
        from: &'static str,
        /// Requested state.
        to: &'static str,
    },

    /// The event refers to a segment that is not known.
    #[error("unknown segment {segment}")]
    UnknownSegment {
        /// The segment the event refers to.
        segment: String,
    },

    /// Any other handler failure.
    #[error("{message}")]
    Other {
        /// Error message.
        message: String,
    },
}
