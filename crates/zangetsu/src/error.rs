//! Error and Result types for Zangetsu operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for Zangetsu operations.
pub type Result<T> = std::result::Result<T, ZangetsuError>;

/// The error type for storage and replication operations.
#[derive(Debug, Error)]
pub enum ZangetsuError {
    /// The offset does not point at a record reachable within the written data.
    #[error("Invalid offset {offset}: written size is {written_size}")]
    InvalidOffset {
        /// Requested offset.
        offset: u64,
        /// Written size of the partition at the time of the read.
        written_size: u64,
    },

    /// Header/footer magic, size, or checksum mismatch.
    #[error("Corrupted record: {0}")]
    CorruptedRecord(String),

    /// Payload is at or above the maximum record size.
    #[error("Data too large: {size} bytes, maximum is {max}")]
    TooLarge {
        /// Payload size in bytes.
        size: u64,
        /// Exclusive upper bound on the payload size.
        max: u64,
    },

    /// Group name is empty, hidden, or contains disallowed characters.
    #[error("Invalid group name: {0:?}")]
    InvalidGroupName(String),

    /// Malformed command field or argument.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The group or the day partition does not exist.
    #[error("Time entry not found: {group}/{day}")]
    NotFound {
        /// Group name.
        group: String,
        /// Day timestamp.
        day: u64,
    },

    /// The time entry is closing or closed and accepts no new operations.
    #[error("Time entry is closed")]
    Closed,

    /// A mutation was attempted while the database was reloading its index.
    #[error("Database is reloading")]
    ReloadInProgress,

    /// The remote side replied with an error or an unexpected message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote side did not reply in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Internal accounting no longer holds. Indicates a bug.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
