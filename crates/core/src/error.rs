//! Error types for trellis
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Read-path errors (`IndexNotFound`, `IndexNotReady`, `RecordNotFound`) are
//! local to the caller. Write-path errors raised during commit abort the whole
//! transaction and leave persisted state untouched.

use crate::record_id::RecordId;
use std::io;
use thiserror::Error;

/// Result type alias for trellis operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the trellis database
#[derive(Debug, Error)]
pub enum Error {
    /// Unique index violation
    ///
    /// Raised at write time, or at commit when a concurrent transaction
    /// committed the same key first. Never silently overwritten.
    #[error("Duplicate key {key} in index '{index}': already mapped to {existing}, rejected {rejected}")]
    DuplicateKey {
        /// Index name
        index: String,
        /// Rendered key
        key: String,
        /// Record that already owns the key
        existing: RecordId,
        /// Record whose write was rejected
        rejected: RecordId,
    },

    /// Optimistic version check failed at commit
    #[error("Concurrent modification of {record}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        /// Record whose version moved
        record: RecordId,
        /// Version the transaction observed
        expected: u64,
        /// Version found at commit time
        actual: u64,
    },

    /// Structurally invalid definition or value
    #[error("Validation error: {0}")]
    Validation(String),

    /// Index does not exist
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// Record does not exist
    #[error("Record not found: {0}")]
    RecordNotFound(RecordId),

    /// Class does not exist
    #[error("Class not found: {0}")]
    ClassNotFound(String),

    /// Index is being rebuilt and must not serve queries
    #[error("Index '{0}' is rebuilding and cannot serve queries")]
    IndexNotReady(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Transaction aborted
    #[error("Transaction aborted: {reason}")]
    TransactionAborted {
        /// Human-readable reason
        reason: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Shorthand for a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Shorthand for an invalid operation
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Shorthand for a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Whether retrying the whole transaction may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrentModification { .. })
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
