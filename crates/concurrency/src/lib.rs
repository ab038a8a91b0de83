//! Concurrency layer for trellis
//!
//! This crate implements transactional index visibility with:
//! - TransactionIndexChanges: per-transaction, per-index folded overlays
//! - IndexMergeCursor: ordered reads merging persisted entries with an overlay
//! - TransactionContext: buffered record writes and observed versions
//! - Optimistic validation at commit time
//! - TransactionManager: all-or-nothing commit and constant-time rollback

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod changes;
pub mod cursor;
pub mod manager;
pub mod transaction;
pub mod validation;

pub use changes::{merge_ids, TransactionIndexChanges};
pub use cursor::{IndexMergeCursor, KeyRange};
pub use manager::{CommitTarget, TransactionManager};
pub use transaction::{
    CommitError, PendingOperations, PendingRecord, TransactionContext, TransactionStatus,
};
pub use validation::{validate_transaction, ConflictType, ValidationResult};
