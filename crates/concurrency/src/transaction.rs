//! Transaction context
//!
//! A [`TransactionContext`] buffers everything one transaction intends to
//! do until commit:
//!
//! - record versions it observed, for optimistic validation
//! - record saves and deletes, keyed by record id (the last write wins)
//! - one [`TransactionIndexChanges`] overlay per touched index, created on
//!   first write
//!
//! Nothing here touches persisted state. Rolling back only drops buffers,
//! so it is constant-time regardless of how much was staged.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::debug;

use trellis_core::{Error, RecordId, Result};
use trellis_storage::Document;

use crate::changes::TransactionIndexChanges;
use crate::validation::{ConflictType, ValidationResult};

/// Error type for commit failures
///
/// A commit either applies every record write and every index overlay or
/// none of them.
#[derive(Debug)]
pub enum CommitError {
    /// Aborted because an observed record version moved
    ValidationFailed(ValidationResult),

    /// Transaction was not in a state that can commit
    InvalidState(String),

    /// Staging or applying the writes failed (unique violation, missing
    /// index, page store failure); nothing was applied
    Apply(Error),
}

impl std::fmt::Display for CommitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitError::ValidationFailed(result) => {
                write!(f, "Commit failed: {} conflict(s)", result.conflict_count())
            }
            CommitError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            CommitError::Apply(e) => write!(f, "Commit failed: {}", e),
        }
    }
}

impl std::error::Error for CommitError {}

impl From<CommitError> for Error {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::ValidationFailed(result) => match result.first() {
                Some(ConflictType::VersionConflict {
                    record,
                    expected,
                    actual,
                }) => Error::ConcurrentModification {
                    record: *record,
                    expected: *expected,
                    actual: *actual,
                },
                None => Error::TransactionAborted {
                    reason: "validation failed".to_string(),
                },
            },
            CommitError::InvalidState(msg) => Error::InvalidOperation(msg),
            CommitError::Apply(e) => e,
        }
    }
}

/// Summary of what a commit would apply, or a rollback discard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOperations {
    /// Staged record saves
    pub saves: usize,
    /// Staged record deletes
    pub deletes: usize,
    /// Pending `(key, record)` index deltas across all overlays
    pub index_entries: usize,
}

impl PendingOperations {
    /// Total number of pending operations
    pub fn total(&self) -> usize {
        self.saves + self.deletes + self.index_entries
    }

    /// Check if there are no pending operations
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Status of a transaction in its lifecycle
///
/// State transitions:
/// - `Active` → `Validating` (begin commit)
/// - `Validating` → `Committed` (validation and apply succeeded)
/// - `Validating` → `Aborted` (conflict or apply failure)
/// - `Active` → `Aborted` (rollback)
///
/// `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Executing, can read and write
    Active,
    /// Being validated and applied
    Validating,
    /// Committed
    Committed,
    /// Aborted
    Aborted {
        /// Human-readable reason for abort
        reason: String,
    },
}

/// A buffered record write
#[derive(Debug, Clone, PartialEq)]
pub enum PendingRecord {
    /// Insert or replace with this content
    Save(Document),
    /// Remove the record
    Delete,
}

/// Buffered state of one transaction
#[derive(Debug)]
pub struct TransactionContext {
    /// Transaction id
    pub txn_id: u64,
    /// Lifecycle state
    pub status: TransactionStatus,
    read_versions: FxHashMap<RecordId, u64>,
    writes: BTreeMap<RecordId, PendingRecord>,
    index_changes: BTreeMap<String, TransactionIndexChanges>,
    start_time: Instant,
}

impl TransactionContext {
    /// New active transaction
    pub fn new(txn_id: u64) -> Self {
        TransactionContext {
            txn_id,
            status: TransactionStatus::Active,
            read_versions: FxHashMap::default(),
            writes: BTreeMap::new(),
            index_changes: BTreeMap::new(),
            start_time: Instant::now(),
        }
    }

    // === State ===

    /// Whether reads and writes are accepted
    pub fn is_active(&self) -> bool {
        matches!(self.status, TransactionStatus::Active)
    }

    /// Whether the transaction committed
    pub fn is_committed(&self) -> bool {
        matches!(self.status, TransactionStatus::Committed)
    }

    /// Whether the transaction aborted
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, TransactionStatus::Aborted { .. })
    }

    /// Whether rollback is still possible
    pub fn can_rollback(&self) -> bool {
        matches!(
            self.status,
            TransactionStatus::Active | TransactionStatus::Validating
        )
    }

    /// Time since begin
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Abort reason, if aborted
    pub fn abort_reason(&self) -> Option<&str> {
        match &self.status {
            TransactionStatus::Aborted { reason } => Some(reason),
            _ => None,
        }
    }

    /// Fail unless active
    ///
    /// # Errors
    /// `InvalidOperation` when the transaction is not `Active`.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::invalid_operation(format!(
                "Transaction {} is not active: {:?}",
                self.txn_id, self.status
            )))
        }
    }

    /// `Active` → `Validating`
    pub fn mark_validating(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.status = TransactionStatus::Validating;
        Ok(())
    }

    /// `Validating` → `Committed`
    pub fn mark_committed(&mut self) -> Result<()> {
        match &self.status {
            TransactionStatus::Validating => {
                self.status = TransactionStatus::Committed;
                self.writes.clear();
                self.index_changes.clear();
                Ok(())
            }
            _ => Err(Error::invalid_operation(format!(
                "Cannot commit transaction {} from state {:?}",
                self.txn_id, self.status
            ))),
        }
    }

    /// Abort and discard every buffer
    ///
    /// Allowed from `Active` and `Validating`.
    pub fn mark_aborted(&mut self, reason: String) -> Result<()> {
        match &self.status {
            TransactionStatus::Committed => Err(Error::invalid_operation(format!(
                "Cannot abort committed transaction {}",
                self.txn_id
            ))),
            TransactionStatus::Aborted { .. } => Err(Error::invalid_operation(format!(
                "Transaction {} already aborted",
                self.txn_id
            ))),
            _ => {
                self.status = TransactionStatus::Aborted { reason };
                self.writes.clear();
                self.index_changes.clear();
                Ok(())
            }
        }
    }

    /// Discard everything staged
    pub fn rollback(&mut self) -> Result<()> {
        let pending = self.pending_operations();
        self.mark_aborted("rolled back".to_string())?;
        debug!(txn_id = self.txn_id, discarded = pending.total(), "Transaction rolled back");
        Ok(())
    }

    // === Records ===

    /// Remember the version a record had when first observed
    ///
    /// Later observations of the same record keep the first version.
    pub fn record_read(&mut self, id: RecordId, version: u64) {
        self.read_versions.entry(id).or_insert(version);
    }

    /// Observed versions
    pub fn read_versions(&self) -> impl Iterator<Item = (&RecordId, &u64)> {
        self.read_versions.iter()
    }

    /// Version observed for one record
    pub fn observed_version(&self, id: RecordId) -> Option<u64> {
        self.read_versions.get(&id).copied()
    }

    /// Buffer a save; the document must already have an identity
    pub fn stage_save(&mut self, document: Document) -> Result<()> {
        self.ensure_active()?;
        let id = document.identity().ok_or_else(|| {
            Error::invalid_operation("cannot stage a document without an identity")
        })?;
        self.writes.insert(id, PendingRecord::Save(document));
        Ok(())
    }

    /// Buffer a delete
    pub fn stage_delete(&mut self, id: RecordId) -> Result<()> {
        self.ensure_active()?;
        self.writes.insert(id, PendingRecord::Delete);
        Ok(())
    }

    /// Buffered write for one record
    pub fn pending_record(&self, id: RecordId) -> Option<&PendingRecord> {
        self.writes.get(&id)
    }

    /// All buffered writes
    pub fn writes(&self) -> &BTreeMap<RecordId, PendingRecord> {
        &self.writes
    }

    /// Number of records with a buffered write
    pub fn staged_records(&self) -> usize {
        self.writes.len()
    }

    // === Index overlays ===

    /// Overlay for an index, if this transaction wrote to it
    pub fn index_changes(&self, index: &str) -> Option<&TransactionIndexChanges> {
        self.index_changes.get(index)
    }

    /// Overlay for an index, created on first use
    pub fn index_changes_mut(&mut self, index: &str) -> &mut TransactionIndexChanges {
        self.index_changes
            .entry(index.to_string())
            .or_insert_with(|| TransactionIndexChanges::new(index))
    }

    /// Every overlay
    pub fn all_index_changes(&self) -> &BTreeMap<String, TransactionIndexChanges> {
        &self.index_changes
    }

    /// Forget the overlay of a dropped index
    pub fn discard_index_changes(&mut self, index: &str) {
        self.index_changes.remove(index);
    }

    // === Summary ===

    /// Counts of buffered operations
    pub fn pending_operations(&self) -> PendingOperations {
        let deletes = self
            .writes
            .values()
            .filter(|w| matches!(w, PendingRecord::Delete))
            .count();
        PendingOperations {
            saves: self.writes.len() - deletes,
            deletes,
            index_entries: self.index_changes.values().map(TransactionIndexChanges::len).sum(),
        }
    }

    /// Whether nothing would be written
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }
}
