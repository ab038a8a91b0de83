//! Commit-time validation
//!
//! Optimistic concurrency over records:
//! - every record a transaction read, updated or deleted carries the version
//!   it observed
//! - at commit the observed version must still be the committed version
//! - a new record (observed version 0) conflicts only if something else
//!   created it meanwhile, which eager id allocation rules out
//!
//! Index overlays are never validated on their own. They are derived from
//! record writes, so a record conflict aborts the overlays with it.

use trellis_core::RecordId;
use trellis_storage::RecordStore;

use crate::transaction::TransactionContext;

/// Kinds of conflicts found while validating a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictType {
    /// A record's committed version moved since the transaction observed it
    VersionConflict {
        /// Record in conflict
        record: RecordId,
        /// Version observed by the transaction
        expected: u64,
        /// Committed version at validation time
        actual: u64,
    },
}

/// Outcome of validation
///
/// Accumulates every conflict; a transaction commits only if
/// [`ValidationResult::is_valid`] holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    /// All conflicts detected
    pub conflicts: Vec<ConflictType>,
}

impl ValidationResult {
    /// No conflicts
    pub fn ok() -> Self {
        ValidationResult {
            conflicts: Vec::new(),
        }
    }

    /// A single conflict
    pub fn conflict(conflict: ConflictType) -> Self {
        ValidationResult {
            conflicts: vec![conflict],
        }
    }

    /// Whether validation passed
    pub fn is_valid(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Fold another result into this one
    pub fn merge(&mut self, other: ValidationResult) {
        self.conflicts.extend(other.conflicts);
    }

    /// Number of conflicts
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    /// First conflict, if any
    pub fn first(&self) -> Option<&ConflictType> {
        self.conflicts.first()
    }
}

/// Check every observed record version against committed state
pub fn validate_transaction(txn: &TransactionContext, records: &RecordStore) -> ValidationResult {
    let mut result = ValidationResult::ok();
    for (record, expected) in txn.read_versions() {
        let actual = records.version(*record);
        if actual != *expected {
            result.conflicts.push(ConflictType::VersionConflict {
                record: *record,
                expected: *expected,
                actual,
            });
        }
    }
    result
}
