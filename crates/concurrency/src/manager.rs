//! Transaction manager for coordinating commit operations
//!
//! Provides atomic commit by orchestrating validation, staging and
//! installation of record writes and index overlays.
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. mark_validating()        - Active → Validating
//! 2. commit lock              - one committer at a time
//! 3. validate_transaction()   - observed record versions unchanged
//! 4. IF conflicts: abort and return ValidationFailed
//! 5. stage records            - link collections flushed into StagedPages,
//!                               orphaned trees deleted, versions bumped
//! 6. prepare indexes          - overlays folded against persisted buckets,
//!                               unique checks, bucket pages staged
//! 7. IF any error: abort, nothing was written
//! 8. visibility write lock    - readers excluded
//! 9. apply pages, records, install index buckets
//! 10. allocate commit version, mark_committed()
//! ```
//!
//! Steps 5 and 6 only stage; all visible mutation happens in step 9 while
//! readers are held off, so a reader sees either none of a commit or all of
//! it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use trellis_core::{Error, PageStore, RecordId, Result};
use trellis_storage::{
    CollectionOwner, ConversionThresholds, PersistedIndex, PreparedIndexChanges, RecordStore,
    RecordWrite, StagedPages, StoredRecord,
};

use crate::transaction::{CommitError, PendingRecord, TransactionContext};
use crate::validation::validate_transaction;

/// Everything a commit writes into
pub struct CommitTarget<'a> {
    /// Committed records
    pub records: &'a RecordStore,
    /// Page store holding link trees
    pub pages: &'a dyn PageStore,
    /// Persisted indexes by name
    pub indexes: &'a BTreeMap<String, Arc<PersistedIndex>>,
    /// Conversion thresholds in effect at flush time
    pub thresholds: ConversionThresholds,
}

/// Manages transaction lifecycle and atomic commits
pub struct TransactionManager {
    /// Global version counter, incremented once per committed transaction
    version: AtomicU64,
    /// Next transaction id
    next_txn_id: AtomicU64,
    /// Serializes committers and schema changes
    commit_lock: Mutex<()>,
    /// Readers hold it shared; the apply step holds it exclusively
    visibility: RwLock<()>,
}

impl TransactionManager {
    /// Create a manager starting at `initial_version`
    pub fn new(initial_version: u64) -> Self {
        TransactionManager {
            version: AtomicU64::new(initial_version),
            next_txn_id: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
            visibility: RwLock::new(()),
        }
    }

    /// Current global version
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Allocate next transaction ID
    pub fn next_txn_id(&self) -> u64 {
        self.next_txn_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate next commit version
    pub fn allocate_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Start a transaction
    pub fn begin(&self) -> TransactionContext {
        let txn = TransactionContext::new(self.next_txn_id());
        debug!(txn_id = txn.txn_id, "Transaction started");
        txn
    }

    /// Shared guard for readers; excludes only the apply step of a commit
    pub fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.visibility.read()
    }

    /// Exclusive guard for committers and schema changes
    pub fn commit_guard(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Exclusive visibility guard, excluding every reader
    pub fn write_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.visibility.write()
    }

    /// Commit a transaction atomically
    ///
    /// # Returns
    /// - `Ok(commit_version)` on success
    /// - `Err(CommitError)` if the transaction was not active, a version
    ///   check failed, or staging failed; in every error case nothing was
    ///   applied and the transaction is aborted
    pub fn commit(
        &self,
        txn: &mut TransactionContext,
        target: &CommitTarget<'_>,
    ) -> std::result::Result<u64, CommitError> {
        if let Err(e) = txn.mark_validating() {
            return Err(CommitError::InvalidState(e.to_string()));
        }
        let pending = txn.pending_operations();

        let _commit = self.commit_guard();

        let validation = validate_transaction(txn, target.records);
        if !validation.is_valid() {
            warn!(txn_id = txn.txn_id, conflicts = validation.conflict_count(), "Commit aborted by version conflict");
            Self::abort_quietly(txn, format!("{} conflict(s)", validation.conflict_count()));
            return Err(CommitError::ValidationFailed(validation));
        }

        let mut staged = StagedPages::new(target.pages);
        let staged_work = Self::stage_records(txn, target, &mut staged).and_then(|writes| {
            let prepared = Self::prepare_indexes(txn, target, &mut staged)?;
            Ok((writes, prepared))
        });
        let (writes, prepared) = match staged_work {
            Ok(work) => work,
            Err(e) => {
                warn!(txn_id = txn.txn_id, error = %e, "Commit aborted while staging");
                Self::abort_quietly(txn, e.to_string());
                return Err(CommitError::Apply(e));
            }
        };

        {
            let _visible = self.write_guard();
            if let Err(e) = staged.commit() {
                Self::abort_quietly(txn, e.to_string());
                return Err(CommitError::Apply(e));
            }
            target.records.apply_batch(writes);
            for (index, changes) in prepared {
                index.install(changes);
            }
        }

        let commit_version = self.allocate_version();
        if let Err(e) = txn.mark_committed() {
            return Err(CommitError::InvalidState(e.to_string()));
        }
        info!(
            txn_id = txn.txn_id,
            commit_version,
            saves = pending.saves,
            deletes = pending.deletes,
            index_entries = pending.index_entries,
            "Transaction committed"
        );
        Ok(commit_version)
    }

    /// Explicitly abort a transaction
    pub fn abort(&self, txn: &mut TransactionContext, reason: String) -> Result<()> {
        txn.mark_aborted(reason)
    }

    fn abort_quietly(txn: &mut TransactionContext, reason: String) {
        if txn.can_rollback() {
            // Only fails on terminal states, excluded above
            let _ = txn.mark_aborted(reason);
        }
    }

    /// Flush link collections and build the record batch
    fn stage_records(
        txn: &TransactionContext,
        target: &CommitTarget<'_>,
        staged: &mut StagedPages<'_>,
    ) -> Result<Vec<RecordWrite>> {
        let mut writes = Vec::with_capacity(txn.staged_records());
        for (id, pending) in txn.writes() {
            let previous = target.records.get(*id);
            let next_version = previous.as_ref().map(|r| r.version).unwrap_or(0) + 1;
            match pending {
                PendingRecord::Delete => {
                    if let Some(previous) = &previous {
                        for (_, bag) in previous.document.link_bags() {
                            bag.delete_storage(staged)?;
                        }
                    }
                    writes.push(RecordWrite::Delete(*id));
                }
                PendingRecord::Save(document) => {
                    let mut document = document.clone();
                    // Copies of another owner's tree must be read before any
                    // tree in this batch is deleted
                    for (field, bag) in document.link_bags_mut() {
                        bag.detach_from_foreign(&CollectionOwner::record(*id, field), &*staged)?;
                    }
                    if let Some(previous) = &previous {
                        Self::delete_orphaned_trees(*id, previous, &document, staged)?;
                    }
                    for (field, bag) in document.link_bags_mut() {
                        bag.set_thresholds(target.thresholds);
                        bag.flush(&CollectionOwner::record(*id, field), staged)?;
                    }
                    document.assign(*id, next_version);
                    writes.push(RecordWrite::Put(
                        *id,
                        StoredRecord {
                            version: next_version,
                            document,
                        },
                    ));
                }
            }
        }
        Ok(writes)
    }

    /// Delete trees of the previous version no longer referenced by the new one
    fn delete_orphaned_trees(
        id: RecordId,
        previous: &StoredRecord,
        next: &trellis_storage::Document,
        staged: &mut StagedPages<'_>,
    ) -> Result<()> {
        let kept: BTreeSet<Vec<u8>> = next
            .link_bags()
            .filter_map(|(_, bag)| bag.tree_prefix().map(<[u8]>::to_vec))
            .collect();
        for (field, bag) in previous.document.link_bags() {
            if let Some(prefix) = bag.tree_prefix() {
                if !kept.contains(prefix) {
                    debug!(record = %id, field, "Deleting replaced link tree");
                    bag.delete_storage(staged)?;
                }
            }
        }
        Ok(())
    }

    fn prepare_indexes(
        txn: &TransactionContext,
        target: &CommitTarget<'_>,
        staged: &mut StagedPages<'_>,
    ) -> Result<Vec<(Arc<PersistedIndex>, PreparedIndexChanges)>> {
        let mut prepared = Vec::new();
        for (name, overlay) in txn.all_index_changes() {
            if overlay.is_empty() {
                continue;
            }
            let index = target
                .indexes
                .get(name)
                .ok_or_else(|| Error::IndexNotFound(name.clone()))?;
            let changes = index.prepare(overlay.net_changes(), staged)?;
            prepared.push((Arc::clone(index), changes));
        }
        Ok(prepared)
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(0)
    }
}
