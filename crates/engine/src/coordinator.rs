//! Transaction coordinator for managing transaction lifecycle
//!
//! The TransactionCoordinator wraps TransactionManager and adds:
//! - Active transaction tracking
//! - Transaction metrics (started, committed, aborted)
//! - Commit rate calculation
//! - Conversion of `CommitError` into the crate-wide `Error`

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{MutexGuard, RwLockReadGuard};
use tracing::{debug, warn};

use trellis_concurrency::{CommitTarget, TransactionContext, TransactionManager};
use trellis_core::{Error, Result};

/// Transaction coordinator for the database
///
/// # Memory Ordering
///
/// The metric counters use Relaxed ordering. They are observational only and
/// synchronize nothing else; the commit protocol itself is ordered by the
/// manager's locks.
pub struct TransactionCoordinator {
    manager: TransactionManager,
    active_count: AtomicU64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
}

impl TransactionCoordinator {
    /// Create new coordinator with initial version
    pub fn new(initial_version: u64) -> Self {
        Self {
            manager: TransactionManager::new(initial_version),
            active_count: AtomicU64::new(0),
            total_started: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
        }
    }

    /// Start a new transaction
    pub fn start_transaction(&self) -> TransactionContext {
        self.record_start();
        self.manager.begin()
    }

    /// Commit a transaction through the concurrency layer
    ///
    /// # Returns
    /// * `Ok(commit_version)` - Transaction committed successfully
    /// * `Err(Error)` - Version conflict, unique violation or invalid state;
    ///   nothing was applied
    pub fn commit(&self, txn: &mut TransactionContext, target: &CommitTarget<'_>) -> Result<u64> {
        match self.manager.commit(txn, target) {
            Ok(version) => {
                self.record_commit();
                Ok(version)
            }
            Err(e) => {
                self.record_abort();
                warn!(txn_id = txn.txn_id, error = %e, "Transaction aborted");
                Err(Error::from(e))
            }
        }
    }

    /// Discard a transaction's buffered work
    ///
    /// Never touches persisted state. Rolling back a finished transaction is
    /// an `InvalidOperation`.
    pub fn rollback(&self, txn: &mut TransactionContext) -> Result<()> {
        txn.rollback()?;
        self.record_abort();
        debug!(txn_id = txn.txn_id, "Transaction rolled back");
        Ok(())
    }

    /// Abort a transaction that can no longer commit
    pub fn abort(&self, txn: &mut TransactionContext, reason: String) -> Result<()> {
        self.manager.abort(txn, reason)?;
        self.record_abort();
        Ok(())
    }

    /// Record transaction start
    pub fn record_start(&self) {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record transaction commit
    ///
    /// Decrements active count (saturating at 0) and increments committed count.
    pub fn record_commit(&self) {
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record transaction abort or rollback
    pub fn record_abort(&self) {
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current global version
    pub fn current_version(&self) -> u64 {
        self.manager.current_version()
    }

    /// Shared guard held by readers of committed state
    pub fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.manager.read_guard()
    }

    /// Exclusive guard serializing committers and index maintenance
    pub fn commit_guard(&self) -> MutexGuard<'_, ()> {
        self.manager.commit_guard()
    }

    /// Get transaction metrics
    pub fn metrics(&self) -> TransactionMetrics {
        let started = self.total_started.load(Ordering::Relaxed);
        let committed = self.total_committed.load(Ordering::Relaxed);

        TransactionMetrics {
            active_count: self.active_count.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_aborted: self.total_aborted.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }

    /// Get current active transaction count
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Transaction metrics snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionMetrics {
    /// Transactions begun and not yet finished
    pub active_count: u64,
    /// Total transactions started
    pub total_started: u64,
    /// Total transactions committed
    pub total_committed: u64,
    /// Total transactions aborted or rolled back
    pub total_aborted: u64,
    /// Committed / started
    pub commit_rate: f64,
}
