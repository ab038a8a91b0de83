//! Per-transaction index overlays
//!
//! A [`TransactionIndexChanges`] holds the pending mutations one transaction
//! made to one index. It is not a replay log: every `(key, record)` pair
//! carries a signed occurrence delta, and writes fold into it immediately.
//!
//! ```text
//! put(k, r); remove(k, r); put(k, r)   →   { k: { r: +1 } }
//! put(k, r); remove(k, r)              →   { }
//! ```
//!
//! Pairs whose delta folds back to zero are pruned, so an overlay that was
//! written to and then fully undone is empty.
//!
//! Keys must already be normalized under the index's collations; callers go
//! through [`PersistedIndex::normalize`](trellis_storage::PersistedIndex::normalize).

use std::collections::BTreeMap;
use std::ops::Bound;

use trellis_core::{IndexKey, RecordId};
use trellis_storage::{range_is_empty, KeyDeltas};

/// Pending mutations of one transaction against one index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionIndexChanges {
    index: String,
    changes: BTreeMap<IndexKey, KeyDeltas>,
}

impl TransactionIndexChanges {
    /// Empty overlay for an index
    pub fn new(index: impl Into<String>) -> Self {
        TransactionIndexChanges {
            index: index.into(),
            changes: BTreeMap::new(),
        }
    }

    /// Index this overlay belongs to
    pub fn index_name(&self) -> &str {
        &self.index
    }

    /// Record one added occurrence
    pub fn put(&mut self, key: IndexKey, id: RecordId) {
        self.apply(key, id, 1);
    }

    /// Record one removed occurrence
    pub fn remove(&mut self, key: IndexKey, id: RecordId) {
        self.apply(key, id, -1);
    }

    /// Fold a signed delta into the overlay
    pub fn apply(&mut self, key: IndexKey, id: RecordId, delta: i64) {
        if delta == 0 {
            return;
        }
        let deltas = self.changes.entry(key.clone()).or_default();
        let slot = deltas.entry(id).or_insert(0);
        *slot += delta;
        if *slot == 0 {
            deltas.remove(&id);
        }
        if deltas.is_empty() {
            self.changes.remove(&key);
        }
    }

    /// Net deltas under one key
    pub fn key_changes(&self, key: &IndexKey) -> Option<&KeyDeltas> {
        self.changes.get(key)
    }

    /// Every key with a non-zero net delta
    pub fn net_changes(&self) -> &BTreeMap<IndexKey, KeyDeltas> {
        &self.changes
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of `(key, record)` pairs with a pending delta
    pub fn len(&self) -> usize {
        self.changes.values().map(BTreeMap::len).sum()
    }

    /// Keys touched within bounds, in scan order
    pub fn keys_in_range(
        &self,
        lower: &Bound<IndexKey>,
        upper: &Bound<IndexKey>,
        ascending: bool,
    ) -> Vec<IndexKey> {
        if range_is_empty(lower, upper) {
            return Vec::new();
        }
        let range = self.changes.range((lower.clone(), upper.clone()));
        if ascending {
            range.map(|(k, _)| k.clone()).collect()
        } else {
            range.rev().map(|(k, _)| k.clone()).collect()
        }
    }

    /// Apply this key's deltas to persisted ids
    ///
    /// `persisted` may hold repeated ids. The result is ascending, holds each
    /// id as many times as its net count, and omits ids whose count dropped
    /// to zero or below.
    pub fn merge_ids(&self, key: &IndexKey, persisted: &[RecordId]) -> Vec<RecordId> {
        merge_ids(persisted, self.changes.get(key))
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.changes.clear();
    }
}

/// Apply optional deltas to persisted ids, producing ascending ids
pub fn merge_ids(persisted: &[RecordId], deltas: Option<&KeyDeltas>) -> Vec<RecordId> {
    let deltas = match deltas {
        Some(d) if !d.is_empty() => d,
        _ => {
            let mut ids = persisted.to_vec();
            ids.sort();
            return ids;
        }
    };
    let mut counts: BTreeMap<RecordId, i64> = BTreeMap::new();
    for id in persisted {
        *counts.entry(*id).or_insert(0) += 1;
    }
    for (id, delta) in deltas {
        *counts.entry(*id).or_insert(0) += delta;
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .flat_map(|(id, n)| std::iter::repeat(id).take(n as usize))
        .collect()
}
