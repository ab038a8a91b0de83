//! Merged index reads
//!
//! [`IndexMergeCursor`] answers point and range queries from a
//! [`PersistedIndex`] combined with the caller's own
//! [`TransactionIndexChanges`], if it has one. Callers without an overlay,
//! or reading on behalf of another session, see committed state only.
//!
//! Output is one ordered stream of `(key, record id)` pairs:
//!
//! - keys in scan order (ascending or descending)
//! - within a key, ids in the same direction
//! - an id removed in the overlay is hidden even though it is still
//!   persisted, and an id removed then re-added appears once
//!
//! A limit stops the scan as soon as enough pairs were produced.

use std::ops::{Bound, ControlFlow};

use trellis_core::{IndexKey, RecordId, Result};
use trellis_storage::{range_is_empty, PersistedIndex};

use crate::changes::{merge_ids, TransactionIndexChanges};

/// Possibly partial, possibly open key range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Lower key, `None` for open
    pub from: Option<IndexKey>,
    /// Upper key, `None` for open
    pub to: Option<IndexKey>,
    /// Whether `from` itself is included
    pub from_inclusive: bool,
    /// Whether `to` itself is included
    pub to_inclusive: bool,
}

impl KeyRange {
    /// Every key
    pub fn all() -> Self {
        KeyRange {
            from: None,
            to: None,
            from_inclusive: true,
            to_inclusive: true,
        }
    }

    /// Keys between two bounds
    pub fn between(from: IndexKey, to: IndexKey, from_inclusive: bool, to_inclusive: bool) -> Self {
        KeyRange {
            from: Some(from),
            to: Some(to),
            from_inclusive,
            to_inclusive,
        }
    }

    /// Keys starting with `prefix`
    pub fn prefix(prefix: IndexKey) -> Self {
        Self::between(prefix.clone(), prefix, true, true)
    }

    /// `key >= from`
    pub fn at_least(from: IndexKey) -> Self {
        KeyRange {
            from: Some(from),
            ..Self::all()
        }
    }

    /// `key > from`
    pub fn greater_than(from: IndexKey) -> Self {
        KeyRange {
            from: Some(from),
            from_inclusive: false,
            ..Self::all()
        }
    }

    /// `key <= to`
    pub fn at_most(to: IndexKey) -> Self {
        KeyRange {
            to: Some(to),
            ..Self::all()
        }
    }

    /// `key < to`
    pub fn less_than(to: IndexKey) -> Self {
        KeyRange {
            to: Some(to),
            to_inclusive: false,
            ..Self::all()
        }
    }
}

/// Ordered reader over a persisted index and an optional overlay
pub struct IndexMergeCursor<'a> {
    index: &'a PersistedIndex,
    overlay: Option<&'a TransactionIndexChanges>,
    limit: Option<usize>,
}

impl<'a> IndexMergeCursor<'a> {
    /// Cursor over `index`, merging `overlay` when present
    pub fn new(index: &'a PersistedIndex, overlay: Option<&'a TransactionIndexChanges>) -> Self {
        IndexMergeCursor {
            index,
            overlay,
            limit: None,
        }
    }

    /// Cursor over committed state only
    pub fn committed(index: &'a PersistedIndex) -> Self {
        Self::new(index, None)
    }

    /// Stop after `limit` pairs
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn full(&self, produced: usize) -> bool {
        matches!(self.limit, Some(limit) if produced >= limit)
    }

    fn visible(&self, key: &IndexKey) -> bool {
        !(key.has_null() && self.index.definition().ignore_null_values())
    }

    fn emit(
        &self,
        key: &IndexKey,
        persisted: &[RecordId],
        ascending: bool,
        out: &mut Vec<(IndexKey, RecordId)>,
    ) -> ControlFlow<()> {
        let mut ids = merge_ids(persisted, self.overlay.and_then(|o| o.key_changes(key)));
        if !ascending {
            ids.reverse();
        }
        for id in ids {
            if self.full(out.len()) {
                return ControlFlow::Break(());
            }
            out.push((key.clone(), id));
        }
        if self.full(out.len()) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Merged ids under one exact key, ascending
    pub fn get(&self, key: &IndexKey) -> Result<Vec<RecordId>> {
        let normalized = self.index.normalize(key);
        let persisted = self.index.get(&normalized)?;
        if !self.visible(&normalized) {
            return Ok(persisted);
        }
        Ok(merge_ids(
            &persisted,
            self.overlay.and_then(|o| o.key_changes(&normalized)),
        ))
    }

    /// Pairs for a list of exact keys (an IN-list), in key order
    pub fn point_lookup(&self, keys: &[IndexKey], ascending: bool) -> Result<Vec<(IndexKey, RecordId)>> {
        let mut normalized: Vec<IndexKey> = keys.iter().map(|k| self.index.normalize(k)).collect();
        normalized.sort();
        normalized.dedup();
        if !ascending {
            normalized.reverse();
        }
        let mut out = Vec::new();
        for key in normalized {
            let persisted = self.index.get(&key)?;
            let persisted = if self.visible(&key) {
                persisted
            } else {
                // Excluded keys never take overlay entries
                Vec::new()
            };
            if self.emit(&key, &persisted, ascending, &mut out).is_break() {
                break;
            }
        }
        Ok(out)
    }

    /// Pairs within a range
    pub fn range(&self, range: &KeyRange, ascending: bool) -> Result<Vec<(IndexKey, RecordId)>> {
        let (lower, upper) = self.index.key_bounds(
            range.from.as_ref(),
            range.to.as_ref(),
            range.from_inclusive,
            range.to_inclusive,
        );
        self.scan_bounds(lower, upper, ascending)
    }

    /// Every pair
    pub fn all(&self, ascending: bool) -> Result<Vec<(IndexKey, RecordId)>> {
        self.range(&KeyRange::all(), ascending)
    }

    fn scan_bounds(
        &self,
        lower: Bound<IndexKey>,
        upper: Bound<IndexKey>,
        ascending: bool,
    ) -> Result<Vec<(IndexKey, RecordId)>> {
        let mut out = Vec::new();
        if range_is_empty(&lower, &upper) || self.limit == Some(0) {
            // Still report a rebuilding index
            self.index.ensure_online()?;
            return Ok(out);
        }
        let overlay_keys: Vec<IndexKey> = match self.overlay {
            Some(o) => o
                .keys_in_range(&lower, &upper, ascending)
                .into_iter()
                .filter(|k| self.visible(k))
                .collect(),
            None => Vec::new(),
        };
        let mut pending = overlay_keys.into_iter().peekable();
        let mut stopped = false;

        self.index.scan(lower, upper, ascending, |key, persisted| {
            let comes_first = |k: &IndexKey| if ascending { k < key } else { k > key };
            while let Some(overlay_only) = pending.next_if(|k| comes_first(k)) {
                if self.emit(&overlay_only, &[], ascending, &mut out).is_break() {
                    stopped = true;
                    return ControlFlow::Break(());
                }
            }
            pending.next_if(|k| k == key);
            if self.emit(key, &persisted, ascending, &mut out).is_break() {
                stopped = true;
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        })?;

        if !stopped {
            for overlay_only in pending {
                if self.emit(&overlay_only, &[], ascending, &mut out).is_break() {
                    break;
                }
            }
        }
        Ok(out)
    }
}
