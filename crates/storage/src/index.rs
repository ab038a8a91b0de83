//! Persisted secondary indexes
//!
//! A [`PersistedIndex`] is the durable sorted `key → record id(s)` structure
//! of one index definition:
//!
//! - unique indexes map each key to a single [`RecordId`]
//! - non-unique indexes map each key to an [`AdaptiveLinkCollection`] bucket
//!   whose tree pages live under the index's page prefix
//!
//! Keys are normalized under the definition's collations on every entry
//! point, so lookup keys and stored keys always agree.
//!
//! # Mutation
//!
//! Transactional mutation is two-phase. [`PersistedIndex::prepare`] folds a
//! set of per-key deltas against the current entries, checks uniqueness and
//! stages bucket pages into a [`StagedPages`]; nothing visible changes and a
//! failure leaves no trace. [`PersistedIndex::install`] then swaps the new
//! buckets in and cannot fail. The caller applies the staged pages between
//! the two steps, with readers excluded, so a commit is all-or-nothing.
//!
//! `put` and `remove` run both phases under the index write lock for
//! non-transactional use.
//!
//! # Rebuild
//!
//! While an index is rebuilding (for example after a collation change), every
//! read returns `IndexNotReady` instead of answering with stale ordering.

use std::collections::BTreeMap;
use std::ops::{Bound, ControlFlow};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use trellis_core::{Error, IndexDefinition, IndexKey, PageStore, RecordId, Result};

use crate::link_bag::{AdaptiveLinkCollection, CollectionOwner, ConversionThresholds};
use crate::pages::StagedPages;

/// Per-key net occurrence deltas, keyed by record id
pub type KeyDeltas = BTreeMap<RecordId, i64>;

/// Whether an index serves queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// Serving queries
    Online,
    /// Being re-keyed; reads fail with `IndexNotReady`
    Rebuilding,
}

/// Value stored under one key
#[derive(Debug, Clone, PartialEq)]
pub enum IndexBucket {
    /// Unique index entry
    Single(RecordId),
    /// Non-unique index entry
    Multi {
        /// Bucket sequence number, part of the page prefix
        bucket: u64,
        /// Record ids under the key
        ids: AdaptiveLinkCollection,
    },
}

impl IndexBucket {
    /// Number of record ids under the key
    pub fn len(&self) -> usize {
        match self {
            IndexBucket::Single(_) => 1,
            IndexBucket::Multi { ids, .. } => ids.len(),
        }
    }

    /// Whether the bucket is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bucket updates computed by [`PersistedIndex::prepare`]
#[derive(Debug, Default)]
pub struct PreparedIndexChanges {
    updates: Vec<(IndexKey, Option<IndexBucket>)>,
}

impl PreparedIndexChanges {
    /// Number of keys whose bucket changes
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Whether nothing changes
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Durable sorted index structure
pub struct PersistedIndex {
    definition: RwLock<Arc<IndexDefinition>>,
    entries: RwLock<BTreeMap<IndexKey, IndexBucket>>,
    state: RwLock<IndexState>,
    pages: Arc<dyn PageStore>,
    thresholds: ConversionThresholds,
    next_bucket: AtomicU64,
}

impl std::fmt::Debug for PersistedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedIndex")
            .field("definition", &self.definition.read().to_string())
            .field("keys", &self.entries.read().len())
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Whether a bound pair selects nothing
///
/// `BTreeMap::range` panics on inverted bounds, so every range lookup checks
/// this first.
pub fn range_is_empty(lower: &Bound<IndexKey>, upper: &Bound<IndexKey>) -> bool {
    use Bound::*;
    match (lower, upper) {
        (Included(a), Included(b)) => a > b,
        (Included(a), Excluded(b)) | (Excluded(a), Included(b)) | (Excluded(a), Excluded(b)) => {
            a >= b
        }
        _ => false,
    }
}

impl PersistedIndex {
    /// Empty index over `pages`
    pub fn new(
        definition: IndexDefinition,
        pages: Arc<dyn PageStore>,
        thresholds: ConversionThresholds,
    ) -> Self {
        PersistedIndex {
            definition: RwLock::new(Arc::new(definition)),
            entries: RwLock::new(BTreeMap::new()),
            state: RwLock::new(IndexState::Online),
            pages,
            thresholds,
            next_bucket: AtomicU64::new(0),
        }
    }

    /// Current definition
    pub fn definition(&self) -> Arc<IndexDefinition> {
        Arc::clone(&self.definition.read())
    }

    /// Index name
    pub fn name(&self) -> String {
        self.definition.read().name().to_string()
    }

    /// Serving state
    pub fn state(&self) -> IndexState {
        *self.state.read()
    }

    /// Page store holding bucket trees
    pub fn pages(&self) -> &Arc<dyn PageStore> {
        &self.pages
    }

    /// Fail with `IndexNotReady` unless online
    pub fn ensure_online(&self) -> Result<()> {
        match self.state() {
            IndexState::Online => Ok(()),
            IndexState::Rebuilding => Err(Error::IndexNotReady(self.name())),
        }
    }

    /// Normalize a full or partial key under the current collations
    pub fn normalize(&self, key: &IndexKey) -> IndexKey {
        self.definition.read().normalize_key(key.clone())
    }

    /// Normalized bounds for a possibly partial range; `None` is open
    pub fn key_bounds(
        &self,
        from: Option<&IndexKey>,
        to: Option<&IndexKey>,
        from_inclusive: bool,
        to_inclusive: bool,
    ) -> (Bound<IndexKey>, Bound<IndexKey>) {
        let lower = match from {
            Some(k) => self.normalize(k).lower_bound(from_inclusive),
            None => Bound::Unbounded,
        };
        let upper = match to {
            Some(k) => self.normalize(k).upper_bound(to_inclusive),
            None => Bound::Unbounded,
        };
        (lower, upper)
    }

    fn bucket_ids(&self, bucket: &IndexBucket, ascending: bool) -> Result<Vec<RecordId>> {
        let mut ids = match bucket {
            IndexBucket::Single(id) => vec![*id],
            IndexBucket::Multi { ids, .. } => ids.to_sorted_vec(&*self.pages)?,
        };
        if !ascending {
            ids.reverse();
        }
        Ok(ids)
    }

    /// Record ids under an exact key, ascending
    pub fn get(&self, key: &IndexKey) -> Result<Vec<RecordId>> {
        self.ensure_online()?;
        let key = self.normalize(key);
        let entries = self.entries.read();
        match entries.get(&key) {
            Some(bucket) => self.bucket_ids(bucket, true),
            None => Ok(Vec::new()),
        }
    }

    /// Whether an exact key has any entry
    pub fn contains_key(&self, key: &IndexKey) -> Result<bool> {
        self.ensure_online()?;
        let key = self.normalize(key);
        Ok(self.entries.read().contains_key(&key))
    }

    /// Visit keys within normalized bounds in order, stopping on `Break`
    ///
    /// The visitor receives each key with its record ids, ordered in the
    /// scan direction.
    pub fn scan<F>(
        &self,
        lower: Bound<IndexKey>,
        upper: Bound<IndexKey>,
        ascending: bool,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&IndexKey, Vec<RecordId>) -> ControlFlow<()>,
    {
        self.ensure_online()?;
        if range_is_empty(&lower, &upper) {
            return Ok(());
        }
        let entries = self.entries.read();
        let range = entries.range((lower, upper));
        if ascending {
            for (key, bucket) in range {
                if visit(key, self.bucket_ids(bucket, true)?).is_break() {
                    break;
                }
            }
        } else {
            for (key, bucket) in range.rev() {
                if visit(key, self.bucket_ids(bucket, false)?).is_break() {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Entries for a set of exact keys, in key order
    pub fn stream_entries(
        &self,
        keys: &[IndexKey],
        ascending: bool,
    ) -> Result<Vec<(IndexKey, RecordId)>> {
        self.ensure_online()?;
        let mut normalized: Vec<IndexKey> = keys.iter().map(|k| self.normalize(k)).collect();
        normalized.sort();
        normalized.dedup();
        if !ascending {
            normalized.reverse();
        }
        let entries = self.entries.read();
        let mut out = Vec::new();
        for key in normalized {
            if let Some(bucket) = entries.get(&key) {
                for id in self.bucket_ids(bucket, ascending)? {
                    out.push((key.clone(), id));
                }
            }
        }
        Ok(out)
    }

    /// Entries within a possibly partial, possibly open range
    pub fn range_scan(
        &self,
        from: Option<&IndexKey>,
        to: Option<&IndexKey>,
        from_inclusive: bool,
        to_inclusive: bool,
        ascending: bool,
    ) -> Result<Vec<(IndexKey, RecordId)>> {
        let (lower, upper) = self.key_bounds(from, to, from_inclusive, to_inclusive);
        let mut out = Vec::new();
        self.scan(lower, upper, ascending, |key, ids| {
            out.extend(ids.into_iter().map(|id| (key.clone(), id)));
            ControlFlow::Continue(())
        })?;
        Ok(out)
    }

    /// Every entry
    pub fn stream_all(&self, ascending: bool) -> Result<Vec<(IndexKey, RecordId)>> {
        self.range_scan(None, None, true, true, ascending)
    }

    /// Entries with keys above `from`
    pub fn stream_major(
        &self,
        from: &IndexKey,
        inclusive: bool,
        ascending: bool,
    ) -> Result<Vec<(IndexKey, RecordId)>> {
        self.range_scan(Some(from), None, inclusive, true, ascending)
    }

    /// Entries with keys below `to`
    pub fn stream_minor(
        &self,
        to: &IndexKey,
        inclusive: bool,
        ascending: bool,
    ) -> Result<Vec<(IndexKey, RecordId)>> {
        self.range_scan(None, Some(to), true, inclusive, ascending)
    }

    /// Total `(key, id)` pairs
    pub fn size(&self) -> usize {
        self.entries.read().values().map(IndexBucket::len).sum()
    }

    /// Number of distinct keys
    pub fn key_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Add one entry immediately
    ///
    /// # Errors
    ///
    /// `DuplicateKey` when the index is unique and the key already maps to
    /// a different record.
    pub fn put(&self, key: IndexKey, id: RecordId) -> Result<()> {
        let mut changes = BTreeMap::new();
        changes.insert(key, KeyDeltas::from([(id, 1)]));
        self.apply_now(&changes)
    }

    /// Remove one entry immediately, returns whether it was present
    pub fn remove(&self, key: &IndexKey, id: RecordId) -> Result<bool> {
        let present = self.get(key)?.contains(&id);
        if present {
            let mut changes = BTreeMap::new();
            changes.insert(key.clone(), KeyDeltas::from([(id, -1)]));
            self.apply_now(&changes)?;
        }
        Ok(present)
    }

    fn apply_now(&self, changes: &BTreeMap<IndexKey, KeyDeltas>) -> Result<()> {
        self.ensure_online()?;
        let definition = self.definition();
        let mut entries = self.entries.write();
        let mut staged = StagedPages::new(&*self.pages);
        let prepared = self.prepare_against(&definition, &entries, changes, &mut staged)?;
        staged.commit()?;
        Self::install_into(&mut entries, prepared);
        Ok(())
    }

    /// Fold deltas against current entries and stage bucket pages
    ///
    /// Keys with a null component are skipped when the definition ignores
    /// nulls. Nothing visible changes until [`PersistedIndex::install`].
    ///
    /// # Errors
    ///
    /// `DuplicateKey` when a unique key would end up owned by two records.
    pub fn prepare(
        &self,
        changes: &BTreeMap<IndexKey, KeyDeltas>,
        pages: &mut StagedPages<'_>,
    ) -> Result<PreparedIndexChanges> {
        let definition = self.definition();
        let entries = self.entries.read();
        self.prepare_against(&definition, &entries, changes, pages)
    }

    /// Swap prepared buckets in
    pub fn install(&self, prepared: PreparedIndexChanges) {
        let mut entries = self.entries.write();
        Self::install_into(&mut entries, prepared);
    }

    fn install_into(entries: &mut BTreeMap<IndexKey, IndexBucket>, prepared: PreparedIndexChanges) {
        for (key, bucket) in prepared.updates {
            match bucket {
                Some(bucket) => {
                    entries.insert(key, bucket);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
    }

    fn prepare_against(
        &self,
        definition: &IndexDefinition,
        entries: &BTreeMap<IndexKey, IndexBucket>,
        changes: &BTreeMap<IndexKey, KeyDeltas>,
        pages: &mut StagedPages<'_>,
    ) -> Result<PreparedIndexChanges> {
        // Collations may fold distinct raw keys together
        let mut folded: BTreeMap<IndexKey, KeyDeltas> = BTreeMap::new();
        for (key, deltas) in changes {
            let key = definition.normalize_key(key.clone());
            if definition.ignore_null_values() && key.has_null() {
                continue;
            }
            let slot = folded.entry(key).or_default();
            for (id, delta) in deltas {
                *slot.entry(*id).or_insert(0) += delta;
            }
        }

        let mut prepared = PreparedIndexChanges::default();
        for (key, deltas) in folded {
            if deltas.values().all(|d| *d == 0) {
                continue;
            }
            let current = entries.get(&key);
            let next = if definition.is_unique() {
                self.fold_unique(definition, &key, current, &deltas)?
            } else {
                self.fold_multi(definition, &key, current, &deltas, pages)?
            };
            if next.as_ref() != current {
                prepared.updates.push((key, next));
            }
        }
        debug!(index = %definition.name(), keys = prepared.len(), "Prepared index changes");
        Ok(prepared)
    }

    fn fold_unique(
        &self,
        definition: &IndexDefinition,
        key: &IndexKey,
        current: Option<&IndexBucket>,
        deltas: &KeyDeltas,
    ) -> Result<Option<IndexBucket>> {
        let existing = match current {
            Some(IndexBucket::Single(id)) => Some(*id),
            _ => None,
        };
        let mut counts: BTreeMap<RecordId, i64> = BTreeMap::new();
        if let Some(id) = existing {
            counts.insert(id, 1);
        }
        for (id, delta) in deltas {
            *counts.entry(*id).or_insert(0) += delta;
        }
        let owners: Vec<RecordId> = counts
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(id, _)| id)
            .collect();
        match owners.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(IndexBucket::Single(*only))),
            [first, ..] => {
                let holder = existing.filter(|e| owners.contains(e)).unwrap_or(*first);
                let rejected = owners.iter().copied().find(|id| *id != holder).unwrap_or(*first);
                warn!(index = %definition.name(), key = %key, existing = %holder, rejected = %rejected,
                    "Rejected duplicate key");
                Err(Error::DuplicateKey {
                    index: definition.name().to_string(),
                    key: key.to_string(),
                    existing: holder,
                    rejected,
                })
            }
        }
    }

    fn fold_multi(
        &self,
        definition: &IndexDefinition,
        key: &IndexKey,
        current: Option<&IndexBucket>,
        deltas: &KeyDeltas,
        pages: &mut StagedPages<'_>,
    ) -> Result<Option<IndexBucket>> {
        let (bucket, mut ids) = match current {
            Some(IndexBucket::Multi { bucket, ids }) => (*bucket, ids.clone()),
            Some(IndexBucket::Single(id)) => {
                return Err(Error::Corruption(format!(
                    "non-unique index '{}' holds a single entry {} under {}",
                    definition.name(),
                    id,
                    key
                )))
            }
            None => (
                self.next_bucket.fetch_add(1, Ordering::SeqCst),
                AdaptiveLinkCollection::with_thresholds(self.thresholds),
            ),
        };
        ids.set_thresholds(self.thresholds);
        for (id, delta) in deltas {
            if *delta > 0 {
                for _ in 0..*delta {
                    ids.add(*id);
                }
            } else {
                for _ in 0..delta.unsigned_abs() {
                    if !ids.remove(*id, &*pages)? {
                        break;
                    }
                }
            }
        }
        if ids.is_empty() {
            ids.delete_storage(pages)?;
            return Ok(None);
        }
        let owner = CollectionOwner::IndexBucket {
            index: definition.name().to_string(),
            bucket,
        };
        ids.flush(&owner, pages)?;
        Ok(Some(IndexBucket::Multi { bucket, ids }))
    }

    /// Stop serving queries until [`PersistedIndex::finish_rebuild`]
    pub fn begin_rebuild(&self) {
        *self.state.write() = IndexState::Rebuilding;
        info!(index = %self.name(), "Index rebuild started");
    }

    /// Re-key the index from scratch under `definition`
    ///
    /// On success the new definition and entries replace the old ones
    /// together. On failure the old definition and entries stay in place.
    /// Either way the index is online afterwards.
    pub fn finish_rebuild<I>(&self, definition: Option<IndexDefinition>, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (IndexKey, RecordId)>,
    {
        let definition = match definition {
            Some(d) => Arc::new(d),
            None => self.definition(),
        };
        let mut changes: BTreeMap<IndexKey, KeyDeltas> = BTreeMap::new();
        for (key, id) in entries {
            *changes.entry(key).or_default().entry(id).or_insert(0) += 1;
        }

        let result = (|| {
            let mut current = self.entries.write();
            let mut staged = StagedPages::new(&*self.pages);
            staged.delete_prefix(&CollectionOwner::index_prefix(definition.name()))?;
            let prepared = self.prepare_against(&definition, &BTreeMap::new(), &changes, &mut staged)?;
            staged.commit()?;
            current.clear();
            Self::install_into(&mut current, prepared);
            *self.definition.write() = Arc::clone(&definition);
            Ok::<usize, Error>(current.len())
        })();

        *self.state.write() = IndexState::Online;
        match result {
            Ok(keys) => {
                info!(index = %definition.name(), keys, "Index rebuild finished");
                Ok(())
            }
            Err(e) => {
                warn!(index = %definition.name(), error = %e, "Index rebuild failed");
                Err(e)
            }
        }
    }

    /// Rebuild in one step
    pub fn rebuild<I>(&self, definition: Option<IndexDefinition>, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (IndexKey, RecordId)>,
    {
        self.begin_rebuild();
        self.finish_rebuild(definition, entries)
    }

    /// Stage deletion of every bucket page
    pub fn drop_storage(&self, pages: &mut StagedPages<'_>) -> Result<usize> {
        let name = self.name();
        pages.delete_prefix(&CollectionOwner::index_prefix(&name))
    }

    /// Forget all entries and their pages
    pub fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write();
        let mut staged = StagedPages::new(&*self.pages);
        self.drop_storage(&mut staged)?;
        staged.commit()?;
        entries.clear();
        Ok(())
    }
}
