//! Page stores
//!
//! - `MemoryPageStore`: `BTreeMap<Vec<u8>, Vec<u8>>` behind a `parking_lot::RwLock`
//! - `StagedPages`: copy-on-write overlay used to build one atomic batch
//!
//! Every mutation made while preparing a commit goes into a `StagedPages`.
//! Reads through the overlay see staged writes first, then the base store.
//! Nothing reaches the base store until [`StagedPages::into_batch`] is
//! applied, so dropping the overlay is a complete rollback.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::error;

use trellis_core::{PageBatch, PageOp, PageRead, PageStore, Result};

/// In-memory page store
///
/// Thread-safe through `parking_lot::RwLock`. A batch is applied while
/// holding the write lock once, so readers see all of it or none of it.
#[derive(Debug, Default)]
pub struct MemoryPageStore {
    pages: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryPageStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held, keys included
    pub fn total_bytes(&self) -> usize {
        self.pages
            .read()
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }
}

impl PageRead for MemoryPageStore {
    fn read_page(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.pages.read().get(key).cloned())
    }
}

impl PageStore for MemoryPageStore {
    fn apply(&self, batch: PageBatch) -> Result<()> {
        // Acquire the lock ONCE for the entire batch
        let mut pages = self.pages.write();
        for op in batch.into_ops() {
            match op {
                PageOp::Put(key, value) => {
                    pages.insert(key, value);
                }
                PageOp::Delete(key) => {
                    pages.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let pages = self.pages.read();
        Ok(pages
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn page_count(&self) -> usize {
        self.pages.read().len()
    }
}

/// Overlay of pending page writes over a base store
pub struct StagedPages<'a> {
    base: &'a dyn PageStore,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> StagedPages<'a> {
    /// Empty overlay
    pub fn new(base: &'a dyn PageStore) -> Self {
        StagedPages {
            base,
            pending: BTreeMap::new(),
        }
    }

    /// Stage a page write
    pub fn write(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending.insert(key, Some(value));
    }

    /// Stage a page delete
    pub fn delete(&mut self, key: Vec<u8>) {
        self.pending.insert(key, None);
    }

    /// Stage deletion of every page under `prefix`, returns how many
    pub fn delete_prefix(&mut self, prefix: &[u8]) -> Result<usize> {
        let keys = self.keys_with_prefix(prefix)?;
        let n = keys.len();
        for key in keys {
            self.pending.insert(key, None);
        }
        Ok(n)
    }

    /// Live keys under `prefix`, staged writes and deletes included
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut keys: BTreeMap<Vec<u8>, bool> = self
            .base
            .keys_with_prefix(prefix)?
            .into_iter()
            .map(|k| (k, true))
            .collect();
        for (key, value) in self
            .pending
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            keys.insert(key.clone(), value.is_some());
        }
        Ok(keys
            .into_iter()
            .filter_map(|(k, live)| live.then_some(k))
            .collect())
    }

    /// Number of staged mutations
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is staged
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The store this overlay stages against
    pub fn base(&self) -> &'a dyn PageStore {
        self.base
    }

    /// Convert staged mutations into one batch for the base store
    pub fn into_batch(self) -> PageBatch {
        let mut batch = PageBatch::new();
        for (key, value) in self.pending {
            match value {
                Some(v) => batch.put(key, v),
                None => batch.delete(key),
            }
        }
        batch
    }

    /// Apply staged mutations to the base store atomically
    pub fn commit(self) -> Result<()> {
        let base = self.base;
        let batch = self.into_batch();
        if batch.is_empty() {
            return Ok(());
        }
        let n = batch.len();
        base.apply(batch).map_err(|e| {
            error!(pages = n, error = %e, "Page batch failed to apply");
            e
        })
    }
}

impl PageRead for StagedPages<'_> {
    fn read_page(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.pending.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.base.read_page(key),
        }
    }
}
