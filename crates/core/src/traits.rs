//! Durable storage seam
//!
//! Tree-backed link collections and multi-value index buckets live in pages
//! addressed by opaque byte keys. The engine only needs get/put/delete by key
//! plus an atomic multi-page batch; everything about page caches and file
//! layout stays behind [`PageStore`].
//!
//! Thread safety: implementations must be safe to call concurrently from
//! multiple threads (requires Send + Sync).

use crate::error::Result;

/// Read access to pages
pub trait PageRead {
    /// Read one page, `None` if absent
    fn read_page(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// One page mutation inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOp {
    /// Write a page
    Put(Vec<u8>, Vec<u8>),
    /// Delete a page
    Delete(Vec<u8>),
}

/// Ordered set of page mutations applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageBatch {
    ops: Vec<PageOp>,
}

impl PageBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a page write
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(PageOp::Put(key, value));
    }

    /// Queue a page delete
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(PageOp::Delete(key));
    }

    /// Queued mutations in order
    pub fn ops(&self) -> &[PageOp] {
        &self.ops
    }

    /// Consume into mutations
    pub fn into_ops(self) -> Vec<PageOp> {
        self.ops
    }

    /// Number of queued mutations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Durable byte-keyed page storage
///
/// # Examples
///
/// ```
/// use trellis_core::traits::PageStore;
/// fn accepts_store(_: &dyn PageStore) {}
/// ```
pub trait PageStore: PageRead + Send + Sync {
    /// Apply a batch atomically: readers observe all of it or none of it
    fn apply(&self, batch: PageBatch) -> Result<()>;

    /// Write a single page
    fn put_page(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let mut batch = PageBatch::new();
        batch.put(key, value);
        self.apply(batch)
    }

    /// Delete a single page
    fn delete_page(&self, key: &[u8]) -> Result<()> {
        let mut batch = PageBatch::new();
        batch.delete(key.to_vec());
        self.apply(batch)
    }

    /// Keys of all pages starting with `prefix`, sorted
    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Total number of pages
    fn page_count(&self) -> usize;
}
