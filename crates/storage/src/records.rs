//! RecordStore: primary record storage
//!
//! This module holds the committed version of every record:
//! - `BTreeMap<RecordId, StoredRecord>` behind a `parking_lot::RwLock`
//! - per-cluster position counters in a `DashMap`
//!
//! # Design Notes
//!
//! - **Positions are allocated eagerly**: a new document gets its final
//!   `RecordId` on first save, even inside a transaction. A rolled-back
//!   position is simply never used, so ids are never reused.
//! - **Batch application holds the write lock once**, so readers observe a
//!   commit's records all together or not at all.

use std::collections::BTreeMap;

use dashmap::DashMap;
use parking_lot::RwLock;

use trellis_core::RecordId;

use crate::document::Document;

/// Committed record with its version
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Version, starting at 1 and incremented by every committed update
    pub version: u64,
    /// Content
    pub document: Document,
}

/// One record mutation inside a commit batch
#[derive(Debug, Clone)]
pub enum RecordWrite {
    /// Insert or replace a record
    Put(RecordId, StoredRecord),
    /// Remove a record
    Delete(RecordId),
}

/// In-memory primary record store
#[derive(Debug, Default)]
pub struct RecordStore {
    records: RwLock<BTreeMap<RecordId, StoredRecord>>,
    positions: DashMap<i32, i64>,
}

impl RecordStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next position in `cluster`
    pub fn allocate(&self, cluster: i32) -> RecordId {
        let mut next = self.positions.entry(cluster).or_insert(0);
        let position = *next;
        *next += 1;
        RecordId::new(cluster, position)
    }

    /// Committed record, if any
    pub fn get(&self, id: RecordId) -> Option<StoredRecord> {
        self.records.read().get(&id).cloned()
    }

    /// Committed version, 0 when the record does not exist
    pub fn version(&self, id: RecordId) -> u64 {
        self.records.read().get(&id).map(|r| r.version).unwrap_or(0)
    }

    /// Whether a committed record exists
    pub fn contains(&self, id: RecordId) -> bool {
        self.records.read().contains_key(&id)
    }

    /// Number of committed records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// All committed records of one cluster, in position order
    pub fn scan_cluster(&self, cluster: i32) -> Vec<(RecordId, StoredRecord)> {
        let records = self.records.read();
        records
            .range(RecordId::new(cluster, i64::MIN)..=RecordId::new(cluster, i64::MAX))
            .map(|(id, r)| (*id, r.clone()))
            .collect()
    }

    /// Apply a batch of writes atomically
    pub fn apply_batch(&self, writes: Vec<RecordWrite>) {
        // Acquire the lock ONCE for the entire batch
        let mut records = self.records.write();
        for write in writes {
            match write {
                RecordWrite::Put(id, record) => {
                    records.insert(id, record);
                }
                RecordWrite::Delete(id) => {
                    records.remove(&id);
                }
            }
        }
    }
}
