//! Storage layer for trellis
//!
//! This crate implements everything that is physically persisted:
//! - MemoryPageStore / StagedPages: byte-keyed pages and atomic page batches
//! - LinkTree: page-backed B+tree of record ids with CRC32-checked pages
//! - AdaptiveLinkCollection: embedded / tree-backed multiset of record ids
//! - Value / Document: closed property bag of a record
//! - PersistedIndex: durable sorted key → record id(s) structure
//! - RecordStore: committed records with versions
//!
//! # Atomicity
//!
//! Commit-time mutation is staged first and applied second. Page writes are
//! collected in a `StagedPages` and applied as one batch; index buckets and
//! records are installed while holding their write locks once.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document;
pub mod index;
pub mod link_bag;
pub mod pages;
pub mod records;
pub mod tree;

pub use document::{Document, Value};
pub use index::{
    range_is_empty, IndexBucket, IndexState, KeyDeltas, PersistedIndex, PreparedIndexChanges,
};
pub use link_bag::{
    AdaptiveLinkCollection, CollectionOwner, ConversionThresholds,
    DEFAULT_EMBEDDED_TO_TREE_THRESHOLD,
};
pub use pages::{MemoryPageStore, StagedPages};
pub use records::{RecordStore, RecordWrite, StoredRecord};
pub use tree::LinkTree;
