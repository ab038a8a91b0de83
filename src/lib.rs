//! trellisdb - embedded document-and-graph database core
//!
//! Records live in classes; secondary indexes over their fields are kept
//! consistent with every committed transaction, and a transaction's own
//! pending index changes are visible to its own reads before commit.
//! Link collections switch between an embedded list and a tree-backed form
//! by size.
//!
//! # Quick Start
//!
//! ```ignore
//! use trellisdb::{Database, Document, IndexDefinition, Predicate, PropertyType};
//!
//! let db = Database::open_in_memory()?;
//! db.create_class("Person")?;
//! db.create_index(
//!     IndexDefinition::builder("Person.age", "Person").property("age", PropertyType::Integer),
//! )?;
//!
//! let mut session = db.session();
//! session.save(&mut Document::new("Person").with("age", 42i64))?;
//!
//! let adults = session.query(
//!     "Person",
//!     &Predicate::and(vec![Predicate::ge("age", 18i64), Predicate::le("age", 65i64)]),
//! )?;
//! assert!(adults.plan.range_converted);
//! ```
//!
//! # Architecture
//!
//! - `trellis-core`: record ids, index keys, collations, index definitions
//! - `trellis-storage`: persisted indexes, link collections, page storage
//! - `trellis-concurrency`: transaction overlays, merge cursors, commit
//! - `trellis-engine`: database, sessions, index maintenance, queries

pub use trellis_engine::*;

pub use trellis_concurrency::{KeyRange, PendingOperations, TransactionIndexChanges};
pub use trellis_core::{
    index_key, Collation, CollationRegistry, Error, IndexDefinition, IndexDefinitionBuilder,
    IndexKey, IndexType, IndexedField, KeyComponent, MapIndexBy, PageRead, PageStore,
    PropertyType, RecordId, Result,
};
pub use trellis_storage::{
    AdaptiveLinkCollection, ConversionThresholds, Document, IndexState, MemoryPageStore,
    PersistedIndex, Value,
};
