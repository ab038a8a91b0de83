//! Core types and traits for trellis
//!
//! This crate defines the foundational types used throughout the system:
//! - RecordId: stable `(cluster, position)` record address
//! - KeyComponent / IndexKey: ordered, possibly partial, index keys
//! - Collation / CollationRegistry: key normalization looked up by name
//! - IndexDefinition: immutable index schema and its validating builder
//! - PageRead / PageStore: durable page storage seam
//! - Error: Error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collation;
pub mod definition;
pub mod error;
pub mod key;
pub mod record_id;
pub mod traits;

pub use collation::{
    CaseInsensitiveCollation, Collation, CollationRegistry, DefaultCollation,
    CASE_INSENSITIVE_COLLATION, DEFAULT_COLLATION,
};
pub use definition::{
    IndexDefinition, IndexDefinitionBuilder, IndexType, IndexedField, MapIndexBy, PropertyType,
};
pub use error::{Error, Result};
pub use key::{IndexKey, KeyComponent};
pub use record_id::RecordId;
pub use traits::{PageBatch, PageOp, PageRead, PageStore};
