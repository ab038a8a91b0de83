//! Shared test utilities for the integration test suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use std::sync::{Arc, Once};

pub use trellisdb::{
    index_key, CountingMetrics, Database, Document, Error, IndexDefinition, IndexKey,
    IndexedField, KeyComponent, KeyRange, PageStore, Predicate, PropertyDef, PropertyType, RecordId,
    Session, TrellisConfig, Value,
};

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Install a test subscriber once per process; `RUST_LOG` selects the level.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Databases
// ============================================================================

/// Fresh in-memory database with default settings
pub fn open() -> Arc<Database> {
    init_tracing();
    Database::open_in_memory().unwrap()
}

/// Fresh in-memory database with `config`
pub fn open_with(config: TrellisConfig) -> Arc<Database> {
    init_tracing();
    Database::open(config).unwrap()
}

/// Config whose link collections become tree-backed at `threshold` elements
pub fn tree_threshold_config(threshold: usize) -> TrellisConfig {
    let mut config = TrellisConfig::default();
    config.link_bag.embedded_to_tree_threshold = threshold;
    config
}

/// Class `name` with one declared property per `(name, type)` pair
pub fn class_with(db: &Database, name: &str, properties: &[(&str, PropertyType)]) {
    db.create_class(name).unwrap();
    for (property, ty) in properties {
        db.create_property(name, PropertyDef::new(*property, *ty)).unwrap();
    }
}

/// Single-field index named `<class>.<field>`
pub fn index_on(db: &Database, class: &str, field: &str, ty: PropertyType, unique: bool) {
    let mut builder = IndexDefinition::builder(format!("{class}.{field}"), class).property(field, ty);
    if unique {
        builder = builder.unique();
    }
    db.create_index(builder).unwrap();
}

/// Save a new document built from `fields` in an implicit transaction
pub fn insert(session: &mut Session, class: &str, fields: Vec<(&str, Value)>) -> RecordId {
    let mut doc = Document::new(class);
    for (field, value) in fields {
        doc.set(field, value);
    }
    session.save(&mut doc).unwrap()
}

/// Integer values of `field` over `documents`, sorted
pub fn sorted_ints(documents: &[Document], field: &str) -> Vec<i64> {
    let mut values: Vec<i64> = documents
        .iter()
        .filter_map(|d| match d.get(field) {
            Value::Int(v) => Some(*v),
            _ => None,
        })
        .collect();
    values.sort_unstable();
    values
}
