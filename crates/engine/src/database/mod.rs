//! Database struct and schema operations
//!
//! This module provides the main Database struct that owns:
//! - Committed records and the page store behind link trees and index buckets
//! - The schema: classes, their clusters and declared properties
//! - Persisted indexes, by name
//! - The transaction coordinator
//!
//! ## Transaction API
//!
//! The Database provides two ways to execute transactions:
//!
//! 1. **Closure API** (recommended): `db.transaction(|session| { ... })`
//!    - Automatic commit on success, rollback on error
//!    - Returns the closure's return value
//!
//! 2. **Manual API**: `db.session()` then `begin()` / `commit()` / `rollback()`
//!    - For cases requiring external control over commit timing
//!
//! Writes on a session without an active transaction run in an implicit
//! single-operation transaction.
//!
//! ## Schema changes
//!
//! Creating, dropping or rebuilding an index and changing a property's
//! collation take the schema write lock and the commit lock. Every
//! transaction remembers the schema version it started under; one that
//! staged writes under an older schema is aborted at commit, since its
//! overlays were computed against index definitions that no longer hold.

pub mod config;
pub mod schema;
mod transactions;

pub use config::{
    IndexConfig, LinkBagConfig, TransactionConfig, TrellisConfig, CONFIG_FILE_NAME,
};
pub use schema::{ClassDef, PropertyDef, Schema};
pub use transactions::RetryConfig;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use trellis_concurrency::{CommitTarget, TransactionContext};
use trellis_core::{
    Collation, CollationRegistry, Error, IndexDefinition, IndexDefinitionBuilder, IndexKey,
    PageStore, RecordId, Result,
};
use trellis_storage::{MemoryPageStore, PersistedIndex, RecordStore};

use crate::coordinator::{TransactionCoordinator, TransactionMetrics};
use crate::maintenance::extract_keys;
use crate::query::MetricsCollector;
use crate::session::Session;

/// Embedded database: records, schema and transactional secondary indexes
pub struct Database {
    config: TrellisConfig,
    collations: RwLock<CollationRegistry>,
    schema: RwLock<Schema>,
    records: RecordStore,
    pages: Arc<dyn PageStore>,
    indexes: RwLock<BTreeMap<String, Arc<PersistedIndex>>>,
    coordinator: TransactionCoordinator,
}

impl Database {
    /// Open an empty in-memory database with default settings
    pub fn open_in_memory() -> Result<Arc<Self>> {
        Self::open(TrellisConfig::default())
    }

    /// Open an empty database over an in-memory page store
    pub fn open(config: TrellisConfig) -> Result<Arc<Self>> {
        Self::open_with_page_store(config, Arc::new(MemoryPageStore::new()))
    }

    /// Open with settings read from `trellis.toml` in `dir`
    ///
    /// A default file is written first when none exists.
    pub fn open_with_config_dir(dir: &Path) -> Result<Arc<Self>> {
        let path = dir.join(CONFIG_FILE_NAME);
        TrellisConfig::write_default_if_missing(&path)?;
        let config = TrellisConfig::from_file(&path)?;
        Self::open(config)
    }

    /// Open over a caller-supplied page store
    ///
    /// # Errors
    ///
    /// `Config` when the settings are inconsistent or name an unknown
    /// default collation.
    pub fn open_with_page_store(config: TrellisConfig, pages: Arc<dyn PageStore>) -> Result<Arc<Self>> {
        let collations = CollationRegistry::with_defaults();
        config.validate_with(&collations)?;
        info!(
            embedded_to_tree = config.link_bag.embedded_to_tree_threshold,
            tree_to_embedded = config.link_bag.tree_to_embedded_threshold,
            default_collation = %config.index.default_collation,
            "Opening database"
        );
        Ok(Arc::new(Database {
            config,
            collations: RwLock::new(collations),
            schema: RwLock::new(Schema::new()),
            records: RecordStore::new(),
            pages,
            indexes: RwLock::new(BTreeMap::new()),
            coordinator: TransactionCoordinator::new(0),
        }))
    }

    /// Settings in effect
    pub fn config(&self) -> &TrellisConfig {
        &self.config
    }

    /// New session without metrics collection
    pub fn session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self), None)
    }

    /// New session whose queries report to `metrics`
    pub fn session_with_metrics(self: &Arc<Self>, metrics: Arc<dyn MetricsCollector>) -> Session {
        Session::new(Arc::clone(self), Some(metrics))
    }

    /// Page store behind tree-backed link collections and index buckets
    pub fn pages(&self) -> &Arc<dyn PageStore> {
        &self.pages
    }

    /// Transaction statistics
    pub fn metrics(&self) -> TransactionMetrics {
        self.coordinator.metrics()
    }

    // ========================================================================
    // Collations and schema
    // ========================================================================

    /// Make a collation available to properties and indexes
    pub fn register_collation(&self, collation: Arc<dyn Collation>) {
        self.collations.write().register(collation);
    }

    /// Current schema
    pub fn schema(&self) -> RwLockReadGuard<'_, Schema> {
        self.schema.read()
    }

    /// Create a class; returns its cluster
    pub fn create_class(&self, name: &str) -> Result<i32> {
        let mut schema = self.schema.write();
        let cluster = schema.create_class(name)?;
        schema.bump_version();
        Ok(cluster)
    }

    /// Declare a property on a class
    ///
    /// # Errors
    ///
    /// `Validation` for a duplicate property or an unknown collation,
    /// `ClassNotFound` for an unknown class.
    pub fn create_property(&self, class: &str, property: PropertyDef) -> Result<()> {
        if let Some(collation) = &property.collation {
            self.collations.read().resolve(collation)?;
        }
        let mut schema = self.schema.write();
        schema.create_property(class, property)?;
        schema.bump_version();
        Ok(())
    }

    /// Change a property's collation and rebuild every index over it
    ///
    /// All-or-nothing: when any rebuilt index would violate uniqueness under
    /// the new collation, nothing changes and the violation is returned.
    pub fn set_property_collation(&self, class: &str, property: &str, collation: &str) -> Result<()> {
        let mut schema = self.schema.write();
        let registry = self.collations.read();
        registry.resolve(collation)?;
        let _commit = self.coordinator.commit_guard();
        let previous = schema.set_property_collation(class, property, collation)?;
        let cluster = schema.class(class)?.cluster();

        let rebuilt = self.indexes_for_class(class).into_iter().filter(|index| {
            index.definition().covers(property)
        });
        let mut staged = Vec::new();
        let prepared = (|| -> Result<()> {
            for index in rebuilt {
                let definition = index.definition().with_collation(property, collation, &registry)?;
                let entries = self.compute_entries(&definition, cluster)?;
                check_unique(&definition, &entries)?;
                staged.push((index, definition, entries));
            }
            Ok(())
        })();
        if let Err(e) = prepared {
            schema.restore_property_collation(class, property, previous);
            warn!(class, property, collation, error = %e, "Collation change rejected");
            return Err(e);
        }

        for (index, definition, entries) in staged {
            debug!(index = %index.name(), collation, "Rebuilding index for collation change");
            index.rebuild(Some(definition), entries)?;
        }
        schema.bump_version();
        info!(class, property, collation, "Property collation changed");
        Ok(())
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    /// Create an index and build it from the class's committed records
    ///
    /// Fields inherit the element type and collation declared on the
    /// matching schema property; fields with no collation anywhere use the
    /// configured default. The null policy falls back to the configured
    /// default when the builder leaves it unset.
    ///
    /// # Errors
    ///
    /// - `ClassNotFound` for an unknown class
    /// - `Validation` for a duplicate name, an invalid definition, or a
    ///   field whose type disagrees with its property
    /// - `DuplicateKey` when a unique index cannot be built over existing
    ///   records; the index is not created
    pub fn create_index(&self, builder: IndexDefinitionBuilder) -> Result<()> {
        let mut schema = self.schema.write();
        let class = schema.class(builder.class_name())?.clone();

        let mut builder = builder;
        for field in builder.fields_mut() {
            if let Some(property) = class.property(&field.name) {
                if property.property_type != field.property_type {
                    return Err(Error::validation(format!(
                        "index field {}.{} is {} but the property is {}",
                        class.name(),
                        field.name,
                        field.property_type,
                        property.property_type
                    )));
                }
                if field.element_type.is_none() {
                    field.element_type = property.element_type;
                }
                if field.collation.is_none() {
                    field.collation = property.collation.clone();
                }
            }
            if field.collation.is_none() {
                field.collation = Some(self.config.index.default_collation.clone());
            }
        }
        let definition = builder
            .default_ignore_null_values(self.config.index.ignore_null_values)
            .build(&self.collations.read())?;

        let _commit = self.coordinator.commit_guard();
        if self.indexes.read().contains_key(definition.name()) {
            return Err(Error::validation(format!(
                "index {} already exists",
                definition.name()
            )));
        }

        let name = definition.name().to_string();
        let entries = self.compute_entries(&definition, class.cluster())?;
        let entry_count = entries.len();
        let index = Arc::new(PersistedIndex::new(
            definition,
            Arc::clone(&self.pages),
            self.config.thresholds(),
        ));
        if let Err(e) = index.rebuild(None, entries) {
            warn!(index = %name, error = %e, "Index build failed");
            index.clear()?;
            return Err(e);
        }
        self.indexes.write().insert(name.clone(), index);
        schema.bump_version();
        info!(index = %name, class = class.name(), entries = entry_count, "Index created");
        Ok(())
    }

    /// Drop an index and release its storage
    pub fn drop_index(&self, name: &str) -> Result<()> {
        let mut schema = self.schema.write();
        let _commit = self.coordinator.commit_guard();
        let index = self
            .indexes
            .write()
            .remove(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        index.clear()?;
        schema.bump_version();
        info!(index = name, "Index dropped");
        Ok(())
    }

    /// Rebuild an index from the committed records of its class
    pub fn rebuild_index(&self, name: &str) -> Result<()> {
        let schema = self.schema.read();
        let _commit = self.coordinator.commit_guard();
        let index = self.index(name)?;
        let definition = index.definition();
        let cluster = schema.class(definition.class_name())?.cluster();
        let entries = self.compute_entries(&definition, cluster)?;
        index.rebuild(None, entries)?;
        info!(index = name, "Index rebuilt");
        Ok(())
    }

    /// Index by name
    pub fn index(&self, name: &str) -> Result<Arc<PersistedIndex>> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }

    /// Names of every index
    pub fn index_names(&self) -> Vec<String> {
        self.indexes.read().keys().cloned().collect()
    }

    /// Indexes over one class, by name
    pub fn indexes_for_class(&self, class: &str) -> Vec<Arc<PersistedIndex>> {
        self.indexes
            .read()
            .values()
            .filter(|index| index.definition().class_name() == class)
            .cloned()
            .collect()
    }

    /// Every (key, id) entry the committed records of `cluster` put into
    /// an index with `definition`
    fn compute_entries(
        &self,
        definition: &IndexDefinition,
        cluster: i32,
    ) -> Result<Vec<(IndexKey, RecordId)>> {
        let mut entries = Vec::new();
        for (id, stored) in self.records.scan_cluster(cluster) {
            for key in extract_keys(definition, &stored.document, &*self.pages)? {
                entries.push((key, id));
            }
        }
        Ok(entries)
    }

    // ========================================================================
    // Closure transactions
    // ========================================================================

    /// Run `f` in one transaction on a fresh session
    ///
    /// Commits when `f` returns `Ok`; rolls back otherwise and returns the
    /// closure's error.
    ///
    /// # Example
    /// ```text
    /// let id = db.transaction(|session| {
    ///     let mut doc = Document::new("Person").with("name", "Ada");
    ///     session.save(&mut doc)
    /// })?;
    /// ```
    pub fn transaction<F, T>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> Result<T>,
    {
        let mut session = self.session();
        session.begin()?;
        let result = f(&mut session);
        Self::finish(&mut session, result)
    }

    /// Run `f` in a transaction, retrying on retryable failures
    ///
    /// The closure is called repeatedly until either:
    /// - The transaction commits successfully
    /// - A non-retryable error occurs
    /// - Maximum retries are exceeded
    ///
    /// # Example
    /// ```text
    /// db.transaction_with_retry(RetryConfig::default(), |session| {
    ///     let mut doc = session.load(id)?;
    ///     let next = doc.get("count").as_int().unwrap_or(0) + 1;
    ///     doc.set("count", next);
    ///     session.save(&mut doc).map(|_| ())
    /// })?;
    /// ```
    pub fn transaction_with_retry<F, T>(self: &Arc<Self>, config: RetryConfig, f: F) -> Result<T>
    where
        F: Fn(&mut Session) -> Result<T>,
    {
        let mut last_error = None;

        for attempt in 0..=config.max_retries {
            let mut session = self.session();
            session.begin()?;
            let result = f(&mut session);
            match Self::finish(&mut session, result) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < config.max_retries => {
                    debug!(attempt, error = %e, "Retrying transaction");
                    last_error = Some(e);
                    std::thread::sleep(config.backoff(attempt));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::TransactionAborted {
            reason: "retry loop exited without a result".to_string(),
        }))
    }

    fn finish<T>(session: &mut Session, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                session.commit()?;
                Ok(value)
            }
            Err(e) => {
                if session.in_transaction() {
                    if let Err(rollback) = session.rollback() {
                        warn!(error = %rollback, "Rollback after closure error failed");
                    }
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Crate-internal access for sessions
    // ========================================================================

    pub(crate) fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub(crate) fn records(&self) -> &RecordStore {
        &self.records
    }

    pub(crate) fn collations(&self) -> RwLockReadGuard<'_, CollationRegistry> {
        self.collations.read()
    }

    /// Commit `txn`, which began under `schema_version`
    pub(crate) fn commit(&self, txn: &mut TransactionContext, schema_version: u64) -> Result<u64> {
        let schema = self.schema.read();
        if !txn.is_read_only() && schema.version() != schema_version {
            let reason = format!(
                "schema changed from version {} to {} during the transaction",
                schema_version,
                schema.version()
            );
            self.coordinator.abort(txn, reason.clone())?;
            return Err(Error::TransactionAborted { reason });
        }
        let indexes = self.indexes.read().clone();
        let target = CommitTarget {
            records: &self.records,
            pages: &*self.pages,
            indexes: &indexes,
            thresholds: self.config.thresholds(),
        };
        self.coordinator.commit(txn, &target)
    }
}

/// Reject entries a unique index cannot hold
fn check_unique(definition: &IndexDefinition, entries: &[(IndexKey, RecordId)]) -> Result<()> {
    if !definition.is_unique() {
        return Ok(());
    }
    let mut owners: BTreeMap<&IndexKey, RecordId> = BTreeMap::new();
    let mut seen = BTreeSet::new();
    for (key, id) in entries {
        if !seen.insert((key, *id)) {
            continue;
        }
        if let Some(existing) = owners.insert(key, *id) {
            return Err(Error::DuplicateKey {
                index: definition.name().to_string(),
                key: key.to_string(),
                existing,
                rejected: *id,
            });
        }
    }
    Ok(())
}
