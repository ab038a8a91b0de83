//! Sessions: the unit of work against a database
//!
//! A session holds at most one active transaction. Record writes made
//! inside it are buffered in the transaction context together with the
//! index deltas they cause, so every read through the session (index
//! lookups, range scans, queries) sees the session's own pending work merged
//! over committed data, while other sessions see committed data only.
//!
//! Writes made without an active transaction run in an implicit
//! single-operation transaction that commits before the call returns.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use trellis_concurrency::{
    IndexMergeCursor, KeyRange, PendingOperations, PendingRecord, TransactionContext,
    TransactionIndexChanges,
};
use trellis_core::{Error, IndexKey, PageRead, RecordId, Result};
use trellis_storage::{Document, PersistedIndex};

use crate::database::Database;
use crate::maintenance::{compute_delta, IndexDelta};
use crate::query::{
    Evaluator, MetricsCollector, NoopMetrics, Predicate, QueryExecutor, QueryResult, QuerySource,
};

struct ActiveTransaction {
    context: TransactionContext,
    /// Schema version when the transaction began
    schema_version: u64,
}

/// A connection-like handle over a shared [`Database`]
pub struct Session {
    db: Arc<Database>,
    id: Uuid,
    txn: Option<ActiveTransaction>,
    executor: QueryExecutor,
}

impl Session {
    pub(crate) fn new(db: Arc<Database>, metrics: Option<Arc<dyn MetricsCollector>>) -> Self {
        let metrics = metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        Session {
            db,
            id: Uuid::new_v4(),
            txn: None,
            executor: QueryExecutor::new(metrics),
        }
    }

    /// Unique id of this session, for logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The database this session works on
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    // ========================================================================
    // Transaction control
    // ========================================================================

    /// Begin a transaction
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when one is already active; transactions do not nest.
    pub fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::invalid_operation(
                "a transaction is already active on this session",
            ));
        }
        let schema_version = self.db.schema().version();
        let context = self.db.coordinator().start_transaction();
        debug!(session = %self.id, txn_id = context.txn_id, "Transaction started");
        self.txn = Some(ActiveTransaction {
            context,
            schema_version,
        });
        Ok(())
    }

    /// Commit the active transaction; returns the commit version
    ///
    /// On any error the transaction is aborted and nothing was applied.
    pub fn commit(&mut self) -> Result<u64> {
        let mut txn = self
            .txn
            .take()
            .ok_or_else(|| Error::invalid_operation("no active transaction to commit"))?;
        self.db.commit(&mut txn.context, txn.schema_version)
    }

    /// Discard the active transaction
    pub fn rollback(&mut self) -> Result<()> {
        let mut txn = self
            .txn
            .take()
            .ok_or_else(|| Error::invalid_operation("no active transaction to roll back"))?;
        self.db.coordinator().rollback(&mut txn.context)
    }

    /// Whether a transaction is active
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Id of the active transaction
    pub fn transaction_id(&self) -> Option<u64> {
        self.txn.as_ref().map(|t| t.context.txn_id)
    }

    /// What the active transaction would apply
    pub fn pending_operations(&self) -> Option<PendingOperations> {
        self.txn.as_ref().map(|t| t.context.pending_operations())
    }

    /// The active transaction's overlay for one index, if it touched it
    pub fn index_changes(&self, index: &str) -> Option<&TransactionIndexChanges> {
        self.txn.as_ref()?.context.index_changes(index)
    }

    /// Run `op` inside the active transaction, or inside an implicit one
    fn in_transaction_scope<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<(T, bool)> {
        let implicit = self.txn.is_none();
        if implicit {
            self.begin()?;
        }
        match op(self) {
            Ok(value) => {
                if implicit {
                    self.commit()?;
                }
                Ok((value, implicit))
            }
            Err(e) => {
                if implicit {
                    self.rollback()?;
                }
                Err(e)
            }
        }
    }

    fn context_mut(&mut self) -> Result<&mut TransactionContext> {
        self.txn
            .as_mut()
            .map(|t| &mut t.context)
            .ok_or_else(|| Error::invalid_operation("no active transaction"))
    }

    // ========================================================================
    // Records
    // ========================================================================

    /// Save a document: insert when it has no identity, update otherwise
    ///
    /// Index maintenance happens here: the record's old and new key sets are
    /// diffed per index and folded into the transaction's overlays. Unique
    /// indexes are checked against committed entries merged with this
    /// transaction's own changes, so a key freed earlier in the same
    /// transaction can be taken again.
    ///
    /// On return the document carries its identity. After an implicit
    /// commit it also carries the committed version.
    ///
    /// # Errors
    ///
    /// - `ClassNotFound`, or `Validation` for a value that does not fit its
    ///   declared property or an identity in another class's cluster
    /// - `RecordNotFound` when updating a record that does not exist
    /// - `DuplicateKey` on a unique violation; nothing is staged
    /// - `InvalidOperation` past the configured staging limit
    pub fn save(&mut self, document: &mut Document) -> Result<RecordId> {
        let (id, implicit) = self.in_transaction_scope(|session| session.stage_save(document))?;
        if implicit {
            let _read = self.db.coordinator().read_guard();
            if let Some(stored) = self.db.records().get(id) {
                *document = stored.document;
                document.assign(id, stored.version);
            }
        }
        Ok(id)
    }

    fn stage_save(&mut self, document: &mut Document) -> Result<RecordId> {
        let db = Arc::clone(&self.db);
        let schema = db.schema();
        let class = schema.class(document.class_name())?;
        class.check_document(document)?;
        let max_staged = db.config().transaction.max_staged_records;
        let ctx = self.context_mut()?;

        let (id, previous, observed) = match document.identity() {
            None => {
                let id = db.records().allocate(class.cluster());
                (id, None, 0)
            }
            Some(id) => {
                if id.cluster != class.cluster() {
                    return Err(Error::validation(format!(
                        "record {} is not in cluster {} of class {}",
                        id,
                        class.cluster(),
                        class.name()
                    )));
                }
                let previous = match ctx.pending_record(id) {
                    Some(PendingRecord::Save(pending)) => pending.clone(),
                    Some(PendingRecord::Delete) => return Err(Error::RecordNotFound(id)),
                    None => {
                        let _read = db.coordinator().read_guard();
                        db.records()
                            .get(id)
                            .map(|stored| stored.document)
                            .ok_or(Error::RecordNotFound(id))?
                    }
                };
                (id, Some(previous), document.version())
            }
        };

        if max_staged > 0 && ctx.pending_record(id).is_none() && ctx.staged_records() >= max_staged {
            return Err(Error::invalid_operation(format!(
                "transaction already stages {} records, the configured maximum",
                max_staged
            )));
        }

        let deltas = {
            let _read = db.coordinator().read_guard();
            let deltas = index_deltas(&db, class.name(), previous.as_ref(), Some(&*document))?;
            check_unique_keys(ctx, &deltas, id)?;
            deltas
        };

        for (index, delta) in &deltas {
            delta.apply_to(ctx.index_changes_mut(&index.name()), id);
        }
        document.assign(id, document.version());
        ctx.record_read(id, observed);
        ctx.stage_save(document.clone())?;
        debug!(record = %id, indexes = deltas.len(), "Record staged");
        Ok(id)
    }

    /// Load a record as this session sees it
    pub fn load(&self, id: RecordId) -> Result<Document> {
        if let Some(txn) = &self.txn {
            match txn.context.pending_record(id) {
                Some(PendingRecord::Save(pending)) => return Ok(pending.clone()),
                Some(PendingRecord::Delete) => return Err(Error::RecordNotFound(id)),
                None => {}
            }
        }
        let _read = self.db.coordinator().read_guard();
        let stored = self.db.records().get(id).ok_or(Error::RecordNotFound(id))?;
        let mut document = stored.document;
        document.assign(id, stored.version);
        Ok(document)
    }

    /// Delete a record and remove it from every index of its class
    pub fn delete(&mut self, id: RecordId) -> Result<()> {
        self.in_transaction_scope(|session| session.stage_delete(id))
            .map(|_| ())
    }

    fn stage_delete(&mut self, id: RecordId) -> Result<()> {
        let db = Arc::clone(&self.db);
        let schema = db.schema();
        let ctx = self.context_mut()?;

        let (previous, observed) = match ctx.pending_record(id) {
            Some(PendingRecord::Save(pending)) => (pending.clone(), db.records().version(id)),
            Some(PendingRecord::Delete) => return Err(Error::RecordNotFound(id)),
            None => {
                let _read = db.coordinator().read_guard();
                let stored = db.records().get(id).ok_or(Error::RecordNotFound(id))?;
                (stored.document, stored.version)
            }
        };
        let class = schema.class(previous.class_name())?;

        let deltas = {
            let _read = db.coordinator().read_guard();
            index_deltas(&db, class.name(), Some(&previous), None)?
        };
        for (index, delta) in &deltas {
            delta.apply_to(ctx.index_changes_mut(&index.name()), id);
        }
        ctx.record_read(id, observed);
        ctx.stage_delete(id)?;
        debug!(record = %id, "Record delete staged");
        Ok(())
    }

    // ========================================================================
    // Index reads
    // ========================================================================

    fn overlay(&self, index: &str) -> Option<&TransactionIndexChanges> {
        self.txn.as_ref()?.context.index_changes(index)
    }

    fn with_cursor<T>(
        &self,
        index: &str,
        read: impl FnOnce(&IndexMergeCursor<'_>) -> Result<T>,
    ) -> Result<T> {
        let index = self.db.index(index)?;
        let _read = self.db.coordinator().read_guard();
        let cursor = IndexMergeCursor::new(&index, self.overlay(&index.name()));
        read(&cursor)
    }

    /// Ids under `key`, ascending, including this transaction's changes
    pub fn index_get(&self, index: &str, key: &IndexKey) -> Result<Vec<RecordId>> {
        self.with_cursor(index, |cursor| cursor.get(key))
    }

    /// Entries under each of `keys`, in key order
    pub fn index_stream_entries(
        &self,
        index: &str,
        keys: &[IndexKey],
        ascending: bool,
    ) -> Result<Vec<(IndexKey, RecordId)>> {
        self.with_cursor(index, |cursor| cursor.point_lookup(keys, ascending))
    }

    /// Entries inside `range`
    pub fn index_range(
        &self,
        index: &str,
        range: &KeyRange,
        ascending: bool,
    ) -> Result<Vec<(IndexKey, RecordId)>> {
        self.with_cursor(index, |cursor| cursor.range(range, ascending))
    }

    /// Every entry of an index
    pub fn index_stream_all(&self, index: &str, ascending: bool) -> Result<Vec<(IndexKey, RecordId)>> {
        self.with_cursor(index, |cursor| cursor.all(ascending))
    }

    /// Number of entries visible to this session
    pub fn index_size(&self, index: &str) -> Result<usize> {
        self.index_stream_all(index, true).map(|entries| entries.len())
    }

    /// Committed ids under `key`, ignoring this session's pending changes
    pub fn get_ignoring_transaction(&self, index: &str, key: &IndexKey) -> Result<Vec<RecordId>> {
        let index = self.db.index(index)?;
        let _read = self.db.coordinator().read_guard();
        index.get(key)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run `predicate` over the records of `class`
    ///
    /// Uses an index when one covers a prefix of the predicate; see
    /// [`crate::query::planner`].
    pub fn query(&self, class: &str, predicate: &Predicate) -> Result<QueryResult> {
        let db = Arc::clone(&self.db);
        let schema = db.schema();
        let class_def = schema.class(class)?;
        let registry = db.collations();
        let definitions: Vec<_> = db
            .indexes_for_class(class)
            .iter()
            .map(|index| index.definition())
            .collect();
        let evaluator = Evaluator::new(
            class_def,
            &registry,
            &db.config().index.default_collation,
            &definitions,
            db.pages().as_ref(),
        )?;
        let _read = db.coordinator().read_guard();
        let view = SessionView {
            db: &db,
            txn: self.txn.as_ref().map(|t| &t.context),
            cluster: class_def.cluster(),
        };
        self.executor.execute(&view, &evaluator, class, predicate)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut txn) = self.txn.take() {
            debug!(session = %self.id, txn_id = txn.context.txn_id, "Rolling back transaction of dropped session");
            let _ = self.db.coordinator().rollback(&mut txn.context);
        }
    }
}

/// Delta per affected index of `class` for a record going from `old` to `new`
fn index_deltas(
    db: &Database,
    class: &str,
    old: Option<&Document>,
    new: Option<&Document>,
) -> Result<Vec<(Arc<PersistedIndex>, IndexDelta)>> {
    let mut deltas = Vec::new();
    for index in db.indexes_for_class(class) {
        let delta = compute_delta(&index.definition(), old, new, db.pages().as_ref())?;
        if !delta.is_empty() {
            deltas.push((index, delta));
        }
    }
    Ok(deltas)
}

/// Reject keys a unique index already maps to another record
fn check_unique_keys(
    ctx: &TransactionContext,
    deltas: &[(Arc<PersistedIndex>, IndexDelta)],
    id: RecordId,
) -> Result<()> {
    for (index, delta) in deltas {
        let definition = index.definition();
        if !definition.is_unique() {
            continue;
        }
        let cursor = IndexMergeCursor::new(index, ctx.index_changes(definition.name()));
        for key in &delta.added {
            if let Some(existing) = cursor.get(key)?.into_iter().find(|owner| *owner != id) {
                return Err(Error::DuplicateKey {
                    index: definition.name().to_string(),
                    key: key.to_string(),
                    existing,
                    rejected: id,
                });
            }
        }
    }
    Ok(())
}

/// Committed state merged with one session's pending work
struct SessionView<'a> {
    db: &'a Database,
    txn: Option<&'a TransactionContext>,
    cluster: i32,
}

impl QuerySource for SessionView<'_> {
    fn class_indexes(&self, class: &str) -> Vec<Arc<PersistedIndex>> {
        self.db.indexes_for_class(class)
    }

    fn overlay(&self, index: &str) -> Option<&TransactionIndexChanges> {
        self.txn?.index_changes(index)
    }

    fn visible_record(&self, id: RecordId) -> Result<Option<Document>> {
        if let Some(pending) = self.txn.and_then(|t| t.pending_record(id)) {
            return Ok(match pending {
                PendingRecord::Save(document) => Some(document.clone()),
                PendingRecord::Delete => None,
            });
        }
        Ok(self.db.records().get(id).map(|stored| {
            let mut document = stored.document;
            document.assign(id, stored.version);
            document
        }))
    }

    fn visible_records(&self, _class: &str) -> Result<Vec<Document>> {
        let mut visible: BTreeMap<RecordId, Document> = self
            .db
            .records()
            .scan_cluster(self.cluster)
            .into_iter()
            .map(|(id, stored)| {
                let mut document = stored.document;
                document.assign(id, stored.version);
                (id, document)
            })
            .collect();
        if let Some(txn) = self.txn {
            for (id, pending) in txn.writes() {
                if id.cluster != self.cluster {
                    continue;
                }
                match pending {
                    PendingRecord::Save(document) => {
                        visible.insert(*id, document.clone());
                    }
                    PendingRecord::Delete => {
                        visible.remove(id);
                    }
                }
            }
        }
        Ok(visible.into_values().collect())
    }

    fn pages(&self) -> &dyn PageRead {
        self.db.pages().as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::PropertyDef;
    use trellis_core::{index_key, IndexDefinition, PropertyType};

    fn db_with_unique_value() -> Arc<Database> {
        let db = Database::open_in_memory().unwrap();
        db.create_class("Item").unwrap();
        db.create_property("Item", PropertyDef::new("value", PropertyType::Integer))
            .unwrap();
        db.create_index(
            IndexDefinition::builder("Item.value", "Item")
                .property("value", PropertyType::Integer)
                .unique(),
        )
        .unwrap();
        db
    }

    #[test]
    fn test_begin_twice_and_commit_without_begin() {
        let db = db_with_unique_value();
        let mut session = db.session();
        assert!(matches!(session.commit(), Err(Error::InvalidOperation(_))));
        assert!(matches!(session.rollback(), Err(Error::InvalidOperation(_))));
        session.begin().unwrap();
        assert!(matches!(session.begin(), Err(Error::InvalidOperation(_))));
        assert!(session.transaction_id().is_some());
        session.rollback().unwrap();
        assert!(!session.in_transaction());
    }

    #[test]
    fn test_implicit_save_assigns_identity_and_version() {
        let db = db_with_unique_value();
        let mut session = db.session();
        let mut doc = Document::new("Item").with("value", 1i64);
        let id = session.save(&mut doc).unwrap();
        assert_eq!(doc.identity(), Some(id));
        assert_eq!(doc.version(), 1);
        assert!(!session.in_transaction());

        doc.set("value", 2i64);
        session.save(&mut doc).unwrap();
        assert_eq!(doc.version(), 2);
        assert_eq!(session.index_get("Item.value", &index_key![2i64]).unwrap(), vec![id]);
        assert!(session.index_get("Item.value", &index_key![1i64]).unwrap().is_empty());
    }

    #[test]
    fn test_pending_writes_visible_only_to_own_session() {
        let db = db_with_unique_value();
        let mut writer = db.session();
        let reader = db.session();
        writer.begin().unwrap();
        let id = writer
            .save(&mut Document::new("Item").with("value", 7i64))
            .unwrap();

        assert_eq!(writer.index_get("Item.value", &index_key![7i64]).unwrap(), vec![id]);
        assert!(writer.get_ignoring_transaction("Item.value", &index_key![7i64]).unwrap().is_empty());
        assert!(reader.index_get("Item.value", &index_key![7i64]).unwrap().is_empty());
        assert!(reader.index_changes("Item.value").is_none());
        assert!(matches!(reader.load(id), Err(Error::RecordNotFound(_))));

        writer.commit().unwrap();
        assert_eq!(reader.index_get("Item.value", &index_key![7i64]).unwrap(), vec![id]);
        assert_eq!(reader.load(id).unwrap().get("value"), &trellis_storage::Value::Int(7));
    }

    #[test]
    fn test_unique_violation_stages_nothing() {
        let db = db_with_unique_value();
        let mut session = db.session();
        let first = session.save(&mut Document::new("Item").with("value", 1i64)).unwrap();

        session.begin().unwrap();
        let err = session
            .save(&mut Document::new("Item").with("value", 1i64))
            .unwrap_err();
        match err {
            Error::DuplicateKey { existing, .. } => assert_eq!(existing, first),
            other => panic!("unexpected {other:?}"),
        }
        assert!(session.pending_operations().unwrap().is_empty());
        session.rollback().unwrap();
    }

    #[test]
    fn test_delete_then_reinsert_same_unique_key() {
        let db = db_with_unique_value();
        let mut session = db.session();
        session.begin().unwrap();
        let first = session.save(&mut Document::new("Item").with("value", 1i64)).unwrap();
        session.delete(first).unwrap();
        let second = session.save(&mut Document::new("Item").with("value", 1i64)).unwrap();
        assert_ne!(first, second);
        assert_eq!(session.index_get("Item.value", &index_key![1i64]).unwrap(), vec![second]);
        session.commit().unwrap();

        let index = db.index("Item.value").unwrap();
        assert_eq!(index.get(&index_key![1i64]).unwrap(), vec![second]);
        assert!(!db.records().contains(first));
    }

    #[test]
    fn test_update_unknown_record() {
        let db = db_with_unique_value();
        let mut session = db.session();
        let mut doc = Document::new("Item").with("value", 1i64);
        doc.assign(RecordId::new(1, 99), 1);
        assert!(matches!(session.save(&mut doc), Err(Error::RecordNotFound(_))));
        assert!(matches!(session.delete(RecordId::new(1, 99)), Err(Error::RecordNotFound(_))));
        assert_eq!(db.metrics().active_count, 0);
    }

    #[test]
    fn test_stale_update_conflicts() {
        let db = db_with_unique_value();
        let mut a = db.session();
        let mut b = db.session();
        let id = a.save(&mut Document::new("Item").with("value", 1i64)).unwrap();

        let mut from_a = a.load(id).unwrap();
        let mut from_b = b.load(id).unwrap();
        from_a.set("value", 2i64);
        a.save(&mut from_a).unwrap();

        from_b.set("value", 3i64);
        let err = b.save(&mut from_b).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(db.index("Item.value").unwrap().get(&index_key![2i64]).unwrap(), vec![id]);
    }

    #[test]
    fn test_staging_limit() {
        let mut config = crate::database::TrellisConfig::default();
        config.transaction.max_staged_records = 1;
        let db = Database::open(config).unwrap();
        db.create_class("Item").unwrap();
        let mut session = db.session();
        session.begin().unwrap();
        session.save(&mut Document::new("Item").with("value", 1i64)).unwrap();
        let err = session.save(&mut Document::new("Item").with("value", 2i64)).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_dropped_session_rolls_back() {
        let db = db_with_unique_value();
        {
            let mut session = db.session();
            session.begin().unwrap();
            session.save(&mut Document::new("Item").with("value", 1i64)).unwrap();
        }
        assert!(db.records().is_empty());
        assert_eq!(db.metrics().active_count, 0);
    }
}
