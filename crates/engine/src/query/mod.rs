//! Index-aware queries over one class
//!
//! A query is a [`Predicate`] over the fields of a class. The
//! [`QueryExecutor`] plans an access path (see [`planner`]), reads candidate
//! ids through an [`IndexMergeCursor`] so the caller's own pending changes
//! are visible, loads the documents and re-checks the whole predicate.
//!
//! Planning decisions go to the [`MetricsCollector`] the executor was built
//! with and are also returned with the result as a [`PlanSummary`].

pub mod eval;
pub mod metrics;
pub mod planner;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use trellis_concurrency::{IndexMergeCursor, TransactionIndexChanges};
use trellis_core::{PageRead, RecordId, Result};
use trellis_storage::{Document, PersistedIndex, Value};

pub use eval::Evaluator;
pub use metrics::{CountingMetrics, MetricsCollector, NoopMetrics};
pub use planner::AccessPath;

/// Filter over document fields
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `field = value`; on a collection, the collection contains `value`
    Eq(String, Value),
    /// `field > value`
    Gt(String, Value),
    /// `field >= value`
    Ge(String, Value),
    /// `field < value`
    Lt(String, Value),
    /// `field <= value`
    Le(String, Value),
    /// `field IS NULL`
    IsNull(String),
    /// `field IN (values)`
    In(String, Vec<Value>),
    /// Conjunction; may nest
    And(Vec<Predicate>),
}

impl Predicate {
    /// `field = value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq(field.into(), value.into())
    }

    /// `field > value`
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Gt(field.into(), value.into())
    }

    /// `field >= value`
    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Ge(field.into(), value.into())
    }

    /// `field < value`
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Lt(field.into(), value.into())
    }

    /// `field <= value`
    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Le(field.into(), value.into())
    }

    /// `field IS NULL`
    pub fn is_null(field: impl Into<String>) -> Self {
        Predicate::IsNull(field.into())
    }

    /// `field IN (values)`
    pub fn in_list(field: impl Into<String>, values: Vec<Value>) -> Self {
        Predicate::In(field.into(), values)
    }

    /// Conjunction of `parts`
    pub fn and(parts: Vec<Predicate>) -> Self {
        Predicate::And(parts)
    }

    /// Field a leaf predicate constrains
    pub fn field(&self) -> Option<&str> {
        match self {
            Predicate::Eq(f, _)
            | Predicate::Gt(f, _)
            | Predicate::Ge(f, _)
            | Predicate::Lt(f, _)
            | Predicate::Le(f, _)
            | Predicate::In(f, _)
            | Predicate::IsNull(f) => Some(f),
            Predicate::And(_) => None,
        }
    }
}

/// How a query was answered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSummary {
    /// Index used, if any
    pub index: Option<String>,
    /// Whether a closed range conjunction was served as one range scan
    pub range_converted: bool,
    /// Whether every record of the class was scanned
    pub full_scan: bool,
}

/// Documents matching a query, with the plan that found them
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Matching documents, in index order for indexed plans
    pub documents: Vec<Document>,
    /// How they were found
    pub plan: PlanSummary,
}

impl QueryResult {
    /// Identities of the matching documents
    pub fn ids(&self) -> Vec<RecordId> {
        self.documents.iter().filter_map(Document::identity).collect()
    }

    /// Number of matching documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether nothing matched
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// The state a query reads: committed data plus the reader's own pending work
pub trait QuerySource {
    /// Indexes over the queried class, by name
    fn class_indexes(&self, class: &str) -> Vec<Arc<PersistedIndex>>;

    /// The reader's overlay for an index
    fn overlay(&self, index: &str) -> Option<&TransactionIndexChanges>;

    /// A record as the reader sees it, `None` when absent or deleted
    fn visible_record(&self, id: RecordId) -> Result<Option<Document>>;

    /// Every record of a class as the reader sees it
    fn visible_records(&self, class: &str) -> Result<Vec<Document>>;

    /// Pages backing tree-backed collections
    fn pages(&self) -> &dyn PageRead;
}

/// Plans and runs queries, reporting to an injected collector
pub struct QueryExecutor {
    metrics: Arc<dyn MetricsCollector>,
}

impl QueryExecutor {
    /// Executor reporting to `metrics`
    pub fn new(metrics: Arc<dyn MetricsCollector>) -> Self {
        QueryExecutor { metrics }
    }

    /// Run `predicate` over `class`
    pub fn execute(
        &self,
        source: &dyn QuerySource,
        evaluator: &Evaluator<'_>,
        class: &str,
        predicate: &Predicate,
    ) -> Result<QueryResult> {
        let indexes = source.class_indexes(class);
        let path = planner::plan(predicate, &indexes);
        debug!(class, path = ?path, "Query planned");

        let plan = PlanSummary {
            index: path.index_name(),
            range_converted: path.is_converted(),
            full_scan: matches!(path, AccessPath::FullScan),
        };
        let candidates = match &path {
            AccessPath::FullScan => {
                self.metrics.full_scan(class);
                source.visible_records(class)?
            }
            AccessPath::Points { index, keys } => {
                self.metrics.index_used(&index.name());
                let cursor = IndexMergeCursor::new(index, source.overlay(&index.name()));
                let ids = cursor.point_lookup(keys, true)?.into_iter().map(|(_, id)| id);
                load_distinct(source, ids)?
            }
            AccessPath::Ranges {
                index,
                ranges,
                converted,
            } => {
                let name = index.name();
                self.metrics.index_used(&name);
                if *converted {
                    self.metrics.range_converted(&name);
                }
                let cursor = IndexMergeCursor::new(index, source.overlay(&name));
                let mut ids = Vec::new();
                for range in ranges {
                    ids.extend(cursor.range(range, true)?.into_iter().map(|(_, id)| id));
                }
                load_distinct(source, ids)?
            }
        };

        let mut documents = Vec::with_capacity(candidates.len());
        for document in candidates {
            if evaluator.matches(predicate, &document)? {
                documents.push(document);
            }
        }
        Ok(QueryResult { documents, plan })
    }
}

fn load_distinct(
    source: &dyn QuerySource,
    ids: impl IntoIterator<Item = RecordId>,
) -> Result<Vec<Document>> {
    let mut seen = HashSet::new();
    let mut documents = Vec::new();
    for id in ids {
        if seen.insert(id) {
            if let Some(document) = source.visible_record(id)? {
                documents.push(document);
            }
        }
    }
    Ok(documents)
}
