//! Database engine for trellis
//!
//! This crate orchestrates all lower layers:
//! - Database: records, schema, persisted indexes and the page store
//! - Session: transactions, record writes with index maintenance, index reads
//! - Maintenance: key extraction and per-record index deltas
//! - Query: predicate planning over indexes, range-to-between detection
//! - Transaction coordination and statistics
//!
//! The engine is the only component that knows about:
//! - The schema and how it constrains index definitions
//! - Which indexes a record write touches
//! - Configuration loaded from `trellis.toml`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod database;
pub mod maintenance;
pub mod query;
pub mod session;

pub use coordinator::{TransactionCoordinator, TransactionMetrics};
pub use database::{
    ClassDef, Database, IndexConfig, LinkBagConfig, PropertyDef, RetryConfig, Schema,
    TransactionConfig, TrellisConfig,
};
pub use maintenance::{compute_delta, extract_keys, IndexDelta};
pub use query::{
    CountingMetrics, MetricsCollector, NoopMetrics, PlanSummary, Predicate, QueryResult,
};
pub use session::Session;
