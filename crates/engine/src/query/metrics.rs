//! Query metrics
//!
//! The executor reports planning decisions to a [`MetricsCollector`] handed
//! to it by the session. Nothing is global: two sessions with two collectors
//! observe only their own queries.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Receives planning events from the query executor
///
/// Every method has a no-op default so collectors implement only what they
/// count.
pub trait MetricsCollector: Send + Sync {
    /// A query was answered through `index`
    fn index_used(&self, index: &str) {
        let _ = index;
    }

    /// A closed range conjunction on `index` was served as one range scan
    fn range_converted(&self, index: &str) {
        let _ = index;
    }

    /// A query on `class` fell back to scanning every record
    fn full_scan(&self, class: &str) {
        let _ = class;
    }
}

/// Collector that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {}

/// Collector that counts events
///
/// Totals use Relaxed ordering; they are read after the queries finished.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    indexed: AtomicU64,
    converted: AtomicU64,
    full_scans: AtomicU64,
    per_index: Mutex<BTreeMap<String, u64>>,
}

impl CountingMetrics {
    /// Zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries answered through any index
    pub fn indexed_queries(&self) -> u64 {
        self.indexed.load(Ordering::Relaxed)
    }

    /// Range conjunctions served as one scan
    pub fn ranges_converted(&self) -> u64 {
        self.converted.load(Ordering::Relaxed)
    }

    /// Queries answered by scanning records
    pub fn full_scans(&self) -> u64 {
        self.full_scans.load(Ordering::Relaxed)
    }

    /// Queries answered through one index
    pub fn uses_of(&self, index: &str) -> u64 {
        self.per_index.lock().get(index).copied().unwrap_or(0)
    }

    /// Zero every counter
    pub fn reset(&self) {
        self.indexed.store(0, Ordering::Relaxed);
        self.converted.store(0, Ordering::Relaxed);
        self.full_scans.store(0, Ordering::Relaxed);
        self.per_index.lock().clear();
    }
}

impl MetricsCollector for CountingMetrics {
    fn index_used(&self, index: &str) {
        self.indexed.fetch_add(1, Ordering::Relaxed);
        *self.per_index.lock().entry(index.to_string()).or_insert(0) += 1;
    }

    fn range_converted(&self, _index: &str) {
        self.converted.fetch_add(1, Ordering::Relaxed);
    }

    fn full_scan(&self, _class: &str) {
        self.full_scans.fetch_add(1, Ordering::Relaxed);
    }
}
