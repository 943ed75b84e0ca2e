//! Coordinator counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::coordinator::types::CoordinatorState;
use crate::semantic::SemanticStats;
use crate::structured::StructuredStats;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub writes: AtomicU64,
    pub write_failures: AtomicU64,
    pub partial_writes: AtomicU64,
    pub deletes: AtomicU64,
    pub structured_queries: AtomicU64,
    pub semantic_queries: AtomicU64,
    pub hybrid_queries: AtomicU64,
    pub timeouts: AtomicU64,
    pub degraded_responses: AtomicU64,
    pub repairs: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CounterSnapshot {
            writes: load(&self.writes),
            write_failures: load(&self.write_failures),
            partial_writes: load(&self.partial_writes),
            deletes: load(&self.deletes),
            structured_queries: load(&self.structured_queries),
            semantic_queries: load(&self.semantic_queries),
            hybrid_queries: load(&self.hybrid_queries),
            timeouts: load(&self.timeouts),
            degraded_responses: load(&self.degraded_responses),
            repairs: load(&self.repairs),
        }
    }
}

/// Counter values at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub writes: u64,
    pub write_failures: u64,
    /// Stores whose semantic half failed.
    pub partial_writes: u64,
    pub deletes: u64,
    pub structured_queries: u64,
    pub semantic_queries: u64,
    pub hybrid_queries: u64,
    /// Leaf calls cut off by a query deadline.
    pub timeouts: u64,
    /// Responses answered by a single surviving leaf.
    pub degraded_responses: u64,
    pub repairs: u64,
}

/// Coordinator statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub state: CoordinatorState,
    pub uptime_ms: u64,
    pub structured: StructuredStats,
    pub semantic: SemanticStats,
    pub counters: CounterSnapshot,
}
