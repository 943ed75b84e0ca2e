//! # Hybrid Memory
//!
//! A memory backend that keeps every entry in two places: a write-ahead-logged
//! structured store for exact, filterable lookups and an HNSW vector index for
//! similarity search. A coordinator writes to both, routes each query to the
//! right store (or both), and merges hybrid results.
//!
//! ## Features
//!
//! - Durable structured leaf with WAL, snapshots and torn-tail recovery
//! - Per-namespace HNSW graphs with a bounded LRU/TTL query cache
//! - Strict or best-effort dual writes with repair of partial failures
//! - Four hybrid combine strategies
//! - Namespace isolation with an explicit cross-namespace wildcard
//! - Health monitoring with automatic degraded-mode routing
//! - Pluggable storage backends (directory or in-memory)

pub mod cli;
pub mod coordinator;
pub mod embedding;
pub mod entry;
pub mod error;
pub mod health;
pub mod namespace;
pub mod query;
pub mod semantic;
pub mod storage;
pub mod structured;

pub mod prelude {
    pub use crate::coordinator::{
        CoordinatorState, DualWriteMode, HybridCoordinator, HybridMemoryConfig, RoutingStrategy,
        WriteResult,
    };
    pub use crate::embedding::EmbeddingGenerator;
    pub use crate::entry::{MemoryEntry, StoreRequest, SyncState};
    pub use crate::error::{MemoryError, Result};
    pub use crate::query::{
        CombineStrategy, HybridQuery, QueryOptions, QueryResponse, QuerySpec, SemanticQuery,
        StructuredFilter,
    };
    pub use crate::semantic::Vector;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
