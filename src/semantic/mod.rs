//! Semantic leaf backend.
//!
//! Vectors are indexed in one HNSW graph per namespace. A bounded LRU cache
//! with per-entry TTL answers repeated queries without touching the graphs.
//! The leaf persists as `semantic.graph` plus `semantic.vectors`.

pub mod cache;
pub mod distance;
pub mod hnsw;
pub mod persist;
pub mod store;
pub mod vector;

pub use cache::{CacheKey, CacheStats, QueryCache};
pub use distance::DistanceMetric;
pub use hnsw::{GraphLayout, HnswGraph, HnswParams};
pub use store::{
    IndexOutcome, SemanticConfig, SemanticHits, SemanticRecovery, SemanticStats, SemanticStore,
};
pub use vector::Vector;
