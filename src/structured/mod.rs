//! Structured leaf backend.
//!
//! A write-ahead-logged key-value store keyed by `(namespace, key)` with
//! secondary indexes for key prefixes, tags and insertion order. It persists
//! as `structured.wal` plus a compacted `structured.snapshot`.

pub mod index;
pub mod snapshot;
pub mod store;
pub mod wal;

pub use index::StructuredIndex;
pub use store::{RecoveryReport, StructuredConfig, StructuredStats, StructuredStore, Written};

pub const WAL_FILE: &str = "structured.wal";
pub const SNAPSHOT_FILE: &str = "structured.snapshot";
