//! Values returned by the coordinator.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entry::{EntryId, SyncState};

/// Lifecycle of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Uninitialized,
    Initializing,
    Ready,
    /// A leaf is unhealthy; operations are served by the survivor.
    Degraded,
    /// Terminal.
    Closed,
}

impl CoordinatorState {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorState::Uninitialized => "uninitialized",
            CoordinatorState::Initializing => "initializing",
            CoordinatorState::Ready => "ready",
            CoordinatorState::Degraded => "degraded",
            CoordinatorState::Closed => "closed",
        }
    }

    /// Whether operations are accepted in this state.
    pub fn is_serving(&self) -> bool {
        matches!(self, CoordinatorState::Ready | CoordinatorState::Degraded)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A non-fatal dual-write problem. The entry is flagged for repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyWarning {
    /// The embedding generator failed, so no vector was written.
    EmbeddingFailed { reason: String },
    /// The semantic half of the write failed.
    SemanticWriteFailed { reason: String },
    /// Both halves committed but the structured leaf could not record it.
    SyncStateNotRecorded { reason: String },
    /// A concurrent write to the same key left the leaves holding different
    /// revisions. The entry stays pending until repaired.
    ConcurrentOverwrite,
}

impl fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyWarning::EmbeddingFailed { reason } => {
                write!(f, "embedding failed: {reason}")
            }
            ConsistencyWarning::SemanticWriteFailed { reason } => {
                write!(f, "semantic write failed: {reason}")
            }
            ConsistencyWarning::SyncStateNotRecorded { reason } => {
                write!(f, "sync state not recorded: {reason}")
            }
            ConsistencyWarning::ConcurrentOverwrite => {
                write!(f, "a concurrent write left the leaves out of step")
            }
        }
    }
}

/// Outcome of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub id: EntryId,
    pub namespace: String,
    pub key: String,
    pub structured_ok: bool,
    pub semantic_ok: bool,
    /// False when an existing entry was replaced.
    pub created: bool,
    /// Sync state recorded for the entry.
    pub sync: SyncState,
    pub warnings: Vec<ConsistencyWarning>,
}

impl WriteResult {
    /// Both halves committed, or the entry had no semantic half.
    pub fn is_consistent(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Outcome of a delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub structured: bool,
    pub semantic: bool,
}

impl DeleteResult {
    /// Whether either leaf held the entry.
    pub fn existed(&self) -> bool {
        self.structured || self.semantic
    }
}

/// What a repair pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    /// `PendingRepair` entries whose semantic half was written.
    pub retried: usize,
    /// `StructuredOnly` entries embedded and indexed.
    pub backfilled: usize,
    /// Synced entries re-indexed because the semantic copy was missing or
    /// held a different revision.
    pub resynced: usize,
    /// Semantic entries without a structured counterpart, removed.
    pub orphans_removed: usize,
    /// Expired entries purged from either leaf.
    pub expired_purged: usize,
    /// Entries that could not be repaired, with the reason.
    pub failures: Vec<String>,
}

impl RepairReport {
    pub fn changed(&self) -> usize {
        self.retried + self.backfilled + self.resynced + self.orphans_removed + self.expired_purged
    }
}

impl fmt::Display for RepairReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "retried {}, backfilled {}, resynced {}, orphans removed {}, expired purged {}, failures {}",
            self.retried,
            self.backfilled,
            self.resynced,
            self.orphans_removed,
            self.expired_purged,
            self.failures.len()
        )
    }
}
