//! Memory entry data model.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::semantic::Vector;

/// Identifier shared by both leaves for one `(namespace, key)` pair.
pub type EntryId = Uuid;

/// Derive the stable id of an entry from its upsert identity.
pub fn entry_id(namespace: &str, key: &str) -> EntryId {
    let mut name = Vec::with_capacity(namespace.len() + key.len() + 1);
    name.extend_from_slice(namespace.as_bytes());
    name.push(0);
    name.extend_from_slice(key.as_bytes());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, &name)
}

/// Replication state of an entry across the two leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Present in both leaves.
    Synced,
    /// No vector was produced; lives in the structured leaf only.
    #[default]
    StructuredOnly,
    /// Has a vector but the semantic write failed. Eligible for repair.
    PendingRepair,
}

impl SyncState {
    pub fn name(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::StructuredOnly => "structured_only",
            SyncState::PendingRepair => "pending_repair",
        }
    }
}

/// A stored memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: EntryId,
    pub namespace: String,
    pub key: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vector>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub sync: SyncState,
    /// Insertion sequence assigned by the structured leaf on first insert.
    #[serde(default)]
    pub seq: u64,
}

impl MemoryEntry {
    /// Create a new entry stamped with the current time.
    pub fn new(
        namespace: impl Into<String>,
        key: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        let key = key.into();
        let now = Utc::now();
        MemoryEntry {
            id: entry_id(&namespace, &key),
            namespace,
            key,
            content: content.into(),
            vector: None,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            ttl_ms: None,
            sync: SyncState::StructuredOnly,
            seq: 0,
        }
    }

    pub fn with_vector(mut self, vector: impl Into<Vector>) -> Self {
        self.vector = Some(vector.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    /// Whether the entry carries an embedding.
    pub fn has_vector(&self) -> bool {
        self.vector.is_some()
    }

    /// Whether the entry's TTL has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_ms {
            Some(ttl) => {
                let age = now.signed_duration_since(self.updated_at);
                age.num_milliseconds() >= ttl as i64
            }
            None => false,
        }
    }

    /// Whether `other` holds the same write of this entry.
    ///
    /// Compares what a caller wrote, not what a leaf assigned (`seq`,
    /// `created_at` and `sync`).
    pub fn same_revision(&self, other: &MemoryEntry) -> bool {
        self.id == other.id
            && self.updated_at == other.updated_at
            && self.content == other.content
            && self.vector == other.vector
            && self.tags == other.tags
            && self.metadata == other.metadata
            && self.ttl_ms == other.ttl_ms
    }

    /// Check the fields every leaf relies on.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(MemoryError::validation("namespace is required"));
        }
        if self.key.is_empty() {
            return Err(MemoryError::validation("key is required"));
        }
        if self.id != entry_id(&self.namespace, &self.key) {
            return Err(MemoryError::validation(format!(
                "entry id does not match ({}, {})",
                self.namespace, self.key
            )));
        }
        Ok(())
    }

    /// Copy of the entry without its vector, as the structured leaf reports it
    /// to callers that do not need the embedding.
    pub fn without_vector(&self) -> Self {
        let mut entry = self.clone();
        entry.vector = None;
        entry
    }
}

/// Caller-facing write request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreRequest {
    /// Target namespace; the configured default is used when absent.
    pub namespace: Option<String>,
    pub key: String,
    pub content: String,
    /// Precomputed embedding. When absent the coordinator asks its embedder.
    pub vector: Option<Vector>,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, String>,
    pub ttl_ms: Option<u64>,
}

impl StoreRequest {
    pub fn new(key: impl Into<String>, content: impl Into<String>) -> Self {
        StoreRequest {
            key: key.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_vector(mut self, vector: impl Into<Vector>) -> Self {
        self.vector = Some(vector.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    /// Build the entry for a resolved namespace.
    pub fn into_entry(self, namespace: String) -> MemoryEntry {
        let mut entry = MemoryEntry::new(namespace, self.key, self.content);
        entry.vector = self.vector;
        entry.tags = self.tags;
        entry.metadata = self.metadata;
        entry.ttl_ms = self.ttl_ms;
        entry
    }
}
