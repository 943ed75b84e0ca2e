//! The structured leaf: a journaled key-value store with exact, prefix and tag
//! lookups.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::entry::{EntryId, MemoryEntry, SyncState};
use crate::error::{MemoryError, Result};
use crate::health::{HealthStatus, LeafHealth};
use crate::namespace::NamespaceScope;
use crate::query::StructuredFilter;
use crate::storage::Storage;
use crate::structured::index::StructuredIndex;
use crate::structured::snapshot::{Snapshot, read_snapshot, salvage_snapshot, write_snapshot};
use crate::structured::wal::{Lsn, WalOp, WalRecord, WalWriter, read_wal};
use crate::structured::{SNAPSHOT_FILE, WAL_FILE};

/// Tuning for the structured leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredConfig {
    /// Maximum live entries; `0` disables the limit.
    pub max_entries: usize,
    /// WAL records accumulated before an automatic checkpoint; `0` disables it.
    pub wal_compaction_threshold: usize,
}

impl Default for StructuredConfig {
    fn default() -> Self {
        StructuredConfig {
            max_entries: 100_000,
            wal_compaction_threshold: 1_000,
        }
    }
}

/// Acknowledgement of a durable structured write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Written {
    pub id: EntryId,
    pub seq: u64,
    /// False when an existing live entry was replaced.
    pub created: bool,
    pub created_at: DateTime<Utc>,
}

/// What `recover` or `rebuild` found on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub snapshot_entries: usize,
    pub replayed_records: usize,
    pub torn_tail: Option<String>,
    pub corruption: Option<String>,
}

/// Counters and sizes for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredStats {
    pub entries: usize,
    pub namespaces: usize,
    pub last_lsn: Lsn,
    pub next_seq: u64,
    pub wal_bytes: u64,
    pub wal_records_since_checkpoint: usize,
    pub snapshot_bytes: u64,
    pub writes: u64,
    pub deletes: u64,
    pub reads: u64,
    pub expired_evictions: u64,
    pub checkpoints: u64,
    pub online: bool,
    pub corrupt: bool,
}

#[derive(Debug)]
struct WriterState {
    wal: WalWriter,
    next_lsn: Lsn,
    next_seq: u64,
    since_checkpoint: usize,
}

#[derive(Debug, Default)]
struct Counters {
    writes: AtomicU64,
    deletes: AtomicU64,
    reads: AtomicU64,
    evictions: AtomicU64,
    checkpoints: AtomicU64,
}

/// Single-writer, multi-reader structured store.
///
/// Mutations take the writer lock, append to the WAL, and only then swap the
/// new entry into the live index under a short write lock. Readers hold the
/// index read lock and clone out `Arc`ed entries, so they see the index either
/// before or after a write, never in between.
#[derive(Debug)]
pub struct StructuredStore {
    storage: Arc<dyn Storage>,
    config: StructuredConfig,
    index: RwLock<StructuredIndex>,
    writer: Mutex<WriterState>,
    online: AtomicBool,
    corruption: RwLock<Option<String>>,
    last_write_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    counters: Counters,
}

impl StructuredStore {
    /// Open the store and recover its state from `storage`.
    ///
    /// Corruption does not fail the open; the store comes up read-only and
    /// reports itself unhealthy until [`StructuredStore::rebuild`] runs.
    pub fn open(storage: Arc<dyn Storage>, config: StructuredConfig) -> Result<Self> {
        let store = StructuredStore {
            writer: Mutex::new(WriterState {
                wal: WalWriter::new(storage.clone(), WAL_FILE),
                next_lsn: 1,
                next_seq: 1,
                since_checkpoint: 0,
            }),
            storage,
            config,
            index: RwLock::new(StructuredIndex::new()),
            online: AtomicBool::new(true),
            corruption: RwLock::new(None),
            last_write_at: RwLock::new(None),
            last_error: RwLock::new(None),
            counters: Counters::default(),
        };

        let report = store.recover()?;
        info!(
            "Opened structured store: {} entries ({} from snapshot, {} replayed)",
            store.len(),
            report.snapshot_entries,
            report.replayed_records
        );
        Ok(store)
    }

    /// Open a store with no persisted state, backed by memory.
    pub fn in_memory() -> Result<Self> {
        Self::open(
            Arc::new(crate::storage::MemoryStorage::new()),
            StructuredConfig::default(),
        )
    }

    pub fn config(&self) -> &StructuredConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Take the leaf offline (or back online) for maintenance.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        info!(
            "Structured store is now {}",
            if online { "online" } else { "offline" }
        );
    }

    pub fn corruption(&self) -> Option<String> {
        self.corruption.read().clone()
    }

    pub fn is_corrupt(&self) -> bool {
        self.corruption.read().is_some()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(MemoryError::unavailable("structured store is offline"))
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_online()?;
        match self.corruption.read().as_ref() {
            Some(reason) => Err(MemoryError::corrupt(format!(
                "structured store refuses writes until rebuilt: {reason}"
            ))),
            None => Ok(()),
        }
    }

    fn journal(&self, state: &mut WriterState, op: WalOp) -> Result<Lsn> {
        let lsn = state.next_lsn;
        if let Err(e) = state.wal.append(&WalRecord { lsn, op }) {
            *self.last_error.write() = Some(e.to_string());
            return Err(e);
        }
        state.next_lsn += 1;
        state.since_checkpoint += 1;
        Ok(lsn)
    }

    fn note_write(&self, now: DateTime<Utc>) {
        *self.last_write_at.write() = Some(now);
        *self.last_error.write() = None;
    }

    fn maybe_checkpoint(&self, state: &mut WriterState) {
        let threshold = self.config.wal_compaction_threshold;
        if threshold > 0 && state.since_checkpoint >= threshold {
            if let Err(e) = self.checkpoint_locked(state) {
                // The records are still durable in the WAL.
                warn!("Automatic structured checkpoint failed: {e}");
            }
        }
    }

    /// Durably insert or replace the entry at `(namespace, key)`.
    ///
    /// An upsert keeps the existing id, `created_at` and insertion sequence.
    pub fn store(&self, entry: MemoryEntry) -> Result<Written> {
        self.ensure_writable()?;
        entry.validate()?;

        let mut state = self.writer.lock();
        let now = Utc::now();
        let mut entry = entry;

        let existing = self.index.read().get(&entry.namespace, &entry.key).cloned();
        let live = existing.as_ref().filter(|prev| !prev.is_expired(now));

        let created = match live {
            Some(prev) => {
                entry.id = prev.id;
                entry.created_at = prev.created_at;
                entry.seq = prev.seq;
                false
            }
            None => {
                let max = self.config.max_entries;
                if max > 0 && existing.is_none() && self.index.read().len() >= max {
                    self.purge_expired_locked(&mut state, now)?;
                    if self.index.read().len() >= max {
                        return Err(MemoryError::capacity(format!(
                            "structured store holds the maximum of {max} entries"
                        )));
                    }
                }
                entry.seq = state.next_seq;
                true
            }
        };

        self.journal(&mut state, WalOp::Upsert {
            entry: entry.clone(),
        })?;
        if created {
            state.next_seq += 1;
        }

        let written = Written {
            id: entry.id,
            seq: entry.seq,
            created,
            created_at: entry.created_at,
        };
        debug!(
            "Stored {}/{} (seq {}, created {})",
            entry.namespace, entry.key, entry.seq, created
        );
        self.index.write().upsert(entry);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.note_write(now);
        self.maybe_checkpoint(&mut state);

        Ok(written)
    }

    /// Exact lookup. Expired entries are evicted and reported as missing.
    pub fn get_by_key(&self, namespace: &str, key: &str) -> Result<Option<MemoryEntry>> {
        self.ensure_online()?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);

        let found = self.index.read().get(namespace, key).cloned();
        match found {
            Some(entry) if entry.is_expired(Utc::now()) => {
                self.evict_expired(namespace, key);
                Ok(None)
            }
            Some(entry) => Ok(Some((*entry).clone())),
            None => Ok(None),
        }
    }

    fn evict_expired(&self, namespace: &str, key: &str) {
        if self.is_corrupt() {
            return;
        }

        let mut state = self.writer.lock();
        let now = Utc::now();
        let still_expired = self
            .index
            .read()
            .get(namespace, key)
            .is_some_and(|entry| entry.is_expired(now));
        if !still_expired {
            return;
        }

        let op = WalOp::Delete {
            namespace: namespace.to_string(),
            key: key.to_string(),
        };
        match self.journal(&mut state, op) {
            Ok(_) => {
                self.index.write().remove(namespace, key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted expired entry {namespace}/{key}");
            }
            Err(e) => warn!("Failed to journal eviction of {namespace}/{key}: {e}"),
        }
    }

    /// Evaluate a filter within `scope`.
    pub fn query(
        &self,
        filter: &StructuredFilter,
        scope: &NamespaceScope,
    ) -> Result<Vec<MemoryEntry>> {
        self.ensure_online()?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);

        let results = self.index.read().query(filter, scope, Utc::now());
        Ok(results.into_iter().map(|entry| (*entry).clone()).collect())
    }

    /// Remove an entry. Returns whether a live entry was removed.
    pub fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.ensure_writable()?;

        let mut state = self.writer.lock();
        let Some(existing) = self.index.read().get(namespace, key).cloned() else {
            return Ok(false);
        };

        let now = Utc::now();
        self.journal(&mut state, WalOp::Delete {
            namespace: namespace.to_string(),
            key: key.to_string(),
        })?;
        self.index.write().remove(namespace, key);
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.note_write(now);
        self.maybe_checkpoint(&mut state);

        Ok(!existing.is_expired(now))
    }

    /// Record the replication state of an entry. Returns false when absent.
    pub fn set_sync_state(&self, namespace: &str, key: &str, sync: SyncState) -> Result<bool> {
        self.ensure_writable()?;

        let mut state = self.writer.lock();
        let current = self.index.read().get(namespace, key).map(|entry| entry.sync);
        match current {
            None => Ok(false),
            Some(current) if current == sync => Ok(true),
            Some(_) => {
                self.journal(&mut state, WalOp::SetSync {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                    state: sync,
                })?;
                self.index.write().set_sync_state(namespace, key, sync);
                self.maybe_checkpoint(&mut state);
                Ok(true)
            }
        }
    }

    /// Live entries in the given replication state, in insertion order.
    pub fn entries_with_state(&self, sync: SyncState) -> Result<Vec<MemoryEntry>> {
        self.ensure_online()?;
        let now = Utc::now();
        let index = self.index.read();
        Ok(index
            .scan(&NamespaceScope::All)
            .filter(|entry| entry.sync == sync && !entry.is_expired(now))
            .map(|entry| (**entry).clone())
            .collect())
    }

    /// Every live entry in `scope`, in insertion order per namespace.
    pub fn scan(&self, scope: &NamespaceScope) -> Result<Vec<MemoryEntry>> {
        self.ensure_online()?;
        let now = Utc::now();
        let index = self.index.read();
        Ok(index
            .scan(scope)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| (**entry).clone())
            .collect())
    }

    /// Remove every expired entry. Returns the removed entries.
    pub fn purge_expired(&self) -> Result<Vec<MemoryEntry>> {
        self.ensure_writable()?;
        let mut state = self.writer.lock();
        let purged = self.purge_expired_locked(&mut state, Utc::now())?;
        if !purged.is_empty() {
            info!("Purged {} expired structured entries", purged.len());
            self.maybe_checkpoint(&mut state);
        }
        Ok(purged)
    }

    fn purge_expired_locked(
        &self,
        state: &mut WriterState,
        now: DateTime<Utc>,
    ) -> Result<Vec<MemoryEntry>> {
        let expired = self.index.read().expired(now);
        let mut purged = Vec::with_capacity(expired.len());

        for entry in expired {
            self.journal(state, WalOp::Delete {
                namespace: entry.namespace.clone(),
                key: entry.key.clone(),
            })?;
            self.index.write().remove(&entry.namespace, &entry.key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            purged.push((*entry).clone());
        }
        Ok(purged)
    }

    /// Namespaces holding at least one entry.
    pub fn namespaces(&self) -> Vec<String> {
        self.index.read().namespaces().map(str::to_string).collect()
    }

    /// Per-namespace count of live entries not yet present in the semantic leaf.
    pub fn coverage_gaps(&self) -> BTreeMap<String, usize> {
        let now = Utc::now();
        let mut gaps = BTreeMap::new();
        let index = self.index.read();
        for entry in index.scan(&NamespaceScope::All) {
            if entry.sync != SyncState::Synced && !entry.is_expired(now) {
                *gaps.entry(entry.namespace.clone()).or_insert(0) += 1;
            }
        }
        gaps
    }

    /// Write a snapshot of the live index and truncate the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_writable()?;
        let mut state = self.writer.lock();
        self.checkpoint_locked(&mut state)
    }

    fn checkpoint_locked(&self, state: &mut WriterState) -> Result<()> {
        let snapshot = Snapshot::new(
            state.next_lsn.saturating_sub(1),
            state.next_seq,
            self.index.read().entries_by_seq(),
        );
        write_snapshot(self.storage.as_ref(), SNAPSHOT_FILE, &snapshot)?;
        state.wal.truncate()?;
        state.since_checkpoint = 0;
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        info!(
            "Structured checkpoint at lsn {} ({} entries)",
            snapshot.last_lsn,
            snapshot.entries.len()
        );
        Ok(())
    }

    /// Reload the index from the snapshot and WAL.
    ///
    /// A torn WAL tail is dropped and compacted away. A corrupt snapshot or a
    /// damaged record before the end of the log marks the store corrupt.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut state = self.writer.lock();
        let mut report = RecoveryReport::default();
        let mut index = StructuredIndex::new();
        let mut snapshot_lsn: Lsn = 0;
        let mut next_seq: u64 = 1;

        match read_snapshot(self.storage.as_ref(), SNAPSHOT_FILE) {
            Ok(Some(snapshot)) => {
                snapshot_lsn = snapshot.last_lsn;
                next_seq = snapshot.next_seq;
                report.snapshot_entries = snapshot.entries.len();
                for entry in snapshot.entries {
                    index.upsert(entry);
                }
            }
            Ok(None) => {}
            Err(e) if e.is_corruption() => report.corruption = Some(e.to_string()),
            Err(e) => return Err(e),
        }

        let outcome = read_wal(self.storage.as_ref(), WAL_FILE)?;
        let replay = replay_records(&mut index, outcome.records, snapshot_lsn);
        report.replayed_records = replay.applied;
        report.torn_tail = outcome.torn_tail;
        if let Some(damage) = outcome.corruption {
            report.corruption = Some(match report.corruption.take() {
                Some(previous) => format!("{previous}; WAL: {damage}"),
                None => format!("WAL: {damage}"),
            });
        }

        next_seq = next_seq
            .max(replay.max_seq + 1)
            .max(index.max_seq().map_or(1, |seq| seq + 1));
        state.next_lsn = snapshot_lsn.max(replay.max_lsn) + 1;
        state.next_seq = next_seq;
        state.since_checkpoint = replay.applied;
        state.wal = WalWriter::new(self.storage.clone(), WAL_FILE);

        *self.index.write() = index;
        *self.corruption.write() = report.corruption.clone();

        if let Some(reason) = &report.corruption {
            error!("Structured store is corrupt and refuses writes: {reason}");
        } else if let Some(tail) = &report.torn_tail {
            warn!("Discarding torn structured WAL tail: {tail}");
            self.checkpoint_locked(&mut state)?;
        }

        Ok(report)
    }

    /// Rebuild the index from whatever snapshot and WAL data is still readable,
    /// then clear the corrupt flag.
    ///
    /// Records after the first damaged WAL frame are lost.
    pub fn rebuild(&self) -> Result<RecoveryReport> {
        self.ensure_online()?;
        let mut state = self.writer.lock();
        let mut report = RecoveryReport::default();
        let mut index = StructuredIndex::new();
        let mut snapshot_lsn: Lsn = 0;
        let mut next_seq: u64 = 1;

        if let Some(snapshot) = salvage_snapshot(self.storage.as_ref(), SNAPSHOT_FILE) {
            snapshot_lsn = snapshot.last_lsn;
            next_seq = snapshot.next_seq;
            report.snapshot_entries = snapshot.entries.len();
            for entry in snapshot.entries {
                index.upsert(entry);
            }
        }

        let outcome = read_wal(self.storage.as_ref(), WAL_FILE)?;
        let replay = replay_records(&mut index, outcome.records, snapshot_lsn);
        report.replayed_records = replay.applied;
        report.torn_tail = outcome.torn_tail;
        if let Some(damage) = outcome.corruption {
            warn!("Rebuild drops WAL records after damage: {damage}");
            report.corruption = Some(damage);
        }

        state.next_lsn = snapshot_lsn.max(replay.max_lsn) + 1;
        state.next_seq = next_seq
            .max(replay.max_seq + 1)
            .max(index.max_seq().map_or(1, |seq| seq + 1));
        state.wal = WalWriter::new(self.storage.clone(), WAL_FILE);

        *self.index.write() = index;
        self.checkpoint_locked(&mut state)?;
        *self.corruption.write() = None;
        *self.last_error.write() = None;

        info!(
            "Rebuilt structured store: {} entries ({} from snapshot, {} replayed)",
            self.len(),
            report.snapshot_entries,
            report.replayed_records
        );
        Ok(report)
    }

    pub fn stats(&self) -> StructuredStats {
        let state = self.writer.lock();
        let index = self.index.read();
        StructuredStats {
            entries: index.len(),
            namespaces: index.namespaces().count(),
            last_lsn: state.next_lsn.saturating_sub(1),
            next_seq: state.next_seq,
            wal_bytes: state.wal.size(),
            wal_records_since_checkpoint: state.since_checkpoint,
            snapshot_bytes: self.storage.file_size(SNAPSHOT_FILE).unwrap_or(0),
            writes: self.counters.writes.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            reads: self.counters.reads.load(Ordering::Relaxed),
            expired_evictions: self.counters.evictions.load(Ordering::Relaxed),
            checkpoints: self.counters.checkpoints.load(Ordering::Relaxed),
            online: self.is_online(),
            corrupt: self.is_corrupt(),
        }
    }

    pub fn health(&self) -> LeafHealth {
        let corruption = self.corruption();
        let last_error = self.last_error.read().clone();
        let (status, detail) = if !self.is_online() {
            (HealthStatus::Unhealthy, Some("offline".to_string()))
        } else if let Some(reason) = corruption {
            (HealthStatus::Unhealthy, Some(format!("corrupt: {reason}")))
        } else if last_error.is_some() {
            (HealthStatus::Degraded, Some("last write failed".to_string()))
        } else {
            (HealthStatus::Healthy, None)
        };

        LeafHealth {
            status,
            entries: self.len(),
            last_write_at: *self.last_write_at.read(),
            last_error,
            detail,
        }
    }
}

#[derive(Debug, Default)]
struct ReplayOutcome {
    applied: usize,
    max_lsn: Lsn,
    max_seq: u64,
}

fn replay_records(
    index: &mut StructuredIndex,
    records: Vec<WalRecord>,
    after_lsn: Lsn,
) -> ReplayOutcome {
    let mut outcome = ReplayOutcome::default();
    for record in records {
        outcome.max_lsn = outcome.max_lsn.max(record.lsn);
        if record.lsn <= after_lsn {
            continue;
        }
        match record.op {
            WalOp::Upsert { entry } => {
                outcome.max_seq = outcome.max_seq.max(entry.seq);
                index.upsert(entry);
            }
            WalOp::Delete { namespace, key } => {
                index.remove(&namespace, &key);
            }
            WalOp::SetSync {
                namespace,
                key,
                state,
            } => {
                index.set_sync_state(&namespace, &key, state);
            }
        }
        outcome.applied += 1;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::structured::wal::encode_frame;

    fn open(storage: &MemoryStorage, config: StructuredConfig) -> StructuredStore {
        StructuredStore::open(Arc::new(storage.clone()), config).unwrap()
    }

    fn scope(ns: &str) -> NamespaceScope {
        NamespaceScope::Single(ns.to_string())
    }

    #[test]
    fn test_store_then_get() {
        let store = StructuredStore::in_memory().unwrap();
        let entry = MemoryEntry::new("ns", "k", "hello").with_tags(["a", "b"]);

        let written = store.store(entry.clone()).unwrap();
        assert!(written.created);
        assert_eq!(written.id, entry.id);

        let loaded = store.get_by_key("ns", "k").unwrap().unwrap();
        assert_eq!(loaded.content, "hello");
        assert_eq!(loaded.tags, entry.tags);
        assert!(store.get_by_key("ns", "missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_keeps_identity() {
        let store = StructuredStore::in_memory().unwrap();
        let first = store.store(MemoryEntry::new("ns", "k", "one")).unwrap();
        store.store(MemoryEntry::new("ns", "other", "x")).unwrap();
        let second = store.store(MemoryEntry::new("ns", "k", "two")).unwrap();

        assert!(!second.created);
        assert_eq!(first.seq, second.seq);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get_by_key("ns", "k").unwrap().unwrap().content, "two");

        let keys: Vec<String> = store
            .query(&StructuredFilter::new(), &scope("ns"))
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["k", "other"]);
    }

    #[test]
    fn test_validation() {
        let store = StructuredStore::in_memory().unwrap();
        let err = store.store(MemoryEntry::new("ns", "", "x")).unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[test]
    fn test_delete() {
        let store = StructuredStore::in_memory().unwrap();
        store.store(MemoryEntry::new("ns", "k", "v")).unwrap();
        assert!(store.delete("ns", "k").unwrap());
        assert!(!store.delete("ns", "k").unwrap());
        assert!(store.get_by_key("ns", "k").unwrap().is_none());
    }

    #[test]
    fn test_recovery_replays_wal() {
        let storage = MemoryStorage::new();
        let config = StructuredConfig {
            wal_compaction_threshold: 0,
            ..Default::default()
        };
        {
            let store = open(&storage, config.clone());
            store.store(MemoryEntry::new("ns", "a", "1")).unwrap();
            store.store(MemoryEntry::new("ns", "b", "2")).unwrap();
            store.delete("ns", "a").unwrap();
            store.set_sync_state("ns", "b", SyncState::Synced).unwrap();
        }

        let store = open(&storage, config);
        assert_eq!(store.len(), 1);
        let b = store.get_by_key("ns", "b").unwrap().unwrap();
        assert_eq!(b.sync, SyncState::Synced);

        // Sequences continue after the replayed ones.
        let c = store.store(MemoryEntry::new("ns", "c", "3")).unwrap();
        assert!(c.seq > b.seq);
    }

    #[test]
    fn test_checkpoint_then_recover() {
        let storage = MemoryStorage::new();
        let config = StructuredConfig {
            wal_compaction_threshold: 3,
            ..Default::default()
        };
        {
            let store = open(&storage, config.clone());
            for i in 0..5 {
                store
                    .store(MemoryEntry::new("ns", format!("k{i}"), "v"))
                    .unwrap();
            }
            assert_eq!(store.stats().checkpoints, 1);
            assert_eq!(store.stats().wal_records_since_checkpoint, 2);
        }

        let store = open(&storage, config);
        assert_eq!(store.len(), 5);
        let report = store.recover().unwrap();
        assert_eq!(report.snapshot_entries, 3);
        assert_eq!(report.replayed_records, 2);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let storage = MemoryStorage::new();
        {
            let store = open(&storage, StructuredConfig::default());
            store.store(MemoryEntry::new("ns", "a", "1")).unwrap();
        }

        let mut wal = storage.open_input(WAL_FILE).unwrap().read_to_vec().unwrap();
        let torn = encode_frame(&WalRecord {
            lsn: 99,
            op: WalOp::Upsert {
                entry: MemoryEntry::new("ns", "b", "2"),
            },
        })
        .unwrap();
        wal.extend_from_slice(&torn[..torn.len() - 3]);
        storage.put_file(WAL_FILE, &wal);

        let store = open(&storage, StructuredConfig::default());
        assert!(!store.is_corrupt());
        assert!(store.get_by_key("ns", "a").unwrap().is_some());
        assert!(store.get_by_key("ns", "b").unwrap().is_none());

        // The tail was compacted away, so new writes survive another restart.
        store.store(MemoryEntry::new("ns", "c", "3")).unwrap();
        drop(store);
        let store = open(&storage, StructuredConfig::default());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_corrupt_snapshot_blocks_writes_until_rebuild() {
        let storage = MemoryStorage::new();
        {
            let store = open(&storage, StructuredConfig::default());
            store.store(MemoryEntry::new("ns", "a", "1")).unwrap();
            store.checkpoint().unwrap();
        }

        let mut snapshot = storage
            .open_input(SNAPSHOT_FILE)
            .unwrap()
            .read_to_vec()
            .unwrap();
        let last = snapshot.len() - 1;
        snapshot[last] ^= 0xff;
        storage.put_file(SNAPSHOT_FILE, &snapshot);

        let store = open(&storage, StructuredConfig::default());
        assert!(store.is_corrupt());
        assert_eq!(store.health().status, HealthStatus::Unhealthy);
        let err = store.store(MemoryEntry::new("ns", "b", "2")).unwrap_err();
        assert!(err.is_corruption());

        store.rebuild().unwrap();
        assert!(!store.is_corrupt());
        assert!(store.get_by_key("ns", "a").unwrap().is_some());
        store.store(MemoryEntry::new("ns", "b", "2")).unwrap();
        assert_eq!(store.health().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_capacity_purges_expired_first() {
        let storage = MemoryStorage::new();
        let store = open(
            &storage,
            StructuredConfig {
                max_entries: 2,
                wal_compaction_threshold: 0,
            },
        );

        let mut stale = MemoryEntry::new("ns", "stale", "x").with_ttl(Duration::from_millis(1));
        stale.updated_at = Utc::now() - chrono::Duration::seconds(5);
        store.store(stale).unwrap();
        store.store(MemoryEntry::new("ns", "b", "x")).unwrap();

        // The expired entry makes room.
        store.store(MemoryEntry::new("ns", "c", "x")).unwrap();
        assert_eq!(store.len(), 2);

        let err = store.store(MemoryEntry::new("ns", "d", "x")).unwrap_err();
        assert!(matches!(err, MemoryError::CapacityExceeded(_)));

        // Upserts of existing keys are always allowed.
        store.store(MemoryEntry::new("ns", "b", "y")).unwrap();
    }

    #[test]
    fn test_expired_entry_is_evicted_on_touch() {
        let store = StructuredStore::in_memory().unwrap();
        let mut entry = MemoryEntry::new("ns", "k", "v").with_ttl(Duration::from_millis(1));
        entry.updated_at = Utc::now() - chrono::Duration::seconds(1);
        store.store(entry).unwrap();

        assert!(store.get_by_key("ns", "k").unwrap().is_none());
        assert_eq!(store.len(), 0);
        assert_eq!(store.stats().expired_evictions, 1);
    }

    #[test]
    fn test_offline_store_is_unavailable() {
        let store = StructuredStore::in_memory().unwrap();
        store.set_online(false);
        assert!(matches!(
            store.get_by_key("ns", "k"),
            Err(MemoryError::BackendUnavailable(_))
        ));
        assert_eq!(store.health().status, HealthStatus::Unhealthy);
        store.set_online(true);
        assert!(store.get_by_key("ns", "k").unwrap().is_none());
    }

    #[test]
    fn test_coverage_gaps_and_states() {
        let store = StructuredStore::in_memory().unwrap();
        store.store(MemoryEntry::new("a", "1", "x")).unwrap();
        store.store(MemoryEntry::new("a", "2", "x")).unwrap();
        store.store(MemoryEntry::new("b", "1", "x")).unwrap();
        store.set_sync_state("a", "1", SyncState::Synced).unwrap();

        let gaps = store.coverage_gaps();
        assert_eq!(gaps.get("a"), Some(&1));
        assert_eq!(gaps.get("b"), Some(&1));

        let pending = store.entries_with_state(SyncState::StructuredOnly).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(store.namespaces(), vec!["a".to_string(), "b".to_string()]);
    }
}
