//! The semantic leaf: per-namespace HNSW graphs, the entry copies they point
//! at, and a query cache in front of them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingGenerator;
use crate::entry::{EntryId, MemoryEntry, SyncState, entry_id};
use crate::error::{MemoryError, Result};
use crate::health::{HealthStatus, LeafHealth};
use crate::namespace::NamespaceScope;
use crate::query::{QueryInput, SemanticQuery, SortOrder, StructuredFilter};
use crate::semantic::cache::{CacheKey, CacheStats, QueryCache};
use crate::semantic::hnsw::{HnswGraph, HnswParams};
use crate::semantic::persist::{
    NamespaceImage, SemanticImage, delete_image, read_image, write_image,
};
use crate::semantic::{DistanceMetric, Vector};
use crate::storage::{MemoryStorage, Storage};

/// Semantic hits: entries with their similarity, best first.
pub type SemanticHits = Vec<(MemoryEntry, f32)>;

/// Tuning for the semantic leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticConfig {
    /// Vector dimension; `0` adopts the dimension of the first indexed vector.
    pub dimension: usize,
    pub hnsw: HnswParams,
    /// Query cache capacity; `0` disables the cache.
    pub cache_size: usize,
    pub cache_ttl: Duration,
    /// Writes accumulated before an automatic checkpoint; `0` disables it.
    pub checkpoint_threshold: usize,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        SemanticConfig {
            dimension: 0,
            hnsw: HnswParams::default(),
            cache_size: 1_000,
            cache_ttl: Duration::from_secs(60),
            checkpoint_threshold: 1_000,
        }
    }
}

/// Result of a semantic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOutcome {
    Indexed,
    /// The entry has no vector; nothing was written.
    Skipped,
}

/// What `recover` found on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticRecovery {
    pub entries: usize,
    pub namespaces: usize,
    /// Graphs were re-linked because the persisted params differ from the
    /// configured ones.
    pub relinked: bool,
    pub corruption: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticStats {
    pub entries: usize,
    pub namespaces: usize,
    pub dimension: usize,
    pub metric: String,
    /// Graph slots including tombstones.
    pub graph_nodes: usize,
    pub tombstones: usize,
    pub cache: CacheStats,
    pub indexed: u64,
    pub skipped: u64,
    pub deletes: u64,
    pub queries: u64,
    pub checkpoints: u64,
    pub compactions: u64,
    pub writes_since_checkpoint: usize,
    pub online: bool,
    pub corrupt: bool,
}

#[derive(Debug, Default)]
struct Counters {
    indexed: AtomicU64,
    skipped: AtomicU64,
    deletes: AtomicU64,
    queries: AtomicU64,
    checkpoints: AtomicU64,
    compactions: AtomicU64,
}

/// Approximate nearest neighbor store with one HNSW graph per namespace.
///
/// Writers are serialized by an internal mutex; the graphs themselves accept
/// readers at any time. Every mutation bumps a generation counter that is part
/// of each cache key and clears the cache, so a query issued after a write
/// never sees results computed before it.
#[derive(Debug)]
pub struct SemanticStore {
    storage: Arc<dyn Storage>,
    config: SemanticConfig,
    embedder: Option<Arc<dyn EmbeddingGenerator>>,
    dimension: AtomicUsize,
    graphs: RwLock<BTreeMap<String, Arc<HnswGraph>>>,
    entries: RwLock<AHashMap<EntryId, Arc<MemoryEntry>>>,
    cache: QueryCache<SemanticHits>,
    generation: AtomicU64,
    /// Writes since the last checkpoint.
    writer: Mutex<usize>,
    online: AtomicBool,
    corruption: RwLock<Option<String>>,
    last_write_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    counters: Counters,
}

impl SemanticStore {
    /// Open the store and load its persisted graphs.
    ///
    /// A damaged image does not fail the open; the store comes up empty and
    /// corrupt, refusing writes until [`SemanticStore::rebuild`] or
    /// [`SemanticStore::reset`] runs.
    pub fn open(
        storage: Arc<dyn Storage>,
        config: SemanticConfig,
        embedder: Option<Arc<dyn EmbeddingGenerator>>,
    ) -> Result<Self> {
        config.hnsw.validate()?;
        if let Some(embedder) = &embedder {
            if config.dimension != 0 && embedder.dimension() != config.dimension {
                return Err(MemoryError::invalid_config(format!(
                    "embedding generator {} produces dimension {}, store expects {}",
                    embedder.name(),
                    embedder.dimension(),
                    config.dimension
                )));
            }
        }

        let store = SemanticStore {
            storage,
            dimension: AtomicUsize::new(config.dimension),
            cache: QueryCache::new(config.cache_size, config.cache_ttl),
            config,
            embedder,
            graphs: RwLock::new(BTreeMap::new()),
            entries: RwLock::new(AHashMap::new()),
            generation: AtomicU64::new(0),
            writer: Mutex::new(0),
            online: AtomicBool::new(true),
            corruption: RwLock::new(None),
            last_write_at: RwLock::new(None),
            last_error: RwLock::new(None),
            counters: Counters::default(),
        };

        let report = store.recover()?;
        info!(
            "Opened semantic store: {} entries in {} namespaces",
            report.entries, report.namespaces
        );
        Ok(store)
    }

    /// Open a store with no persisted state, backed by memory.
    pub fn in_memory(config: SemanticConfig) -> Result<Self> {
        Self::open(Arc::new(MemoryStorage::new()), config, None)
    }

    pub fn config(&self) -> &SemanticConfig {
        &self.config
    }

    pub fn metric(&self) -> DistanceMetric {
        self.config.hnsw.metric
    }

    /// Current vector dimension, `0` while undetermined.
    pub fn dimension(&self) -> usize {
        self.dimension.load(Ordering::SeqCst)
    }

    pub fn embedder(&self) -> Option<&Arc<dyn EmbeddingGenerator>> {
        self.embedder.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.graphs
            .read()
            .iter()
            .filter(|(_, graph)| !graph.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Take the leaf offline (or back online) for maintenance.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        info!(
            "Semantic store is now {}",
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
            Err(MemoryError::unavailable("semantic store is offline"))
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_online()?;
        match self.corruption.read().as_ref() {
            Some(reason) => Err(MemoryError::corrupt(format!(
                "semantic store refuses writes until rebuilt: {reason}"
            ))),
            None => Ok(()),
        }
    }

    /// Invalidate cached query results after a mutation.
    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache.clear();
    }

    fn note_write(&self) {
        *self.last_write_at.write() = Some(Utc::now());
        *self.last_error.write() = None;
    }

    /// Validate a vector about to be indexed, adopting its dimension if none
    /// is set yet. Callers hold the writer lock.
    fn admit_vector(&self, vector: &Vector) -> Result<()> {
        let expected = self.dimension();
        if expected == 0 {
            if vector.dimension() == 0 {
                return Err(MemoryError::validation("vector must not be empty"));
            }
            if !vector.is_valid() {
                return Err(MemoryError::validation(
                    "Vector contains NaN or infinite values",
                ));
            }
            self.dimension.store(vector.dimension(), Ordering::SeqCst);
            info!("Semantic store adopted dimension {}", vector.dimension());
            Ok(())
        } else {
            vector.validate(expected)
        }
    }

    fn graph_for(&self, namespace: &str) -> Arc<HnswGraph> {
        if let Some(graph) = self.graphs.read().get(namespace) {
            return graph.clone();
        }
        self.graphs
            .write()
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(HnswGraph::new(self.config.hnsw.clone())))
            .clone()
    }

    /// Swap in a relinked copy of `graph` once its tombstones outnumber its
    /// live nodes. Callers hold the writer lock.
    fn compact_if_needed(&self, namespace: &str, graph: &Arc<HnswGraph>) {
        if !graph.should_compact() {
            return;
        }
        let tombstones = graph.deleted_count();
        let compacted = Arc::new(graph.compacted());
        self.graphs.write().insert(namespace.to_string(), compacted);
        self.counters.compactions.fetch_add(1, Ordering::Relaxed);
        debug!("Compacted graph for namespace {namespace}, dropped {tombstones} tombstones");
    }

    /// Index an entry. Entries without a vector are skipped.
    pub fn store(&self, entry: MemoryEntry) -> Result<IndexOutcome> {
        self.ensure_writable()?;
        entry.validate()?;
        let Some(vector) = entry.vector.clone() else {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(IndexOutcome::Skipped);
        };

        let mut since_checkpoint = self.writer.lock();
        self.admit_vector(&vector)?;

        let graph = self.graph_for(&entry.namespace);
        graph.insert(entry.id, vector);
        debug!("Indexed {}/{} ({})", entry.namespace, entry.key, entry.id);
        self.compact_if_needed(&entry.namespace, &graph);
        self.entries.write().insert(entry.id, Arc::new(entry));

        self.invalidate();
        self.counters.indexed.fetch_add(1, Ordering::Relaxed);
        self.note_write();
        *since_checkpoint += 1;
        self.maybe_checkpoint(&mut since_checkpoint);
        Ok(IndexOutcome::Indexed)
    }

    /// Copy the bookkeeping fields the structured leaf assigned onto the
    /// indexed copy of an entry. Returns false when the id is not indexed.
    pub fn stamp(
        &self,
        id: &EntryId,
        seq: u64,
        created_at: DateTime<Utc>,
        sync: SyncState,
    ) -> Result<bool> {
        self.ensure_writable()?;
        let _writer = self.writer.lock();

        let mut entries = self.entries.write();
        let Some(current) = entries.get(id) else {
            return Ok(false);
        };
        if current.seq == seq && current.created_at == created_at && current.sync == sync {
            return Ok(true);
        }

        let mut updated = (**current).clone();
        updated.seq = seq;
        updated.created_at = created_at;
        updated.sync = sync;
        entries.insert(*id, Arc::new(updated));
        drop(entries);

        self.invalidate();
        Ok(true)
    }

    /// Remove an entry from its graph. Returns whether it was indexed.
    pub fn delete(&self, id: &EntryId) -> Result<bool> {
        self.ensure_writable()?;
        let mut since_checkpoint = self.writer.lock();

        let Some(removed) = self.entries.write().remove(id) else {
            return Ok(false);
        };
        let graph = self.graphs.read().get(&removed.namespace).cloned();
        if let Some(graph) = graph {
            graph.remove(id);
            self.compact_if_needed(&removed.namespace, &graph);
        }

        self.invalidate();
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.note_write();
        debug!("Removed {}/{} from the semantic index", removed.namespace, removed.key);
        *since_checkpoint += 1;
        self.maybe_checkpoint(&mut since_checkpoint);
        Ok(true)
    }

    pub fn delete_key(&self, namespace: &str, key: &str) -> Result<bool> {
        self.delete(&entry_id(namespace, key))
    }

    /// Drop every graph, entry and persisted file. Clears corruption.
    pub fn reset(&self) -> Result<()> {
        self.ensure_online()?;
        let mut since_checkpoint = self.writer.lock();

        self.graphs.write().clear();
        self.entries.write().clear();
        self.dimension.store(self.config.dimension, Ordering::SeqCst);
        self.invalidate();
        delete_image(self.storage.as_ref())?;
        *since_checkpoint = 0;
        *self.corruption.write() = None;
        *self.last_error.write() = None;

        info!("Semantic store reset");
        Ok(())
    }

    /// Fetch the indexed copy of an entry. Expired entries read as missing.
    pub fn get(&self, id: &EntryId) -> Result<Option<MemoryEntry>> {
        self.ensure_online()?;
        let now = Utc::now();
        Ok(self
            .entries
            .read()
            .get(id)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| (**entry).clone()))
    }

    pub fn find_by_key(&self, namespace: &str, key: &str) -> Result<Option<MemoryEntry>> {
        self.get(&entry_id(namespace, key))
    }

    /// Turn a query input into a vector, embedding text when needed.
    pub async fn resolve_vector(&self, input: &QueryInput) -> Result<Vector> {
        let vector = match input {
            QueryInput::Vector(vector) => vector.clone(),
            QueryInput::Text(text) => {
                let embedder = self.embedder.as_ref().ok_or_else(|| {
                    MemoryError::validation("text queries need an embedding generator")
                })?;
                embedder.embed(text).await?
            }
        };

        let expected = self.dimension();
        if expected != 0 {
            vector.validate(expected)?;
        } else if !vector.is_valid() {
            return Err(MemoryError::validation(
                "Vector contains NaN or infinite values",
            ));
        }
        Ok(vector)
    }

    /// Nearest neighbors of the query within `scope`, best first.
    ///
    /// Only hits with similarity at or above the threshold are returned, at
    /// most `k` of them.
    pub async fn query(&self, query: &SemanticQuery, scope: &NamespaceScope) -> Result<SemanticHits> {
        self.ensure_online()?;
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        if query.k == 0 {
            return Ok(Vec::new());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let key = CacheKey::new(&query.input, query.k, query.threshold, scope)
            .at_generation(generation);
        if let Some(hits) = self.cache.get(&key) {
            debug!("Semantic cache hit for scope {scope}");
            return Ok((*hits).clone());
        }

        let vector = self.resolve_vector(&query.input).await?;
        let hits = self.search(&vector, query.k, query.threshold, scope);
        self.cache.insert(key, hits.clone());
        Ok(hits)
    }

    /// Uncached graph search.
    pub fn search(
        &self,
        vector: &Vector,
        k: usize,
        threshold: f32,
        scope: &NamespaceScope,
    ) -> SemanticHits {
        let graphs: Vec<Arc<HnswGraph>> = {
            let graphs = self.graphs.read();
            match scope {
                NamespaceScope::Single(name) => graphs.get(name).cloned().into_iter().collect(),
                NamespaceScope::All => graphs.values().cloned().collect(),
            }
        };

        let metric = self.metric();
        let mut found = Vec::new();
        for graph in graphs {
            for (id, distance) in graph.search(&vector.data, k, None) {
                let similarity = metric.similarity_from_distance(distance);
                if similarity >= threshold {
                    found.push((id, similarity));
                }
            }
        }

        let now = Utc::now();
        let entries = self.entries.read();
        let mut hits: SemanticHits = found
            .into_iter()
            .filter_map(|(id, similarity)| {
                let entry = entries.get(&id)?;
                (scope.contains(&entry.namespace) && !entry.is_expired(now))
                    .then(|| ((**entry).clone(), similarity))
            })
            .collect();
        drop(entries);

        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.seq.cmp(&b.0.seq)));
        hits.truncate(k);
        hits
    }

    /// Score a candidate pool against `vector`, best first.
    ///
    /// Uses each candidate's own vector, falling back to the indexed copy.
    /// Candidates with no usable vector are dropped. No candidate outside the
    /// pool is ever returned.
    pub fn score_candidates(&self, vector: &Vector, candidates: Vec<MemoryEntry>) -> Result<SemanticHits> {
        let with_vectors: Vec<(MemoryEntry, Vector)> = {
            let indexed = self.entries.read();
            candidates
                .into_iter()
                .filter_map(|candidate| {
                    let candidate_vector = candidate.vector.clone().or_else(|| {
                        indexed
                            .get(&candidate.id)
                            .and_then(|entry| entry.vector.clone())
                    })?;
                    (candidate_vector.dimension() == vector.dimension())
                        .then_some((candidate, candidate_vector))
                })
                .collect()
        };

        let slices: Vec<&[f32]> = with_vectors
            .iter()
            .map(|(_, candidate)| candidate.data.as_slice())
            .collect();
        let similarities = self.metric().batch_similarity_parallel(&vector.data, &slices)?;

        let mut scored: SemanticHits = with_vectors
            .into_iter()
            .map(|(entry, _)| entry)
            .zip(similarities)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(scored)
    }

    /// Evaluate a structured filter over the indexed entry copies.
    ///
    /// Serves structured reads while the structured leaf is down. Only
    /// entries with vectors live here, so the answer may be partial.
    pub fn filter_entries(
        &self,
        filter: &StructuredFilter,
        scope: &NamespaceScope,
    ) -> Result<Vec<MemoryEntry>> {
        self.ensure_online()?;
        let now = Utc::now();
        let mut found: Vec<MemoryEntry> = self
            .entries
            .read()
            .values()
            .filter(|entry| {
                scope.contains(&entry.namespace) && filter.matches(entry) && !entry.is_expired(now)
            })
            .map(|entry| (**entry).clone())
            .collect();

        match filter.order {
            SortOrder::InsertionAsc => found.sort_by(|a, b| {
                (a.seq, &a.namespace, &a.key).cmp(&(b.seq, &b.namespace, &b.key))
            }),
            SortOrder::InsertionDesc => found.sort_by(|a, b| {
                (b.seq, &b.namespace, &b.key).cmp(&(a.seq, &a.namespace, &a.key))
            }),
            SortOrder::KeyAsc => {
                found.sort_by(|a, b| (&a.key, &a.namespace).cmp(&(&b.key, &b.namespace)))
            }
        }
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    /// Every live indexed entry in `scope`.
    pub fn scan(&self, scope: &NamespaceScope) -> Result<Vec<MemoryEntry>> {
        self.filter_entries(&StructuredFilter::new(), scope)
    }

    /// Remove expired entries. Returns their ids.
    pub fn purge_expired(&self) -> Result<Vec<EntryId>> {
        self.ensure_writable()?;
        let now = Utc::now();
        let expired: Vec<EntryId> = self
            .entries
            .read()
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.id)
            .collect();

        let mut purged = Vec::with_capacity(expired.len());
        for id in expired {
            if self.delete(&id)? {
                purged.push(id);
            }
        }
        if !purged.is_empty() {
            info!("Purged {} expired semantic entries", purged.len());
        }
        Ok(purged)
    }

    /// Replace the whole index with `entries`, then persist it.
    ///
    /// Entries without a usable vector are skipped. Clears corruption.
    pub fn rebuild(&self, entries: Vec<MemoryEntry>) -> Result<usize> {
        self.ensure_online()?;
        let mut since_checkpoint = self.writer.lock();

        self.graphs.write().clear();
        self.entries.write().clear();
        self.dimension.store(self.config.dimension, Ordering::SeqCst);

        let mut indexed = 0;
        for entry in entries {
            let Some(vector) = entry.vector.clone() else {
                continue;
            };
            if let Err(e) = entry.validate().and_then(|_| self.admit_vector(&vector)) {
                warn!("Skipping {}/{} during rebuild: {e}", entry.namespace, entry.key);
                continue;
            }
            self.graph_for(&entry.namespace).insert(entry.id, vector);
            self.entries.write().insert(entry.id, Arc::new(entry));
            indexed += 1;
        }

        self.invalidate();
        *self.corruption.write() = None;
        *self.last_error.write() = None;
        self.checkpoint_locked(&mut since_checkpoint)?;

        info!("Rebuilt semantic store with {indexed} entries");
        Ok(indexed)
    }

    fn maybe_checkpoint(&self, since_checkpoint: &mut usize) {
        let threshold = self.config.checkpoint_threshold;
        if threshold > 0 && *since_checkpoint >= threshold {
            if let Err(e) = self.checkpoint_locked(since_checkpoint) {
                *self.last_error.write() = Some(e.to_string());
                warn!("Automatic semantic checkpoint failed: {e}");
            }
        }
    }

    /// Persist the graphs and vectors.
    pub fn checkpoint(&self) -> Result<()> {
        self.ensure_writable()?;
        let mut since_checkpoint = self.writer.lock();
        self.checkpoint_locked(&mut since_checkpoint)
    }

    fn checkpoint_locked(&self, since_checkpoint: &mut usize) -> Result<()> {
        let graphs = self.graphs.read().clone();
        let entries = self.entries.read().clone();

        let mut namespaces = Vec::with_capacity(graphs.len());
        for (namespace, graph) in graphs {
            if graph.is_empty() {
                continue;
            }
            let (layout, vectors) = graph.export();
            let mut slot_entries = Vec::with_capacity(layout.ids.len());
            for (id, vector) in layout.ids.iter().zip(vectors) {
                let entry = entries.get(id).ok_or_else(|| {
                    MemoryError::internal(format!("graph node {id} has no entry"))
                })?;
                let mut entry = (**entry).clone();
                entry.vector = Some(vector);
                slot_entries.push(entry);
            }
            namespaces.push(NamespaceImage {
                namespace,
                layout,
                entries: slot_entries,
            });
        }

        let image = SemanticImage {
            params: self.config.hnsw.clone(),
            dimension: self.dimension(),
            namespaces,
        };
        let bytes = write_image(self.storage.as_ref(), &image)?;
        *since_checkpoint = 0;
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        info!(
            "Semantic checkpoint: {} entries, {bytes} bytes",
            image.entry_count()
        );
        Ok(())
    }

    /// Reload graphs and entries from the persisted image.
    pub fn recover(&self) -> Result<SemanticRecovery> {
        let mut since_checkpoint = self.writer.lock();
        let mut report = SemanticRecovery::default();

        let image = match read_image(self.storage.as_ref()) {
            Ok(image) => image,
            Err(e) if e.is_corruption() => {
                error!("Semantic store is corrupt and refuses writes: {e}");
                report.corruption = Some(e.to_string());
                None
            }
            Err(e) => return Err(e),
        };

        let mut graphs = BTreeMap::new();
        let mut entries = AHashMap::new();
        let mut dimension = self.config.dimension;

        if let Some(image) = image {
            if self.config.dimension != 0
                && image.dimension != 0
                && image.dimension != self.config.dimension
            {
                return Err(MemoryError::invalid_config(format!(
                    "persisted semantic index has dimension {}, configuration says {}",
                    image.dimension, self.config.dimension
                )));
            }
            if image.dimension != 0 {
                dimension = image.dimension;
            }
            report.relinked = image.params != self.config.hnsw;
            if report.relinked {
                info!("HNSW parameters changed; re-linking persisted vectors");
            }

            match self.load_graphs(image, report.relinked) {
                Ok((loaded_graphs, loaded_entries)) => {
                    graphs = loaded_graphs;
                    entries = loaded_entries;
                }
                Err(e) if e.is_corruption() => {
                    error!("Semantic store is corrupt and refuses writes: {e}");
                    report.corruption = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        report.entries = entries.len();
        report.namespaces = graphs.len();
        *self.graphs.write() = graphs;
        *self.entries.write() = entries;
        self.dimension.store(dimension, Ordering::SeqCst);
        *self.corruption.write() = report.corruption.clone();
        *since_checkpoint = 0;
        self.invalidate();

        Ok(report)
    }

    #[allow(clippy::type_complexity)]
    fn load_graphs(
        &self,
        image: SemanticImage,
        relink: bool,
    ) -> Result<(
        BTreeMap<String, Arc<HnswGraph>>,
        AHashMap<EntryId, Arc<MemoryEntry>>,
    )> {
        let mut graphs = BTreeMap::new();
        let mut entries = AHashMap::new();

        for namespace in image.namespaces {
            let graph = if relink {
                let graph = HnswGraph::new(self.config.hnsw.clone());
                for entry in &namespace.entries {
                    if let Some(vector) = &entry.vector {
                        graph.insert(entry.id, vector.clone());
                    }
                }
                graph
            } else {
                let vectors = namespace
                    .entries
                    .iter()
                    .map(|entry| entry.vector.clone().unwrap_or_else(|| Vector::new(Vec::new())))
                    .collect();
                HnswGraph::from_layout(image.params.clone(), namespace.layout, vectors)?
            };

            for entry in namespace.entries {
                entries.insert(entry.id, Arc::new(entry));
            }
            graphs.insert(namespace.namespace, Arc::new(graph));
        }
        Ok((graphs, entries))
    }

    pub fn stats(&self) -> SemanticStats {
        let since_checkpoint = *self.writer.lock();
        let graphs = self.graphs.read();
        SemanticStats {
            entries: self.len(),
            namespaces: graphs.values().filter(|graph| !graph.is_empty()).count(),
            dimension: self.dimension(),
            metric: self.metric().name().to_string(),
            graph_nodes: graphs.values().map(|graph| graph.node_count()).sum(),
            tombstones: graphs.values().map(|graph| graph.deleted_count()).sum(),
            cache: self.cache.stats(),
            indexed: self.counters.indexed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            queries: self.counters.queries.load(Ordering::Relaxed),
            checkpoints: self.counters.checkpoints.load(Ordering::Relaxed),
            compactions: self.counters.compactions.load(Ordering::Relaxed),
            writes_since_checkpoint: since_checkpoint,
            online: self.is_online(),
            corrupt: self.is_corrupt(),
        }
    }

    pub fn health(&self) -> LeafHealth {
        let last_error = self.last_error.read().clone();
        let (status, detail) = if !self.is_online() {
            (HealthStatus::Unhealthy, Some("offline".to_string()))
        } else if let Some(reason) = self.corruption() {
            (HealthStatus::Unhealthy, Some(format!("corrupt: {reason}")))
        } else if last_error.is_some() {
            (HealthStatus::Degraded, Some("last checkpoint failed".to_string()))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::PrecomputedEmbedder;

    fn config() -> SemanticConfig {
        SemanticConfig {
            dimension: 3,
            hnsw: HnswParams {
                metric: DistanceMetric::Cosine,
                ..HnswParams::default()
            },
            ..SemanticConfig::default()
        }
    }

    fn entry(ns: &str, key: &str, vector: [f32; 3]) -> MemoryEntry {
        MemoryEntry::new(ns, key, format!("content of {key}")).with_vector(vector.to_vec())
    }

    fn ns(name: &str) -> NamespaceScope {
        NamespaceScope::Single(name.to_string())
    }

    #[tokio::test]
    async fn test_store_and_query() {
        let store = SemanticStore::in_memory(config()).unwrap();
        store.store(entry("ns", "x", [1.0, 0.0, 0.0])).unwrap();
        store.store(entry("ns", "y", [0.0, 1.0, 0.0])).unwrap();
        store.store(entry("ns", "xy", [1.0, 1.0, 0.0])).unwrap();

        let hits = store
            .query(&SemanticQuery::vector(vec![1.0, 0.1, 0.0], 2), &ns("ns"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.key, "x");
        assert_eq!(hits[1].0.key, "xy");
        assert!(hits[0].1 >= hits[1].1);
        assert!(hits.iter().all(|(_, sim)| (0.0..=1.0).contains(sim)));
    }

    #[tokio::test]
    async fn test_threshold_prunes_hits() {
        let store = SemanticStore::in_memory(config()).unwrap();
        store.store(entry("ns", "x", [1.0, 0.0, 0.0])).unwrap();
        store.store(entry("ns", "y", [0.0, 1.0, 0.0])).unwrap();

        let query = SemanticQuery::vector(vec![1.0, 0.0, 0.0], 10).with_threshold(0.5);
        let hits = store.query(&query, &ns("ns")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.key, "x");
    }

    #[test]
    fn test_entry_without_vector_is_skipped() {
        let store = SemanticStore::in_memory(config()).unwrap();
        let outcome = store.store(MemoryEntry::new("ns", "k", "text")).unwrap();
        assert_eq!(outcome, IndexOutcome::Skipped);
        assert!(store.is_empty());
        assert_eq!(store.stats().skipped, 1);
    }

    #[test]
    fn test_dimension_mismatch_is_validation_error() {
        let store = SemanticStore::in_memory(config()).unwrap();
        let bad = MemoryEntry::new("ns", "k", "text").with_vector(vec![1.0, 2.0]);
        assert!(matches!(store.store(bad), Err(MemoryError::Validation(_))));
    }

    #[test]
    fn test_dimension_is_adopted_when_unset() {
        let store = SemanticStore::in_memory(SemanticConfig::default()).unwrap();
        assert_eq!(store.dimension(), 0);
        store
            .store(MemoryEntry::new("ns", "k", "t").with_vector(vec![1.0, 2.0]))
            .unwrap();
        assert_eq!(store.dimension(), 2);
        let bad = MemoryEntry::new("ns", "j", "t").with_vector(vec![1.0, 2.0, 3.0]);
        assert!(store.store(bad).is_err());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = SemanticStore::in_memory(config()).unwrap();
        store.store(entry("a", "k", [1.0, 0.0, 0.0])).unwrap();
        store.store(entry("b", "k", [1.0, 0.0, 0.0])).unwrap();

        let query = SemanticQuery::vector(vec![1.0, 0.0, 0.0], 10);
        let hits = store.query(&query, &ns("a")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.namespace, "a");

        let all = store.query(&query, &NamespaceScope::All).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_hits_and_invalidation() {
        let store = SemanticStore::in_memory(config()).unwrap();
        store.store(entry("ns", "x", [1.0, 0.0, 0.0])).unwrap();

        let query = SemanticQuery::vector(vec![1.0, 0.0, 0.0], 5);
        store.query(&query, &ns("ns")).await.unwrap();
        store.query(&query, &ns("ns")).await.unwrap();
        assert_eq!(store.stats().cache.hits, 1);

        // A write is visible to the next identical query.
        store.store(entry("ns", "y", [0.9, 0.1, 0.0])).unwrap();
        let hits = store.query(&query, &ns("ns")).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(store.stats().cache.hits, 1);
    }

    #[tokio::test]
    async fn test_restoring_one_key_compacts_its_graph() {
        let store = SemanticStore::in_memory(config()).unwrap();
        store.store(entry("ns", "x", [1.0, 0.0, 0.0])).unwrap();
        store.store(entry("ns", "y", [0.0, 1.0, 0.0])).unwrap();
        store.store(entry("ns", "z", [0.0, 0.0, 1.0])).unwrap();
        for _ in 0..100 {
            store.store(entry("ns", "x", [1.0, 0.0, 0.0])).unwrap();
        }

        let stats = store.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.compactions, 3);
        assert_eq!(stats.tombstones, 4);
        assert_eq!(stats.graph_nodes, 7);

        let hits = store
            .query(&SemanticQuery::vector(vec![1.0, 0.0, 0.0], 3), &ns("ns"))
            .await
            .unwrap();
        let keys: Vec<&str> = hits.iter().map(|(e, _)| e.key.as_str()).collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0], "x");
    }

    #[tokio::test]
    async fn test_delete_and_reset() {
        let store = SemanticStore::in_memory(config()).unwrap();
        let x = entry("ns", "x", [1.0, 0.0, 0.0]);
        store.store(x.clone()).unwrap();
        store.store(entry("ns", "y", [0.0, 1.0, 0.0])).unwrap();

        assert!(store.delete(&x.id).unwrap());
        assert!(!store.delete(&x.id).unwrap());
        assert!(store.get(&x.id).unwrap().is_none());

        let hits = store
            .query(&SemanticQuery::vector(vec![1.0, 0.0, 0.0], 5), &ns("ns"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.key, "y");

        store.reset().unwrap();
        assert!(store.is_empty());
        assert!(store.namespaces().is_empty());
    }

    #[tokio::test]
    async fn test_text_query_uses_embedder() {
        let embedder = PrecomputedEmbedder::new(3)
            .with("east", vec![1.0, 0.0, 0.0])
            .unwrap();
        let store = SemanticStore::open(
            Arc::new(MemoryStorage::new()),
            config(),
            Some(Arc::new(embedder)),
        )
        .unwrap();
        store.store(entry("ns", "x", [1.0, 0.0, 0.0])).unwrap();

        let hits = store
            .query(&SemanticQuery::text("east", 1), &ns("ns"))
            .await
            .unwrap();
        assert_eq!(hits[0].0.key, "x");
    }

    #[tokio::test]
    async fn test_text_query_without_embedder_fails() {
        let store = SemanticStore::in_memory(config()).unwrap();
        let err = store
            .query(&SemanticQuery::text("east", 1), &ns("ns"))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[test]
    fn test_score_candidates_only_ranks_the_pool() {
        let store = SemanticStore::in_memory(config()).unwrap();
        let near = entry("ns", "near", [1.0, 0.0, 0.0]);
        let far = entry("ns", "far", [0.0, 1.0, 0.0]);
        let unindexed = MemoryEntry::new("ns", "plain", "no vector");
        store.store(entry("ns", "outsider", [1.0, 0.0, 0.0])).unwrap();

        let scored = store
            .score_candidates(
                &Vector::new(vec![1.0, 0.0, 0.0]),
                vec![far.clone(), near.clone(), unindexed],
            )
            .unwrap();
        let keys: Vec<&str> = scored.iter().map(|(e, _)| e.key.as_str()).collect();
        assert_eq!(keys, vec!["near", "far"]);
    }

    #[test]
    fn test_filter_entries() {
        let store = SemanticStore::in_memory(config()).unwrap();
        store
            .store(entry("ns", "user:1", [1.0, 0.0, 0.0]).with_tag("red"))
            .unwrap();
        store.store(entry("ns", "user:2", [0.0, 1.0, 0.0])).unwrap();
        store.store(entry("other", "user:3", [0.0, 0.0, 1.0])).unwrap();

        let filter = StructuredFilter::new().with_key_prefix("user:");
        let found = store.filter_entries(&filter, &ns("ns")).unwrap();
        assert_eq!(found.len(), 2);

        let red = store
            .filter_entries(&StructuredFilter::new().with_tag("red"), &NamespaceScope::All)
            .unwrap();
        assert_eq!(red.len(), 1);
        assert_eq!(red[0].key, "user:1");
    }

    #[tokio::test]
    async fn test_checkpoint_and_recover() {
        let storage = MemoryStorage::new();
        {
            let store = SemanticStore::open(Arc::new(storage.clone()), config(), None).unwrap();
            store.store(entry("a", "x", [1.0, 0.0, 0.0])).unwrap();
            store.store(entry("a", "y", [0.0, 1.0, 0.0])).unwrap();
            store.store(entry("b", "z", [0.0, 0.0, 1.0])).unwrap();
            store.delete_key("a", "y").unwrap();
            store.checkpoint().unwrap();
        }

        let store = SemanticStore::open(Arc::new(storage), config(), None).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.namespaces(), vec!["a".to_string(), "b".to_string()]);
        let hits = store
            .query(&SemanticQuery::vector(vec![0.0, 0.0, 1.0], 1), &NamespaceScope::All)
            .await
            .unwrap();
        assert_eq!(hits[0].0.key, "z");
        assert!(store.find_by_key("a", "x").unwrap().unwrap().vector.is_some());
    }

    #[test]
    fn test_corrupt_image_blocks_writes_until_rebuild() {
        let storage = MemoryStorage::new();
        let x = entry("ns", "x", [1.0, 0.0, 0.0]);
        {
            let store = SemanticStore::open(Arc::new(storage.clone()), config(), None).unwrap();
            store.store(x.clone()).unwrap();
            store.checkpoint().unwrap();
        }

        let path = crate::semantic::persist::GRAPH_FILE;
        let mut graph = storage.open_input(path).unwrap().read_to_vec().unwrap();
        graph[0] ^= 0xff;
        storage.put_file(path, &graph);

        let store = SemanticStore::open(Arc::new(storage), config(), None).unwrap();
        assert!(store.is_corrupt());
        assert_eq!(store.health().status, HealthStatus::Unhealthy);
        assert!(store.store(x.clone()).unwrap_err().is_corruption());

        assert_eq!(store.rebuild(vec![x.clone()]).unwrap(), 1);
        assert!(!store.is_corrupt());
        assert!(store.get(&x.id).unwrap().is_some());
        assert_eq!(store.health().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_offline_store_is_unavailable() {
        let store = SemanticStore::in_memory(config()).unwrap();
        store.set_online(false);
        let err = store.store(entry("ns", "x", [1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, MemoryError::BackendUnavailable(_)));
        assert_eq!(store.health().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_stamp_copies_structured_fields() {
        let store = SemanticStore::in_memory(config()).unwrap();
        let x = entry("ns", "x", [1.0, 0.0, 0.0]);
        store.store(x.clone()).unwrap();

        let created = Utc::now() - chrono::Duration::hours(1);
        assert!(store.stamp(&x.id, 42, created, SyncState::Synced).unwrap());
        let indexed = store.get(&x.id).unwrap().unwrap();
        assert_eq!(indexed.seq, 42);
        assert_eq!(indexed.created_at, created);
        assert_eq!(indexed.sync, SyncState::Synced);

        let missing = crate::entry::entry_id("ns", "missing");
        assert!(!store.stamp(&missing, 1, created, SyncState::Synced).unwrap());
    }
}
