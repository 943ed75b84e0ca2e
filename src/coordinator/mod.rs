//! The hybrid coordinator.
//!
//! A [`HybridCoordinator`] presents one logical memory over two leaves: the
//! [`StructuredStore`] (source of truth, exact lookups) and the
//! [`SemanticStore`] (approximate nearest neighbours). Writes go to both
//! leaves, reads are routed by the [`QuerySpec`] variant, and hybrid reads are
//! merged by the functions in [`merger`].
//!
//! # Example
//!
//! ```
//! use hybrid_memory::coordinator::{HybridCoordinator, HybridMemoryConfig};
//! use hybrid_memory::entry::StoreRequest;
//! use hybrid_memory::query::{QueryOptions, SemanticQuery};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let memory = HybridCoordinator::open(HybridMemoryConfig::default(), None)
//!     .await
//!     .unwrap();
//!
//! let written = memory
//!     .store(StoreRequest::new("greeting", "hello").with_vector(vec![1.0, 0.0]))
//!     .await
//!     .unwrap();
//! assert!(written.structured_ok && written.semantic_ok);
//!
//! let found = memory
//!     .query_semantic(&SemanticQuery::vector(vec![1.0, 0.1], 1), QueryOptions::default())
//!     .await
//!     .unwrap();
//! assert_eq!(found.keys(), vec!["greeting"]);
//!
//! memory.close().await.unwrap();
//! # }
//! ```

pub mod config;
pub mod merger;
pub mod stats;
pub mod types;

pub use config::{DualWriteMode, HybridMemoryConfig, RoutingStrategy};
pub use stats::{CoordinatorStats, CounterSnapshot};
pub use types::{ConsistencyWarning, CoordinatorState, DeleteResult, RepairReport, WriteResult};

use std::sync::Arc;
use std::time::Instant as StdInstant;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::embedding::EmbeddingGenerator;
use crate::entry::{EntryId, MemoryEntry, StoreRequest, SyncState};
use crate::error::{MemoryError, Result};
use crate::health::{HealthMonitor, HealthReport, HealthStatus, HealthTask};
use crate::namespace::{NamespaceManager, NamespaceScope};
use crate::query::{
    CombineStrategy, HybridQuery, QueryOptions, QueryResponse, QuerySpec, ScoredEntry,
    SemanticQuery, StructuredFilter,
};
use crate::semantic::{IndexOutcome, SemanticHits, SemanticStore, Vector};
use crate::storage::{PrefixedStorage, Storage, StorageLock, open_root};
use crate::structured::{RecoveryReport, StructuredStore, Written};

use self::stats::Counters;

/// Name of the lock that keeps two coordinators off one data directory.
const LOCK_NAME: &str = "coordinator";
const STRUCTURED_DIR: &str = "structured";
const SEMANTIC_DIR: &str = "semantic";

/// Semantic-first post-filters the semantic ranking, so it asks for more
/// neighbours than it returns.
const SEMANTIC_FIRST_OVERFETCH: usize = 4;

#[derive(Debug)]
struct Leaves {
    structured: Arc<StructuredStore>,
    semantic: Arc<SemanticStore>,
    monitor: Arc<HealthMonitor>,
    _lock: Box<dyn StorageLock>,
}

impl Leaves {
    fn healthy(&self) -> bool {
        self.structured.is_online()
            && !self.structured.is_corrupt()
            && self.semantic.is_online()
            && !self.semantic.is_corrupt()
    }

    fn ensure_writable(&self) -> Result<()> {
        for (leaf, online, corruption) in [
            (
                "structured",
                self.structured.is_online(),
                self.structured.corruption(),
            ),
            ("semantic", self.semantic.is_online(), self.semantic.corruption()),
        ] {
            if !online {
                return Err(MemoryError::unavailable(format!("{leaf} leaf is offline")));
            }
            if let Some(reason) = corruption {
                return Err(MemoryError::corrupt(format!(
                    "{leaf} leaf needs a rebuild: {reason}"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of one leaf's part in a query.
enum Leg<T> {
    Done(T),
    TimedOut,
    /// The leaf was down and routing chose to answer without it.
    Unavailable,
}

/// Move between `Ready` and `Degraded` as leaf health changes. Other states
/// are left alone.
fn transition(state: &RwLock<CoordinatorState>, leaves_healthy: bool) {
    let current = *state.read();
    let next = match (current, leaves_healthy) {
        (CoordinatorState::Ready, false) => CoordinatorState::Degraded,
        (CoordinatorState::Degraded, true) => CoordinatorState::Ready,
        _ => return,
    };

    let mut state = state.write();
    if *state != current {
        return;
    }
    *state = next;
    match next {
        CoordinatorState::Degraded => warn!("Coordinator degraded: a leaf is unhealthy"),
        _ => info!("Coordinator recovered: both leaves healthy"),
    }
}

async fn join_blocking<T>(leaf: &str, handle: JoinHandle<Result<T>>) -> Result<T> {
    handle
        .await
        .map_err(|e| MemoryError::internal(format!("{leaf} task failed: {e}")))?
}

/// One logical memory over a structured and a semantic leaf.
#[derive(Debug)]
pub struct HybridCoordinator {
    config: HybridMemoryConfig,
    embedder: Option<Arc<dyn EmbeddingGenerator>>,
    namespaces: NamespaceManager,
    /// Root storage to open the leaves on, instead of `config.data_dir`.
    root: Option<Arc<dyn Storage>>,
    state: Arc<RwLock<CoordinatorState>>,
    leaves: RwLock<Option<Arc<Leaves>>>,
    health_task: Mutex<Option<HealthTask>>,
    counters: Counters,
    started_at: StdInstant,
}

impl HybridCoordinator {
    /// Create an uninitialized coordinator.
    pub fn new(
        config: HybridMemoryConfig,
        embedder: Option<Arc<dyn EmbeddingGenerator>>,
    ) -> Result<Self> {
        config.validate()?;
        let namespaces = NamespaceManager::new(config.default_namespace.clone())?;
        if let Some(embedder) = &embedder {
            if config.dimension != 0 && embedder.dimension() != config.dimension {
                return Err(MemoryError::invalid_config(format!(
                    "embedding generator {} produces dimension {}, configured dimension is {}",
                    embedder.name(),
                    embedder.dimension(),
                    config.dimension
                )));
            }
        }

        Ok(HybridCoordinator {
            config,
            embedder,
            namespaces,
            root: None,
            state: Arc::new(RwLock::new(CoordinatorState::Uninitialized)),
            leaves: RwLock::new(None),
            health_task: Mutex::new(None),
            counters: Counters::default(),
            started_at: StdInstant::now(),
        })
    }

    /// Create an uninitialized coordinator whose leaves live on `root`.
    ///
    /// `config.data_dir` is ignored.
    pub fn with_storage(
        config: HybridMemoryConfig,
        root: Arc<dyn Storage>,
        embedder: Option<Arc<dyn EmbeddingGenerator>>,
    ) -> Result<Self> {
        let mut coordinator = Self::new(config, embedder)?;
        coordinator.root = Some(root);
        Ok(coordinator)
    }

    /// Create and initialize a coordinator.
    pub async fn open(
        config: HybridMemoryConfig,
        embedder: Option<Arc<dyn EmbeddingGenerator>>,
    ) -> Result<Self> {
        let coordinator = Self::new(config, embedder)?;
        coordinator.initialize().await?;
        Ok(coordinator)
    }

    pub fn config(&self) -> &HybridMemoryConfig {
        &self.config
    }

    pub fn namespaces(&self) -> &NamespaceManager {
        &self.namespaces
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    /// Open both leaves and start serving.
    ///
    /// Calling this on a serving coordinator does nothing. A failed
    /// initialization leaves the coordinator uninitialized.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            match *state {
                CoordinatorState::Uninitialized => *state = CoordinatorState::Initializing,
                CoordinatorState::Ready | CoordinatorState::Degraded => return Ok(()),
                CoordinatorState::Initializing => {
                    return Err(MemoryError::not_ready("coordinator is already initializing"));
                }
                CoordinatorState::Closed => {
                    return Err(MemoryError::closed("coordinator is closed"));
                }
            }
        }

        let leaves = match self.open_leaves() {
            Ok(leaves) => Arc::new(leaves),
            Err(e) => {
                error!("Coordinator failed to initialize: {e}");
                *self.state.write() = CoordinatorState::Uninitialized;
                return Err(e);
            }
        };
        *self.leaves.write() = Some(leaves.clone());

        if leaves.ensure_writable().is_ok() {
            let mut failures = Vec::new();
            let resynced = self.resync_semantic(&leaves, &mut failures);
            if resynced > 0 {
                info!("Restored {resynced} synced entries missing or stale in the semantic leaf");
            }
            for failure in failures {
                warn!("Could not restore semantic entry {failure}");
            }
        }

        let report = leaves.monitor.check();
        let state = if report.status == HealthStatus::Unhealthy {
            CoordinatorState::Degraded
        } else {
            CoordinatorState::Ready
        };
        *self.state.write() = state;

        if let Some(interval) = self.config.health_check_interval() {
            let shared = self.state.clone();
            let task = leaves.monitor.spawn(interval, move |report| {
                transition(&shared, report.status != HealthStatus::Unhealthy)
            });
            *self.health_task.lock() = Some(task);
        }

        info!(
            "Coordinator {state}: {} structured entries, {} semantic entries",
            leaves.structured.len(),
            leaves.semantic.len()
        );
        Ok(())
    }

    fn open_leaves(&self) -> Result<Leaves> {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => open_root(self.config.data_dir.as_deref())?,
        };
        let lock = root.acquire_lock(LOCK_NAME).map_err(|e| {
            MemoryError::storage(format!("data directory is held by another coordinator: {e}"))
        })?;

        let structured_storage: Arc<dyn Storage> =
            Arc::new(PrefixedStorage::new(STRUCTURED_DIR, root.clone()));
        let semantic_storage: Arc<dyn Storage> =
            Arc::new(PrefixedStorage::new(SEMANTIC_DIR, root));

        let structured = Arc::new(StructuredStore::open(
            structured_storage,
            self.config.structured_config(),
        )?);
        let semantic = Arc::new(SemanticStore::open(
            semantic_storage,
            self.config.semantic_config(),
            self.embedder.clone(),
        )?);
        let monitor = Arc::new(HealthMonitor::new(structured.clone(), semantic.clone()));

        Ok(Leaves {
            structured,
            semantic,
            monitor,
            _lock: lock,
        })
    }

    /// Shut down: stop background checks, checkpoint both leaves and release
    /// the data directory. Every later call fails with `Closed`.
    pub async fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.write(), CoordinatorState::Closed);
        if previous == CoordinatorState::Closed {
            return Ok(());
        }

        let task = self.health_task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }

        let leaves = self.leaves.write().take();
        let mut first_error = None;
        if let Some(leaves) = leaves {
            if leaves.structured.is_online() && !leaves.structured.is_corrupt() {
                if let Err(e) = leaves.structured.checkpoint() {
                    warn!("Structured checkpoint on close failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
            if leaves.semantic.is_online() && !leaves.semantic.is_corrupt() {
                if let Err(e) = leaves.semantic.checkpoint() {
                    warn!("Semantic checkpoint on close failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!("Coordinator closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The open leaves, if the coordinator is serving. Updates the
    /// `Ready`/`Degraded` state from their current health.
    fn leaves(&self) -> Result<Arc<Leaves>> {
        match self.state() {
            CoordinatorState::Uninitialized | CoordinatorState::Initializing => {
                return Err(MemoryError::not_ready("coordinator is not initialized"));
            }
            CoordinatorState::Closed => return Err(MemoryError::closed("coordinator is closed")),
            CoordinatorState::Ready | CoordinatorState::Degraded => {}
        }

        let leaves = self
            .leaves
            .read()
            .clone()
            .ok_or_else(|| MemoryError::not_ready("coordinator has no open leaves"))?;
        transition(&self.state, leaves.healthy());
        Ok(leaves)
    }

    /// The structured leaf, for administration and fault drills.
    pub fn structured_store(&self) -> Result<Arc<StructuredStore>> {
        Ok(self.leaves()?.structured.clone())
    }

    /// The semantic leaf, for administration and fault drills.
    pub fn semantic_store(&self) -> Result<Arc<SemanticStore>> {
        Ok(self.leaves()?.semantic.clone())
    }

    fn check_vector(&self, leaves: &Leaves, vector: &Vector) -> Result<()> {
        match leaves.semantic.dimension() {
            0 if vector.dimension() == 0 => Err(MemoryError::validation("vector must not be empty")),
            0 if !vector.is_valid() => Err(MemoryError::validation(
                "Vector contains NaN or infinite values",
            )),
            0 => Ok(()),
            dimension => vector.validate(dimension),
        }
    }

    /// Insert or replace an entry in both leaves.
    ///
    /// Fails only when the structured write fails (or, in strict mode, when
    /// either write fails). A failed semantic half in best-effort mode leaves
    /// the entry `PendingRepair` and is reported as a warning.
    pub async fn store(&self, request: StoreRequest) -> Result<WriteResult> {
        let leaves = self.leaves()?;
        let namespace = self.namespaces.resolve(request.namespace.as_deref())?;
        let mut entry = request.into_entry(namespace);
        entry.validate()?;

        let mut warnings = Vec::new();
        match &entry.vector {
            Some(vector) => self.check_vector(&leaves, vector)?,
            None if self.config.dual_write => {
                if let Some(embedder) = &self.embedder {
                    let embedded = embedder
                        .embed(&entry.content)
                        .await
                        .and_then(|vector| self.check_vector(&leaves, &vector).map(|_| vector));
                    match embedded {
                        Ok(vector) => entry.vector = Some(vector),
                        Err(e) => {
                            warn!(
                                "Embedding {}/{} failed, storing structured only: {e}",
                                entry.namespace, entry.key
                            );
                            warnings.push(ConsistencyWarning::EmbeddingFailed {
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
            None => {}
        }

        let result = match self.config.dual_write_mode {
            DualWriteMode::BestEffort => self.store_best_effort(&leaves, entry, warnings).await,
            DualWriteMode::Strict => self.store_strict(&leaves, entry, warnings).await,
        };
        match &result {
            Ok(_) => Counters::bump(&self.counters.writes),
            Err(_) => Counters::bump(&self.counters.write_failures),
        }
        result
    }

    fn write_result(entry: &MemoryEntry, written: &Written, warnings: Vec<ConsistencyWarning>) -> WriteResult {
        WriteResult {
            id: written.id,
            namespace: entry.namespace.clone(),
            key: entry.key.clone(),
            structured_ok: true,
            semantic_ok: false,
            created: written.created,
            sync: entry.sync,
            warnings,
        }
    }

    async fn write_structured(&self, leaves: &Leaves, entry: MemoryEntry) -> Result<Written> {
        let structured = leaves.structured.clone();
        join_blocking("structured", tokio::task::spawn_blocking(move || structured.store(entry)))
            .await
    }

    async fn store_best_effort(
        &self,
        leaves: &Arc<Leaves>,
        mut entry: MemoryEntry,
        warnings: Vec<ConsistencyWarning>,
    ) -> Result<WriteResult> {
        let index_semantic = self.config.dual_write && entry.has_vector();
        entry.sync = if index_semantic {
            SyncState::PendingRepair
        } else {
            SyncState::StructuredOnly
        };
        let previous = index_semantic
            .then(|| self.semantic_copy(leaves, &entry.id))
            .flatten();

        let structured_task = {
            let structured = leaves.structured.clone();
            let entry = entry.clone();
            tokio::task::spawn_blocking(move || structured.store(entry))
        };
        let semantic_task = index_semantic.then(|| {
            let semantic = leaves.semantic.clone();
            let entry = entry.clone();
            tokio::task::spawn_blocking(move || semantic.store(entry))
        });

        let structured = join_blocking("structured", structured_task).await;
        let semantic = match semantic_task {
            Some(task) => Some(join_blocking("semantic", task).await),
            None => None,
        };

        let written = match structured {
            Ok(written) => written,
            Err(e) => {
                if matches!(semantic, Some(Ok(IndexOutcome::Indexed))) {
                    self.rollback_semantic(leaves, &entry, previous);
                }
                warn!("Structured write of {}/{} failed: {e}", entry.namespace, entry.key);
                return Err(e);
            }
        };

        let mut result = Self::write_result(&entry, &written, warnings);
        match semantic {
            Some(Ok(IndexOutcome::Indexed)) => {
                result.semantic_ok = true;
                result.sync = self.mark_synced(leaves, &entry, &written, &mut result.warnings);
            }
            Some(Ok(IndexOutcome::Skipped)) | None => {}
            Some(Err(e)) => {
                Counters::bump(&self.counters.partial_writes);
                warn!(
                    "Semantic write of {}/{} failed, flagged for repair: {e}",
                    entry.namespace, entry.key
                );
                result.warnings.push(ConsistencyWarning::SemanticWriteFailed {
                    reason: e.to_string(),
                });
                transition(&self.state, leaves.healthy());
            }
        }
        Ok(result)
    }

    async fn store_strict(
        &self,
        leaves: &Arc<Leaves>,
        mut entry: MemoryEntry,
        warnings: Vec<ConsistencyWarning>,
    ) -> Result<WriteResult> {
        if !(self.config.dual_write && entry.has_vector()) {
            entry.sync = SyncState::StructuredOnly;
            let written = self.write_structured(leaves, entry.clone()).await?;
            return Ok(Self::write_result(&entry, &written, warnings));
        }

        entry.sync = SyncState::Synced;
        let previous = self.semantic_copy(leaves, &entry.id);
        let semantic = leaves.semantic.clone();
        let copy = entry.clone();
        join_blocking(
            "semantic",
            tokio::task::spawn_blocking(move || semantic.store(copy)),
        )
        .await?;

        let written = match self.write_structured(leaves, entry.clone()).await {
            Ok(written) => written,
            Err(e) => {
                warn!(
                    "Structured write of {}/{} failed, rolling back the semantic write: {e}",
                    entry.namespace, entry.key
                );
                self.rollback_semantic(leaves, &entry, previous);
                return Err(e);
            }
        };

        if let Err(e) =
            leaves
                .semantic
                .stamp(&written.id, written.seq, written.created_at, SyncState::Synced)
        {
            warn!("Could not stamp semantic copy of {}/{}: {e}", entry.namespace, entry.key);
        }

        let mut result = Self::write_result(&entry, &written, warnings);
        result.semantic_ok = true;
        Ok(result)
    }

    fn semantic_copy(&self, leaves: &Leaves, id: &EntryId) -> Option<MemoryEntry> {
        leaves.semantic.get(id).ok().flatten()
    }

    /// Undo a semantic write whose structured half failed.
    fn rollback_semantic(&self, leaves: &Leaves, entry: &MemoryEntry, previous: Option<MemoryEntry>) {
        let outcome = match previous {
            Some(previous) => leaves.semantic.store(previous).map(|_| ()),
            None => leaves.semantic.delete(&entry.id).map(|_| ()),
        };
        if let Err(e) = outcome {
            warn!(
                "Could not roll back semantic copy of {}/{}, left for repair: {e}",
                entry.namespace, entry.key
            );
        }
    }

    /// Record that both halves of a write committed.
    ///
    /// A concurrent write to the same key may have landed on the two leaves
    /// in opposite orders. The entry is only marked synced while both leaves
    /// hold the same revision; otherwise it stays pending for repair.
    fn mark_synced(
        &self,
        leaves: &Leaves,
        entry: &MemoryEntry,
        written: &Written,
        warnings: &mut Vec<ConsistencyWarning>,
    ) -> SyncState {
        let current = leaves.structured.get_by_key(&entry.namespace, &entry.key);
        let copy = leaves.semantic.get(&written.id);
        if let (Ok(Some(current)), Ok(Some(copy))) = (&current, &copy) {
            if !current.same_revision(copy) {
                warn!(
                    "Concurrent writes left {}/{} out of step, flagged for repair",
                    entry.namespace, entry.key
                );
                warnings.push(ConsistencyWarning::ConcurrentOverwrite);
                return SyncState::PendingRepair;
            }
        }

        if let Err(e) =
            leaves
                .semantic
                .stamp(&written.id, written.seq, written.created_at, SyncState::Synced)
        {
            warn!("Could not stamp semantic copy of {}/{}: {e}", entry.namespace, entry.key);
        }

        match leaves
            .structured
            .set_sync_state(&entry.namespace, &entry.key, SyncState::Synced)
        {
            Ok(true) => SyncState::Synced,
            Ok(false) => {
                warnings.push(ConsistencyWarning::SyncStateNotRecorded {
                    reason: "entry was removed concurrently".to_string(),
                });
                SyncState::PendingRepair
            }
            Err(e) => {
                warn!(
                    "Could not record sync state of {}/{}: {e}",
                    entry.namespace, entry.key
                );
                warnings.push(ConsistencyWarning::SyncStateNotRecorded {
                    reason: e.to_string(),
                });
                SyncState::PendingRepair
            }
        }
    }

    /// Exact lookup. Falls back to the semantic copy when the structured leaf
    /// is down and routing is automatic.
    pub async fn get_by_key(&self, namespace: Option<&str>, key: &str) -> Result<Option<MemoryEntry>> {
        let leaves = self.leaves()?;
        let namespace = self.namespaces.resolve(namespace)?;

        match leaves.structured.get_by_key(&namespace, key) {
            Err(MemoryError::BackendUnavailable(reason)) => match self.config.routing_strategy {
                RoutingStrategy::Auto => {
                    debug!("Structured leaf down, reading {namespace}/{key} from the semantic leaf");
                    Counters::bump(&self.counters.degraded_responses);
                    leaves.semantic.find_by_key(&namespace, key)
                }
                RoutingStrategy::Manual => Err(MemoryError::BackendUnavailable(reason)),
            },
            found => found,
        }
    }

    /// Run any query.
    pub async fn query(&self, spec: &QuerySpec, options: QueryOptions) -> Result<QueryResponse> {
        match spec {
            QuerySpec::Structured(filter) => self.query_structured(filter, options).await,
            QuerySpec::Semantic(query) => self.query_semantic(query, options).await,
            QuerySpec::Hybrid(query) => self.query_hybrid(query, options).await,
        }
    }

    fn deadline(&self, options: QueryOptions) -> Instant {
        Instant::now() + options.timeout.unwrap_or_else(|| self.config.query_timeout())
    }

    /// A semantic query with the configured threshold floor applied.
    fn effective_semantic(&self, query: &SemanticQuery, k: usize) -> SemanticQuery {
        let mut effective = query.clone();
        effective.k = k;
        effective.threshold = query.threshold.max(self.config.semantic_threshold);
        effective
    }

    fn spawn_structured(
        &self,
        leaves: &Leaves,
        filter: &StructuredFilter,
        scope: &NamespaceScope,
    ) -> Option<JoinHandle<Result<Vec<MemoryEntry>>>> {
        if !leaves.structured.is_online() {
            return None;
        }
        let structured = leaves.structured.clone();
        let filter = filter.clone();
        let scope = scope.clone();
        Some(tokio::task::spawn_blocking(move || {
            structured.query(&filter, &scope)
        }))
    }

    fn spawn_semantic(
        &self,
        leaves: &Leaves,
        query: SemanticQuery,
        scope: &NamespaceScope,
    ) -> Option<JoinHandle<Result<SemanticHits>>> {
        if !leaves.semantic.is_online() {
            return None;
        }
        let semantic = leaves.semantic.clone();
        let scope = scope.clone();
        Some(tokio::spawn(async move { semantic.query(&query, &scope).await }))
    }

    /// Wait for a leaf's part of a query until the shared deadline.
    async fn finish_leg<T>(
        &self,
        leaf: &str,
        handle: Option<JoinHandle<Result<T>>>,
        deadline: Instant,
    ) -> Result<Leg<T>> {
        let Some(mut handle) = handle else {
            return self.leaf_down(leaf, MemoryError::unavailable(format!("{leaf} leaf is offline")));
        };

        match tokio::time::timeout_at(deadline, &mut handle).await {
            Err(_) => {
                handle.abort();
                Counters::bump(&self.counters.timeouts);
                warn!("{leaf} leaf missed the query deadline");
                Ok(Leg::TimedOut)
            }
            Ok(Err(e)) => Err(MemoryError::internal(format!("{leaf} query task failed: {e}"))),
            Ok(Ok(Ok(value))) => Ok(Leg::Done(value)),
            Ok(Ok(Err(e @ MemoryError::BackendUnavailable(_)))) => self.leaf_down(leaf, e),
            Ok(Ok(Err(e))) => Err(e),
        }
    }

    fn leaf_down<T>(&self, leaf: &str, error: MemoryError) -> Result<Leg<T>> {
        match self.config.routing_strategy {
            RoutingStrategy::Auto => {
                debug!("Routing around the {leaf} leaf: {error}");
                if let Some(leaves) = self.leaves.read().as_ref() {
                    transition(&self.state, leaves.healthy());
                }
                Ok(Leg::Unavailable)
            }
            RoutingStrategy::Manual => Err(error),
        }
    }

    fn finish_response(
        &self,
        scope: &NamespaceScope,
        mut response: QueryResponse,
        started: StdInstant,
    ) -> QueryResponse {
        self.namespaces
            .retain_visible(scope, &mut response.hits, |hit| hit.entry.namespace.as_str());
        if response.degraded {
            Counters::bump(&self.counters.degraded_responses);
        }
        response.took_ms = started.elapsed().as_millis() as u64;
        response
    }

    /// Evaluate a structured filter.
    ///
    /// With automatic routing and the structured leaf down, the filter runs
    /// over the semantic leaf's entry copies instead.
    pub async fn query_structured(
        &self,
        filter: &StructuredFilter,
        options: QueryOptions,
    ) -> Result<QueryResponse> {
        let leaves = self.leaves()?;
        Counters::bump(&self.counters.structured_queries);
        let started = StdInstant::now();
        let deadline = self.deadline(options);
        let scope = self
            .namespaces
            .scope(filter.namespace.as_deref(), filter.all_namespaces)?;

        let mut response = QueryResponse::default();
        let leg = self.spawn_structured(&leaves, filter, &scope);
        let entries = match self.finish_leg("structured", leg, deadline).await? {
            Leg::Done(entries) => entries,
            Leg::TimedOut => {
                response.incomplete = true;
                Vec::new()
            }
            Leg::Unavailable => {
                response.degraded = true;
                leaves.semantic.filter_entries(filter, &scope)?
            }
        };

        response.structured_hits = entries.len();
        response.hits = merger::structured_only(entries);
        Ok(self.finish_response(&scope, response, started))
    }

    /// Nearest-neighbour search.
    ///
    /// With automatic routing and the semantic leaf down, the answer is empty
    /// and flagged degraded.
    pub async fn query_semantic(
        &self,
        query: &SemanticQuery,
        options: QueryOptions,
    ) -> Result<QueryResponse> {
        let leaves = self.leaves()?;
        Counters::bump(&self.counters.semantic_queries);
        let started = StdInstant::now();
        let deadline = self.deadline(options);
        let scope = self
            .namespaces
            .scope(query.namespace.as_deref(), query.all_namespaces)?;

        let mut response = QueryResponse::default();
        let leg = self.spawn_semantic(&leaves, self.effective_semantic(query, query.k), &scope);
        let hits = match self.finish_leg("semantic", leg, deadline).await? {
            Leg::Done(hits) => hits,
            Leg::TimedOut => {
                response.incomplete = true;
                Vec::new()
            }
            Leg::Unavailable => {
                response.degraded = true;
                Vec::new()
            }
        };

        response.semantic_hits = hits.len();
        response.hits = hits
            .into_iter()
            .map(|(entry, similarity)| ScoredEntry::semantic(entry, similarity))
            .collect();
        Ok(self.finish_response(&scope, response, started))
    }

    /// Query both leaves concurrently and merge by the query's strategy.
    ///
    /// The semantic half searches the filter's namespace scope. When one leaf
    /// is down (automatic routing) or misses the deadline, the other leaf's
    /// results are returned alone, flagged `degraded` or `incomplete`.
    pub async fn query_hybrid(
        &self,
        query: &HybridQuery,
        options: QueryOptions,
    ) -> Result<QueryResponse> {
        let leaves = self.leaves()?;
        Counters::bump(&self.counters.hybrid_queries);
        let started = StdInstant::now();
        let deadline = self.deadline(options);
        let scope = self
            .namespaces
            .scope(query.filter.namespace.as_deref(), query.filter.all_namespaces)?;

        let mut response = if query.strategy == CombineStrategy::StructuredFirst {
            self.structured_first(&leaves, query, &scope, deadline).await?
        } else {
            self.merge_both(&leaves, query, &scope, deadline).await?
        };

        merger::apply_limit(&mut response.hits, query.limit);
        Ok(self.finish_response(&scope, response, started))
    }

    async fn merge_both(
        &self,
        leaves: &Leaves,
        query: &HybridQuery,
        scope: &NamespaceScope,
        deadline: Instant,
    ) -> Result<QueryResponse> {
        let k = query.semantic.k;
        let fetch = match query.strategy {
            CombineStrategy::SemanticFirst => k.saturating_mul(SEMANTIC_FIRST_OVERFETCH),
            _ => k,
        };

        let structured_leg = self.spawn_structured(leaves, &query.filter, scope);
        let semantic_leg =
            self.spawn_semantic(leaves, self.effective_semantic(&query.semantic, fetch), scope);
        let structured = self.finish_leg("structured", structured_leg, deadline).await?;
        let semantic = self.finish_leg("semantic", semantic_leg, deadline).await?;

        let mut response = QueryResponse {
            incomplete: matches!(structured, Leg::TimedOut) || matches!(semantic, Leg::TimedOut),
            degraded: matches!(structured, Leg::Unavailable)
                || matches!(semantic, Leg::Unavailable),
            ..QueryResponse::default()
        };
        if matches!(
            (&structured, &semantic),
            (Leg::Unavailable, Leg::Unavailable)
        ) {
            return Err(MemoryError::unavailable("both leaves are unavailable"));
        }

        response.hits = match (structured, semantic) {
            (Leg::Done(structured), Leg::Done(semantic)) => {
                response.structured_hits = structured.len();
                response.semantic_hits = semantic.len();
                debug!(
                    "Merging {} structured and {} semantic hits ({:?})",
                    structured.len(),
                    semantic.len(),
                    query.strategy
                );
                match query.strategy {
                    CombineStrategy::Union => merger::union(structured, semantic),
                    CombineStrategy::Intersection => merger::intersection(structured, semantic),
                    CombineStrategy::SemanticFirst | CombineStrategy::StructuredFirst => {
                        let mut hits =
                            merger::semantic_first(semantic, &query.filter, &structured);
                        hits.truncate(k);
                        hits
                    }
                }
            }
            (Leg::Done(structured), _) => {
                response.structured_hits = structured.len();
                merger::structured_only(structured)
            }
            (_, Leg::Done(semantic)) => {
                response.semantic_hits = semantic.len();
                let mut hits = merger::semantic_only(semantic, &query.filter);
                hits.truncate(k);
                hits
            }
            _ => Vec::new(),
        };
        Ok(response)
    }

    async fn structured_first(
        &self,
        leaves: &Leaves,
        query: &HybridQuery,
        scope: &NamespaceScope,
        deadline: Instant,
    ) -> Result<QueryResponse> {
        let structured_leg = self.spawn_structured(leaves, &query.filter, scope);
        let vector_leg = {
            let semantic = leaves.semantic.clone();
            let input = query.semantic.input.clone();
            Some(tokio::spawn(async move { semantic.resolve_vector(&input).await }))
        };

        let pool = self.finish_leg("structured", structured_leg, deadline).await?;
        let vector = self.finish_leg("semantic", vector_leg, deadline).await?;

        let mut response = QueryResponse::default();
        let pool = match pool {
            Leg::Done(pool) => pool,
            Leg::TimedOut => {
                response.incomplete = true;
                return Ok(response);
            }
            Leg::Unavailable => {
                response.degraded = true;
                leaves.semantic.filter_entries(&query.filter, scope)?
            }
        };
        response.structured_hits = pool.len();

        response.hits = match vector {
            Leg::Done(vector) => {
                let ranked = leaves.semantic.score_candidates(&vector, pool.clone())?;
                response.semantic_hits = ranked.len();
                merger::structured_first(pool, ranked)
            }
            Leg::TimedOut => {
                response.incomplete = true;
                merger::structured_only(pool)
            }
            Leg::Unavailable => {
                response.degraded = true;
                merger::structured_only(pool)
            }
        };
        Ok(response)
    }

    /// Remove an entry from both leaves.
    ///
    /// The structured delete is required. A failed semantic delete leaves an
    /// orphan that the next repair pass removes.
    pub async fn delete(&self, namespace: Option<&str>, key: &str) -> Result<DeleteResult> {
        let leaves = self.leaves()?;
        let namespace = self.namespaces.resolve(namespace)?;

        let structured = leaves.structured.delete(&namespace, key)?;
        let semantic = match leaves.semantic.delete_key(&namespace, key) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Semantic delete of {namespace}/{key} failed, left for repair: {e}");
                false
            }
        };

        Counters::bump(&self.counters.deletes);
        debug!("Deleted {namespace}/{key} (structured {structured}, semantic {semantic})");
        Ok(DeleteResult {
            structured,
            semantic,
        })
    }

    /// Check both leaves now.
    pub fn health(&self) -> Result<HealthReport> {
        let leaves = self.leaves()?;
        let report = leaves.monitor.check();
        transition(&self.state, report.status != HealthStatus::Unhealthy);
        Ok(report)
    }

    pub fn stats(&self) -> Result<CoordinatorStats> {
        let leaves = self.leaves()?;
        Ok(CoordinatorStats {
            state: self.state(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            structured: leaves.structured.stats(),
            semantic: leaves.semantic.stats(),
            counters: self.counters.snapshot(),
        })
    }

    /// Write the semantic half of a structured entry and record it as synced.
    fn index_copy(&self, leaves: &Leaves, entry: MemoryEntry) -> std::result::Result<(), String> {
        let label = format!("{}/{}", entry.namespace, entry.key);
        if !entry.has_vector() {
            leaves
                .structured
                .set_sync_state(&entry.namespace, &entry.key, SyncState::StructuredOnly)
                .map_err(|e| format!("{label}: {e}"))?;
            return Err(format!("{label}: no vector to index"));
        }

        let (id, seq, created_at) = (entry.id, entry.seq, entry.created_at);
        let (namespace, key) = (entry.namespace.clone(), entry.key.clone());
        leaves
            .semantic
            .store(entry)
            .map_err(|e| format!("{label}: {e}"))?;
        leaves
            .semantic
            .stamp(&id, seq, created_at, SyncState::Synced)
            .map_err(|e| format!("{label}: {e}"))?;
        leaves
            .structured
            .set_sync_state(&namespace, &key, SyncState::Synced)
            .map_err(|e| format!("{label}: {e}"))?;
        Ok(())
    }

    /// Re-index synced entries whose semantic copy is missing or holds a
    /// different revision, e.g. writes after its last checkpoint before a
    /// crash, or two concurrent writes to one key landing in opposite orders.
    fn resync_semantic(&self, leaves: &Leaves, failures: &mut Vec<String>) -> usize {
        let synced = match leaves.structured.entries_with_state(SyncState::Synced) {
            Ok(entries) => entries,
            Err(e) => {
                failures.push(format!("listing synced entries: {e}"));
                return 0;
            }
        };

        let mut restored = 0;
        for entry in synced {
            if !entry.has_vector() {
                continue;
            }
            let label = format!("{}/{}", entry.namespace, entry.key);
            match leaves.semantic.get(&entry.id) {
                Ok(Some(copy)) if copy.same_revision(&entry) => continue,
                Ok(Some(_)) => debug!("Semantic copy of {label} is stale, re-indexing"),
                Ok(None) => {}
                Err(e) => {
                    failures.push(format!("{label}: {e}"));
                    continue;
                }
            }
            match leaves.semantic.store(entry) {
                Ok(_) => restored += 1,
                Err(e) => failures.push(format!("{label}: {e}")),
            }
        }
        restored
    }

    fn purge_expired_in(&self, leaves: &Leaves) -> Result<usize> {
        let expired = leaves.structured.purge_expired()?;
        for entry in &expired {
            if let Err(e) = leaves.semantic.delete(&entry.id) {
                warn!(
                    "Could not drop expired semantic copy of {}/{}: {e}",
                    entry.namespace, entry.key
                );
            }
        }
        let stray = leaves.semantic.purge_expired()?;
        Ok(expired.len() + stray.len())
    }

    /// Remove expired entries from both leaves. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        let leaves = self.leaves()?;
        leaves.ensure_writable()?;
        let purged = self.purge_expired_in(&leaves)?;
        if purged > 0 {
            info!("Purged {purged} expired entries");
        }
        Ok(purged)
    }

    /// Reconcile the two leaves.
    ///
    /// Retries the semantic half of `PendingRepair` entries, back-fills
    /// `StructuredOnly` entries (embedding them when an embedder is
    /// configured), restores synced entries the semantic leaf lost, removes
    /// semantic orphans and purges expired entries.
    pub async fn repair(&self) -> Result<RepairReport> {
        let leaves = self.leaves()?;
        leaves.ensure_writable()?;
        let mut report = RepairReport {
            expired_purged: self.purge_expired_in(&leaves)?,
            ..RepairReport::default()
        };

        for entry in leaves.structured.entries_with_state(SyncState::PendingRepair)? {
            match self.index_copy(&leaves, entry) {
                Ok(()) => report.retried += 1,
                Err(failure) => report.failures.push(failure),
            }
        }

        if self.config.dual_write {
            for mut entry in leaves.structured.entries_with_state(SyncState::StructuredOnly)? {
                if entry.vector.is_none() {
                    let Some(embedder) = &self.embedder else {
                        continue;
                    };
                    let embedded = embedder
                        .embed(&entry.content)
                        .await
                        .and_then(|vector| self.check_vector(&leaves, &vector).map(|_| vector));
                    let vector = match embedded {
                        Ok(vector) => vector,
                        Err(e) => {
                            report
                                .failures
                                .push(format!("{}/{}: {e}", entry.namespace, entry.key));
                            continue;
                        }
                    };
                    entry.vector = Some(vector);
                    entry.sync = SyncState::PendingRepair;
                    if let Err(e) = leaves.structured.store(entry.clone()) {
                        report
                            .failures
                            .push(format!("{}/{}: {e}", entry.namespace, entry.key));
                        continue;
                    }
                }
                match self.index_copy(&leaves, entry) {
                    Ok(()) => report.backfilled += 1,
                    Err(failure) => report.failures.push(failure),
                }
            }
        }

        report.resynced = self.resync_semantic(&leaves, &mut report.failures);

        for entry in leaves.semantic.scan(&NamespaceScope::All)? {
            match leaves.structured.get_by_key(&entry.namespace, &entry.key) {
                Ok(Some(_)) => {}
                Ok(None) => match leaves.semantic.delete(&entry.id) {
                    Ok(removed) => report.orphans_removed += usize::from(removed),
                    Err(e) => report
                        .failures
                        .push(format!("{}/{}: {e}", entry.namespace, entry.key)),
                },
                Err(e) => report
                    .failures
                    .push(format!("{}/{}: {e}", entry.namespace, entry.key)),
            }
        }

        Counters::bump(&self.counters.repairs);
        if report.failures.is_empty() {
            info!("Repair pass: {report}");
        } else {
            warn!("Repair pass: {report}");
        }
        Ok(report)
    }

    /// Rebuild the semantic leaf from the structured leaf's vectors.
    pub async fn rebuild_semantic(&self) -> Result<usize> {
        let leaves = self.leaves()?;
        let mut entries = leaves.structured.scan(&NamespaceScope::All)?;
        entries.retain(MemoryEntry::has_vector);

        let previous: Vec<(EntryId, String, String, SyncState)> = entries
            .iter()
            .map(|entry| (entry.id, entry.namespace.clone(), entry.key.clone(), entry.sync))
            .collect();
        for entry in &mut entries {
            entry.sync = SyncState::Synced;
        }

        let semantic = leaves.semantic.clone();
        let indexed = join_blocking(
            "semantic",
            tokio::task::spawn_blocking(move || semantic.rebuild(entries)),
        )
        .await?;

        if !leaves.structured.is_corrupt() {
            for (id, namespace, key, sync) in previous {
                let now = if leaves.semantic.contains(&id) {
                    SyncState::Synced
                } else {
                    SyncState::PendingRepair
                };
                if now == sync {
                    continue;
                }
                if let Err(e) = leaves.structured.set_sync_state(&namespace, &key, now) {
                    warn!("Could not record sync state of {namespace}/{key}: {e}");
                }
            }
        }

        transition(&self.state, leaves.healthy());
        Ok(indexed)
    }

    /// Rebuild the structured leaf from whatever its files still hold.
    pub async fn rebuild_structured(&self) -> Result<RecoveryReport> {
        let leaves = self.leaves()?;
        let structured = leaves.structured.clone();
        let report = join_blocking(
            "structured",
            tokio::task::spawn_blocking(move || structured.rebuild()),
        )
        .await?;
        transition(&self.state, leaves.healthy());
        Ok(report)
    }

    /// Compact the structured WAL and persist the semantic graphs.
    pub async fn checkpoint(&self) -> Result<()> {
        let leaves = self.leaves()?;
        let structured = leaves.structured.clone();
        join_blocking(
            "structured",
            tokio::task::spawn_blocking(move || structured.checkpoint()),
        )
        .await?;
        let semantic = leaves.semantic.clone();
        join_blocking(
            "semantic",
            tokio::task::spawn_blocking(move || semantic.checkpoint()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn config() -> HybridMemoryConfig {
        HybridMemoryConfig::default()
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let memory = HybridCoordinator::new(config(), None).unwrap();
        assert_eq!(memory.state(), CoordinatorState::Uninitialized);
        assert!(matches!(
            memory.store(StoreRequest::new("k", "v")).await,
            Err(MemoryError::NotReady(_))
        ));

        memory.initialize().await.unwrap();
        assert_eq!(memory.state(), CoordinatorState::Ready);
        // A second initialize is a no-op.
        memory.initialize().await.unwrap();

        memory.close().await.unwrap();
        assert_eq!(memory.state(), CoordinatorState::Closed);
        assert!(matches!(
            memory.get_by_key(None, "k").await,
            Err(MemoryError::Closed(_))
        ));
        assert!(matches!(memory.initialize().await, Err(MemoryError::Closed(_))));
        memory.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_degraded_follows_leaf_health() {
        let memory = HybridCoordinator::open(config(), None).await.unwrap();
        let semantic = memory.semantic_store().unwrap();

        semantic.set_online(false);
        let report = memory.health().unwrap();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(memory.state(), CoordinatorState::Degraded);

        semantic.set_online(true);
        memory.health().unwrap();
        assert_eq!(memory.state(), CoordinatorState::Ready);
    }

    #[tokio::test]
    async fn test_background_checks_drive_state() {
        let memory = HybridCoordinator::open(
            config().with_health_check_interval(std::time::Duration::from_millis(10)),
            None,
        )
        .await
        .unwrap();
        let structured = memory.structured_store().unwrap();

        structured.set_online(false);
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(memory.state(), CoordinatorState::Degraded);

        structured.set_online(true);
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(memory.state(), CoordinatorState::Ready);

        memory.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_step_write_is_left_pending() {
        let memory = HybridCoordinator::open(config(), None).await.unwrap();
        let leaves = memory.leaves().unwrap();

        let mut newer = MemoryEntry::new("default", "k", "second").with_vector(vec![1.0, 0.0]);
        newer.sync = SyncState::PendingRepair;
        let mut older = newer.clone();
        older.content = "first".to_string();
        older.updated_at = newer.updated_at - chrono::Duration::seconds(1);

        // The structured leaf applied the newer write last, the semantic leaf the older.
        let written = leaves.structured.store(newer.clone()).unwrap();
        leaves.semantic.store(older).unwrap();

        let mut warnings = Vec::new();
        let sync = memory.mark_synced(&leaves, &newer, &written, &mut warnings);
        assert_eq!(sync, SyncState::PendingRepair);
        assert_eq!(warnings, vec![ConsistencyWarning::ConcurrentOverwrite]);
        let stored = memory.get_by_key(None, "k").await.unwrap().unwrap();
        assert_eq!(stored.sync, SyncState::PendingRepair);

        let report = memory.repair().await.unwrap();
        assert_eq!(report.retried, 1);
        let copy = leaves.semantic.get(&newer.id).unwrap().unwrap();
        assert_eq!(copy.content, "second");
        assert_eq!(
            memory.get_by_key(None, "k").await.unwrap().unwrap().sync,
            SyncState::Synced
        );
    }

    #[tokio::test]
    async fn test_second_coordinator_on_same_root_is_refused() {
        let root: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let first = HybridCoordinator::with_storage(config(), root.clone(), None).unwrap();
        first.initialize().await.unwrap();

        let second = HybridCoordinator::with_storage(config(), root.clone(), None).unwrap();
        assert!(matches!(second.initialize().await, Err(MemoryError::Storage(_))));
        assert_eq!(second.state(), CoordinatorState::Uninitialized);

        first.close().await.unwrap();
        second.initialize().await.unwrap();
        assert_eq!(second.state(), CoordinatorState::Ready);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let bad = config().with_semantic_threshold(2.0);
        assert!(matches!(
            HybridCoordinator::new(bad, None),
            Err(MemoryError::InvalidConfig(_))
        ));

        let embedder: Arc<dyn EmbeddingGenerator> =
            Arc::new(crate::embedding::HashingEmbedder::new(8));
        assert!(matches!(
            HybridCoordinator::new(config().with_dimension(16), Some(embedder)),
            Err(MemoryError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_threshold_floor_from_config() {
        let memory = HybridCoordinator::open(config().with_semantic_threshold(0.9), None)
            .await
            .unwrap();
        memory
            .store(StoreRequest::new("near", "n").with_vector(vec![1.0, 0.0]))
            .await
            .unwrap();
        memory
            .store(StoreRequest::new("far", "f").with_vector(vec![0.0, 1.0]))
            .await
            .unwrap();

        let response = memory
            .query_semantic(&SemanticQuery::vector(vec![1.0, 0.05], 5), QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(response.keys(), vec!["near"]);
    }
}
