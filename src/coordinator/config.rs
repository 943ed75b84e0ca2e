//! Configuration for the hybrid coordinator.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::namespace::NamespaceManager;
use crate::semantic::{DistanceMetric, HnswParams, SemanticConfig};
use crate::structured::StructuredConfig;

/// How a store reaches the semantic leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DualWriteMode {
    /// The semantic write is awaited first; the call fails unless both halves
    /// commit.
    Strict,
    /// Both writes run concurrently; only the structured half is required.
    #[default]
    BestEffort,
}

impl DualWriteMode {
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "strict" => Some(DualWriteMode::Strict),
            "best_effort" => Some(DualWriteMode::BestEffort),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DualWriteMode::Strict => "strict",
            DualWriteMode::BestEffort => "best_effort",
        }
    }
}

impl fmt::Display for DualWriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What happens when a leaf is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Answer from the surviving leaf and flag the response as degraded.
    #[default]
    Auto,
    /// Fail with `BackendUnavailable`.
    Manual,
}

impl RoutingStrategy {
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(RoutingStrategy::Auto),
            "manual" => Some(RoutingStrategy::Manual),
            _ => None,
        }
    }
}

/// Configuration for [`HybridCoordinator`](super::HybridCoordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridMemoryConfig {
    /// Root directory of both leaves. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,

    /// Write vectors to the semantic leaf at all.
    pub dual_write: bool,

    pub dual_write_mode: DualWriteMode,

    pub routing_strategy: RoutingStrategy,

    /// Minimum similarity of any semantic hit, in `[0, 1]`.
    pub semantic_threshold: f32,

    /// Semantic query cache capacity; `0` disables the cache.
    pub cache_size: usize,

    pub cache_ttl_ms: u64,

    pub hnsw_m: usize,

    pub hnsw_ef_construction: usize,

    pub hnsw_ef_search: usize,

    /// Vector dimension; `0` adopts the first vector's dimension.
    pub dimension: usize,

    pub distance_metric: DistanceMetric,

    /// Live entries the structured leaf may hold; `0` means unbounded.
    pub max_entries: usize,

    pub default_namespace: String,

    pub query_timeout_ms: u64,

    /// Background health check period. No background checks when absent.
    pub health_check_interval_ms: Option<u64>,

    /// Journaled writes between automatic checkpoints of either leaf.
    pub wal_compaction_threshold: usize,
}

impl Default for HybridMemoryConfig {
    fn default() -> Self {
        let hnsw = HnswParams::default();
        HybridMemoryConfig {
            data_dir: None,
            dual_write: true,
            dual_write_mode: DualWriteMode::default(),
            routing_strategy: RoutingStrategy::default(),
            semantic_threshold: 0.0,
            cache_size: 1000,
            cache_ttl_ms: 60_000,
            hnsw_m: hnsw.m,
            hnsw_ef_construction: hnsw.ef_construction,
            hnsw_ef_search: hnsw.ef_search,
            dimension: 0,
            distance_metric: hnsw.metric,
            max_entries: 100_000,
            default_namespace: "default".to_string(),
            query_timeout_ms: 5_000,
            health_check_interval_ms: None,
            wal_compaction_threshold: 1_000,
        }
    }
}

impl HybridMemoryConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn with_dual_write(mut self, dual_write: bool) -> Self {
        self.dual_write = dual_write;
        self
    }

    pub fn with_dual_write_mode(mut self, mode: DualWriteMode) -> Self {
        self.dual_write_mode = mode;
        self
    }

    pub fn with_routing_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.routing_strategy = strategy;
        self
    }

    pub fn with_semantic_threshold(mut self, threshold: f32) -> Self {
        self.semantic_threshold = threshold;
        self
    }

    pub fn with_cache(mut self, size: usize, ttl: Duration) -> Self {
        self.cache_size = size;
        self.cache_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_hnsw(mut self, m: usize, ef_construction: usize, ef_search: usize) -> Self {
        self.hnsw_m = m;
        self.hnsw_ef_construction = ef_construction;
        self.hnsw_ef_search = ef_search;
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_distance_metric(mut self, metric: DistanceMetric) -> Self {
        self.distance_metric = metric;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_wal_compaction_threshold(mut self, threshold: usize) -> Self {
        self.wal_compaction_threshold = threshold;
        self
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval_ms.map(Duration::from_millis)
    }

    pub fn hnsw_params(&self) -> HnswParams {
        HnswParams {
            m: self.hnsw_m,
            ef_construction: self.hnsw_ef_construction,
            ef_search: self.hnsw_ef_search,
            metric: self.distance_metric,
            ..HnswParams::default()
        }
    }

    pub fn structured_config(&self) -> StructuredConfig {
        StructuredConfig {
            max_entries: self.max_entries,
            wal_compaction_threshold: self.wal_compaction_threshold,
        }
    }

    pub fn semantic_config(&self) -> SemanticConfig {
        SemanticConfig {
            dimension: self.dimension,
            hnsw: self.hnsw_params(),
            cache_size: self.cache_size,
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            checkpoint_threshold: self.wal_compaction_threshold,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.semantic_threshold) {
            return Err(MemoryError::invalid_config(format!(
                "semantic_threshold must be between 0.0 and 1.0, got {}",
                self.semantic_threshold
            )));
        }

        if self.cache_size > 0 && self.cache_ttl_ms == 0 {
            return Err(MemoryError::invalid_config(
                "cache_ttl_ms must be greater than 0 when the cache is enabled",
            ));
        }

        if self.query_timeout_ms == 0 {
            return Err(MemoryError::invalid_config(
                "query_timeout_ms must be greater than 0",
            ));
        }

        if self.health_check_interval_ms == Some(0) {
            return Err(MemoryError::invalid_config(
                "health_check_interval_ms must be greater than 0",
            ));
        }

        self.hnsw_params()
            .validate()
            .map_err(|e| MemoryError::invalid_config(format!("hnsw: {e}")))?;
        NamespaceManager::validate_name(&self.default_namespace)
            .map_err(|e| MemoryError::invalid_config(format!("default_namespace: {e}")))?;

        Ok(())
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            MemoryError::invalid_config(format!("cannot open {}: {e}", path.display()))
        })?;
        let config: HybridMemoryConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HybridMemoryConfig::default();
        config.validate().unwrap();

        assert!(config.dual_write);
        assert_eq!(config.dual_write_mode, DualWriteMode::BestEffort);
        assert_eq!(config.routing_strategy, RoutingStrategy::Auto);
        assert_eq!(config.hnsw_m, 16);
        assert_eq!(config.hnsw_ef_construction, 200);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            HybridMemoryConfig::default().with_semantic_threshold(1.5),
            HybridMemoryConfig::default().with_query_timeout(Duration::ZERO),
            HybridMemoryConfig::default().with_hnsw(0, 200, 50),
            HybridMemoryConfig::default().with_default_namespace(""),
            HybridMemoryConfig::default().with_cache(10, Duration::ZERO),
            HybridMemoryConfig::default().with_health_check_interval(Duration::ZERO),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(MemoryError::InvalidConfig(_))),
                "{config:?}"
            );
        }

        // A disabled cache needs no TTL.
        HybridMemoryConfig::default()
            .with_cache(0, Duration::ZERO)
            .validate()
            .unwrap();
    }

    #[test]
    fn test_leaf_configs() {
        let config = HybridMemoryConfig::default()
            .with_hnsw(8, 64, 32)
            .with_dimension(12)
            .with_distance_metric(DistanceMetric::Euclidean)
            .with_max_entries(10)
            .with_wal_compaction_threshold(7);

        let semantic = config.semantic_config();
        assert_eq!(semantic.dimension, 12);
        assert_eq!(semantic.hnsw.m, 8);
        assert_eq!(semantic.hnsw.ef_construction, 64);
        assert_eq!(semantic.hnsw.ef_search, 32);
        assert_eq!(semantic.hnsw.metric, DistanceMetric::Euclidean);
        assert_eq!(semantic.checkpoint_threshold, 7);

        let structured = config.structured_config();
        assert_eq!(structured.max_entries, 10);
        assert_eq!(structured.wal_compaction_threshold, 7);
    }

    #[test]
    fn test_json_file_roundtrip_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");

        let config = HybridMemoryConfig::default()
            .with_dual_write_mode(DualWriteMode::Strict)
            .with_health_check_interval(Duration::from_secs(5));
        config.to_json_file(&path).unwrap();
        assert_eq!(HybridMemoryConfig::from_json_file(&path).unwrap(), config);

        std::fs::write(&path, r#"{"routing_strategy": "manual", "cache_size": 0}"#).unwrap();
        let partial = HybridMemoryConfig::from_json_file(&path).unwrap();
        assert_eq!(partial.routing_strategy, RoutingStrategy::Manual);
        assert_eq!(partial.cache_size, 0);
        assert_eq!(partial.query_timeout_ms, 5_000);
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!(DualWriteMode::parse_str("best-effort"), Some(DualWriteMode::BestEffort));
        assert_eq!(DualWriteMode::parse_str("STRICT"), Some(DualWriteMode::Strict));
        assert_eq!(DualWriteMode::parse_str("eventual"), None);
        assert_eq!(RoutingStrategy::parse_str("Manual"), Some(RoutingStrategy::Manual));
    }
}
