//! Command implementations for the hybrid-memory CLI.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::cli::args::*;
use crate::cli::output::*;
use crate::coordinator::{HybridCoordinator, HybridMemoryConfig};
use crate::embedding::{EmbeddingGenerator, HashingEmbedder};
use crate::entry::StoreRequest;
use crate::error::{MemoryError, Result};
use crate::query::{HybridQuery, QueryOptions, QuerySpec, SemanticQuery, StructuredFilter};

/// Execute a CLI command.
///
/// The coordinator is opened for the duration of the command and closed
/// afterwards, even when the command fails.
pub async fn execute_command(args: MemoryArgs) -> Result<()> {
    let config = load_config(&args)?;
    let embedder = build_embedder(&args);
    debug!(
        "opening memory at {:?} with embedder {:?}",
        config.data_dir, args.embedder
    );

    let coordinator = HybridCoordinator::open(config, embedder).await?;
    let outcome = run(&coordinator, &args).await;
    let closed = coordinator.close().await;
    outcome?;
    closed
}

async fn run(coordinator: &HybridCoordinator, args: &MemoryArgs) -> Result<()> {
    match &args.command {
        Command::Store(store_args) => store_entry(coordinator, store_args.clone(), args).await,
        Command::Get(key_args) => get_entry(coordinator, key_args.clone(), args).await,
        Command::Query(query_args) => run_query(coordinator, query_args.clone(), args).await,
        Command::Search(search_args) => run_search(coordinator, search_args.clone(), args).await,
        Command::Hybrid(hybrid_args) => run_hybrid(coordinator, hybrid_args.clone(), args).await,
        Command::Delete(key_args) => delete_entry(coordinator, key_args.clone(), args).await,
        Command::Health => show_health(coordinator, args),
        Command::Stats => show_stats(coordinator, args),
        Command::Repair => repair(coordinator, args).await,
        Command::Compact(compact_args) => compact(coordinator, compact_args.clone(), args).await,
    }
}

/// Build the configuration from the optional file and command line overrides.
pub fn load_config(args: &MemoryArgs) -> Result<HybridMemoryConfig> {
    let mut config = match &args.config {
        Some(path) => {
            if args.verbosity() > 1 {
                println!("Loading configuration from: {}", path.display());
            }
            HybridMemoryConfig::from_json_file(path)?
        }
        None => HybridMemoryConfig::default(),
    };

    if let Some(data_dir) = &args.data_dir {
        config.data_dir = Some(data_dir.clone());
    }
    if config.data_dir.is_none() {
        return Err(MemoryError::invalid_config(
            "no data directory; pass --data-dir or set data_dir in the configuration file",
        ));
    }
    if args.embedder == EmbedderKind::Hashing && config.dimension == 0 {
        config.dimension = args.embedding_dimension;
    }

    config.validate()?;
    Ok(config)
}

fn build_embedder(args: &MemoryArgs) -> Option<Arc<dyn EmbeddingGenerator>> {
    match args.embedder {
        EmbedderKind::None => None,
        EmbedderKind::Hashing => Some(Arc::new(HashingEmbedder::new(args.embedding_dimension))),
    }
}

fn options(timeout_ms: Option<u64>) -> QueryOptions {
    QueryOptions {
        timeout: timeout_ms.map(Duration::from_millis),
    }
}

/// Build a structured filter scoped to the requested namespace.
fn build_filter(filter: &FilterArgs, cli_args: &MemoryArgs) -> StructuredFilter {
    let mut built = if filter.all_namespaces {
        StructuredFilter::all_namespaces()
    } else {
        StructuredFilter {
            namespace: cli_args.namespace.clone(),
            ..StructuredFilter::default()
        }
    };

    if let Some(prefix) = &filter.prefix {
        built = built.with_key_prefix(prefix.clone());
    }
    for tag in &filter.tags {
        built = built.with_tag(tag.clone());
    }
    if let Some(after) = filter.after {
        built = built.with_created_after(after);
    }
    if let Some(before) = filter.before {
        built = built.with_created_before(before);
    }
    built.with_order(filter.order.into())
}

fn build_semantic(input: &InputArgs, k: usize, threshold: f32) -> Result<SemanticQuery> {
    let query = match (&input.vector, &input.text) {
        (Some(vector), _) => SemanticQuery::vector(vector.clone(), k),
        (None, Some(text)) => SemanticQuery::text(text.clone(), k),
        (None, None) => {
            return Err(MemoryError::validation("either --vector or --text is required"));
        }
    };
    Ok(query.with_threshold(threshold))
}

/// Store or replace an entry.
async fn store_entry(
    coordinator: &HybridCoordinator,
    args: StoreArgs,
    cli_args: &MemoryArgs,
) -> Result<()> {
    let mut request = StoreRequest::new(args.key, args.content).with_tags(args.tags);
    if let Some(namespace) = &cli_args.namespace {
        request = request.with_namespace(namespace.clone());
    }
    if let Some(vector) = args.vector {
        request = request.with_vector(vector);
    }
    for (key, value) in args.metadata {
        request = request.with_metadata(key, value);
    }
    if let Some(ttl_ms) = args.ttl_ms {
        request = request.with_ttl(Duration::from_millis(ttl_ms));
    }

    let result = coordinator.store(request).await?;
    for warning in &result.warnings {
        warn!("{}/{}: {warning}", result.namespace, result.key);
    }

    let message = if result.created {
        "Entry stored"
    } else {
        "Entry replaced"
    };
    output_result(message, &result, cli_args)
}

/// Look up an entry by key.
async fn get_entry(
    coordinator: &HybridCoordinator,
    args: KeyArgs,
    cli_args: &MemoryArgs,
) -> Result<()> {
    let namespace = coordinator
        .namespaces()
        .resolve(cli_args.namespace.as_deref())?;
    let entry = coordinator
        .get_by_key(Some(&namespace), &args.key)
        .await?;

    let message = if entry.is_some() {
        "Entry found"
    } else {
        "Entry not found"
    };
    output_result(
        message,
        &LookupResult {
            namespace,
            key: args.key,
            entry,
        },
        cli_args,
    )
}

/// Run a structured query.
async fn run_query(
    coordinator: &HybridCoordinator,
    args: QueryArgs,
    cli_args: &MemoryArgs,
) -> Result<()> {
    let mut filter = build_filter(&args.filter, cli_args);
    if let Some(limit) = args.limit {
        filter = filter.with_limit(limit);
    }

    let response = coordinator
        .query(&QuerySpec::Structured(filter), options(args.timeout_ms))
        .await?;
    output_hits("Structured query results", &response, cli_args)
}

/// Run a semantic query.
async fn run_search(
    coordinator: &HybridCoordinator,
    args: SearchArgs,
    cli_args: &MemoryArgs,
) -> Result<()> {
    let mut query = build_semantic(&args.input, args.k, args.threshold)?;
    if args.all_namespaces {
        query = query.with_all_namespaces();
    } else if let Some(namespace) = &cli_args.namespace {
        query = query.with_namespace(namespace.clone());
    }

    let response = coordinator
        .query(&QuerySpec::Semantic(query), options(args.timeout_ms))
        .await?;
    output_hits("Semantic query results", &response, cli_args)
}

/// Run a hybrid query.
async fn run_hybrid(
    coordinator: &HybridCoordinator,
    args: HybridArgs,
    cli_args: &MemoryArgs,
) -> Result<()> {
    let filter = build_filter(&args.filter, cli_args);
    let semantic = build_semantic(&args.input, args.k, args.threshold)?;
    let mut query = HybridQuery::new(filter, semantic, args.strategy.into());
    if let Some(limit) = args.limit {
        query = query.with_limit(limit);
    }

    let response = coordinator
        .query(&QuerySpec::Hybrid(query), options(args.timeout_ms))
        .await?;
    output_hits("Hybrid query results", &response, cli_args)
}

/// Delete an entry by key.
async fn delete_entry(
    coordinator: &HybridCoordinator,
    args: KeyArgs,
    cli_args: &MemoryArgs,
) -> Result<()> {
    let result = coordinator
        .delete(cli_args.namespace.as_deref(), &args.key)
        .await?;
    let message = if result.existed() {
        "Entry deleted"
    } else {
        "Entry not found"
    };
    output_result(message, &result, cli_args)
}

fn show_health(coordinator: &HybridCoordinator, cli_args: &MemoryArgs) -> Result<()> {
    let report = coordinator.health()?;
    output_health(&report, cli_args)
}

fn show_stats(coordinator: &HybridCoordinator, cli_args: &MemoryArgs) -> Result<()> {
    let stats = coordinator.stats()?;
    output_stats(&stats, cli_args)
}

/// Reconcile the two stores.
async fn repair(coordinator: &HybridCoordinator, cli_args: &MemoryArgs) -> Result<()> {
    let report = coordinator.repair().await?;
    info!("repair finished: {report}");
    for failure in &report.failures {
        warn!("repair failure: {failure}");
    }
    output_result("Repair complete", &report, cli_args)
}

/// Compact the WAL and persist the vector index.
async fn compact(
    coordinator: &HybridCoordinator,
    args: CompactArgs,
    cli_args: &MemoryArgs,
) -> Result<()> {
    let start = Instant::now();
    let wal_bytes_before = coordinator.stats()?.structured.wal_bytes;

    let mut result = CompactionResult {
        wal_bytes_before,
        ..CompactionResult::default()
    };
    if args.purge_expired {
        result.expired_purged = coordinator.purge_expired().await?;
    }
    if args.rebuild_semantic {
        result.semantic_rebuilt = Some(coordinator.rebuild_semantic().await?);
    }
    coordinator.checkpoint().await?;

    result.wal_bytes_after = coordinator.stats()?.structured.wal_bytes;
    result.duration_ms = start.elapsed().as_millis() as u64;
    output_result("Compaction complete", &result, cli_args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_load_config_requires_data_dir() {
        let args = MemoryArgs::try_parse_from(["hybrid-memory", "stats"]).unwrap();
        // Skipped when HYBRID_MEMORY_DATA_DIR is set.
        if args.data_dir.is_none() && args.config.is_none() {
            assert!(load_config(&args).is_err());
        }
    }

    #[test]
    fn test_load_config_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("memory.json");
        HybridMemoryConfig::default()
            .with_default_namespace("agents")
            .to_json_file(&config_path)
            .unwrap();

        let args = MemoryArgs::try_parse_from([
            "hybrid-memory",
            "--config",
            config_path.to_str().unwrap(),
            "--data-dir",
            dir.path().to_str().unwrap(),
            "--embedder",
            "hashing",
            "--embedding-dimension",
            "32",
            "stats",
        ])
        .unwrap();

        let config = load_config(&args).unwrap();
        assert_eq!(config.default_namespace, "agents");
        assert_eq!(config.data_dir.as_deref(), Some(dir.path()));
        assert_eq!(config.dimension, 32);
    }

    #[test]
    fn test_build_filter_scopes() {
        let args = MemoryArgs::try_parse_from([
            "hybrid-memory",
            "-n",
            "agents",
            "query",
            "--prefix",
            "note-",
            "--tag",
            "x",
            "--order",
            "key",
        ])
        .unwrap();
        let Command::Query(query) = &args.command else {
            panic!("Expected Query command");
        };

        let filter = build_filter(&query.filter, &args);
        assert_eq!(filter.namespace.as_deref(), Some("agents"));
        assert!(!filter.all_namespaces);
        assert_eq!(filter.key_prefix.as_deref(), Some("note-"));
        assert!(filter.tags.contains("x"));
        assert_eq!(filter.order, crate::query::SortOrder::KeyAsc);
    }

    #[tokio::test]
    async fn test_execute_store_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();

        let store = MemoryArgs::try_parse_from([
            "hybrid-memory",
            "-q",
            "--format",
            "json",
            "--data-dir",
            data_dir,
            "--embedder",
            "hashing",
            "store",
            "greeting",
            "hello world",
        ])
        .unwrap();
        execute_command(store).await.unwrap();

        let config = HybridMemoryConfig::default()
            .with_data_dir(dir.path())
            .with_dimension(64);
        let embedder: Arc<dyn EmbeddingGenerator> = Arc::new(HashingEmbedder::new(64));
        let coordinator = HybridCoordinator::open(config, Some(embedder)).await.unwrap();
        let entry = coordinator.get_by_key(None, "greeting").await.unwrap().unwrap();
        assert_eq!(entry.content, "hello world");
        assert!(entry.has_vector());
        coordinator.close().await.unwrap();
    }
}
