//! Command line argument parsing for the hybrid-memory CLI using clap.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::query::{CombineStrategy, SortOrder};
use crate::semantic::Vector;

/// hybrid-memory - structured and semantic memory in one store
#[derive(Parser, Debug, Clone)]
#[command(name = "hybrid-memory")]
#[command(about = "Administer a hybrid structured and semantic memory store")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct MemoryArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human", global = true)]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Configuration file (JSON)
    #[arg(short, long, value_name = "FILE", env = "HYBRID_MEMORY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory; overrides the configuration file
    #[arg(short, long, value_name = "DIR", env = "HYBRID_MEMORY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Embedding generator used for text content and text queries
    #[arg(long, default_value = "none")]
    pub embedder: EmbedderKind,

    /// Output dimension of the hashing embedder
    #[arg(long, default_value = "64")]
    pub embedding_dimension: usize,

    /// Namespace to operate on (configured default when absent)
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl MemoryArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1, // Default to normal
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Store or replace an entry
    Store(StoreArgs),

    /// Look up an entry by key
    Get(KeyArgs),

    /// Run a structured query
    Query(QueryArgs),

    /// Run a semantic (nearest neighbour) query
    Search(SearchArgs),

    /// Run a hybrid query over both stores
    Hybrid(HybridArgs),

    /// Delete an entry by key
    Delete(KeyArgs),

    /// Show backend health
    Health,

    /// Show backend statistics
    Stats,

    /// Reconcile the two stores
    Repair,

    /// Compact the WAL and persist the vector index
    Compact(CompactArgs),
}

/// Arguments for storing an entry
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Entry key
    #[arg(value_name = "KEY")]
    pub key: String,

    /// Entry content
    #[arg(value_name = "CONTENT")]
    pub content: String,

    /// Precomputed vector as a comma separated list
    #[arg(long, value_parser = parse_vector)]
    pub vector: Option<Vector>,

    /// Tag to attach (repeatable)
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    /// Metadata as KEY=VALUE (repeatable)
    #[arg(short, long = "meta", value_parser = parse_key_value)]
    pub metadata: Vec<(String, String)>,

    /// Time to live in milliseconds
    #[arg(long)]
    pub ttl_ms: Option<u64>,
}

/// Arguments naming a single entry
#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    /// Entry key
    #[arg(value_name = "KEY")]
    pub key: String,
}

/// Structured filter flags
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Only keys starting with this prefix
    #[arg(long)]
    pub prefix: Option<String>,

    /// Required tag (repeatable)
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    /// Only entries created at or after this time (RFC 3339)
    #[arg(long)]
    pub after: Option<DateTime<Utc>>,

    /// Only entries created before this time (RFC 3339)
    #[arg(long)]
    pub before: Option<DateTime<Utc>>,

    /// Result order
    #[arg(long, default_value = "insertion")]
    pub order: OrderArg,

    /// Search every namespace
    #[arg(long)]
    pub all_namespaces: bool,
}

/// Arguments for a structured query
#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    #[command(flatten)]
    pub filter: FilterArgs,

    /// Maximum number of results to return
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Query timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

/// What a semantic query compares against
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct InputArgs {
    /// Query vector as a comma separated list
    #[arg(long, value_parser = parse_vector)]
    pub vector: Option<Vector>,

    /// Query text, embedded with the configured embedder
    #[arg(long)]
    pub text: Option<String>,
}

/// Arguments for a semantic query
#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Number of neighbours to return
    #[arg(short, long, default_value = "10")]
    pub k: usize,

    /// Minimum similarity in [0, 1]
    #[arg(long, default_value = "0.0")]
    pub threshold: f32,

    /// Search every namespace
    #[arg(long)]
    pub all_namespaces: bool,

    /// Query timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

/// Arguments for a hybrid query
#[derive(Args, Debug, Clone)]
pub struct HybridArgs {
    #[command(flatten)]
    pub filter: FilterArgs,

    #[command(flatten)]
    pub input: InputArgs,

    /// Number of neighbours the semantic half returns
    #[arg(short, long, default_value = "10")]
    pub k: usize,

    /// Minimum similarity in [0, 1]
    #[arg(long, default_value = "0.0")]
    pub threshold: f32,

    /// How the two result sets are merged
    #[arg(short, long, default_value = "union")]
    pub strategy: StrategyArg,

    /// Maximum number of merged results
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Query timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

/// Arguments for compaction
#[derive(Args, Debug, Clone)]
pub struct CompactArgs {
    /// Also drop expired entries first
    #[arg(long)]
    pub purge_expired: bool,

    /// Rebuild the vector index from the structured store
    #[arg(long)]
    pub rebuild_semantic: bool,
}

/// Output formats for CLI
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

/// Embedding generators available from the command line
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    /// No embedder: entries without a vector stay structured-only
    None,
    /// Feature-hashing embedder
    Hashing,
}

/// Structured result order
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderArg {
    /// Oldest first
    #[default]
    Insertion,
    /// Newest first
    InsertionDesc,
    /// By key
    Key,
}

impl From<OrderArg> for SortOrder {
    fn from(order: OrderArg) -> Self {
        match order {
            OrderArg::Insertion => SortOrder::InsertionAsc,
            OrderArg::InsertionDesc => SortOrder::InsertionDesc,
            OrderArg::Key => SortOrder::KeyAsc,
        }
    }
}

/// Combine strategies
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyArg {
    Union,
    Intersection,
    SemanticFirst,
    StructuredFirst,
}

impl From<StrategyArg> for CombineStrategy {
    fn from(strategy: StrategyArg) -> Self {
        match strategy {
            StrategyArg::Union => CombineStrategy::Union,
            StrategyArg::Intersection => CombineStrategy::Intersection,
            StrategyArg::SemanticFirst => CombineStrategy::SemanticFirst,
            StrategyArg::StructuredFirst => CombineStrategy::StructuredFirst,
        }
    }
}

/// Parse `0.1,0.2,0.3` into a vector.
pub fn parse_vector(s: &str) -> Result<Vector, String> {
    let data = s
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|e| format!("invalid vector component {part:?}: {e}"))
        })
        .collect::<Result<Vec<f32>, String>>()?;
    if data.is_empty() {
        return Err("vector must not be empty".to_string());
    }
    Ok(Vector::new(data))
}

/// Parse `key=value`.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_store_command() {
        let args = MemoryArgs::try_parse_from([
            "hybrid-memory",
            "--data-dir",
            "/tmp/memory",
            "store",
            "greeting",
            "hello world",
            "--vector",
            "0.5, 1,-2",
            "--tag",
            "a",
            "-t",
            "b",
            "--meta",
            "source=cli",
            "--ttl-ms",
            "1000",
        ])
        .unwrap();

        assert_eq!(args.data_dir, Some(PathBuf::from("/tmp/memory")));
        if let Command::Store(store) = args.command {
            assert_eq!(store.key, "greeting");
            assert_eq!(store.content, "hello world");
            assert_eq!(store.vector.unwrap().data, vec![0.5, 1.0, -2.0]);
            assert_eq!(store.tags, vec!["a", "b"]);
            assert_eq!(
                store.metadata,
                vec![("source".to_string(), "cli".to_string())]
            );
            assert_eq!(store.ttl_ms, Some(1000));
        } else {
            panic!("Expected Store command");
        }
    }

    #[test]
    fn test_hybrid_command() {
        let args = MemoryArgs::try_parse_from([
            "hybrid-memory",
            "hybrid",
            "--text",
            "rust memory",
            "--prefix",
            "note-",
            "--strategy",
            "semantic-first",
            "-k",
            "5",
            "--limit",
            "3",
            "--namespace",
            "agents",
        ])
        .unwrap();

        assert_eq!(args.namespace.as_deref(), Some("agents"));
        if let Command::Hybrid(hybrid) = args.command {
            assert_eq!(hybrid.input.text.as_deref(), Some("rust memory"));
            assert!(hybrid.input.vector.is_none());
            assert_eq!(hybrid.filter.prefix.as_deref(), Some("note-"));
            assert_eq!(
                CombineStrategy::from(hybrid.strategy),
                CombineStrategy::SemanticFirst
            );
            assert_eq!(hybrid.k, 5);
            assert_eq!(hybrid.limit, Some(3));
        } else {
            panic!("Expected Hybrid command");
        }
    }

    #[test]
    fn test_search_requires_one_input() {
        assert!(MemoryArgs::try_parse_from(["hybrid-memory", "search"]).is_err());
        assert!(
            MemoryArgs::try_parse_from([
                "hybrid-memory",
                "search",
                "--text",
                "a",
                "--vector",
                "1,2"
            ])
            .is_err()
        );
    }

    #[test]
    fn test_verbosity_levels() {
        let args = MemoryArgs::try_parse_from(["hybrid-memory", "health"]).unwrap();
        assert_eq!(args.verbosity(), 1);

        let args = MemoryArgs::try_parse_from(["hybrid-memory", "-vv", "health"]).unwrap();
        assert_eq!(args.verbosity(), 2);

        let args = MemoryArgs::try_parse_from(["hybrid-memory", "--quiet", "stats"]).unwrap();
        assert_eq!(args.verbosity(), 0);
    }

    #[test]
    fn test_output_format_and_embedder() {
        let args = MemoryArgs::try_parse_from([
            "hybrid-memory",
            "--format",
            "json",
            "--embedder",
            "hashing",
            "stats",
        ])
        .unwrap();
        assert_eq!(args.output_format, OutputFormat::Json);
        assert_eq!(args.embedder, EmbedderKind::Hashing);
    }

    #[test]
    fn test_value_parsers() {
        assert!(parse_vector("1,x").is_err());
        assert!(parse_vector("").is_err());
        assert_eq!(
            parse_key_value("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
        assert!(parse_key_value("=b").is_err());
        assert!(parse_key_value("ab").is_err());
    }
}
