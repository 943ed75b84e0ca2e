//! Output formatting for CLI commands.

use serde::{Deserialize, Serialize};

use crate::cli::args::{MemoryArgs, OutputFormat};
use crate::coordinator::CoordinatorStats;
use crate::entry::MemoryEntry;
use crate::error::Result;
use crate::health::{HealthReport, LeafHealth};
use crate::query::{HitSource, QueryResponse};

/// Result structure for a key lookup.
#[derive(Debug, Serialize, Deserialize)]
pub struct LookupResult {
    pub namespace: String,
    pub key: String,
    pub entry: Option<MemoryEntry>,
}

/// Result structure for compaction.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CompactionResult {
    pub expired_purged: usize,
    pub semantic_rebuilt: Option<usize>,
    pub wal_bytes_before: u64,
    pub wal_bytes_after: u64,
    pub duration_ms: u64,
}

/// Output a result in the specified format.
pub fn output_result<T: Serialize>(message: &str, result: &T, args: &MemoryArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => output_human(message, result, args),
        OutputFormat::Json => output_json(result, args),
    }
}

/// Output query hits.
pub fn output_hits(message: &str, response: &QueryResponse, args: &MemoryArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => {
            if args.verbosity() > 0 {
                println!("{message}");
                println!();
            }
            print!("{}", render_hits(response));
            Ok(())
        }
        OutputFormat::Json => output_json(response, args),
    }
}

/// Output a health report.
pub fn output_health(report: &HealthReport, args: &MemoryArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => {
            println!("Health: {}", report.status);
            println!("════════════════");
            print_leaf("structured", &report.structured);
            print_leaf("semantic", &report.semantic);
            let gaps = report.degraded_namespaces();
            if !gaps.is_empty() {
                println!();
                println!("Semantic coverage gaps:");
                for namespace in gaps {
                    let count = report.semantic_coverage_gaps[namespace];
                    println!("  {namespace}: {count}");
                }
            }
            println!();
            println!("Checked at: {}", report.checked_at.to_rfc3339());
            Ok(())
        }
        OutputFormat::Json => output_json(report, args),
    }
}

/// Output coordinator statistics.
pub fn output_stats(stats: &CoordinatorStats, args: &MemoryArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => {
            println!("Coordinator: {} (up {}ms)", stats.state, stats.uptime_ms);
            println!();

            let s = &stats.structured;
            println!("Structured Store:");
            println!("────────────────");
            println!("Entries: {} in {} namespaces", s.entries, s.namespaces);
            println!("Last LSN: {}", s.last_lsn);
            println!(
                "WAL size: {} ({} records since checkpoint)",
                format_bytes(s.wal_bytes),
                s.wal_records_since_checkpoint
            );
            println!("Snapshot size: {}", format_bytes(s.snapshot_bytes));
            println!("Writes: {}  Deletes: {}  Reads: {}", s.writes, s.deletes, s.reads);
            println!();

            let v = &stats.semantic;
            println!("Semantic Store:");
            println!("──────────────");
            println!("Entries: {} in {} namespaces", v.entries, v.namespaces);
            println!("Dimension: {} ({})", v.dimension, v.metric);
            println!("Graph nodes: {}  Tombstones: {}", v.graph_nodes, v.tombstones);
            println!(
                "Cache: {} hits, {} misses, {} entries",
                v.cache.hits, v.cache.misses, v.cache.entries
            );
            println!(
                "Queries: {}  Checkpoints: {}  Compactions: {}",
                v.queries, v.checkpoints, v.compactions
            );
            println!();

            let value = serde_json::to_value(&stats.counters)?;
            println!("Counters:");
            println!("────────");
            output_generic_human(&value)
        }
        OutputFormat::Json => output_json(stats, args),
    }
}

fn print_leaf(name: &str, leaf: &LeafHealth) {
    println!("{name}: {} ({} entries)", leaf.status, leaf.entries);
    if let Some(at) = leaf.last_write_at {
        println!("  last write: {}", at.to_rfc3339());
    }
    if let Some(error) = &leaf.last_error {
        println!("  last error: {error}");
    }
    if let Some(detail) = &leaf.detail {
        println!("  {detail}");
    }
}

/// Render hits as numbered blocks.
pub fn render_hits(response: &QueryResponse) -> String {
    let mut out = String::new();
    for (i, hit) in response.hits.iter().enumerate() {
        let source = match hit.source {
            HitSource::Structured => "structured",
            HitSource::Semantic => "semantic",
            HitSource::Both => "both",
        };
        out.push_str(&format!(
            "{}. {}/{} (score: {:.3}, {source})\n",
            i + 1,
            hit.entry.namespace,
            hit.entry.key,
            hit.score
        ));
        out.push_str(&format!("   {}\n", hit.entry.content));
        if !hit.entry.tags.is_empty() {
            let tags = hit.entry.tags.iter().cloned().collect::<Vec<_>>().join(", ");
            out.push_str(&format!("   tags: {tags}\n"));
        }
    }
    out.push_str(&format!(
        "\n{} hits ({} structured, {} semantic) in {}ms\n",
        response.len(),
        response.structured_hits,
        response.semantic_hits,
        response.took_ms
    ));
    if response.incomplete {
        out.push_str("warning: a backend did not answer before the deadline\n");
    }
    if response.degraded {
        out.push_str("warning: answered by a single backend\n");
    }
    out
}

/// Output in human-readable format.
fn output_human<T: Serialize>(message: &str, result: &T, args: &MemoryArgs) -> Result<()> {
    if args.verbosity() > 0 {
        println!("{message}");
        println!();
    }

    let value = serde_json::to_value(result)?;
    output_generic_human(&value)
}

/// Output generic data in human format.
fn output_generic_human(value: &serde_json::Value) -> Result<()> {
    match value {
        serde_json::Value::Object(obj) => {
            for (key, val) in obj {
                let formatted_val = format_value(val);
                println!("{key}: {formatted_val}");
            }
        }
        _ => {
            let formatted_value = format_value(value);
            println!("{formatted_value}");
        }
    }
    Ok(())
}

/// Output in JSON format.
fn output_json<T: Serialize>(result: &T, args: &MemoryArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };

    println!("{json}");
    Ok(())
}

/// Format a JSON value for display.
fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Array(arr) => {
            let formatted_values = arr.iter().map(format_value).collect::<Vec<_>>().join(", ");
            format!("[{formatted_values}]")
        }
        serde_json::Value::Object(obj) => {
            let formatted_fields = obj
                .iter()
                .map(|(key, val)| format!("{key}={}", format_value(val)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{{{formatted_fields}}}")
        }
        serde_json::Value::Null => "null".to_string(),
    }
}

/// Format bytes into human-readable format.
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    let unit = UNITS[unit_index];
    if unit_index == 0 {
        format!("{bytes} {unit}")
    } else {
        format!("{size:.1} {unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ScoredEntry;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576), "1.0 MB");
        assert_eq!(format_bytes(1073741824), "1.0 GB");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(
            format_value(&serde_json::Value::String("test".to_string())),
            "test"
        );
        assert_eq!(
            format_value(&serde_json::Value::Number(serde_json::Number::from(42))),
            "42"
        );
        assert_eq!(format_value(&serde_json::Value::Bool(false)), "false");
        assert_eq!(format_value(&serde_json::Value::Null), "null");
        assert_eq!(
            format_value(&serde_json::json!({"retried": 1, "failures": []})),
            "{failures=[], retried=1}"
        );
    }

    #[test]
    fn test_render_hits() {
        let entry = MemoryEntry::new("default", "greeting", "hello world").with_tag("demo");
        let response = QueryResponse {
            hits: vec![ScoredEntry::semantic(entry, 0.875)],
            incomplete: true,
            degraded: false,
            structured_hits: 0,
            semantic_hits: 1,
            took_ms: 3,
        };

        let rendered = render_hits(&response);
        assert!(rendered.contains("1. default/greeting (score: 0.875, semantic)"));
        assert!(rendered.contains("   hello world"));
        assert!(rendered.contains("tags: demo"));
        assert!(rendered.contains("1 hits (0 structured, 1 semantic) in 3ms"));
        assert!(rendered.contains("did not answer before the deadline"));
        assert!(!rendered.contains("single backend"));
    }
}
