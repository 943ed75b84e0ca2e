//! Query specifications and result types.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::MemoryEntry;
use crate::semantic::Vector;

/// A query routed by the coordinator.
///
/// Each variant names the leaf (or leaves) it hits; the coordinator matches on
/// it explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuerySpec {
    Structured(StructuredFilter),
    Semantic(SemanticQuery),
    Hybrid(HybridQuery),
}

/// Ordering of structured results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Insertion order, oldest first.
    #[default]
    InsertionAsc,
    /// Insertion order, newest first.
    InsertionDesc,
    /// Lexicographic by key.
    KeyAsc,
}

/// Predicate over the structured index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredFilter {
    /// Namespace to search; the configured default is used when absent.
    pub namespace: Option<String>,
    /// Explicit cross-namespace wildcard.
    #[serde(default)]
    pub all_namespaces: bool,
    pub key_prefix: Option<String>,
    /// Every listed tag must be present on a match.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Inclusive lower bound on `created_at`.
    pub created_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl StructuredFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(namespace: impl Into<String>) -> Self {
        StructuredFilter {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn all_namespaces() -> Self {
        StructuredFilter {
            all_namespaces: true,
            ..Default::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_created_after(mut self, after: DateTime<Utc>) -> Self {
        self.created_after = Some(after);
        self
    }

    pub fn with_created_before(mut self, before: DateTime<Utc>) -> Self {
        self.created_before = Some(before);
        self
    }

    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate every predicate except namespace scope and limit.
    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        if let Some(prefix) = &self.key_prefix {
            if !entry.key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if !self.tags.iter().all(|tag| entry.tags.contains(tag)) {
            return false;
        }
        if let Some(after) = self.created_after {
            if entry.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if entry.created_at >= before {
                return false;
            }
        }
        true
    }
}

/// What a semantic query compares against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryInput {
    Vector(Vector),
    /// Embedded through the configured generator before searching.
    Text(String),
}

/// Approximate nearest-neighbour query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticQuery {
    pub namespace: Option<String>,
    #[serde(default)]
    pub all_namespaces: bool,
    pub input: QueryInput,
    pub k: usize,
    /// Minimum similarity in `[0, 1]`.
    #[serde(default)]
    pub threshold: f32,
}

impl SemanticQuery {
    pub fn vector(vector: impl Into<Vector>, k: usize) -> Self {
        SemanticQuery {
            namespace: None,
            all_namespaces: false,
            input: QueryInput::Vector(vector.into()),
            k,
            threshold: 0.0,
        }
    }

    pub fn text(text: impl Into<String>, k: usize) -> Self {
        SemanticQuery {
            namespace: None,
            all_namespaces: false,
            input: QueryInput::Text(text.into()),
            k,
            threshold: 0.0,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_all_namespaces(mut self) -> Self {
        self.all_namespaces = true;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }
}

/// How hybrid results from both leaves are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CombineStrategy {
    /// Dedupe across both sets; structured hits score 1.0.
    #[default]
    Union,
    /// Keep ids present in both sets, scored by similarity.
    Intersection,
    /// Semantic ranking, post-filtered by the structured predicate.
    SemanticFirst,
    /// Structured candidates re-ranked by similarity.
    StructuredFirst,
}

impl CombineStrategy {
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "union" => Some(CombineStrategy::Union),
            "intersection" => Some(CombineStrategy::Intersection),
            "semantic_first" => Some(CombineStrategy::SemanticFirst),
            "structured_first" => Some(CombineStrategy::StructuredFirst),
            _ => None,
        }
    }
}

/// Query hitting both leaves.
///
/// The semantic half always searches the filter's namespace scope; the
/// namespace fields on `semantic` are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridQuery {
    pub filter: StructuredFilter,
    pub semantic: SemanticQuery,
    #[serde(default)]
    pub strategy: CombineStrategy,
    pub limit: Option<usize>,
}

impl HybridQuery {
    pub fn new(
        filter: StructuredFilter,
        semantic: SemanticQuery,
        strategy: CombineStrategy,
    ) -> Self {
        HybridQuery {
            filter,
            semantic,
            strategy,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Overrides the configured query timeout.
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        QueryOptions {
            timeout: Some(timeout),
        }
    }
}

/// Which leaf produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSource {
    Structured,
    Semantic,
    Both,
}

/// A result entry with its merged score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    /// Score used for ordering; see the combine strategy for its meaning.
    pub score: f32,
    /// Semantic similarity, when the semantic leaf scored this entry.
    pub similarity: Option<f32>,
    pub source: HitSource,
}

impl ScoredEntry {
    pub fn structured(entry: MemoryEntry) -> Self {
        ScoredEntry {
            entry,
            score: 1.0,
            similarity: None,
            source: HitSource::Structured,
        }
    }

    pub fn semantic(entry: MemoryEntry, similarity: f32) -> Self {
        ScoredEntry {
            entry,
            score: similarity,
            similarity: Some(similarity),
            source: HitSource::Semantic,
        }
    }
}

/// Result of any query through the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Hits in result order.
    pub hits: Vec<ScoredEntry>,
    /// A leaf did not finish before the deadline.
    pub incomplete: bool,
    /// A leaf was unavailable and the answer came from the survivor.
    pub degraded: bool,
    /// Hits the structured leaf produced before merging.
    pub structured_hits: usize,
    /// Hits the semantic leaf produced before merging.
    pub semantic_hits: usize,
    pub took_ms: u64,
}

impl QueryResponse {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Entries in result order.
    pub fn entries(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.hits.iter().map(|hit| &hit.entry)
    }

    /// Keys in result order.
    pub fn keys(&self) -> Vec<&str> {
        self.hits.iter().map(|hit| hit.entry.key.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        let entry = MemoryEntry::new("ns", "user:42", "hi").with_tags(["a", "b"]);

        assert!(StructuredFilter::new().matches(&entry));
        assert!(StructuredFilter::new().with_key_prefix("user:").matches(&entry));
        assert!(!StructuredFilter::new().with_key_prefix("task:").matches(&entry));
        assert!(StructuredFilter::new().with_tag("a").with_tag("b").matches(&entry));
        assert!(!StructuredFilter::new().with_tag("a").with_tag("c").matches(&entry));
    }

    #[test]
    fn test_filter_created_bounds() {
        let entry = MemoryEntry::new("ns", "k", "v");
        let at = entry.created_at;

        assert!(StructuredFilter::new().with_created_after(at).matches(&entry));
        assert!(!StructuredFilter::new().with_created_before(at).matches(&entry));
        assert!(
            StructuredFilter::new()
                .with_created_before(at + chrono::Duration::milliseconds(1))
                .matches(&entry)
        );
    }

    #[test]
    fn test_combine_strategy_parse() {
        assert_eq!(
            CombineStrategy::parse_str("semantic-first"),
            Some(CombineStrategy::SemanticFirst)
        );
        assert_eq!(
            CombineStrategy::parse_str("STRUCTURED_FIRST"),
            Some(CombineStrategy::StructuredFirst)
        );
        assert_eq!(CombineStrategy::parse_str("both"), None);
    }

    #[test]
    fn test_query_spec_is_tagged() {
        let spec = QuerySpec::Structured(StructuredFilter::namespace("a"));
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "structured");
        assert_eq!(json["namespace"], "a");
    }
}
