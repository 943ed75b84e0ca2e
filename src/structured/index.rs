//! In-memory structured index.
//!
//! The primary index is an ordered map keyed by `(namespace, key)`. Two
//! secondary indexes sit beside it: per-namespace insertion order (`seq ->
//! key`) and per-namespace tag posting lists (`tag -> seqs`). Key-prefix
//! lookups are range scans over the primary map.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::entry::{MemoryEntry, SyncState};
use crate::namespace::NamespaceScope;
use crate::query::{SortOrder, StructuredFilter};

type PrimaryKey = (String, String);

#[derive(Debug, Default, Clone)]
struct NamespaceIndex {
    by_seq: BTreeMap<u64, String>,
    tags: BTreeMap<String, BTreeSet<u64>>,
}

/// Live index over every entry in the structured leaf.
#[derive(Debug, Default, Clone)]
pub struct StructuredIndex {
    primary: BTreeMap<PrimaryKey, Arc<MemoryEntry>>,
    namespaces: BTreeMap<String, NamespaceIndex>,
}

impl StructuredIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<&Arc<MemoryEntry>> {
        self.primary.get(&(namespace.to_string(), key.to_string()))
    }

    /// Insert or replace an entry. Returns the previous value.
    pub fn upsert(&mut self, entry: MemoryEntry) -> Option<Arc<MemoryEntry>> {
        let previous = self.remove(&entry.namespace, &entry.key);

        let ns = self.namespaces.entry(entry.namespace.clone()).or_default();
        ns.by_seq.insert(entry.seq, entry.key.clone());
        for tag in &entry.tags {
            ns.tags.entry(tag.clone()).or_default().insert(entry.seq);
        }

        self.primary.insert(
            (entry.namespace.clone(), entry.key.clone()),
            Arc::new(entry),
        );
        previous
    }

    /// Remove an entry. Returns it when it was present.
    pub fn remove(&mut self, namespace: &str, key: &str) -> Option<Arc<MemoryEntry>> {
        let removed = self
            .primary
            .remove(&(namespace.to_string(), key.to_string()))?;

        let mut now_empty = false;
        if let Some(ns) = self.namespaces.get_mut(namespace) {
            ns.by_seq.remove(&removed.seq);
            for tag in &removed.tags {
                if let Some(postings) = ns.tags.get_mut(tag) {
                    postings.remove(&removed.seq);
                    if postings.is_empty() {
                        ns.tags.remove(tag);
                    }
                }
            }
            now_empty = ns.by_seq.is_empty();
        }
        if now_empty {
            self.namespaces.remove(namespace);
        }

        Some(removed)
    }

    /// Replace the sync state of an entry. Returns false when absent.
    pub fn set_sync_state(&mut self, namespace: &str, key: &str, state: SyncState) -> bool {
        match self.primary.get_mut(&(namespace.to_string(), key.to_string())) {
            Some(entry) => {
                Arc::make_mut(entry).sync = state;
                true
            }
            None => false,
        }
    }

    /// Namespaces holding at least one entry.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// Every entry in the scope, in insertion order per namespace.
    pub fn scan<'a>(
        &'a self,
        scope: &'a NamespaceScope,
    ) -> impl Iterator<Item = &'a Arc<MemoryEntry>> + 'a {
        self.namespaces
            .iter()
            .filter(move |(name, _)| scope.contains(name))
            .flat_map(move |(name, ns)| {
                ns.by_seq
                    .values()
                    .filter_map(move |key| self.get(name, key))
            })
    }

    /// Evaluate a structured filter.
    ///
    /// Picks the narrowest access path for each namespace: a primary range scan
    /// for key prefixes, the smallest tag posting list for tag filters, and the
    /// insertion index otherwise. Remaining predicates are applied to each
    /// candidate and expired entries are skipped.
    pub fn query(
        &self,
        filter: &StructuredFilter,
        scope: &NamespaceScope,
        now: DateTime<Utc>,
    ) -> Vec<Arc<MemoryEntry>> {
        let names: Vec<&str> = match scope {
            NamespaceScope::Single(name) => vec![name.as_str()],
            NamespaceScope::All => self.namespaces().collect(),
        };

        // With one namespace read in the requested order the limit can stop
        // the scan early.
        let early_limit = match (scope, filter.limit) {
            (NamespaceScope::Single(_), Some(limit)) => Some(limit),
            _ => None,
        };

        let mut results = Vec::new();
        for name in names {
            self.collect_namespace(name, filter, now, early_limit, &mut results);
        }

        match filter.order {
            SortOrder::InsertionAsc => results.sort_by_key(|entry| entry.seq),
            SortOrder::InsertionDesc => results.sort_by(|a, b| b.seq.cmp(&a.seq)),
            SortOrder::KeyAsc => results.sort_by(|a, b| {
                (&a.key, &a.namespace).cmp(&(&b.key, &b.namespace))
            }),
        }

        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        results
    }

    fn collect_namespace(
        &self,
        name: &str,
        filter: &StructuredFilter,
        now: DateTime<Utc>,
        early_limit: Option<usize>,
        results: &mut Vec<Arc<MemoryEntry>>,
    ) {
        let Some(ns) = self.namespaces.get(name) else {
            return;
        };

        let accept = |entry: &Arc<MemoryEntry>| filter.matches(entry) && !entry.is_expired(now);

        if let Some(prefix) = &filter.key_prefix {
            let start = (name.to_string(), prefix.clone());
            let candidates = self
                .primary
                .range((Bound::Included(start), Bound::Unbounded))
                .take_while(|((entry_ns, key), _)| {
                    entry_ns == name && key.starts_with(prefix.as_str())
                })
                .map(|(_, entry)| entry);
            let limit = early_limit.filter(|_| filter.order == SortOrder::KeyAsc);
            push_limited(candidates.filter(|e| accept(e)), limit, results);
            return;
        }

        let seqs: Box<dyn DoubleEndedIterator<Item = &u64> + '_> = if filter.tags.is_empty() {
            Box::new(ns.by_seq.keys())
        } else {
            let smallest = filter
                .tags
                .iter()
                .map(|tag| ns.tags.get(tag))
                .min_by_key(|postings| postings.map_or(0, BTreeSet::len));
            match smallest {
                Some(Some(postings)) => Box::new(postings.iter()),
                // A filter tag with no postings matches nothing.
                _ => return,
            }
        };

        let lookup = |seq: &u64| {
            ns.by_seq
                .get(seq)
                .and_then(|key| self.get(name, key))
        };

        match filter.order {
            SortOrder::InsertionAsc => {
                push_limited(seqs.filter_map(lookup).filter(|e| accept(e)), early_limit, results)
            }
            SortOrder::InsertionDesc => push_limited(
                seqs.rev().filter_map(lookup).filter(|e| accept(e)),
                early_limit,
                results,
            ),
            SortOrder::KeyAsc => {
                push_limited(seqs.filter_map(lookup).filter(|e| accept(e)), None, results)
            }
        }
    }

    /// Entries whose TTL has elapsed at `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<Arc<MemoryEntry>> {
        self.primary
            .values()
            .filter(|entry| entry.is_expired(now))
            .cloned()
            .collect()
    }

    /// All entries ordered by insertion sequence.
    pub fn entries_by_seq(&self) -> Vec<MemoryEntry> {
        let mut entries: Vec<MemoryEntry> =
            self.primary.values().map(|entry| (**entry).clone()).collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
    }

    /// Highest insertion sequence in use.
    pub fn max_seq(&self) -> Option<u64> {
        self.primary.values().map(|entry| entry.seq).max()
    }
}

fn push_limited<'a, I>(candidates: I, limit: Option<usize>, results: &mut Vec<Arc<MemoryEntry>>)
where
    I: Iterator<Item = &'a Arc<MemoryEntry>>,
{
    match limit {
        Some(limit) => results.extend(candidates.take(limit).cloned()),
        None => results.extend(candidates.cloned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ns: &str, key: &str, seq: u64, tags: &[&str]) -> MemoryEntry {
        let mut entry =
            MemoryEntry::new(ns, key, format!("{ns}/{key}")).with_tags(tags.iter().copied());
        entry.seq = seq;
        entry
    }

    fn keys(entries: &[Arc<MemoryEntry>]) -> Vec<&str> {
        entries.iter().map(|e| e.key.as_str()).collect()
    }

    fn sample() -> StructuredIndex {
        let mut index = StructuredIndex::new();
        index.upsert(entry("a", "user:2", 1, &["x"]));
        index.upsert(entry("a", "user:1", 2, &["x", "y"]));
        index.upsert(entry("a", "task:1", 3, &["y"]));
        index.upsert(entry("b", "user:9", 4, &["x"]));
        index
    }

    fn single(ns: &str) -> NamespaceScope {
        NamespaceScope::Single(ns.to_string())
    }

    #[test]
    fn test_default_order_is_insertion() {
        let index = sample();
        let results = index.query(&StructuredFilter::new(), &single("a"), Utc::now());
        assert_eq!(keys(&results), vec!["user:2", "user:1", "task:1"]);
    }

    #[test]
    fn test_prefix_and_tags() {
        let index = sample();
        let now = Utc::now();

        let filter = StructuredFilter::new().with_key_prefix("user:");
        assert_eq!(keys(&index.query(&filter, &single("a"), now)), vec!["user:2", "user:1"]);

        let filter = StructuredFilter::new().with_tag("x").with_tag("y");
        assert_eq!(keys(&index.query(&filter, &single("a"), now)), vec!["user:1"]);

        let filter = StructuredFilter::new().with_tag("missing");
        assert!(index.query(&filter, &single("a"), now).is_empty());
    }

    #[test]
    fn test_orders_and_limits() {
        let index = sample();
        let now = Utc::now();

        let filter = StructuredFilter::new().with_order(SortOrder::InsertionDesc).with_limit(2);
        assert_eq!(keys(&index.query(&filter, &single("a"), now)), vec!["task:1", "user:1"]);

        let filter = StructuredFilter::new().with_order(SortOrder::KeyAsc);
        assert_eq!(
            keys(&index.query(&filter, &single("a"), now)),
            vec!["task:1", "user:1", "user:2"]
        );

        let filter = StructuredFilter::new()
            .with_key_prefix("user:")
            .with_order(SortOrder::KeyAsc)
            .with_limit(1);
        assert_eq!(keys(&index.query(&filter, &single("a"), now)), vec!["user:1"]);
    }

    #[test]
    fn test_scope_isolation() {
        let index = sample();
        let now = Utc::now();

        let results = index.query(&StructuredFilter::new(), &single("b"), now);
        assert_eq!(keys(&results), vec!["user:9"]);

        let filter = StructuredFilter::new().with_tag("x");
        let results = index.query(&filter, &NamespaceScope::All, now);
        assert_eq!(keys(&results), vec!["user:2", "user:1", "user:9"]);

        assert!(index.query(&StructuredFilter::new(), &single("c"), now).is_empty());
    }

    #[test]
    fn test_upsert_replaces_postings() {
        let mut index = sample();
        let previous = index.upsert(entry("a", "user:1", 2, &["z"]));
        assert!(previous.is_some());
        assert_eq!(index.len(), 4);

        let now = Utc::now();
        let filter = StructuredFilter::new().with_tag("x");
        assert_eq!(keys(&index.query(&filter, &single("a"), now)), vec!["user:2"]);
        let filter = StructuredFilter::new().with_tag("z");
        assert_eq!(keys(&index.query(&filter, &single("a"), now)), vec!["user:1"]);
    }

    #[test]
    fn test_remove_drops_empty_namespace() {
        let mut index = sample();
        assert!(index.remove("b", "user:9").is_some());
        assert!(index.remove("b", "user:9").is_none());
        assert_eq!(index.namespaces().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_expired_entries_are_skipped() {
        let mut index = StructuredIndex::new();
        let mut short = entry("a", "short", 1, &[]);
        short.ttl_ms = Some(10);
        index.upsert(short.clone());
        index.upsert(entry("a", "long", 2, &[]));

        let later = short.updated_at + chrono::Duration::seconds(1);
        let results = index.query(&StructuredFilter::new(), &single("a"), later);
        assert_eq!(keys(&results), vec!["long"]);
        assert_eq!(index.expired(later).len(), 1);
    }

    #[test]
    fn test_set_sync_state() {
        let mut index = sample();
        assert!(index.set_sync_state("a", "user:1", SyncState::Synced));
        assert_eq!(index.get("a", "user:1").unwrap().sync, SyncState::Synced);
        assert!(!index.set_sync_state("a", "nope", SyncState::Synced));
    }
}
