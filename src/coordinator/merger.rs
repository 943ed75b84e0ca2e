//! Merging of structured and semantic result sets.
//!
//! Every function here is pure: the coordinator gathers both halves, then picks
//! the function matching the query's [`CombineStrategy`](crate::query::CombineStrategy).

use std::cmp::Ordering;

use ahash::{AHashMap, AHashSet};

use crate::entry::{EntryId, MemoryEntry};
use crate::query::{HitSource, ScoredEntry, StructuredFilter};
use crate::semantic::SemanticHits;

fn by_score(a: &ScoredEntry, b: &ScoredEntry) -> Ordering {
    b.score.total_cmp(&a.score)
}

fn both(entry: MemoryEntry, similarity: f32) -> ScoredEntry {
    ScoredEntry {
        entry,
        score: similarity,
        similarity: Some(similarity),
        source: HitSource::Both,
    }
}

/// Deduplicate across both sets.
///
/// Structured hits score 1.0, semantic-only hits score their similarity. An id
/// found by both keeps the structured copy and score and records the
/// similarity. Ties keep structured order first, then semantic rank.
pub fn union(structured: Vec<MemoryEntry>, semantic: SemanticHits) -> Vec<ScoredEntry> {
    let mut merged: Vec<ScoredEntry> = Vec::with_capacity(structured.len() + semantic.len());
    let mut position: AHashMap<EntryId, usize> = AHashMap::with_capacity(structured.len());

    for entry in structured {
        if position.contains_key(&entry.id) {
            continue;
        }
        position.insert(entry.id, merged.len());
        merged.push(ScoredEntry::structured(entry));
    }

    for (entry, similarity) in semantic {
        match position.get(&entry.id) {
            Some(&at) => {
                let hit = &mut merged[at];
                hit.similarity = Some(similarity);
                hit.source = HitSource::Both;
            }
            None => {
                position.insert(entry.id, merged.len());
                merged.push(ScoredEntry::semantic(entry, similarity));
            }
        }
    }

    // Stable: equal scores keep their insertion order.
    merged.sort_by(by_score);
    merged
}

/// Keep ids present in both sets, in semantic rank, scored by similarity.
///
/// The structured copy of each surviving entry is returned.
pub fn intersection(structured: Vec<MemoryEntry>, semantic: SemanticHits) -> Vec<ScoredEntry> {
    let mut structured: AHashMap<EntryId, MemoryEntry> = structured
        .into_iter()
        .map(|entry| (entry.id, entry))
        .collect();

    semantic
        .into_iter()
        .filter_map(|(entry, similarity)| {
            structured
                .remove(&entry.id)
                .map(|structured_copy| both(structured_copy, similarity))
        })
        .collect()
}

/// Semantic rank, post-filtered by the structured predicate.
///
/// Survivors keep their relative rank. Entries also present in the structured
/// result set are reported as found by both.
pub fn semantic_first(
    semantic: SemanticHits,
    filter: &StructuredFilter,
    structured: &[MemoryEntry],
) -> Vec<ScoredEntry> {
    let structured_ids: AHashSet<EntryId> = structured.iter().map(|entry| entry.id).collect();

    semantic
        .into_iter()
        .filter(|(entry, _)| filter.matches(entry))
        .map(|(entry, similarity)| {
            if structured_ids.contains(&entry.id) {
                both(entry, similarity)
            } else {
                ScoredEntry::semantic(entry, similarity)
            }
        })
        .collect()
}

/// Re-rank the structured candidate pool by similarity.
///
/// `ranked` must be scored from `pool` itself; ids outside the pool are
/// ignored. Candidates that could not be scored (no vector) follow the scored
/// ones in their structured order with a score of 0.
pub fn structured_first(pool: Vec<MemoryEntry>, ranked: SemanticHits) -> Vec<ScoredEntry> {
    let mut remaining: AHashMap<EntryId, usize> = pool
        .iter()
        .enumerate()
        .map(|(at, entry)| (entry.id, at))
        .collect();

    let mut merged: Vec<ScoredEntry> = Vec::with_capacity(pool.len());
    for (entry, similarity) in ranked {
        if remaining.remove(&entry.id).is_some() {
            merged.push(both(entry, similarity));
        }
    }

    let mut unscored: Vec<(usize, MemoryEntry)> = pool
        .into_iter()
        .filter_map(|entry| remaining.get(&entry.id).map(|&at| (at, entry)))
        .collect();
    unscored.sort_by_key(|(at, _)| *at);
    merged.extend(unscored.into_iter().map(|(_, entry)| ScoredEntry {
        entry,
        score: 0.0,
        similarity: None,
        source: HitSource::Structured,
    }));

    merged
}

/// Results when only the structured half answered.
pub fn structured_only(structured: Vec<MemoryEntry>) -> Vec<ScoredEntry> {
    structured.into_iter().map(ScoredEntry::structured).collect()
}

/// Results when only the semantic half answered, post-filtered by the
/// structured predicate.
pub fn semantic_only(semantic: SemanticHits, filter: &StructuredFilter) -> Vec<ScoredEntry> {
    semantic
        .into_iter()
        .filter(|(entry, _)| filter.matches(entry))
        .map(|(entry, similarity)| ScoredEntry::semantic(entry, similarity))
        .collect()
}

/// Truncate to `limit`, if any.
pub fn apply_limit(hits: &mut Vec<ScoredEntry>, limit: Option<usize>) {
    if let Some(limit) = limit {
        hits.truncate(limit);
    }
}
