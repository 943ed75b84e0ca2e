//! HNSW (Hierarchical Navigable Small World) graph for approximate nearest
//! neighbor search.
//!
//! The graph is a stack of layers; every node lives on layer 0 and on each
//! layer up to a randomly drawn level, so upper layers act as express lanes
//! towards the region of the query. Search cost grows roughly with `log n`.
//!
//! Concurrency model:
//!
//! - Nodes live in an append-only slab. A node never moves once pushed, so a
//!   slot number is a stable handle.
//! - Each node keeps one neighbor list per layer as an immutable
//!   `Arc<Vec<u32>>`. Readers clone the `Arc` and traverse their own copy.
//!   Writers build a replacement list and publish it only if the list they
//!   started from is still the current one (compare on `Arc` identity),
//!   retrying otherwise. No reader ever waits for a writer to finish
//!   computing a list.
//! - Deletion sets a tombstone flag. Tombstoned nodes keep routing traversal
//!   but never take a result slot. Once they outnumber the live nodes the
//!   owner swaps in [`HnswGraph::compacted`]; exports are always compacted.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::entry::EntryId;
use crate::error::{MemoryError, Result};
use crate::semantic::{DistanceMetric, Vector};

/// Upper bound on drawn levels. Reached with negligible probability.
const MAX_LEVEL: usize = 16;

/// Tombstones tolerated before compaction is considered at all.
const COMPACTION_MIN_TOMBSTONES: usize = 32;

/// Construction and search parameters of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Maximum links per node on layers above 0.
    pub m: usize,
    /// Candidate list size while inserting.
    pub ef_construction: usize,
    /// Default candidate list size while searching.
    pub ef_search: usize,
    pub metric: DistanceMetric,
    /// Seed for level assignment, so graphs build reproducibly.
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        HnswParams {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            metric: DistanceMetric::Cosine,
            seed: 42,
        }
    }
}

impl HnswParams {
    /// Maximum links per node on layer 0.
    pub fn m0(&self) -> usize {
        self.m * 2
    }

    /// Level multiplier `1 / ln(m)`.
    pub fn level_multiplier(&self) -> f64 {
        1.0 / (self.m.max(2) as f64).ln()
    }

    pub fn validate(&self) -> Result<()> {
        if self.m < 2 {
            return Err(MemoryError::invalid_config("hnsw m must be at least 2"));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err(MemoryError::invalid_config(
                "hnsw ef_construction and ef_search must be positive",
            ));
        }
        Ok(())
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 { self.m0() } else { self.m }
    }
}

/// A node in the graph.
#[derive(Debug)]
struct HnswNode {
    id: EntryId,
    vector: Vector,
    level: usize,
    /// One neighbor list per layer `0..=level`.
    layers: Vec<RwLock<Arc<Vec<u32>>>>,
    deleted: AtomicBool,
}

impl HnswNode {
    fn new(id: EntryId, vector: Vector, level: usize) -> Self {
        HnswNode {
            id,
            vector,
            level,
            layers: (0..=level).map(|_| RwLock::new(Arc::default())).collect(),
            deleted: AtomicBool::new(false),
        }
    }

    fn neighbors(&self, layer: usize) -> Arc<Vec<u32>> {
        match self.layers.get(layer) {
            Some(list) => list.read().clone(),
            None => Arc::default(),
        }
    }

    /// Replace the list on `layer` if it is still `expected`.
    fn publish(&self, layer: usize, expected: &Arc<Vec<u32>>, next: Vec<u32>) -> bool {
        let Some(list) = self.layers.get(layer) else {
            return false;
        };
        let mut current = list.write();
        if Arc::ptr_eq(&current, expected) {
            *current = Arc::new(next);
            true
        } else {
            false
        }
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

/// Candidate during a layer search, ordered by distance.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f32,
    slot: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

/// Serializable shape of a compacted graph. Vectors are stored separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphLayout {
    pub entry_point: Option<u32>,
    pub ids: Vec<EntryId>,
    pub levels: Vec<u32>,
    /// `neighbors[slot][layer]`.
    pub neighbors: Vec<Vec<Vec<u32>>>,
}

/// Approximate nearest neighbor graph over the vectors of one namespace.
#[derive(Debug)]
pub struct HnswGraph {
    params: HnswParams,
    nodes: RwLock<Vec<Arc<HnswNode>>>,
    /// Live slot of each id.
    ids: RwLock<AHashMap<EntryId, u32>>,
    entry_point: RwLock<Option<u32>>,
    rng: Mutex<StdRng>,
    deleted: AtomicUsize,
}

impl HnswGraph {
    pub fn new(params: HnswParams) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        HnswGraph {
            params,
            nodes: RwLock::new(Vec::new()),
            ids: RwLock::new(AHashMap::new()),
            entry_point: RwLock::new(None),
            rng: Mutex::new(rng),
            deleted: AtomicUsize::new(0),
        }
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Number of live (non-tombstoned) ids.
    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }

    /// Number of slots, tombstones included.
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::Relaxed)
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.ids.read().contains_key(id)
    }

    /// The vector currently indexed for `id`.
    pub fn vector(&self, id: &EntryId) -> Option<Vector> {
        let slot = *self.ids.read().get(id)?;
        self.nodes
            .read()
            .get(slot as usize)
            .map(|node| node.vector.clone())
    }

    /// Live ids in slot order.
    pub fn ids(&self) -> Vec<EntryId> {
        let nodes = self.nodes.read();
        nodes
            .iter()
            .filter(|node| !node.is_deleted())
            .map(|node| node.id)
            .collect()
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        // Dimensions are validated before vectors reach the graph.
        self.params
            .metric
            .distance(a, b)
            .unwrap_or(f32::INFINITY)
    }

    fn select_level(&self) -> usize {
        let uniform: f64 = self.rng.lock().random();
        let level = (-uniform.max(f64::MIN_POSITIVE).ln() * self.params.level_multiplier()).floor();
        (level as usize).min(MAX_LEVEL)
    }

    /// Insert `vector` under `id` and return its slot.
    ///
    /// Re-inserting an id tombstones the node that held it before.
    pub fn insert(&self, id: EntryId, vector: Vector) -> u32 {
        let level = self.select_level();
        let node = Arc::new(HnswNode::new(id, vector, level));
        let slot = {
            let mut nodes = self.nodes.write();
            nodes.push(node.clone());
            (nodes.len() - 1) as u32
        };

        self.link(&node, slot);

        let previous = self.ids.write().insert(id, slot);
        if let Some(previous) = previous {
            self.tombstone(previous);
        }
        slot
    }

    fn link(&self, node: &HnswNode, slot: u32) {
        let entry = {
            let mut entry_point = self.entry_point.write();
            match *entry_point {
                Some(entry) => entry,
                None => {
                    *entry_point = Some(slot);
                    return;
                }
            }
        };

        let nodes = self.nodes.read();
        let query = node.vector.data.as_slice();
        let entry_node = &nodes[entry as usize];
        let top = entry_node.level;

        let mut current = vec![Candidate {
            distance: self.distance(query, &entry_node.vector.data),
            slot: entry,
        }];

        for layer in (node.level + 1..=top).rev() {
            current = self.search_layer(&nodes, query, &current, 1, layer);
        }

        for layer in (0..=node.level.min(top)).rev() {
            let found = self.search_layer(&nodes, query, &current, self.params.ef_construction, layer);
            let selected: Vec<u32> = found
                .iter()
                .filter(|candidate| candidate.slot != slot)
                .take(self.params.max_links(layer))
                .map(|candidate| candidate.slot)
                .collect();

            // Concurrent inserts may already have linked to this node.
            self.add_links(&nodes, slot, &selected, layer);
            for &neighbor in &selected {
                self.add_links(&nodes, neighbor, &[slot], layer);
            }
            if !found.is_empty() {
                current = found;
            }
        }

        if node.level > top {
            let mut entry_point = self.entry_point.write();
            let current_top = (*entry_point).map_or(0, |entry| nodes[entry as usize].level);
            if entry_point.is_none() || node.level > current_top {
                *entry_point = Some(slot);
            }
        }
    }

    /// Merge `new_slots` into the neighbor list of `target`, pruning if full.
    fn add_links(&self, nodes: &[Arc<HnswNode>], target: u32, new_slots: &[u32], layer: usize) {
        let target_node = &nodes[target as usize];
        if layer > target_node.level {
            return;
        }
        let max_links = self.params.max_links(layer);

        loop {
            let current = target_node.neighbors(layer);
            let mut next = Vec::with_capacity(current.len() + new_slots.len());
            next.extend_from_slice(&current);
            for &slot in new_slots {
                if slot != target && !next.contains(&slot) {
                    next.push(slot);
                }
            }
            if next.len() == current.len() {
                return;
            }
            if next.len() > max_links {
                next = self.prune(nodes, target_node, next, max_links);
            }

            if target_node.publish(layer, &current, next) {
                return;
            }
        }
    }

    /// Keep the `max_links` neighbors closest to `node`, live ones first.
    fn prune(
        &self,
        nodes: &[Arc<HnswNode>],
        node: &HnswNode,
        links: Vec<u32>,
        max_links: usize,
    ) -> Vec<u32> {
        let mut scored: Vec<(bool, Candidate)> = links
            .into_iter()
            .filter_map(|slot| {
                nodes.get(slot as usize).map(|neighbor| {
                    let candidate = Candidate {
                        distance: self.distance(&node.vector.data, &neighbor.vector.data),
                        slot,
                    };
                    (neighbor.is_deleted(), candidate)
                })
            })
            .collect();
        scored.sort_unstable();
        scored.truncate(max_links);
        scored.into_iter().map(|(_, candidate)| candidate.slot).collect()
    }

    /// Beam search on one layer. Returns up to `ef` candidates, closest first.
    fn search_layer(
        &self,
        nodes: &[Arc<HnswNode>],
        query: &[f32],
        entry_points: &[Candidate],
        ef: usize,
        layer: usize,
    ) -> Vec<Candidate> {
        let ef = ef.max(1);
        let mut visited: HashSet<u32> = HashSet::with_capacity(ef * 4);
        let mut candidates = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();
        // Closest node seen, tombstoned or not. Keeps descent going when a
        // layer holds nothing live near the query.
        let mut nearest: Option<Candidate> = None;

        let is_live = |slot: u32| nodes.get(slot as usize).is_some_and(|node| !node.is_deleted());

        for &entry in entry_points {
            if visited.insert(entry.slot) {
                candidates.push(Reverse(entry));
                if nearest.is_none_or(|best| entry < best) {
                    nearest = Some(entry);
                }
                if is_live(entry.slot) {
                    results.push(entry);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if let Some(farthest) = results.peek() {
                if results.len() >= ef && current.distance > farthest.distance {
                    break;
                }
            }

            let Some(current_node) = nodes.get(current.slot as usize) else {
                continue;
            };
            for &neighbor in current_node.neighbors(layer).iter() {
                if !visited.insert(neighbor) {
                    continue;
                }
                let Some(neighbor_node) = nodes.get(neighbor as usize) else {
                    continue;
                };

                let distance = self.distance(query, &neighbor_node.vector.data);
                let closer = results
                    .peek()
                    .is_none_or(|farthest| distance < farthest.distance);
                if results.len() < ef || closer {
                    let candidate = Candidate {
                        distance,
                        slot: neighbor,
                    };
                    candidates.push(Reverse(candidate));
                    if nearest.is_none_or(|best| candidate < best) {
                        nearest = Some(candidate);
                    }
                    if !neighbor_node.is_deleted() {
                        results.push(candidate);
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        if results.is_empty() {
            return nearest.into_iter().collect();
        }
        results.into_sorted_vec()
    }

    /// Find up to `k` live ids closest to `query`, closest first.
    ///
    /// `ef` overrides the configured search breadth. Graphs no larger than the
    /// breadth are scanned exhaustively.
    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Vec<(EntryId, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let Some(entry) = *self.entry_point.read() else {
            return Vec::new();
        };

        let ef = ef.unwrap_or(self.params.ef_search).max(k);

        let nodes = self.nodes.read();
        let found = if nodes.len() <= ef {
            self.exhaustive(&nodes, query)
        } else {
            let entry_node = &nodes[entry as usize];
            let mut current = vec![Candidate {
                distance: self.distance(query, &entry_node.vector.data),
                slot: entry,
            }];
            for layer in (1..=entry_node.level).rev() {
                current = self.search_layer(&nodes, query, &current, 1, layer);
            }
            self.search_layer(&nodes, query, &current, ef, 0)
        };

        let mut seen = HashSet::with_capacity(k);
        found
            .into_iter()
            .filter_map(|candidate| {
                let node = &nodes[candidate.slot as usize];
                (!node.is_deleted() && seen.insert(node.id)).then_some((node.id, candidate.distance))
            })
            .take(k)
            .collect()
    }

    fn exhaustive(&self, nodes: &[Arc<HnswNode>], query: &[f32]) -> Vec<Candidate> {
        let mut all: Vec<Candidate> = nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| !node.is_deleted())
            .map(|(slot, node)| Candidate {
                distance: self.distance(query, &node.vector.data),
                slot: slot as u32,
            })
            .collect();
        all.sort_unstable();
        all
    }

    /// Tombstone the node holding `id`. Returns whether it was live.
    pub fn remove(&self, id: &EntryId) -> bool {
        let slot = self.ids.write().remove(id);
        match slot {
            Some(slot) => {
                self.tombstone(slot);
                true
            }
            None => false,
        }
    }

    fn tombstone(&self, slot: u32) {
        let nodes = self.nodes.read();
        if let Some(node) = nodes.get(slot as usize) {
            if !node.deleted.swap(true, Ordering::AcqRel) {
                self.deleted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Export a compacted copy of the graph together with its vectors.
    ///
    /// Graphs holding tombstones are rebuilt from their live nodes so the
    /// exported links never route through removed entries.
    pub fn export(&self) -> (GraphLayout, Vec<Vector>) {
        if self.deleted_count() > 0 {
            return self.compacted().export();
        }

        let nodes = self.nodes.read();
        let mut layout = GraphLayout {
            entry_point: *self.entry_point.read(),
            ids: Vec::with_capacity(nodes.len()),
            levels: Vec::with_capacity(nodes.len()),
            neighbors: Vec::with_capacity(nodes.len()),
        };
        let mut vectors = Vec::with_capacity(nodes.len());

        for node in nodes.iter() {
            layout.ids.push(node.id);
            layout.levels.push(node.level as u32);
            layout.neighbors.push(
                (0..=node.level)
                    .map(|layer| node.neighbors(layer).to_vec())
                    .collect(),
            );
            vectors.push(node.vector.clone());
        }
        (layout, vectors)
    }

    /// Whether tombstones have piled up enough to warrant [`Self::compacted`].
    pub fn should_compact(&self) -> bool {
        let deleted = self.deleted_count();
        deleted >= COMPACTION_MIN_TOMBSTONES && deleted > self.len()
    }

    /// A fresh graph holding only the live nodes, relinked from scratch.
    ///
    /// Inserts racing with this call may be missed; callers serialize writes.
    pub fn compacted(&self) -> HnswGraph {
        let compacted = HnswGraph::new(self.params.clone());
        for (id, vector) in self.live_nodes() {
            compacted.insert(id, vector);
        }
        compacted
    }

    fn live_nodes(&self) -> Vec<(EntryId, Vector)> {
        let nodes = self.nodes.read();
        nodes
            .iter()
            .filter(|node| !node.is_deleted())
            .map(|node| (node.id, node.vector.clone()))
            .collect()
    }

    /// Restore a graph from an exported layout and its vectors.
    pub fn from_layout(params: HnswParams, layout: GraphLayout, vectors: Vec<Vector>) -> Result<Self> {
        let count = layout.ids.len();
        if layout.levels.len() != count || layout.neighbors.len() != count || vectors.len() != count
        {
            return Err(MemoryError::corrupt(format!(
                "graph layout is inconsistent: {count} ids, {} levels, {} neighbor lists, {} vectors",
                layout.levels.len(),
                layout.neighbors.len(),
                vectors.len()
            )));
        }
        if let Some(entry) = layout.entry_point {
            if entry as usize >= count {
                return Err(MemoryError::corrupt(format!(
                    "graph entry point {entry} is out of range"
                )));
            }
        } else if count > 0 {
            return Err(MemoryError::corrupt("non-empty graph has no entry point"));
        }

        let graph = HnswGraph::new(params);
        {
            let mut nodes = graph.nodes.write();
            let mut ids = graph.ids.write();
            let parts = layout
                .ids
                .into_iter()
                .zip(layout.levels)
                .zip(layout.neighbors)
                .zip(vectors);

            for (slot, (((id, level), neighbors), vector)) in parts.enumerate() {
                let level = level as usize;
                if neighbors.len() != level + 1 {
                    return Err(MemoryError::corrupt(format!(
                        "node {slot} has {} layers but level {level}",
                        neighbors.len()
                    )));
                }
                if neighbors.iter().flatten().any(|&n| n as usize >= count) {
                    return Err(MemoryError::corrupt(format!(
                        "node {slot} links outside the graph"
                    )));
                }

                let node = HnswNode::new(id, vector, level);
                for (layer, list) in neighbors.into_iter().enumerate() {
                    *node.layers[layer].write() = Arc::new(list);
                }
                if ids.insert(id, slot as u32).is_some() {
                    return Err(MemoryError::corrupt(format!("duplicate id {id} in graph")));
                }
                nodes.push(Arc::new(node));
            }
        }
        *graph.entry_point.write() = layout.entry_point;
        Ok(graph)
    }
}
