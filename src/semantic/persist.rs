//! On-disk format of the semantic leaf.
//!
//! Two files are written per checkpoint:
//!
//! - `semantic.vectors`: `[dim: u32][count: u64]` followed by `count` rows of
//!   `dim` little-endian `f32`, then a crc32 footer.
//! - `semantic.graph`: bincode-encoded params, per-namespace graph layouts and
//!   entry payloads (without vectors), then a crc32 footer. It also records the
//!   checksum of the vector file it was written with, so a pair of files from
//!   different checkpoints is detected.
//!
//! Vector rows follow the graph layouts in order: every slot of the first
//! namespace, then every slot of the next.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::entry::{EntryId, MemoryEntry, SyncState};
use crate::error::{MemoryError, Result};
use crate::semantic::Vector;
use crate::semantic::hnsw::{GraphLayout, HnswParams};
use crate::storage::Storage;

pub const GRAPH_FILE: &str = "semantic.graph";
pub const VECTORS_FILE: &str = "semantic.vectors";

const FORMAT_VERSION: u32 = 1;
const VECTOR_HEADER_LEN: usize = 12;

/// Entry payload as persisted next to the graph.
///
/// Kept separate from [`MemoryEntry`] so the binary layout has no optional
/// fields that serde would skip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredEntry {
    id: EntryId,
    namespace: String,
    key: String,
    content: String,
    tags: Vec<String>,
    metadata: Vec<(String, String)>,
    created_at_us: i64,
    updated_at_us: i64,
    ttl_ms: Option<u64>,
    sync: SyncState,
    seq: u64,
}

impl StoredEntry {
    fn from_entry(entry: &MemoryEntry) -> Self {
        StoredEntry {
            id: entry.id,
            namespace: entry.namespace.clone(),
            key: entry.key.clone(),
            content: entry.content.clone(),
            tags: entry.tags.iter().cloned().collect(),
            metadata: entry
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            created_at_us: entry.created_at.timestamp_micros(),
            updated_at_us: entry.updated_at.timestamp_micros(),
            ttl_ms: entry.ttl_ms,
            sync: entry.sync,
            seq: entry.seq,
        }
    }

    fn into_entry(self, vector: Vector) -> Result<MemoryEntry> {
        Ok(MemoryEntry {
            id: self.id,
            namespace: self.namespace,
            key: self.key,
            content: self.content,
            vector: Some(vector),
            tags: self.tags.into_iter().collect::<BTreeSet<_>>(),
            metadata: self.metadata.into_iter().collect::<BTreeMap<_, _>>(),
            created_at: timestamp(self.created_at_us)?,
            updated_at: timestamp(self.updated_at_us)?,
            ttl_ms: self.ttl_ms,
            sync: self.sync,
            seq: self.seq,
        })
    }
}

fn timestamp(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| MemoryError::corrupt(format!("timestamp {micros} is out of range")))
}

#[derive(Debug, Serialize, Deserialize)]
struct NamespaceGraph {
    namespace: String,
    layout: GraphLayout,
}

#[derive(Debug, Serialize, Deserialize)]
struct GraphFile {
    version: u32,
    params: HnswParams,
    dimension: u32,
    vectors_checksum: u32,
    graphs: Vec<NamespaceGraph>,
    /// One payload per graph slot, in row order.
    entries: Vec<StoredEntry>,
}

/// A namespace graph together with the full entries of its slots.
#[derive(Debug, Clone)]
pub struct NamespaceImage {
    pub namespace: String,
    pub layout: GraphLayout,
    /// `entries[slot]`, each carrying its vector.
    pub entries: Vec<MemoryEntry>,
}

/// Everything the semantic leaf persists.
#[derive(Debug, Clone)]
pub struct SemanticImage {
    pub params: HnswParams,
    pub dimension: usize,
    pub namespaces: Vec<NamespaceImage>,
}

impl SemanticImage {
    pub fn entry_count(&self) -> usize {
        self.namespaces.iter().map(|ns| ns.entries.len()).sum()
    }
}

/// Write the image. Returns the bytes written across both files.
pub fn write_image(storage: &dyn Storage, image: &SemanticImage) -> Result<u64> {
    let count = image.entry_count();
    let mut vectors = Vec::with_capacity(VECTOR_HEADER_LEN + count * image.dimension * 4 + 4);
    vectors.write_u32::<LittleEndian>(image.dimension as u32)?;
    vectors.write_u64::<LittleEndian>(count as u64)?;

    let mut graphs = Vec::with_capacity(image.namespaces.len());
    let mut entries = Vec::with_capacity(count);
    for namespace in &image.namespaces {
        if namespace.entries.len() != namespace.layout.ids.len() {
            return Err(MemoryError::internal(format!(
                "namespace {} has {} entries for {} graph slots",
                namespace.namespace,
                namespace.entries.len(),
                namespace.layout.ids.len()
            )));
        }
        for entry in &namespace.entries {
            let vector = entry.vector.as_ref().ok_or_else(|| {
                MemoryError::internal(format!("indexed entry {} has no vector", entry.id))
            })?;
            vector.validate_dimension(image.dimension)?;
            for value in &vector.data {
                vectors.write_f32::<LittleEndian>(*value)?;
            }
            entries.push(StoredEntry::from_entry(entry));
        }
        graphs.push(NamespaceGraph {
            namespace: namespace.namespace.clone(),
            layout: namespace.layout.clone(),
        });
    }
    let vectors_checksum = crc32fast::hash(&vectors);
    vectors.write_u32::<LittleEndian>(vectors_checksum)?;

    let graph_file = GraphFile {
        version: FORMAT_VERSION,
        params: image.params.clone(),
        dimension: image.dimension as u32,
        vectors_checksum,
        graphs,
        entries,
    };
    let mut graph = bincode::serialize(&graph_file)?;
    let graph_checksum = crc32fast::hash(&graph);
    graph.write_u32::<LittleEndian>(graph_checksum)?;

    // Vectors first: the graph file names the vector checksum it expects.
    replace_file(storage, VECTORS_FILE, &vectors)?;
    replace_file(storage, GRAPH_FILE, &graph)?;
    storage.sync()?;

    debug!(
        "Wrote semantic image: {count} vectors in {} namespaces ({} + {} bytes)",
        image.namespaces.len(),
        graph.len(),
        vectors.len()
    );
    Ok((graph.len() + vectors.len()) as u64)
}

fn replace_file(storage: &dyn Storage, path: &str, bytes: &[u8]) -> Result<()> {
    let temp_path = format!("{path}.tmp");
    let mut output = storage.create_output(&temp_path)?;
    output.write_all(bytes)?;
    output.flush_and_sync()?;
    output.close()?;
    storage.rename_file(&temp_path, path)
}

/// Remove both files.
pub fn delete_image(storage: &dyn Storage) -> Result<()> {
    for path in [GRAPH_FILE, VECTORS_FILE] {
        if storage.file_exists(path) {
            storage.delete_file(path)?;
        }
    }
    Ok(())
}

/// Read and verify the image.
///
/// Returns `Ok(None)` when nothing was persisted yet and `CorruptIndex` when
/// either file fails verification or they do not belong together.
pub fn read_image(storage: &dyn Storage) -> Result<Option<SemanticImage>> {
    let has_graph = storage.file_exists(GRAPH_FILE);
    let has_vectors = storage.file_exists(VECTORS_FILE);
    match (has_graph, has_vectors) {
        (false, false) => return Ok(None),
        (true, false) => return Err(MemoryError::corrupt("semantic.vectors is missing")),
        (false, true) => return Err(MemoryError::corrupt("semantic.graph is missing")),
        (true, true) => {}
    }

    let graph_bytes = storage.open_input(GRAPH_FILE)?.read_to_vec()?;
    let graph_payload = verified_payload(&graph_bytes, GRAPH_FILE)?;
    let graph: GraphFile = bincode::deserialize(graph_payload)
        .map_err(|e| MemoryError::corrupt(format!("{GRAPH_FILE} does not decode: {e}")))?;
    if graph.version != FORMAT_VERSION {
        return Err(MemoryError::corrupt(format!(
            "{GRAPH_FILE} has unsupported version {}",
            graph.version
        )));
    }

    let vector_bytes = storage.open_input(VECTORS_FILE)?.read_to_vec()?;
    let vector_payload = verified_payload(&vector_bytes, VECTORS_FILE)?;
    if crc32fast::hash(vector_payload) != graph.vectors_checksum {
        return Err(MemoryError::corrupt(format!(
            "{VECTORS_FILE} does not belong to {GRAPH_FILE}"
        )));
    }
    let rows = decode_vectors(vector_payload, graph.dimension as usize)?;

    let slots: usize = graph.graphs.iter().map(|g| g.layout.ids.len()).sum();
    if rows.len() != slots || graph.entries.len() != slots {
        return Err(MemoryError::corrupt(format!(
            "semantic image holds {slots} graph slots, {} vectors and {} entries",
            rows.len(),
            graph.entries.len()
        )));
    }

    let mut rows = rows.into_iter();
    let mut stored = graph.entries.into_iter();
    let mut namespaces = Vec::with_capacity(graph.graphs.len());
    for NamespaceGraph { namespace, layout } in graph.graphs {
        let mut entries = Vec::with_capacity(layout.ids.len());
        for id in &layout.ids {
            let (Some(entry), Some(vector)) = (stored.next(), rows.next()) else {
                return Err(MemoryError::corrupt("semantic image ended early"));
            };
            if entry.id != *id || entry.namespace != namespace {
                return Err(MemoryError::corrupt(format!(
                    "entry {} does not match graph slot {id} in {namespace}",
                    entry.id
                )));
            }
            entries.push(entry.into_entry(vector)?);
        }
        namespaces.push(NamespaceImage {
            namespace,
            layout,
            entries,
        });
    }

    Ok(Some(SemanticImage {
        params: graph.params,
        dimension: graph.dimension as usize,
        namespaces,
    }))
}

fn verified_payload<'a>(data: &'a [u8], path: &str) -> Result<&'a [u8]> {
    if data.len() < 4 {
        return Err(MemoryError::corrupt(format!("{path} is truncated")));
    }
    let (payload, mut footer) = data.split_at(data.len() - 4);
    let expected = footer.read_u32::<LittleEndian>()?;
    if crc32fast::hash(payload) != expected {
        return Err(MemoryError::corrupt(format!("{path} checksum mismatch")));
    }
    Ok(payload)
}

fn decode_vectors(payload: &[u8], expected_dim: usize) -> Result<Vec<Vector>> {
    if payload.len() < VECTOR_HEADER_LEN {
        return Err(MemoryError::corrupt(format!("{VECTORS_FILE} header is truncated")));
    }

    let mut cursor = Cursor::new(payload);
    let dimension = cursor.read_u32::<LittleEndian>()? as usize;
    let count = cursor.read_u64::<LittleEndian>()? as usize;
    if dimension != expected_dim {
        return Err(MemoryError::corrupt(format!(
            "{VECTORS_FILE} has dimension {dimension}, graph expects {expected_dim}"
        )));
    }

    let expected_len = count
        .checked_mul(dimension)
        .and_then(|values| values.checked_mul(4))
        .and_then(|bytes| bytes.checked_add(VECTOR_HEADER_LEN));
    if expected_len != Some(payload.len()) {
        return Err(MemoryError::corrupt(format!(
            "{VECTORS_FILE} length does not match {count} rows of dimension {dimension}"
        )));
    }

    let mut rows = Vec::with_capacity(count);
    for _ in 0..count {
        let mut data = vec![0.0f32; dimension];
        cursor.read_f32_into::<LittleEndian>(&mut data)?;
        rows.push(Vector::new(data));
    }
    Ok(rows)
}
