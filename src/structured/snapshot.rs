//! Compacted index snapshots for the structured leaf.
//!
//! A snapshot is the JSON-encoded live index followed by a little-endian
//! crc32 footer over the payload. It is written to a temp file and renamed into
//! place, so a reader sees either the old snapshot or the new one.

use std::io::Write;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::entry::MemoryEntry;
use crate::error::{MemoryError, Result};
use crate::storage::Storage;
use crate::structured::wal::Lsn;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Persisted state of the structured index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Last WAL record folded into this snapshot.
    pub last_lsn: Lsn,
    /// Next insertion sequence to hand out.
    pub next_seq: u64,
    /// Live entries in insertion order.
    pub entries: Vec<MemoryEntry>,
}

impl Snapshot {
    pub fn new(last_lsn: Lsn, next_seq: u64, entries: Vec<MemoryEntry>) -> Self {
        Snapshot {
            version: SNAPSHOT_VERSION,
            last_lsn,
            next_seq,
            entries,
        }
    }
}

/// Write `snapshot` to `path` atomically.
pub fn write_snapshot(storage: &dyn Storage, path: &str, snapshot: &Snapshot) -> Result<u64> {
    let payload = serde_json::to_vec(snapshot)?;
    let checksum = crc32fast::hash(&payload);
    let temp_path = format!("{path}.tmp");

    {
        let mut output = storage.create_output(&temp_path)?;
        output.write_all(&payload)?;
        output.write_all(&checksum.to_le_bytes())?;
        output.flush_and_sync()?;
        output.close()?;
    }
    storage.rename_file(&temp_path, path)?;
    storage.sync()?;

    let bytes = payload.len() as u64 + 4;
    debug!(
        "Wrote snapshot {path}: {} entries, lsn {}, {bytes} bytes",
        snapshot.entries.len(),
        snapshot.last_lsn
    );
    Ok(bytes)
}

/// Read the snapshot at `path`, verifying its checksum.
///
/// Returns `Ok(None)` when no snapshot exists and `CorruptIndex` when the file
/// fails verification.
pub fn read_snapshot(storage: &dyn Storage, path: &str) -> Result<Option<Snapshot>> {
    if !storage.file_exists(path) {
        return Ok(None);
    }

    let data = storage.open_input(path)?.read_to_vec()?;
    let payload = split_footer(&data, path)?;
    serde_json::from_slice(payload)
        .map(Some)
        .map_err(|e| MemoryError::corrupt(format!("snapshot {path} does not decode: {e}")))
}

/// Decode the snapshot at `path` without trusting its checksum.
///
/// Used by rebuilds to salvage what is still readable.
pub fn salvage_snapshot(storage: &dyn Storage, path: &str) -> Option<Snapshot> {
    if !storage.file_exists(path) {
        return None;
    }
    let data = storage.open_input(path).ok()?.read_to_vec().ok()?;
    if data.len() < 4 {
        return None;
    }
    serde_json::from_slice(&data[..data.len() - 4]).ok()
}

fn split_footer<'a>(data: &'a [u8], path: &str) -> Result<&'a [u8]> {
    if data.len() < 4 {
        return Err(MemoryError::corrupt(format!(
            "snapshot {path} is truncated ({} bytes)",
            data.len()
        )));
    }

    let (payload, footer) = data.split_at(data.len() - 4);
    let expected = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    if crc32fast::hash(payload) != expected {
        return Err(MemoryError::corrupt(format!(
            "snapshot {path} checksum mismatch"
        )));
    }
    Ok(payload)
}
