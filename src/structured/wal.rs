//! Write-ahead log for the structured leaf.
//!
//! Every mutation is appended here and synced before it touches the live
//! index. Records are framed as `[len: u32][crc32: u32][json payload]`, all
//! little-endian.
//!
//! Recovery distinguishes two kinds of damage:
//!
//! - a **torn tail**: the final frame is incomplete or fails its checksum. This
//!   is what a crash in the middle of an append leaves behind; the record was
//!   never acknowledged, so it is dropped.
//! - **corruption**: a frame that is followed by more data fails its checksum
//!   or does not decode. Acknowledged writes may be lost, so the leaf refuses
//!   further writes until it is rebuilt.

use std::io::Write;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entry::{MemoryEntry, SyncState};
use crate::error::{MemoryError, Result};
use crate::storage::{Storage, StorageOutput};

/// Log sequence number. Strictly increasing across the life of a store.
pub type Lsn = u64;

const FRAME_HEADER_LEN: usize = 8;

/// A journaled mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalOp {
    /// Insert or fully replace an entry.
    Upsert { entry: MemoryEntry },
    /// Remove an entry.
    Delete { namespace: String, key: String },
    /// Change the replication state of an entry.
    SetSync {
        namespace: String,
        key: String,
        state: SyncState,
    },
}

/// A WAL operation with its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub op: WalOp,
}

/// Encode a record into its on-disk frame.
pub fn encode_frame(record: &WalRecord) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(record)?;
    let checksum = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Everything recovered from a log file.
#[derive(Debug, Default)]
pub struct WalReadOutcome {
    /// Records that passed their checksum, in log order.
    pub records: Vec<WalRecord>,
    /// Bytes covered by `records`.
    pub valid_bytes: u64,
    /// Set when the final frame was discarded.
    pub torn_tail: Option<String>,
    /// Set when damage was found before the end of the log.
    pub corruption: Option<String>,
}

/// Read and validate every frame of the log at `path`.
pub fn read_wal(storage: &dyn Storage, path: &str) -> Result<WalReadOutcome> {
    let mut outcome = WalReadOutcome::default();
    if !storage.file_exists(path) {
        return Ok(outcome);
    }

    let data = storage.open_input(path)?.read_to_vec()?;
    let total = data.len();
    let mut pos = 0usize;

    while pos < total {
        if total - pos < FRAME_HEADER_LEN {
            outcome.torn_tail = Some(format!("incomplete frame header at offset {pos}"));
            break;
        }

        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let checksum =
            u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        let start = pos + FRAME_HEADER_LEN;
        let end = start.saturating_add(len);

        if end > total {
            outcome.torn_tail = Some(format!("incomplete frame payload at offset {pos}"));
            break;
        }

        let payload = &data[start..end];
        let is_last = end == total;

        if crc32fast::hash(payload) != checksum {
            let message = format!("checksum mismatch at offset {pos}");
            if is_last {
                outcome.torn_tail = Some(message);
            } else {
                outcome.corruption = Some(message);
            }
            break;
        }

        match serde_json::from_slice::<WalRecord>(payload) {
            Ok(record) => outcome.records.push(record),
            Err(e) => {
                outcome.corruption = Some(format!("undecodable record at offset {pos}: {e}"));
                break;
            }
        }

        pos = end;
        outcome.valid_bytes = pos as u64;
    }

    Ok(outcome)
}

/// Appends frames to the log and syncs each one.
#[derive(Debug)]
pub struct WalWriter {
    storage: Arc<dyn Storage>,
    path: String,
    output: Option<Box<dyn StorageOutput>>,
}

impl WalWriter {
    pub fn new(storage: Arc<dyn Storage>, path: impl Into<String>) -> Self {
        WalWriter {
            storage,
            path: path.into(),
            output: None,
        }
    }

    fn ensure_output(&mut self) -> Result<&mut Box<dyn StorageOutput>> {
        let output = match self.output.take() {
            Some(output) => output,
            None => self.storage.create_output_append(&self.path)?,
        };
        Ok(self.output.insert(output))
    }

    /// Append one record. It is durable when this returns `Ok`.
    pub fn append(&mut self, record: &WalRecord) -> Result<()> {
        let frame = encode_frame(record)?;
        let output = self.ensure_output()?;
        let written = output
            .write_all(&frame)
            .map_err(MemoryError::from)
            .and_then(|_| output.flush_and_sync());

        if written.is_err() {
            // Reopen on the next append rather than write after a partial frame.
            self.output = None;
        }
        written
    }

    /// Empty the log. Called after a successful checkpoint.
    pub fn truncate(&mut self) -> Result<()> {
        self.output = None;
        let mut output = self.storage.create_output(&self.path)?;
        output.flush_and_sync()?;
        output.close()?;
        Ok(())
    }

    /// Current size of the log file in bytes.
    pub fn size(&self) -> u64 {
        match &self.output {
            Some(output) => output.position(),
            None => self.storage.file_size(&self.path).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const WAL: &str = "structured.wal";

    fn upsert(lsn: Lsn, key: &str) -> WalRecord {
        WalRecord {
            lsn,
            op: WalOp::Upsert {
                entry: MemoryEntry::new("ns", key, format!("content of {key}")),
            },
        }
    }

    #[test]
    fn test_append_read_truncate() {
        let storage = Arc::new(MemoryStorage::new());
        let mut wal = WalWriter::new(storage.clone(), WAL);

        wal.append(&upsert(1, "a")).unwrap();
        wal.append(&WalRecord {
            lsn: 2,
            op: WalOp::Delete {
                namespace: "ns".to_string(),
                key: "a".to_string(),
            },
        })
        .unwrap();

        let outcome = read_wal(storage.as_ref(), WAL).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].lsn, 1);
        assert!(matches!(outcome.records[1].op, WalOp::Delete { .. }));
        assert!(outcome.torn_tail.is_none());
        assert!(outcome.corruption.is_none());
        assert_eq!(outcome.valid_bytes, wal.size());

        wal.truncate().unwrap();
        assert!(read_wal(storage.as_ref(), WAL).unwrap().records.is_empty());

        wal.append(&upsert(3, "b")).unwrap();
        let outcome = read_wal(storage.as_ref(), WAL).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].lsn, 3);
    }

    #[test]
    fn test_missing_log_is_empty() {
        let storage = MemoryStorage::new();
        let outcome = read_wal(&storage, WAL).unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.valid_bytes, 0);
    }

    #[test]
    fn test_incomplete_tail_is_torn() {
        let storage = MemoryStorage::new();
        let mut bytes = encode_frame(&upsert(1, "a")).unwrap();
        let second = encode_frame(&upsert(2, "b")).unwrap();
        bytes.extend_from_slice(&second[..second.len() / 2]);
        storage.put_file(WAL, &bytes);

        let outcome = read_wal(&storage, WAL).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.torn_tail.is_some());
        assert!(outcome.corruption.is_none());
    }

    #[test]
    fn test_bad_checksum_on_final_record_is_torn() {
        let storage = MemoryStorage::new();
        let mut bytes = encode_frame(&upsert(1, "a")).unwrap();
        let mut second = encode_frame(&upsert(2, "b")).unwrap();
        let last = second.len() - 1;
        second[last] ^= 0xff;
        bytes.extend_from_slice(&second);
        storage.put_file(WAL, &bytes);

        let outcome = read_wal(&storage, WAL).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.torn_tail.is_some());
        assert!(outcome.corruption.is_none());
    }

    #[test]
    fn test_bad_checksum_mid_log_is_corruption() {
        let storage = MemoryStorage::new();
        let mut first = encode_frame(&upsert(1, "a")).unwrap();
        first[FRAME_HEADER_LEN + 2] ^= 0xff;
        let mut bytes = first;
        bytes.extend_from_slice(&encode_frame(&upsert(2, "b")).unwrap());
        storage.put_file(WAL, &bytes);

        let outcome = read_wal(&storage, WAL).unwrap();
        assert!(outcome.records.is_empty());
        assert!(outcome.corruption.is_some());
    }
}
