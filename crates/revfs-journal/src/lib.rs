#![forbid(unsafe_code)]
//! Redo journal for REVFS.
//!
//! Every mutating block write first appends a record here, then goes to
//! the image. On mount a non-empty journal is replayed before any user
//! operation: records with a bad payload checksum are skipped, records
//! with a mismatched length abort the scan, accepted payloads are
//! rewritten at their home block. The journal delivers at-most-once block
//! redo with corruption filtering, not cross-block atomicity.

use revfs_block::BlockDevice;
use revfs_error::{Result, VfsError};
use revfs_types::{block_checksum, read_le_u32, BlockId, BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Fixed per-record header: block id, payload length, payload checksum.
const RECORD_HEADER_LEN: usize = 12;

/// Journal counters reported through the public stats surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JournalStats {
    /// Records applied by the most recent replay.
    pub replayed: u64,
    /// Records appended since the last truncation.
    pub pending: u64,
    /// Set when replay applied at least one record.
    pub recovered: bool,
    /// Set while un-checkpointed records exist.
    pub dirty: bool,
}

/// Append-only redo log in `<image>.journal`.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
    stats: JournalStats,
}

impl Journal {
    /// Open (creating if absent) the journal sidecar for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            stats: JournalStats::default(),
        })
    }

    /// Append one redo record and flush it.
    ///
    /// `payload.len()` must equal the block size; anything else would poison
    /// replay for every later record.
    pub fn append(&mut self, block: BlockId, payload: &[u8]) -> Result<()> {
        if payload.len() != BLOCK_SIZE as usize {
            return Err(VfsError::Invalid(format!(
                "journal payload size mismatch: got {}, expected {BLOCK_SIZE}",
                payload.len()
            )));
        }
        let len = payload.len() as u32;
        let checksum = block_checksum(payload);
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        record.extend_from_slice(&block.0.to_le_bytes());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&checksum.to_le_bytes());
        record.extend_from_slice(payload);
        self.file.write_all(&record)?;
        self.file.flush()?;
        self.stats.pending += 1;
        self.stats.dirty = true;
        Ok(())
    }

    /// Replay pending records into the image, then truncate.
    ///
    /// Corrupt records (checksum disagreement) are skipped; a record whose
    /// length field is not the block size aborts the scan, as does a
    /// truncated tail.
    pub fn replay(&mut self, dev: &dyn BlockDevice) -> Result<()> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let mut replayed = 0_u64;
        let mut skipped = 0_u64;
        let mut offset = 0_usize;
        while offset + RECORD_HEADER_LEN <= bytes.len() {
            let block = read_le_u32(&bytes, offset).map_err(VfsError::from)?;
            let len = read_le_u32(&bytes, offset + 4).map_err(VfsError::from)?;
            let checksum = read_le_u32(&bytes, offset + 8).map_err(VfsError::from)?;
            if len != BLOCK_SIZE {
                warn!(block, len, "journal record with bad length, aborting replay");
                break;
            }
            let payload_start = offset + RECORD_HEADER_LEN;
            let payload_end = payload_start + len as usize;
            if payload_end > bytes.len() {
                // Torn tail from an interrupted append.
                break;
            }
            let payload = &bytes[payload_start..payload_end];
            if block_checksum(payload) != checksum {
                warn!(block, "journal record checksum mismatch, skipping");
                skipped += 1;
                offset = payload_end;
                continue;
            }
            dev.write_block(BlockId(block), payload)?;
            replayed += 1;
            offset = payload_end;
        }

        if replayed > 0 || skipped > 0 {
            info!(replayed, skipped, "journal replay complete");
        }

        self.stats.replayed = replayed;
        self.stats.recovered = replayed > 0;
        self.truncate()?;
        Ok(())
    }

    /// Clear the journal; `pending` returns to zero.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.stats.pending = 0;
        self.stats.dirty = false;
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> JournalStats {
        self.stats
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
