#![forbid(unsafe_code)]
//! Block I/O for REVFS.
//!
//! Provides the `BlockDevice` trait with its file-backed implementation
//! (positioned reads and writes over the image, no shared seek cursor),
//! the bounded LRU `BlockCache` with hit/miss/eviction accounting, and the
//! `ChecksumTable` persisted beside the image.

use parking_lot::Mutex;
use revfs_error::{Result, VfsError};
use revfs_types::{block_checksum, BlockId, BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

// ── Block device ────────────────────────────────────────────────────────────

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read one block into `buf`. `buf.len()` MUST equal [`BLOCK_SIZE`].
    fn read_block(&self, block: BlockId, buf: &mut [u8]) -> Result<()>;

    /// Write one block. `data.len()` MUST equal [`BLOCK_SIZE`].
    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()>;

    /// Total number of blocks.
    fn block_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed block device over the host image file.
///
/// Uses `std::os::unix::fs::FileExt` positioned I/O, which is thread-safe
/// and needs no shared seek position.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    block_count: u32,
}

impl FileBlockDevice {
    /// Open an existing image for read/write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len % u64::from(BLOCK_SIZE) != 0 {
            return Err(VfsError::BadImage(format!(
                "image length {len} is not a multiple of the block size"
            )));
        }
        let block_count = u32::try_from(len / u64::from(BLOCK_SIZE))
            .map_err(|_| VfsError::BadImage("image too large".to_owned()))?;
        Ok(Self { file, block_count })
    }

    /// Create a fresh, fully zero-filled image of `total_blocks` blocks.
    ///
    /// The zeros are written out explicitly so the image occupies its full
    /// extent before any metadata lands in it.
    pub fn create_zeroed(path: impl AsRef<Path>, total_blocks: u32) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let zero = vec![0_u8; BLOCK_SIZE as usize];
        for _ in 0..total_blocks {
            file.write_all(&zero)?;
        }
        file.flush()?;
        debug!(total_blocks, "image zero-filled");
        Ok(Self {
            file,
            block_count: total_blocks,
        })
    }

    fn check_range(&self, block: BlockId, len: usize) -> Result<()> {
        if len != BLOCK_SIZE as usize {
            return Err(VfsError::Invalid(format!(
                "block payload size mismatch: got {len}, expected {BLOCK_SIZE}"
            )));
        }
        if block.0 >= self.block_count {
            return Err(VfsError::Invalid(format!(
                "block {block} out of range ({} blocks)",
                self.block_count
            )));
        }
        Ok(())
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: BlockId, buf: &mut [u8]) -> Result<()> {
        self.check_range(block, buf.len())?;
        self.file.read_exact_at(buf, block.byte_offset())?;
        Ok(())
    }

    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()> {
        self.check_range(block, data.len())?;
        self.file.write_all_at(data, block.byte_offset())?;
        Ok(())
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ── LRU block cache ─────────────────────────────────────────────────────────

/// Snapshot of cache counters.
///
/// All counters are monotonically increasing for the lifetime of the cache;
/// `hits + misses` equals the number of `get` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

impl CacheStats {
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.hits + self.misses
    }

    /// Hit ratio in [0.0, 1.0]; 0.0 before any access.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct CacheState {
    capacity: usize,
    /// Recency order: least-recently-used at the front.
    order: VecDeque<BlockId>,
    resident: HashMap<BlockId, Vec<u8>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn touch(&mut self, block: BlockId) {
        if let Some(pos) = self.order.iter().position(|b| *b == block) {
            let _ = self.order.remove(pos);
        }
        self.order.push_back(block);
    }

    fn evict_lru(&mut self) {
        if let Some(victim) = self.order.pop_front() {
            let _ = self.resident.remove(&victim);
            self.evictions += 1;
            trace!(block = victim.0, "cache_evict");
        }
    }
}

/// Bounded LRU over recently accessed blocks.
///
/// Internally mutexed; safe to consult from the shared-lock stats path while
/// a mutator holds the filesystem lock.
#[derive(Debug)]
pub struct BlockCache {
    state: Mutex<CacheState>,
}

impl BlockCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                capacity,
                order: VecDeque::new(),
                resident: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Look up a block. A hit moves it to most-recently-used and returns a
    /// copy of its bytes.
    #[must_use]
    pub fn get(&self, block: BlockId) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        if let Some(data) = state.resident.get(&block).cloned() {
            state.hits += 1;
            state.touch(block);
            Some(data)
        } else {
            state.misses += 1;
            None
        }
    }

    /// Insert or replace a block, evicting the least-recently-used entry at
    /// capacity.
    pub fn put(&self, block: BlockId, data: &[u8]) {
        let mut state = self.state.lock();
        if state.capacity == 0 {
            return;
        }
        if state.resident.contains_key(&block) {
            state.resident.insert(block, data.to_vec());
            state.touch(block);
            return;
        }
        if state.resident.len() >= state.capacity {
            state.evict_lru();
        }
        state.resident.insert(block, data.to_vec());
        state.order.push_back(block);
    }

    /// Remove a block without touching the counters.
    pub fn invalidate(&self, block: BlockId) {
        let mut state = self.state.lock();
        if state.resident.remove(&block).is_some() {
            if let Some(pos) = state.order.iter().position(|b| *b == block) {
                let _ = state.order.remove(pos);
            }
        }
    }

    /// Drop every resident block. Counters survive.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.resident.clear();
        state.order.clear();
    }

    /// Change the bound, evicting LRU entries as needed.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.capacity = capacity;
        while state.resident.len() > capacity {
            state.evict_lru();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().resident.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            len: state.resident.len(),
            capacity: state.capacity,
        }
    }
}

// ── Checksum table ──────────────────────────────────────────────────────────

/// One 32-bit checksum per image block, persisted in `<image>.checksum`.
///
/// A zero entry means "never written"; mismatches on read are warnings, not
/// errors.
#[derive(Debug)]
pub struct ChecksumTable {
    path: PathBuf,
    values: Mutex<Vec<u32>>,
}

impl ChecksumTable {
    /// Create an all-zero table for `total_blocks` blocks.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, total_blocks: u32) -> Self {
        Self {
            path: path.into(),
            values: Mutex::new(vec![0_u32; total_blocks as usize]),
        }
    }

    /// Load the sidecar if present; a missing file leaves the table zeroed.
    pub fn load(&self) -> Result<()> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let mut values = self.values.lock();
        for (i, slot) in values.iter_mut().enumerate() {
            let offset = i * 4;
            if offset + 4 > bytes.len() {
                break;
            }
            *slot = u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]);
        }
        Ok(())
    }

    /// Rewrite the sidecar from the in-memory table.
    pub fn save(&self) -> Result<()> {
        let values = self.values.lock();
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values.iter() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    /// Record the checksum of freshly written block content.
    pub fn record(&self, block: BlockId, data: &[u8]) {
        let mut values = self.values.lock();
        if let Some(slot) = values.get_mut(block.0 as usize) {
            *slot = block_checksum(data);
        }
    }

    /// Verify read-back content against the stored entry. Returns whether
    /// the entry matched (or was absent); a mismatch only logs.
    pub fn verify(&self, block: BlockId, data: &[u8]) -> bool {
        let values = self.values.lock();
        let Some(&expect) = values.get(block.0 as usize) else {
            return true;
        };
        if expect == 0 {
            return true;
        }
        let got = block_checksum(data);
        if expect != got {
            warn!(block = block.0, expect, got, "checksum mismatch on read");
            return false;
        }
        true
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
