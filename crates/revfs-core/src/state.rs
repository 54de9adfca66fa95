//! Mounted filesystem state.
//!
//! `MountedFs` owns the image device plus every sidecar structure and
//! implements the two I/O pipelines everything else is built on:
//!
//! - reads go cache → image, with checksum verification on miss;
//! - mutating writes go journal → snapshot pre-image capture → image →
//!   checksum table → cache.
//!
//! All methods take `&self`: each component guards its own private state,
//! while the public `Vfs` wrapper serializes operations through the
//! filesystem-wide readers-writer lock.

use crate::handle::HandleTable;
use parking_lot::Mutex;
use revfs_alloc::BlockBitmap;
use revfs_block::{BlockCache, BlockDevice, ChecksumTable, FileBlockDevice};
use revfs_error::{Result, VfsError};
use revfs_journal::Journal;
use revfs_snap::SnapshotSet;
use revfs_types::{
    read_le_u32, BlockId, Inode, InodeId, Superblock, BLOCK_SIZE, DIRECT_BLOCKS, INDIRECT_SLOTS,
    INODES_PER_BLOCK, INODE_SIZE, LAYOUT_VERSION, RESERVED_INODE_MARKER, ROOT_INODE, S_IFDIR,
    VFS_MAGIC,
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Seconds since the Unix epoch, saturating at zero on clock skew.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn sibling_path(image: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(image.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

pub(crate) fn journal_path(image: &Path) -> PathBuf {
    sibling_path(image, ".journal")
}

pub(crate) fn checksum_path(image: &Path) -> PathBuf {
    sibling_path(image, ".checksum")
}

// ── Region layout ───────────────────────────────────────────────────────────

/// Computed image geometry for `format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layout {
    pub total_blocks: u32,
    pub total_inodes: u32,
    pub inode_table_start: u32,
    pub bitmap_start: u32,
    pub data_block_start: u32,
    pub data_blocks: u32,
}

impl Layout {
    /// Derive the region layout for a `size_mb` MiB image: one superblock
    /// block, an inode table sized to `total_blocks / 8` inodes (floored at
    /// 64), a bitmap region covering every block, data filling the rest.
    pub fn compute(size_mb: u32) -> Result<Self> {
        if size_mb == 0 {
            return Err(VfsError::Invalid("image size must be at least 1 MiB".to_owned()));
        }
        let total_bytes = u64::from(size_mb) * 1024 * 1024;
        let total_blocks = u32::try_from(total_bytes / u64::from(BLOCK_SIZE))
            .map_err(|_| VfsError::Invalid("image size too large".to_owned()))?;
        let total_inodes = (total_blocks / 8).max(64);
        let inode_bytes = u64::from(total_inodes) * u64::from(INODE_SIZE);
        let inode_blocks =
            u32::try_from(inode_bytes.div_ceil(u64::from(BLOCK_SIZE))).unwrap_or(u32::MAX);
        let bitmap_bytes = total_blocks.div_ceil(8);
        let bitmap_blocks = bitmap_bytes.div_ceil(BLOCK_SIZE);

        let inode_table_start = 1;
        let bitmap_start = inode_table_start + inode_blocks;
        let data_block_start = bitmap_start + bitmap_blocks;
        if data_block_start >= total_blocks {
            return Err(VfsError::Invalid(format!(
                "image of {size_mb} MiB leaves no data area"
            )));
        }
        Ok(Self {
            total_blocks,
            total_inodes,
            inode_table_start,
            bitmap_start,
            data_block_start,
            data_blocks: total_blocks - data_block_start,
        })
    }
}

fn write_bitmap_region(device: &FileBlockDevice, bitmap_start: u32, bytes: &[u8]) -> Result<()> {
    for (i, chunk) in bytes.chunks(BLOCK_SIZE as usize).enumerate() {
        let mut block = vec![0_u8; BLOCK_SIZE as usize];
        block[..chunk.len()].copy_from_slice(chunk);
        device.write_block(BlockId(bitmap_start + i as u32), &block)?;
    }
    Ok(())
}

// ── Mounted state ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct MountedFs {
    pub image_path: PathBuf,
    pub device: FileBlockDevice,
    pub superblock: Mutex<Superblock>,
    pub bitmap: BlockBitmap,
    pub cache: BlockCache,
    pub checksums: ChecksumTable,
    pub journal: Mutex<Journal>,
    pub snapshots: Mutex<SnapshotSet>,
    pub handles: Mutex<HandleTable>,
}

impl MountedFs {
    /// Lay down a fresh image: zero-fill, superblock, reserved inode 0 and
    /// the root inode with its one pre-allocated directory block, bitmap
    /// with that block marked, stale sidecars removed.
    pub fn format_image(image: &Path, size_mb: u32) -> Result<()> {
        let layout = Layout::compute(size_mb)?;
        let device = FileBlockDevice::create_zeroed(image, layout.total_blocks)?;
        let now = unix_now();

        let superblock = Superblock {
            magic: VFS_MAGIC,
            version: LAYOUT_VERSION,
            block_size: BLOCK_SIZE,
            total_blocks: layout.total_blocks,
            total_inodes: layout.total_inodes,
            free_blocks: layout.data_blocks - 1,
            free_inodes: layout.total_inodes - 2,
            inode_table_start: layout.inode_table_start,
            data_block_start: layout.data_block_start,
            bitmap_start: layout.bitmap_start,
            created_time: now,
            modified_time: now,
        };
        let mut block0 = vec![0_u8; BLOCK_SIZE as usize];
        superblock.encode_into(&mut block0);
        device.write_block(BlockId(0), &block0)?;

        // Inode 0 carries a marker so the table block is visibly
        // initialized; inode 1 is the root with its first data block.
        let mut table = vec![0_u8; BLOCK_SIZE as usize];
        let marker = Inode {
            inode_num: RESERVED_INODE_MARKER,
            ..Inode::default()
        };
        marker.encode_into(&mut table[..INODE_SIZE as usize]);
        let mut root = Inode {
            inode_num: ROOT_INODE,
            mode: S_IFDIR | 0o755,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            links_count: 2,
            blocks_count: 1,
            ..Inode::default()
        };
        root.direct[0] = layout.data_block_start;
        root.encode_into(&mut table[INODE_SIZE as usize..2 * INODE_SIZE as usize]);
        device.write_block(BlockId(layout.inode_table_start), &table)?;

        let bitmap = BlockBitmap::new(layout.data_blocks);
        let _ = bitmap.allocate();
        write_bitmap_region(&device, layout.bitmap_start, &bitmap.to_bytes())?;
        device.sync()?;

        let _ = std::fs::remove_file(checksum_path(image));
        let _ = std::fs::remove_file(journal_path(image));

        info!(
            image = %image.display(),
            size_mb,
            total_blocks = layout.total_blocks,
            total_inodes = layout.total_inodes,
            "image formatted"
        );
        Ok(())
    }

    /// Mount an existing image: validate the superblock, rebuild the bitmap
    /// from disk, replay the journal, and discover snapshots.
    pub fn open(image: &Path, cache_capacity: usize) -> Result<Self> {
        let device = FileBlockDevice::open(image)?;
        let mut block0 = vec![0_u8; BLOCK_SIZE as usize];
        device.read_block(BlockId(0), &mut block0)?;
        let superblock = Superblock::decode(&block0)?;

        if superblock.block_size != BLOCK_SIZE {
            return Err(VfsError::BadImage(format!(
                "unsupported block size {}",
                superblock.block_size
            )));
        }
        if superblock.inode_table_start < 1
            || superblock.bitmap_start <= superblock.inode_table_start
            || superblock.data_block_start <= superblock.bitmap_start
            || superblock.data_block_start >= superblock.total_blocks
        {
            return Err(VfsError::BadImage("inconsistent region layout".to_owned()));
        }
        if superblock.total_blocks > device.block_count() {
            return Err(VfsError::BadImage("image shorter than superblock claims".to_owned()));
        }

        let data_blocks = superblock.data_blocks();
        let bitmap = BlockBitmap::new(data_blocks);
        let bitmap_bytes_len = (data_blocks as usize).div_ceil(8);
        let bitmap_blocks = bitmap_bytes_len.div_ceil(BLOCK_SIZE as usize);
        let mut bitmap_bytes = Vec::with_capacity(bitmap_blocks * BLOCK_SIZE as usize);
        let mut block = vec![0_u8; BLOCK_SIZE as usize];
        for i in 0..bitmap_blocks {
            device.read_block(BlockId(superblock.bitmap_start + i as u32), &mut block)?;
            bitmap_bytes.extend_from_slice(&block);
        }
        bitmap_bytes.truncate(bitmap_bytes_len);
        bitmap.load_bytes(&bitmap_bytes);

        let checksums = ChecksumTable::new(checksum_path(image), superblock.total_blocks);
        checksums.load()?;

        let mut journal = Journal::open(journal_path(image))?;
        journal.replay(&device)?;

        let snapshots = SnapshotSet::discover(image)?;

        info!(
            image = %image.display(),
            total_blocks = superblock.total_blocks,
            free_blocks = superblock.free_blocks,
            snapshots = snapshots.len(),
            journal_replayed = journal.stats().replayed,
            "mounted"
        );

        Ok(Self {
            image_path: image.to_path_buf(),
            device,
            superblock: Mutex::new(superblock),
            bitmap,
            cache: BlockCache::new(cache_capacity),
            checksums,
            journal: Mutex::new(journal),
            snapshots: Mutex::new(snapshots),
            handles: Mutex::new(HandleTable::new()),
        })
    }

    /// Flush persistent state back to disk for a clean unmount.
    pub fn unmount_flush(&self) -> Result<()> {
        let bitmap_start = {
            let mut superblock = self.superblock.lock();
            superblock.modified_time = unix_now();
            let mut block0 = vec![0_u8; BLOCK_SIZE as usize];
            superblock.encode_into(&mut block0);
            self.device.write_block(BlockId(0), &block0)?;
            superblock.bitmap_start
        };
        write_bitmap_region(&self.device, bitmap_start, &self.bitmap.to_bytes())?;
        self.checksums.save()?;
        self.journal.lock().truncate()?;
        let dropped_handles = {
            let mut handles = self.handles.lock();
            let open = handles.len();
            handles.clear();
            open
        };
        self.cache.clear();
        self.device.sync()?;
        info!(image = %self.image_path.display(), dropped_handles, "unmounted");
        Ok(())
    }

    // ── Block pipelines ─────────────────────────────────────────────────

    /// Read one block through the cache; misses verify the stored checksum
    /// (mismatch warns, never fails) and populate the cache.
    pub fn read_block(&self, block: BlockId) -> Result<Vec<u8>> {
        if let Some(data) = self.cache.get(block) {
            return Ok(data);
        }
        let mut buf = vec![0_u8; BLOCK_SIZE as usize];
        self.device.read_block(block, &mut buf)?;
        let _ = self.checksums.verify(block, &buf);
        self.cache.put(block, &buf);
        Ok(buf)
    }

    /// Write one block through the full mutation pipeline: journal record
    /// first, then snapshot pre-image capture, then the image write, then
    /// checksum and cache updates. A failed journal append or image write
    /// aborts without marking the block clean in the cache.
    pub fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE as usize {
            return Err(VfsError::Invalid(format!(
                "block payload size mismatch: got {}, expected {BLOCK_SIZE}",
                data.len()
            )));
        }
        let needs_pre_image = !self.snapshots.lock().is_empty();
        let pre_image = if needs_pre_image {
            Some(self.read_block(block)?)
        } else {
            None
        };

        self.journal.lock().append(block, data)?;
        if let Some(pre_image) = pre_image {
            self.snapshots.lock().record_pre_image(block, &pre_image);
        }
        self.device.write_block(block, data)?;
        self.checksums.record(block, data);
        self.cache.put(block, data);
        Ok(())
    }

    // ── Inode table ─────────────────────────────────────────────────────

    fn inode_location(&self, ino: InodeId) -> Result<(BlockId, usize)> {
        let superblock = *self.superblock.lock();
        if ino.0 >= superblock.total_inodes {
            return Err(VfsError::Invalid(format!(
                "inode {ino} out of range ({} inodes)",
                superblock.total_inodes
            )));
        }
        let block = superblock.inode_table_start + ino.0 / INODES_PER_BLOCK;
        let offset = ((ino.0 % INODES_PER_BLOCK) * INODE_SIZE) as usize;
        Ok((BlockId(block), offset))
    }

    pub fn read_inode(&self, ino: InodeId) -> Result<Inode> {
        let (block, offset) = self.inode_location(ino)?;
        let data = self.read_block(block)?;
        Ok(Inode::decode(&data[offset..offset + INODE_SIZE as usize])?)
    }

    /// Read-modify-write the containing inode-table block.
    pub fn write_inode(&self, ino: InodeId, inode: &Inode) -> Result<()> {
        let (block, offset) = self.inode_location(ino)?;
        let mut data = self.read_block(block)?;
        inode.encode_into(&mut data[offset..offset + INODE_SIZE as usize]);
        self.write_block(block, &data)
    }

    /// Claim the first free inode. Inodes 0 and 1 are never handed out.
    pub fn allocate_inode(&self) -> Result<InodeId> {
        let total_inodes = self.superblock.lock().total_inodes;
        for num in 2..total_inodes {
            let inode = self.read_inode(InodeId(num))?;
            if inode.is_free() {
                let mut superblock = self.superblock.lock();
                superblock.free_inodes = superblock.free_inodes.saturating_sub(1);
                return Ok(InodeId(num));
            }
        }
        Err(VfsError::NoInodes)
    }

    /// Zero the on-disk inode and return it to the free pool.
    pub fn free_inode(&self, ino: InodeId) -> Result<()> {
        self.write_inode(ino, &Inode::default())?;
        let mut superblock = self.superblock.lock();
        superblock.free_inodes += 1;
        Ok(())
    }

    // ── Data block allocation ───────────────────────────────────────────

    /// Claim the lowest free data block.
    pub fn allocate_block(&self) -> Result<BlockId> {
        let Some(rel) = self.bitmap.allocate() else {
            return Err(VfsError::NoBlocks);
        };
        let mut superblock = self.superblock.lock();
        superblock.free_blocks = superblock.free_blocks.saturating_sub(1);
        Ok(BlockId(superblock.data_block_start + rel))
    }

    /// Return a data block to the free pool and drop its cache entry.
    /// Reserved-region blocks are rejected.
    pub fn free_block(&self, block: BlockId) -> bool {
        let data_block_start = self.superblock.lock().data_block_start;
        if block.0 < data_block_start {
            return false;
        }
        if self.bitmap.free(block.0 - data_block_start) {
            self.superblock.lock().free_blocks += 1;
            self.cache.invalidate(block);
            true
        } else {
            false
        }
    }

    fn allocate_block_or_none(&self) -> Result<Option<BlockId>> {
        match self.allocate_block() {
            Ok(block) => Ok(Some(block)),
            Err(VfsError::NoBlocks) => Ok(None),
            Err(err) => Err(err),
        }
    }

    // ── File block mapping ──────────────────────────────────────────────

    /// Resolve logical block `index` of a file to its data block, without
    /// allocating. `None` is a hole (reads as zeros) or an index beyond
    /// the supported direct + single-indirect range.
    pub fn map_block(&self, inode: &Inode, index: u32) -> Result<Option<BlockId>> {
        if (index as usize) < DIRECT_BLOCKS {
            let ptr = inode.direct[index as usize];
            return Ok((ptr != 0).then_some(BlockId(ptr)));
        }
        let slot = index - DIRECT_BLOCKS as u32;
        if slot >= INDIRECT_SLOTS || inode.indirect == 0 {
            return Ok(None);
        }
        let table = self.read_block(BlockId(inode.indirect))?;
        let ptr = read_le_u32(&table, slot as usize * 4)?;
        Ok((ptr != 0).then_some(BlockId(ptr)))
    }

    /// Resolve logical block `index`, allocating the data block (and the
    /// indirect block when first needed) on demand. Freshly allocated
    /// blocks are zeroed through the write pipeline. Returns `None` when
    /// the index is beyond the supported range or the allocator is
    /// exhausted — the caller short-writes.
    pub fn map_block_alloc(&self, inode: &mut Inode, index: u32) -> Result<Option<BlockId>> {
        let zero = vec![0_u8; BLOCK_SIZE as usize];
        if (index as usize) < DIRECT_BLOCKS {
            let ptr = inode.direct[index as usize];
            if ptr != 0 {
                return Ok(Some(BlockId(ptr)));
            }
            let Some(block) = self.allocate_block_or_none()? else {
                return Ok(None);
            };
            inode.direct[index as usize] = block.0;
            inode.blocks_count += 1;
            self.write_block(block, &zero)?;
            return Ok(Some(block));
        }

        let slot = index - DIRECT_BLOCKS as u32;
        if slot >= INDIRECT_SLOTS {
            return Ok(None);
        }
        if inode.indirect == 0 {
            let Some(block) = self.allocate_block_or_none()? else {
                return Ok(None);
            };
            inode.indirect = block.0;
            // The indirect block itself counts toward the inode's blocks.
            inode.blocks_count += 1;
            self.write_block(block, &zero)?;
        }

        let mut table = self.read_block(BlockId(inode.indirect))?;
        let offset = slot as usize * 4;
        let ptr = read_le_u32(&table, offset)?;
        if ptr != 0 {
            return Ok(Some(BlockId(ptr)));
        }
        let Some(block) = self.allocate_block_or_none()? else {
            return Ok(None);
        };
        table[offset..offset + 4].copy_from_slice(&block.0.to_le_bytes());
        self.write_block(BlockId(inode.indirect), &table)?;
        inode.blocks_count += 1;
        self.write_block(block, &zero)?;
        Ok(Some(block))
    }

    /// Free every data block of a file — direct pointers, indirect
    /// pointees, and the indirect block itself — and reset the size
    /// accounting. Used by truncation and deletion.
    pub fn free_file_blocks(&self, inode: &mut Inode) -> Result<()> {
        for slot in &mut inode.direct {
            if *slot != 0 {
                let _ = self.free_block(BlockId(*slot));
                *slot = 0;
            }
        }
        if inode.indirect != 0 {
            let table = self.read_block(BlockId(inode.indirect))?;
            for slot in 0..INDIRECT_SLOTS as usize {
                let ptr = read_le_u32(&table, slot * 4)?;
                if ptr != 0 {
                    let _ = self.free_block(BlockId(ptr));
                }
            }
            let _ = self.free_block(BlockId(inode.indirect));
            inode.indirect = 0;
        }
        inode.size = 0;
        inode.blocks_count = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_small_image() {
        let layout = Layout::compute(10).unwrap();
        assert_eq!(layout.total_blocks, 2560);
        // 2560 / 8 = 320 inodes, 320 * 128 = 40960 bytes = 10 blocks.
        assert_eq!(layout.total_inodes, 320);
        assert_eq!(layout.inode_table_start, 1);
        assert_eq!(layout.bitmap_start, 11);
        // 2560 bits = 320 bytes fits one block.
        assert_eq!(layout.data_block_start, 12);
        assert_eq!(layout.data_blocks, 2548);
    }

    #[test]
    fn layout_floors_inode_count() {
        let layout = Layout::compute(1).unwrap();
        assert_eq!(layout.total_blocks, 256);
        assert_eq!(layout.total_inodes, 64);
    }

    #[test]
    fn layout_rejects_zero() {
        assert!(Layout::compute(0).is_err());
    }

    #[test]
    fn sidecar_paths() {
        let image = Path::new("/tmp/volume.img");
        assert_eq!(
            journal_path(image),
            PathBuf::from("/tmp/volume.img.journal")
        );
        assert_eq!(
            checksum_path(image),
            PathBuf::from("/tmp/volume.img.checksum")
        );
    }
}
