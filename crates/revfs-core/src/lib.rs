#![forbid(unsafe_code)]
//! The REVFS virtual filesystem.
//!
//! A Unix-style block filesystem stored in a single host image file:
//! superblock, fixed inode table, free-block bitmap, direct plus
//! single-indirect file mapping, an LRU block cache, per-block checksums,
//! a redo journal for crash recovery, and copy-on-write snapshots.
//!
//! [`Vfs`] is the mountable facade. Every operation is serialized by one
//! filesystem-wide readers-writer lock: pure queries (`exists`,
//! `is_directory`, `readdir`, `read`, the stats calls) share it, all
//! mutators take it exclusively. Operations are therefore linearizable;
//! a single `write` call is atomic with respect to other threads.

mod dir;
mod handle;
mod path;
mod state;

pub use dir::DirEntryInfo;
pub use handle::Fd;
pub use revfs_block::CacheStats;
pub use revfs_error::{Result, VfsError};
pub use revfs_journal::JournalStats;
pub use revfs_types::{block_checksum, open_flags, FileType, BLOCK_SIZE, MAX_NAME_LEN};

use parking_lot::RwLock;
use revfs_types::{Inode, InodeId, S_IFDIR, S_IFREG};
use serde::{Deserialize, Serialize};
use state::{unix_now, MountedFs};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

/// Filesystem-level statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub total_inodes: u32,
    pub free_inodes: u32,
    /// Full image size in bytes.
    pub total_size: u64,
    /// Bytes not covered by free data blocks (metadata included).
    pub used_size: u64,
    /// Allocated blocks in the data area.
    pub used_data_blocks: u32,
}

impl FsStats {
    /// Used fraction of the image, in percent.
    #[must_use]
    pub fn usage_percent(&self) -> f64 {
        if self.total_size == 0 {
            0.0
        } else {
            self.used_size as f64 / self.total_size as f64 * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct VfsState {
    mounted: Option<MountedFs>,
    /// Remembered across unmount so offline snapshot restore can find the
    /// image and its sidecars.
    image_path: Option<PathBuf>,
}

/// A mountable REVFS instance.
///
/// State machine: Unmounted → (`format`/`mount`) → Mounted → (`unmount`)
/// → Unmounted. Every other operation requires Mounted, except
/// `restore_snapshot`/`restore_backup`, which require Unmounted.
#[derive(Debug, Default)]
pub struct Vfs {
    state: RwLock<VfsState>,
}

fn mounted(state: &VfsState) -> Result<&MountedFs> {
    state.mounted.as_ref().ok_or(VfsError::NotMounted)
}

fn bad_fd(fd: Fd) -> VfsError {
    VfsError::Invalid(format!("invalid file descriptor {fd}"))
}

impl Vfs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Mount lifecycle ─────────────────────────────────────────────────

    /// Create a fresh `size_mb` MiB image at `image` and mount it.
    pub fn format(&self, image: &Path, size_mb: u32, cache_capacity: usize) -> Result<()> {
        let mut state = self.state.write();
        if state.mounted.is_some() {
            return Err(VfsError::AlreadyMounted);
        }
        MountedFs::format_image(image, size_mb)?;
        state.mounted = Some(MountedFs::open(image, cache_capacity)?);
        state.image_path = Some(image.to_path_buf());
        Ok(())
    }

    /// Mount an existing image, replaying any pending journal first.
    pub fn mount(&self, image: &Path, cache_capacity: usize) -> Result<()> {
        let mut state = self.state.write();
        if state.mounted.is_some() {
            return Err(VfsError::AlreadyMounted);
        }
        state.mounted = Some(MountedFs::open(image, cache_capacity)?);
        state.image_path = Some(image.to_path_buf());
        Ok(())
    }

    /// Flush superblock, bitmap, and checksums; truncate the journal; drop
    /// open handles and the cache.
    pub fn unmount(&self) -> Result<()> {
        let mut state = self.state.write();
        let fs = state.mounted.take().ok_or(VfsError::NotMounted)?;
        fs.unmount_flush()
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.state.read().mounted.is_some()
    }

    // ── Namespace operations ────────────────────────────────────────────

    /// Create an empty regular file. The permission bits of `mode` are
    /// stored, not enforced.
    pub fn create_file(&self, path: &str, mode: u32) -> Result<()> {
        let state = self.state.write();
        let fs = mounted(&state)?;
        fs.create_node(path, S_IFREG | (mode & 0o777), FileType::Regular, 1)
    }

    /// Create an empty directory.
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let state = self.state.write();
        let fs = mounted(&state)?;
        fs.create_node(path, S_IFDIR | (mode & 0o777), FileType::Directory, 2)
    }

    /// Delete a regular file, freeing its data blocks and inode.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let state = self.state.write();
        let fs = mounted(&state)?;
        let (parent, name) = fs.resolve_parent(path)?;
        let parent_inode = fs.read_inode(parent)?;
        let Some(ino) = fs.dir_find(&parent_inode, name)? else {
            return Err(VfsError::NotFound(path.to_owned()));
        };
        let ino = InodeId(ino);
        let mut inode = fs.read_inode(ino)?;
        if !inode.is_regular() {
            return Err(VfsError::NotAFile);
        }
        fs.free_file_blocks(&mut inode)?;
        fs.free_inode(ino)?;
        fs.dir_remove_entry(parent, name)
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let state = self.state.write();
        let fs = mounted(&state)?;
        let (parent, name) = fs.resolve_parent(path)?;
        let parent_inode = fs.read_inode(parent)?;
        let Some(ino) = fs.dir_find(&parent_inode, name)? else {
            return Err(VfsError::NotFound(path.to_owned()));
        };
        let ino = InodeId(ino);
        let mut inode = fs.read_inode(ino)?;
        if !inode.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        if !fs.dir_entries(&inode)?.is_empty() {
            return Err(VfsError::NotEmpty);
        }
        for slot in &mut inode.direct {
            if *slot != 0 {
                let _ = fs.free_block(revfs_types::BlockId(*slot));
                *slot = 0;
            }
        }
        fs.free_inode(ino)?;
        fs.dir_remove_entry(parent, name)
    }

    // ── File I/O ────────────────────────────────────────────────────────

    /// Open a regular file. `O_TRUNC` with write access frees every data
    /// block and resets the size before the handle is issued.
    pub fn open(&self, path: &str, flags: u32) -> Result<Fd> {
        let state = self.state.write();
        let fs = mounted(&state)?;
        let ino = fs.resolve(path)?;
        let mut inode = fs.read_inode(ino)?;
        if !inode.is_regular() {
            return Err(VfsError::NotAFile);
        }
        let now = unix_now();
        if open_flags::truncate(flags) && open_flags::writable(flags) {
            fs.free_file_blocks(&mut inode)?;
            inode.mtime = now;
        }
        inode.atime = now;
        fs.write_inode(ino, &inode)?;
        let fd = fs.handles.lock().allocate(ino, flags);
        Ok(fd)
    }

    /// Invalidate a handle.
    pub fn close(&self, fd: Fd) -> Result<()> {
        let state = self.state.write();
        let fs = mounted(&state)?;
        if fs.handles.lock().remove(fd) {
            Ok(())
        } else {
            Err(bad_fd(fd))
        }
    }

    /// Read up to `count` bytes at the handle's offset. Bounded by the
    /// file size; unmapped (sparse) blocks read as zeros. Advances the
    /// offset and touches atime.
    pub fn read(&self, fd: Fd, count: usize) -> Result<Vec<u8>> {
        let state = self.state.read();
        let fs = mounted(&state)?;
        let handle = fs.handles.lock().get(fd).ok_or_else(|| bad_fd(fd))?;
        let mut inode = fs.read_inode(handle.inode)?;
        if handle.offset >= inode.size {
            return Ok(Vec::new());
        }
        let to_read = count.min(usize::try_from(inode.size - handle.offset).unwrap_or(usize::MAX));
        let mut out = vec![0_u8; to_read];
        let mut done = 0_usize;
        while done < to_read {
            let pos = handle.offset + done as u64;
            let index = u32::try_from(pos / u64::from(BLOCK_SIZE))
                .map_err(|_| VfsError::Invalid("file offset out of range".to_owned()))?;
            let in_block = (pos % u64::from(BLOCK_SIZE)) as usize;
            let n = (to_read - done).min(BLOCK_SIZE as usize - in_block);
            if let Some(block) = fs.map_block(&inode, index)? {
                let data = fs.read_block(block)?;
                out[done..done + n].copy_from_slice(&data[in_block..in_block + n]);
            }
            done += n;
        }
        fs.handles.lock().set_offset(fd, handle.offset + done as u64);
        inode.atime = unix_now();
        fs.write_inode(handle.inode, &inode)?;
        Ok(out)
    }

    /// Write `data` at the handle's offset, allocating blocks on demand.
    /// Returns the number of bytes written, which is short of
    /// `data.len()` when the allocator runs dry; the size grows to cover
    /// what was written.
    pub fn write(&self, fd: Fd, data: &[u8]) -> Result<usize> {
        let state = self.state.write();
        let fs = mounted(&state)?;
        let handle = fs.handles.lock().get(fd).ok_or_else(|| bad_fd(fd))?;
        let mut inode = fs.read_inode(handle.inode)?;
        let mut written = 0_usize;
        while written < data.len() {
            let pos = handle.offset + written as u64;
            let index = match u32::try_from(pos / u64::from(BLOCK_SIZE)) {
                Ok(index) => index,
                Err(_) => break,
            };
            let in_block = (pos % u64::from(BLOCK_SIZE)) as usize;
            let n = (data.len() - written).min(BLOCK_SIZE as usize - in_block);
            let Some(block) = fs.map_block_alloc(&mut inode, index)? else {
                break;
            };
            let mut buf = fs.read_block(block)?;
            buf[in_block..in_block + n].copy_from_slice(&data[written..written + n]);
            fs.write_block(block, &buf)?;
            written += n;
        }
        let end = handle.offset + written as u64;
        fs.handles.lock().set_offset(fd, end);
        if end > inode.size {
            inode.size = end;
        }
        let now = unix_now();
        inode.mtime = now;
        inode.atime = now;
        fs.write_inode(handle.inode, &inode)?;
        Ok(written)
    }

    /// Reposition a handle. Offsets that would become negative fail.
    pub fn seek(&self, fd: Fd, pos: SeekFrom) -> Result<u64> {
        let state = self.state.write();
        let fs = mounted(&state)?;
        let handle = fs.handles.lock().get(fd).ok_or_else(|| bad_fd(fd))?;
        let inode = fs.read_inode(handle.inode)?;
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(handle.offset) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(inode.size) + i128::from(delta),
        };
        let offset = u64::try_from(target)
            .map_err(|_| VfsError::Invalid(format!("seek to negative offset {target}")))?;
        fs.handles.lock().set_offset(fd, offset);
        Ok(offset)
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Live entries of a directory, in slot order.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntryInfo>> {
        let state = self.state.read();
        let fs = mounted(&state)?;
        let ino = fs.resolve(path)?;
        let inode = fs.read_inode(ino)?;
        fs.dir_entries(&inode)
    }

    /// Whether the path resolves.
    pub fn exists(&self, path: &str) -> Result<bool> {
        let state = self.state.read();
        let fs = mounted(&state)?;
        match fs.resolve(path) {
            Ok(_) => Ok(true),
            Err(
                VfsError::NotFound(_)
                | VfsError::NotADirectory
                | VfsError::Invalid(_)
                | VfsError::NameTooLong,
            ) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Whether the path resolves to a directory.
    pub fn is_directory(&self, path: &str) -> Result<bool> {
        let state = self.state.read();
        let fs = mounted(&state)?;
        match fs.resolve(path) {
            Ok(ino) => Ok(fs.read_inode(ino)?.is_directory()),
            Err(
                VfsError::NotFound(_)
                | VfsError::NotADirectory
                | VfsError::Invalid(_)
                | VfsError::NameTooLong,
            ) => Ok(false),
            Err(err) => Err(err),
        }
    }

    // ── Snapshots and backups ───────────────────────────────────────────

    /// Register a copy-on-write snapshot; later block writes capture their
    /// pre-images into its diff file.
    pub fn create_snapshot(&self, name: &str) -> Result<()> {
        let state = self.state.write();
        let fs = mounted(&state)?;
        let result = fs.snapshots.lock().create(name);
        result
    }

    /// Known snapshot names. An empty in-memory set is refreshed by
    /// rescanning the image's siblings.
    pub fn list_snapshots(&self) -> Result<Vec<String>> {
        let state = self.state.write();
        let fs = mounted(&state)?;
        let mut snapshots = fs.snapshots.lock();
        if snapshots.is_empty() {
            *snapshots = revfs_snap::SnapshotSet::discover(&fs.image_path)?;
        }
        Ok(snapshots.names())
    }

    /// Restore a snapshot into the unmounted image, then delete it. The
    /// checksum sidecar is dropped so restored blocks read back cleanly.
    pub fn restore_snapshot(&self, name: &str) -> Result<()> {
        let state = self.state.write();
        if state.mounted.is_some() {
            return Err(VfsError::AlreadyMounted);
        }
        let Some(image) = state.image_path.as_deref() else {
            return Err(VfsError::Invalid(
                "no image has been formatted or mounted".to_owned(),
            ));
        };
        revfs_snap::restore_into(image, name)
    }

    /// Backup surface: same copy-on-write semantics as snapshots.
    pub fn create_backup(&self, name: &str) -> Result<()> {
        self.create_snapshot(name)
    }

    pub fn list_backups(&self) -> Result<Vec<String>> {
        self.list_snapshots()
    }

    pub fn restore_backup(&self, name: &str) -> Result<()> {
        self.restore_snapshot(name)
    }

    // ── Stats ───────────────────────────────────────────────────────────

    pub fn fs_stats(&self) -> Result<FsStats> {
        let state = self.state.read();
        let fs = mounted(&state)?;
        let superblock = *fs.superblock.lock();
        Ok(FsStats {
            total_blocks: superblock.total_blocks,
            free_blocks: superblock.free_blocks,
            total_inodes: superblock.total_inodes,
            free_inodes: superblock.free_inodes,
            total_size: u64::from(superblock.total_blocks) * u64::from(BLOCK_SIZE),
            used_size: u64::from(superblock.total_blocks - superblock.free_blocks)
                * u64::from(BLOCK_SIZE),
            used_data_blocks: superblock.data_blocks().saturating_sub(superblock.free_blocks),
        })
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        let state = self.state.read();
        let fs = mounted(&state)?;
        Ok(fs.cache.stats())
    }

    pub fn journal_stats(&self) -> Result<JournalStats> {
        let state = self.state.read();
        let fs = mounted(&state)?;
        let stats = fs.journal.lock().stats();
        Ok(stats)
    }
}

impl MountedFs {
    /// Shared create path for files and directories: resolve the parent,
    /// reject duplicates, allocate and initialize the inode, link it in.
    /// The inode is released again if any later step fails.
    fn create_node(
        &self,
        path: &str,
        mode: u32,
        file_type: FileType,
        links_count: u32,
    ) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let parent_inode = self.read_inode(parent)?;
        if self.dir_find(&parent_inode, name)?.is_some() {
            return Err(VfsError::AlreadyExists);
        }
        let ino = self.allocate_inode()?;
        let now = unix_now();
        let inode = Inode {
            inode_num: ino.0,
            mode,
            uid: 0,
            gid: 0,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            links_count,
            blocks_count: 0,
            ..Inode::default()
        };
        if let Err(err) = self.write_inode(ino, &inode) {
            let _ = self.free_inode(ino);
            return Err(err);
        }
        if let Err(err) = self.dir_add_entry(parent, name, ino.0, file_type) {
            let _ = self.free_inode(ino);
            return Err(err);
        }
        Ok(())
    }
}
