//! Directory layer.
//!
//! A directory's entries live as a fixed-stride array in its first direct
//! block. Lookup, insertion, and removal are linear scans over the 15
//! slots; a slot with `inode_num == 0` is free. `.` and `..` are never
//! stored — path splitting handles them.

use crate::state::{unix_now, MountedFs};
use revfs_error::{Result, VfsError};
use revfs_types::{
    BlockId, DirEntry, FileType, Inode, InodeId, DIR_ENTRIES_PER_BLOCK, DIR_ENTRY_SIZE,
    MAX_NAME_LEN,
};
use serde::{Deserialize, Serialize};

/// One live directory entry as reported by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub inode: u32,
    pub file_type: FileType,
}

fn entry_offset(slot: u32) -> usize {
    (slot * DIR_ENTRY_SIZE) as usize
}

impl MountedFs {
    /// Look up `name` in a directory inode. `Ok(None)` when absent.
    pub(crate) fn dir_find(&self, dir: &Inode, name: &str) -> Result<Option<u32>> {
        if !dir.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        if dir.blocks_count == 0 || dir.direct[0] == 0 {
            return Ok(None);
        }
        let block = self.read_block(BlockId(dir.direct[0]))?;
        for slot in 0..DIR_ENTRIES_PER_BLOCK {
            let offset = entry_offset(slot);
            let entry = DirEntry::decode(&block[offset..offset + DIR_ENTRY_SIZE as usize])?;
            if !entry.is_free() && entry.name_bytes() == name.as_bytes() {
                return Ok(Some(entry.inode_num));
            }
        }
        Ok(None)
    }

    /// Insert an entry into the first free slot, allocating the directory's
    /// block on first use. Fails with `DirectoryFull` when all slots are
    /// taken.
    pub(crate) fn dir_add_entry(
        &self,
        dir_ino: InodeId,
        name: &str,
        child: u32,
        file_type: FileType,
    ) -> Result<()> {
        if name.len() > MAX_NAME_LEN {
            return Err(VfsError::NameTooLong);
        }
        let mut dir = self.read_inode(dir_ino)?;
        if !dir.is_directory() {
            return Err(VfsError::NotADirectory);
        }

        if dir.blocks_count == 0 {
            let block = self.allocate_block()?;
            dir.direct[0] = block.0;
            dir.blocks_count = 1;
            let zero = vec![0_u8; revfs_types::BLOCK_SIZE as usize];
            self.write_block(block, &zero)?;
        }

        let dir_block = BlockId(dir.direct[0]);
        let mut block = self.read_block(dir_block)?;
        for slot in 0..DIR_ENTRIES_PER_BLOCK {
            let offset = entry_offset(slot);
            let existing = DirEntry::decode(&block[offset..offset + DIR_ENTRY_SIZE as usize])?;
            if existing.is_free() {
                let entry = DirEntry::new(child, name.as_bytes(), file_type);
                entry.encode_into(&mut block[offset..offset + DIR_ENTRY_SIZE as usize]);
                dir.size += u64::from(DIR_ENTRY_SIZE);
                dir.mtime = unix_now();
                self.write_inode(dir_ino, &dir)?;
                self.write_block(dir_block, &block)?;
                return Ok(());
            }
        }
        Err(VfsError::DirectoryFull)
    }

    /// Mark the named entry's slot free and shrink the directory size.
    pub(crate) fn dir_remove_entry(&self, dir_ino: InodeId, name: &str) -> Result<()> {
        let mut dir = self.read_inode(dir_ino)?;
        if !dir.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        if dir.blocks_count == 0 || dir.direct[0] == 0 {
            return Err(VfsError::NotFound(name.to_owned()));
        }
        let dir_block = BlockId(dir.direct[0]);
        let mut block = self.read_block(dir_block)?;
        for slot in 0..DIR_ENTRIES_PER_BLOCK {
            let offset = entry_offset(slot);
            let entry = DirEntry::decode(&block[offset..offset + DIR_ENTRY_SIZE as usize])?;
            if !entry.is_free() && entry.name_bytes() == name.as_bytes() {
                block[offset..offset + 4].copy_from_slice(&0_u32.to_le_bytes());
                dir.size = dir.size.saturating_sub(u64::from(DIR_ENTRY_SIZE));
                dir.mtime = unix_now();
                self.write_inode(dir_ino, &dir)?;
                self.write_block(dir_block, &block)?;
                return Ok(());
            }
        }
        Err(VfsError::NotFound(name.to_owned()))
    }

    /// All live entries in slot order (which is insertion order while no
    /// removals punch holes).
    pub(crate) fn dir_entries(&self, dir: &Inode) -> Result<Vec<DirEntryInfo>> {
        if !dir.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        let mut entries = Vec::new();
        if dir.blocks_count == 0 || dir.direct[0] == 0 {
            return Ok(entries);
        }
        let block = self.read_block(BlockId(dir.direct[0]))?;
        for slot in 0..DIR_ENTRIES_PER_BLOCK {
            let offset = entry_offset(slot);
            let entry = DirEntry::decode(&block[offset..offset + DIR_ENTRY_SIZE as usize])?;
            if !entry.is_free() {
                entries.push(DirEntryInfo {
                    name: String::from_utf8_lossy(entry.name_bytes()).into_owned(),
                    inode: entry.inode_num,
                    file_type: FileType::from(entry.file_type),
                });
            }
        }
        Ok(entries)
    }

    /// Walk a component list from the root.
    pub(crate) fn walk(&self, components: &[&str]) -> Result<InodeId> {
        let mut current = InodeId::ROOT;
        for name in components {
            let inode = self.read_inode(current)?;
            let Some(next) = self.dir_find(&inode, name)? else {
                return Err(VfsError::NotFound((*name).to_owned()));
            };
            current = InodeId(next);
        }
        Ok(current)
    }

    /// Resolve an absolute path to an inode.
    pub(crate) fn resolve(&self, path: &str) -> Result<InodeId> {
        let components = crate::path::split_path(path)?;
        self.walk(&components)
    }

    /// Resolve a path's parent directory, yielding `(parent, basename)`.
    pub(crate) fn resolve_parent<'p>(&self, path: &'p str) -> Result<(InodeId, &'p str)> {
        let (parents, name) = crate::path::split_parent(path)?;
        let parent = self.walk(&parents)?;
        Ok((parent, name))
    }
}
