#![forbid(unsafe_code)]
//! On-disk layout and shared identifiers for REVFS.
//!
//! Defines the image constants, the `BlockId`/`InodeId` newtypes, the
//! little-endian codec for the superblock, inode, and directory-entry
//! records, and the per-block rolling checksum. Every structure here
//! round-trips byte-exactly; higher layers never touch raw offsets.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Image constants ─────────────────────────────────────────────────────────

/// Identifies a formatted REVFS image ("REVD").
pub const VFS_MAGIC: u32 = 0x5245_5644;
/// On-disk layout version written at format.
pub const LAYOUT_VERSION: u32 = 1;
/// Fundamental I/O unit of the image.
pub const BLOCK_SIZE: u32 = 4096;
/// Encoded inode record size; 32 inodes per block.
pub const INODE_SIZE: u32 = 128;
/// Encoded directory entry size; 15 entries per block.
pub const DIR_ENTRY_SIZE: u32 = 264;
/// Direct block pointers per inode.
pub const DIRECT_BLOCKS: usize = 12;
/// Block-id slots in a single-indirect block.
pub const INDIRECT_SLOTS: u32 = BLOCK_SIZE / 4;
/// Longest permitted name component, in bytes.
pub const MAX_NAME_LEN: usize = 255;
/// Inodes per inode-table block.
pub const INODES_PER_BLOCK: u32 = BLOCK_SIZE / INODE_SIZE;
/// Directory entries per directory block.
pub const DIR_ENTRIES_PER_BLOCK: u32 = BLOCK_SIZE / DIR_ENTRY_SIZE;

/// Reserved inode slot; never live.
pub const RESERVED_INODE: u32 = 0;
/// The root directory inode.
pub const ROOT_INODE: u32 = 1;
/// Marker stored in inode 0's `inode_num` field at format so the table
/// block is distinguishable from an unwritten one.
pub const RESERVED_INODE_MARKER: u32 = 0xDEAD_BEEF;

// ── File mode bits ──────────────────────────────────────────────────────────

/// File type mask over the mode field.
pub const S_IFMT: u32 = 0o170_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Permission bits (stored, never enforced).
pub const MODE_PERM_MASK: u32 = 0o777;

// ── Open flags ──────────────────────────────────────────────────────────────

/// Open-flag constants accepted by `open`.
pub mod open_flags {
    pub const O_RDONLY: u32 = 0;
    pub const O_WRONLY: u32 = 1;
    pub const O_RDWR: u32 = 2;
    pub const O_ACCMODE: u32 = 3;
    pub const O_TRUNC: u32 = 0o1000;

    /// Whether the flags grant write access.
    #[must_use]
    pub fn writable(flags: u32) -> bool {
        matches!(flags & O_ACCMODE, O_WRONLY | O_RDWR)
    }

    /// Whether the flags request truncation (effective only with write access).
    #[must_use]
    pub fn truncate(flags: u32) -> bool {
        flags & O_TRUNC != 0
    }
}

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Absolute block number within the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Ordinal into the inode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeId(pub u32);

impl InodeId {
    pub const ROOT: Self = Self(ROOT_INODE);
}

impl BlockId {
    /// Byte offset of this block in the image.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * u64::from(BLOCK_SIZE)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Decode errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], LayoutError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(LayoutError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(LayoutError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, LayoutError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, LayoutError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, LayoutError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Block-0 record holding the global layout and counters.
///
/// Encoded little-endian in the first [`Superblock::ENCODED_LEN`] bytes of
/// block 0; the rest of the block stays zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_inodes: u32,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub inode_table_start: u32,
    pub data_block_start: u32,
    pub bitmap_start: u32,
    pub created_time: u64,
    pub modified_time: u64,
}

impl Superblock {
    /// Encoded size: 56 field bytes plus a 256-byte reserved tail.
    pub const ENCODED_LEN: usize = 312;

    pub fn decode(data: &[u8]) -> Result<Self, LayoutError> {
        let magic = read_le_u32(data, 0)?;
        if magic != VFS_MAGIC {
            return Err(LayoutError::InvalidMagic {
                expected: VFS_MAGIC,
                actual: magic,
            });
        }
        // Reserved tail must be present even though its content is ignored.
        ensure_slice(data, 56, Self::ENCODED_LEN - 56)?;
        Ok(Self {
            magic,
            version: read_le_u32(data, 4)?,
            block_size: read_le_u32(data, 8)?,
            total_blocks: read_le_u32(data, 12)?,
            total_inodes: read_le_u32(data, 16)?,
            free_blocks: read_le_u32(data, 20)?,
            free_inodes: read_le_u32(data, 24)?,
            inode_table_start: read_le_u32(data, 28)?,
            data_block_start: read_le_u32(data, 32)?,
            bitmap_start: read_le_u32(data, 36)?,
            created_time: read_le_u64(data, 40)?,
            modified_time: read_le_u64(data, 48)?,
        })
    }

    /// Encode into the head of `buf`. `buf` must hold at least
    /// [`Superblock::ENCODED_LEN`] bytes; the reserved tail is zeroed.
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= Self::ENCODED_LEN, "superblock buffer too small");
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.total_blocks.to_le_bytes());
        buf[16..20].copy_from_slice(&self.total_inodes.to_le_bytes());
        buf[20..24].copy_from_slice(&self.free_blocks.to_le_bytes());
        buf[24..28].copy_from_slice(&self.free_inodes.to_le_bytes());
        buf[28..32].copy_from_slice(&self.inode_table_start.to_le_bytes());
        buf[32..36].copy_from_slice(&self.data_block_start.to_le_bytes());
        buf[36..40].copy_from_slice(&self.bitmap_start.to_le_bytes());
        buf[40..48].copy_from_slice(&self.created_time.to_le_bytes());
        buf[48..56].copy_from_slice(&self.modified_time.to_le_bytes());
        buf[56..Self::ENCODED_LEN].fill(0);
    }

    /// Number of data blocks governed by the bitmap.
    #[must_use]
    pub fn data_blocks(&self) -> u32 {
        self.total_blocks.saturating_sub(self.data_block_start)
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// One 128-byte inode record.
///
/// A free inode has `mode == 0`. `double_indirect` is reserved: preserved
/// across round-trips, never consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Inode {
    pub inode_num: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub links_count: u32,
    pub blocks_count: u32,
    pub direct: [u32; DIRECT_BLOCKS],
    pub indirect: u32,
    pub double_indirect: u32,
}

impl Inode {
    pub fn decode(data: &[u8]) -> Result<Self, LayoutError> {
        ensure_slice(data, 0, INODE_SIZE as usize)?;
        let mut direct = [0_u32; DIRECT_BLOCKS];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = read_le_u32(data, 56 + i * 4)?;
        }
        Ok(Self {
            inode_num: read_le_u32(data, 0)?,
            mode: read_le_u32(data, 4)?,
            uid: read_le_u32(data, 8)?,
            gid: read_le_u32(data, 12)?,
            size: read_le_u64(data, 16)?,
            atime: read_le_u64(data, 24)?,
            mtime: read_le_u64(data, 32)?,
            ctime: read_le_u64(data, 40)?,
            links_count: read_le_u32(data, 48)?,
            blocks_count: read_le_u32(data, 52)?,
            direct,
            indirect: read_le_u32(data, 104)?,
            double_indirect: read_le_u32(data, 108)?,
        })
    }

    /// Encode into the first [`INODE_SIZE`] bytes of `buf`; the 16-byte
    /// reserved tail is zeroed.
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= INODE_SIZE as usize, "inode buffer too small");
        buf[0..4].copy_from_slice(&self.inode_num.to_le_bytes());
        buf[4..8].copy_from_slice(&self.mode.to_le_bytes());
        buf[8..12].copy_from_slice(&self.uid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.gid.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.atime.to_le_bytes());
        buf[32..40].copy_from_slice(&self.mtime.to_le_bytes());
        buf[40..48].copy_from_slice(&self.ctime.to_le_bytes());
        buf[48..52].copy_from_slice(&self.links_count.to_le_bytes());
        buf[52..56].copy_from_slice(&self.blocks_count.to_le_bytes());
        for (i, slot) in self.direct.iter().enumerate() {
            buf[56 + i * 4..60 + i * 4].copy_from_slice(&slot.to_le_bytes());
        }
        buf[104..108].copy_from_slice(&self.indirect.to_le_bytes());
        buf[108..112].copy_from_slice(&self.double_indirect.to_le_bytes());
        buf[112..INODE_SIZE as usize].fill(0);
    }

    /// Free slot test: an unallocated inode carries mode 0.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.mode == 0
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Largest representable file: direct pointers plus one indirect block.
    #[must_use]
    pub fn max_file_size() -> u64 {
        (DIRECT_BLOCKS as u64 + u64::from(INDIRECT_SLOTS)) * u64::from(BLOCK_SIZE)
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// Tag stored in a directory entry's `file_type` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    Regular = 1,
    Directory = 2,
}

impl From<u8> for FileType {
    fn from(tag: u8) -> Self {
        match tag {
            1 => Self::Regular,
            2 => Self::Directory,
            _ => Self::Unknown,
        }
    }
}

/// One 264-byte directory entry record. `inode_num == 0` marks a free slot.
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub inode_num: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
    pub name: [u8; MAX_NAME_LEN],
}

impl DirEntry {
    /// Build an entry for `name`; callers must have validated the length.
    #[must_use]
    pub fn new(inode_num: u32, name: &[u8], file_type: FileType) -> Self {
        debug_assert!(name.len() <= MAX_NAME_LEN);
        let mut buf = [0_u8; MAX_NAME_LEN];
        let len = name.len().min(MAX_NAME_LEN);
        buf[..len].copy_from_slice(&name[..len]);
        Self {
            inode_num,
            rec_len: DIR_ENTRY_SIZE as u16,
            name_len: len as u8,
            file_type: file_type as u8,
            name: buf,
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, LayoutError> {
        ensure_slice(data, 0, DIR_ENTRY_SIZE as usize)?;
        let mut name = [0_u8; MAX_NAME_LEN];
        name.copy_from_slice(&data[8..8 + MAX_NAME_LEN]);
        Ok(Self {
            inode_num: read_le_u32(data, 0)?,
            rec_len: read_le_u16(data, 4)?,
            name_len: data[6],
            file_type: data[7],
            name,
        })
    }

    /// Encode into the first [`DIR_ENTRY_SIZE`] bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= DIR_ENTRY_SIZE as usize, "dirent buffer too small");
        buf[0..4].copy_from_slice(&self.inode_num.to_le_bytes());
        buf[4..6].copy_from_slice(&self.rec_len.to_le_bytes());
        buf[6] = self.name_len;
        buf[7] = self.file_type;
        buf[8..8 + MAX_NAME_LEN].copy_from_slice(&self.name);
        buf[8 + MAX_NAME_LEN] = 0;
    }

    /// The live name bytes.
    #[must_use]
    pub fn name_bytes(&self) -> &[u8] {
        let len = (self.name_len as usize).min(MAX_NAME_LEN);
        &self.name[..len]
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.inode_num == 0
    }
}

// ── Block checksum ──────────────────────────────────────────────────────────

/// Rolling hash over a block: `h := h * 131 + byte`, wrapping.
#[must_use]
pub fn block_checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0_u32, |h, &b| h.wrapping_mul(131).wrapping_add(u32::from(b)))
}

// ── Tests ───────────────────────────────────────────────────────────────────
