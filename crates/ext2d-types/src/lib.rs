#![forbid(unsafe_code)]
//! Shared vocabulary for the ext2d workspace: unit-carrying newtypes,
//! on-disk constants, and bounds-checked little-endian field access.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte offset of the superblock from the start of the volume.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// Size of the on-disk superblock record in bytes.
pub const SUPERBLOCK_SIZE: usize = 1024;
/// ext2 superblock magic (`s_magic`).
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Inode number of the root directory.
pub const ROOT_INO: u32 = 2;
/// First inode number available for ordinary allocation (rev 0 layout).
pub const EXT2_FIRST_INO: u32 = 11;

/// Direct block pointer slots in an inode.
pub const NDIR_BLOCKS: usize = 12;
/// Index of the single-indirect pointer slot.
pub const IND_SLOT: usize = 12;
/// Index of the double-indirect pointer slot.
pub const DIND_SLOT: usize = 13;
/// Index of the triple-indirect pointer slot.
pub const TIND_SLOT: usize = 14;
/// Total block pointer slots in an inode.
pub const N_BLOCK_SLOTS: usize = 15;

/// Size of the preallocation window: one block is returned to the caller,
/// up to `PREALLOC_BLOCKS - 1` remain cached on the inode.
pub const PREALLOC_BLOCKS: usize = 8;

/// Size of a group descriptor record on disk.
pub const GROUP_DESC_SIZE: usize = 32;

/// Maximum directory entry name length.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum hard link count per inode (`EXT2_LINK_MAX`).
pub const MAX_LINKS: u16 = 32000;

// ── File mode bits ──────────────────────────────────────────────────────────

pub const S_IFMT: u16 = 0xF000;
pub const S_IFSOCK: u16 = 0xC000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFBLK: u16 = 0x6000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFIFO: u16 = 0x1000;

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Absolute block number on the volume.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BlockNumber(pub u32);

impl BlockNumber {
    /// The "no block" sentinel used in inode pointer slots and indirect
    /// blocks. Reading through it yields a hole.
    pub const HOLE: Self = Self(0);

    #[must_use]
    pub fn is_hole(self) -> bool {
        self.0 == 0
    }
}

/// Inode number. On-disk inode numbering starts at 1; 0 marks a deleted
/// directory entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct InodeNumber(pub u32);

/// Block group index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct GroupNumber(pub u32);

/// File-relative logical block index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogicalBlock(pub u32);

/// Validated block size: a power of two in `1024..=4096`.
///
/// ext2 encodes the block size as `1024 << s_log_block_size`; this type only
/// exists in validated form, so downstream geometry math never re-checks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a supported power of two.
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !matches!(value, 1024 | 2048 | 4096) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be 1024, 2048 or 4096",
            });
        }
        Ok(Self(value))
    }

    /// Decode the on-disk `s_log_block_size` field.
    pub fn from_log(log: u32) -> Result<Self, ParseError> {
        let shifted = 1024_u64 << log.min(31);
        u32::try_from(shifted)
            .map_err(|_| ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "shift out of range",
            })
            .and_then(Self::new)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// On-disk encoding (`s_log_block_size`).
    #[must_use]
    pub fn log(self) -> u32 {
        self.0.trailing_zeros() - 10
    }

    /// Block pointers that fit in one block (stride of one indirect level).
    #[must_use]
    pub fn addresses_per_block(self) -> u32 {
        self.0 / 4
    }

    /// Byte offset of the start of `block`.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> u64 {
        u64::from(block.0) * u64::from(self.0)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

/// On-disk format violation detected while parsing raw bytes.
///
/// Kept independent of the runtime error type; `ext2d-core` converts at its
/// boundary, adding mount-validation context where it has any.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
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

// ── Little-endian field helpers ─────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
