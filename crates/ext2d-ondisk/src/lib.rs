#![forbid(unsafe_code)]
//! Parsing and encoding of the ext2 on-disk structures.
//!
//! Everything here is byte-for-byte little-endian with explicit field
//! offsets. Parsed structs carry only the fields the driver reads or
//! mutates; `encode_into` patches exactly those fields back at their on-disk
//! offsets, leaving every other byte of the record untouched, so a volume
//! written by another implementation keeps its unknown tail intact across a
//! mount/flush cycle.

use ext2d_types::{
    read_fixed, read_le_u16, read_le_u32, write_le_u16, write_le_u32, BlockNumber, BlockSize,
    GroupNumber, ParseError, EXT2_SUPER_MAGIC, GROUP_DESC_SIZE, N_BLOCK_SLOTS, SUPERBLOCK_SIZE,
    S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
};
use serde::{Deserialize, Serialize};

// ── Feature flags ───────────────────────────────────────────────────────────

fn describe_flags(bits: u32, known: &[(u32, &'static str)]) -> Vec<&'static str> {
    known
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|&(_, name)| name)
        .collect()
}

/// Compatible feature flags (`s_feature_compat`). Advisory; unknown bits are
/// safe to ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CompatFeatures(pub u32);

impl CompatFeatures {
    pub const DIR_PREALLOC: Self = Self(0x0001);
    pub const IMAGIC_INODES: Self = Self(0x0002);
    pub const HAS_JOURNAL: Self = Self(0x0004);
    pub const EXT_ATTR: Self = Self(0x0008);
    pub const RESIZE_INO: Self = Self(0x0010);
    pub const DIR_INDEX: Self = Self(0x0020);

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 != 0
    }
}

/// Incompatible feature flags (`s_feature_incompat`).
///
/// Any bit outside [`IncompatFeatures::SUPPORTED`] fails the mount; the
/// driver never guesses at a layout it does not understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IncompatFeatures(pub u32);

impl IncompatFeatures {
    pub const COMPRESSION: Self = Self(0x0001);
    pub const FILETYPE: Self = Self(0x0002);
    pub const RECOVER: Self = Self(0x0004);
    pub const JOURNAL_DEV: Self = Self(0x0008);
    pub const META_BG: Self = Self(0x0010);

    /// Incompatible bits this driver implements.
    pub const SUPPORTED: Self = Self(Self::FILETYPE.0);

    const KNOWN: &'static [(u32, &'static str)] = &[
        (0x0001, "COMPRESSION"),
        (0x0002, "FILETYPE"),
        (0x0004, "RECOVER"),
        (0x0008, "JOURNAL_DEV"),
        (0x0010, "META_BG"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 != 0
    }

    /// Bits present here that [`Self::SUPPORTED`] does not cover.
    #[must_use]
    pub fn unsupported_bits(self) -> u32 {
        self.0 & !Self::SUPPORTED.0
    }

    /// Names of the unsupported bits, for the mount error message.
    #[must_use]
    pub fn describe_unsupported(self) -> Vec<&'static str> {
        describe_flags(self.unsupported_bits(), Self::KNOWN)
    }
}

/// Read-only compatible feature flags (`s_feature_ro_compat`).
///
/// Unknown bits force a read-only mount rather than a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RoCompatFeatures(pub u32);

impl RoCompatFeatures {
    pub const SPARSE_SUPER: Self = Self(0x0001);
    pub const LARGE_FILE: Self = Self(0x0002);
    pub const BTREE_DIR: Self = Self(0x0004);

    /// Read-only-compatible bits this driver understands for writing.
    pub const SUPPORTED: Self = Self(Self::SPARSE_SUPER.0 | Self::LARGE_FILE.0);

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 != 0
    }

    #[must_use]
    pub fn unsupported_bits(self) -> u32 {
        self.0 & !Self::SUPPORTED.0
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Filesystem state flags (`s_state`).
pub const STATE_CLEAN: u16 = 0x0001;
pub const STATE_ERRORS: u16 = 0x0002;

/// Parsed ext2 superblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub block_size: BlockSize,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub errors: u16,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub feature_compat: CompatFeatures,
    pub feature_incompat: IncompatFeatures,
    pub feature_ro_compat: RoCompatFeatures,
    pub uuid: [u8; 16],
    pub prealloc_blocks: u8,
    pub prealloc_dir_blocks: u8,
}

impl Superblock {
    /// Parse from the 1024-byte superblock region.
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u32::from(EXT2_SUPER_MAGIC),
                actual: u32::from(magic),
            });
        }

        let block_size = BlockSize::from_log(read_le_u32(region, 0x18)?)?;
        let rev_level = read_le_u32(region, 0x4C)?;

        // Rev 0 fixes the dynamic fields; rev 1 stores them.
        let (first_ino, inode_size) = if rev_level == 0 {
            (ext2d_types::EXT2_FIRST_INO, 128)
        } else {
            (read_le_u32(region, 0x54)?, read_le_u16(region, 0x58)?)
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            reserved_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            magic,
            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            rev_level,
            first_ino,
            inode_size,
            feature_compat: CompatFeatures(read_le_u32(region, 0x5C)?),
            feature_incompat: IncompatFeatures(read_le_u32(region, 0x60)?),
            feature_ro_compat: RoCompatFeatures(read_le_u32(region, 0x64)?),
            uuid: read_fixed::<16>(region, 0x68)?,
            prealloc_blocks: ext2d_types::ensure_slice(region, 0xCC, 1)?[0],
            prealloc_dir_blocks: ext2d_types::ensure_slice(region, 0xCD, 1)?[0],
        })
    }

    /// Patch every parsed field back into `region` at its on-disk offset.
    ///
    /// `region` must be the 1024-byte superblock region; bytes not covered
    /// by a parsed field are left as they were.
    pub fn encode_into(&self, region: &mut [u8]) {
        debug_assert!(region.len() >= SUPERBLOCK_SIZE);
        write_le_u32(region, 0x00, self.inodes_count);
        write_le_u32(region, 0x04, self.blocks_count);
        write_le_u32(region, 0x08, self.reserved_blocks_count);
        write_le_u32(region, 0x0C, self.free_blocks_count);
        write_le_u32(region, 0x10, self.free_inodes_count);
        write_le_u32(region, 0x14, self.first_data_block);
        write_le_u32(region, 0x18, self.block_size.log());
        write_le_u32(region, 0x20, self.blocks_per_group);
        write_le_u32(region, 0x28, self.inodes_per_group);
        write_le_u32(region, 0x2C, self.mtime);
        write_le_u32(region, 0x30, self.wtime);
        write_le_u16(region, 0x34, self.mnt_count);
        write_le_u16(region, 0x36, self.max_mnt_count);
        write_le_u16(region, 0x38, self.magic);
        write_le_u16(region, 0x3A, self.state);
        write_le_u16(region, 0x3C, self.errors);
        write_le_u32(region, 0x4C, self.rev_level);
        write_le_u32(region, 0x54, self.first_ino);
        write_le_u16(region, 0x58, self.inode_size);
        write_le_u32(region, 0x5C, self.feature_compat.0);
        write_le_u32(region, 0x60, self.feature_incompat.0);
        write_le_u32(region, 0x64, self.feature_ro_compat.0);
        region[0x68..0x78].copy_from_slice(&self.uuid);
        region[0xCC] = self.prealloc_blocks;
        region[0xCD] = self.prealloc_dir_blocks;
    }

    /// Validate geometry fields beyond what parsing already established.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        // One bitmap block must cover a whole group.
        if self.blocks_per_group > self.block_size.get() * 8 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "exceeds bits in one bitmap block",
            });
        }
        if self.inodes_per_group == 0 || self.inodes_per_group > self.block_size.get() * 8 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "zero or exceeds bits in one bitmap block",
            });
        }
        if self.blocks_count <= self.first_data_block {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "no blocks past first_data_block",
            });
        }
        if !matches!(self.inode_size, 128 | 256) {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be 128 or 256",
            });
        }
        if self.inodes_per_group % self.inodes_per_block() != 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "not a multiple of inodes per block",
            });
        }
        if u64::from(self.free_blocks_count) > u64::from(self.blocks_count) {
            return Err(ParseError::InvalidField {
                field: "s_free_blocks_count",
                reason: "exceeds total blocks",
            });
        }
        if self.free_inodes_count > self.inodes_count {
            return Err(ParseError::InvalidField {
                field: "s_free_inodes_count",
                reason: "exceeds total inodes",
            });
        }
        Ok(())
    }

    /// Number of block groups on the volume.
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        let data_blocks = u64::from(self.blocks_count) - u64::from(self.first_data_block);
        u32::try_from(data_blocks.div_ceil(u64::from(self.blocks_per_group))).unwrap_or(u32::MAX)
    }

    /// Inode records per inode-table block.
    #[must_use]
    pub fn inodes_per_block(&self) -> u32 {
        self.block_size.get() / u32::from(self.inode_size)
    }

    /// Blocks spanned by one group's inode table.
    #[must_use]
    pub fn inode_table_blocks(&self) -> u32 {
        self.inodes_per_group.div_ceil(self.inodes_per_block())
    }

    /// Group descriptors per GDT block.
    #[must_use]
    pub fn descs_per_block(&self) -> u32 {
        self.block_size.get() / GROUP_DESC_SIZE as u32
    }

    /// Blocks spanned by the group descriptor table.
    #[must_use]
    pub fn gdt_blocks(&self) -> u32 {
        self.groups_count().div_ceil(self.descs_per_block())
    }

    /// First block of the group descriptor table (the block after the one
    /// holding the superblock).
    #[must_use]
    pub fn gdt_start(&self) -> BlockNumber {
        BlockNumber(self.first_data_block + 1)
    }

    /// Largest byte size addressable through the direct and indirect
    /// pointers for this block size, capped at what `i_size`/`i_dir_acl`
    /// can represent. Computed once at mount.
    #[must_use]
    pub fn max_file_size(&self) -> u64 {
        let bs = u64::from(self.block_size.get());
        let apb = u64::from(self.block_size.addresses_per_block());
        let blocks = ext2d_types::NDIR_BLOCKS as u64 + apb + apb * apb + apb * apb * apb;
        (blocks * bs).min(u32::MAX.into())
    }

    /// Does a group carry a superblock/GDT backup? Always true without
    /// SPARSE_SUPER; with it, only groups 0, 1 and powers of 3, 5, 7.
    #[must_use]
    pub fn group_has_super(&self, group: GroupNumber) -> bool {
        if !self
            .feature_ro_compat
            .contains(RoCompatFeatures::SPARSE_SUPER)
        {
            return true;
        }
        let g = group.0;
        if g <= 1 {
            return true;
        }
        [3_u32, 5, 7].iter().any(|&base| {
            let mut p = base;
            while p < g {
                p = p.saturating_mul(base);
            }
            p == g
        })
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

/// Parsed 32-byte ext2 group descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GroupDesc {
    pub block_bitmap: BlockNumber,
    pub inode_bitmap: BlockNumber,
    pub inode_table: BlockNumber,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            block_bitmap: BlockNumber(read_le_u32(bytes, 0x00)?),
            inode_bitmap: BlockNumber(read_le_u32(bytes, 0x04)?),
            inode_table: BlockNumber(read_le_u32(bytes, 0x08)?),
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }

    pub fn encode_into(&self, bytes: &mut [u8]) {
        debug_assert!(bytes.len() >= GROUP_DESC_SIZE);
        write_le_u32(bytes, 0x00, self.block_bitmap.0);
        write_le_u32(bytes, 0x04, self.inode_bitmap.0);
        write_le_u32(bytes, 0x08, self.inode_table.0);
        write_le_u16(bytes, 0x0C, self.free_blocks_count);
        write_le_u16(bytes, 0x0E, self.free_inodes_count);
        write_le_u16(bytes, 0x10, self.used_dirs_count);
    }
}

// ── Raw inode ───────────────────────────────────────────────────────────────

/// Parsed on-disk inode record (the 128-byte base; 256-byte tables keep
/// their extension area untouched on write-back).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawInode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// 512-byte sector count, per the on-disk contract.
    pub blocks512: u32,
    pub flags: u32,
    pub block: [u32; N_BLOCK_SLOTS],
    pub generation: u32,
}

impl RawInode {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < 128 {
            return Err(ParseError::InsufficientData {
                needed: 128,
                offset: 0,
                actual: bytes.len(),
            });
        }
        let mut block = [0_u32; N_BLOCK_SLOTS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, 0x28 + i * 4)?;
        }
        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: read_le_u16(bytes, 0x02)?,
            size: read_le_u32(bytes, 0x04)?,
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            gid: read_le_u16(bytes, 0x18)?,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks512: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            block,
            generation: read_le_u32(bytes, 0x64)?,
        })
    }

    pub fn encode_into(&self, bytes: &mut [u8]) {
        debug_assert!(bytes.len() >= 128);
        write_le_u16(bytes, 0x00, self.mode);
        write_le_u16(bytes, 0x02, self.uid);
        write_le_u32(bytes, 0x04, self.size);
        write_le_u32(bytes, 0x08, self.atime);
        write_le_u32(bytes, 0x0C, self.ctime);
        write_le_u32(bytes, 0x10, self.mtime);
        write_le_u32(bytes, 0x14, self.dtime);
        write_le_u16(bytes, 0x18, self.gid);
        write_le_u16(bytes, 0x1A, self.links_count);
        write_le_u32(bytes, 0x1C, self.blocks512);
        write_le_u32(bytes, 0x20, self.flags);
        for (i, slot) in self.block.iter().enumerate() {
            write_le_u32(bytes, 0x28 + i * 4, *slot);
        }
        write_le_u32(bytes, 0x64, self.generation);
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

// ── Directory entry file type ───────────────────────────────────────────────

/// On-disk directory entry file-type tag, present when the FILETYPE
/// incompatible feature is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    Regular = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

impl FileType {
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::Regular,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Socket,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            1 => Self::Regular,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Socket,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}
