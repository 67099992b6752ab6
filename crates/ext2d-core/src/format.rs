//! Minimal volume formatter.
//!
//! Lays down a rev-1 volume with the FILETYPE and SPARSE_SUPER features:
//! superblock, group descriptor table, per-group bitmaps and inode tables,
//! the reserved inodes 1..=10 and a root directory holding `.` and `..`.
//! Backup superblock copies get their space reserved in the bitmaps but are
//! not written; the driver only ever reads the primary.

use crate::volume::parse_to_ext2;
use ext2d_alloc::bitmap_set;
use ext2d_block::ByteDevice;
use ext2d_error::{Ext2Error, Result};
use ext2d_ondisk::{
    GroupDesc, IncompatFeatures, RawInode, RoCompatFeatures, Superblock, STATE_CLEAN,
};
use ext2d_types::{
    BlockNumber, BlockSize, GroupNumber, EXT2_FIRST_INO, EXT2_SUPER_MAGIC, GROUP_DESC_SIZE,
    PREALLOC_BLOCKS, ROOT_INO, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, S_IFDIR,
};
use rand::RngCore;
use tracing::info;

/// Formatting parameters. `inodes_per_group` must be a multiple of the
/// inode records per block (8 per KiB of block size).
#[derive(Debug, Clone)]
pub struct Geometry {
    pub block_size: u32,
    pub blocks_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    /// Blocks kept back for privileged allocation.
    pub reserved_blocks_count: u32,
}

impl Geometry {
    /// A 1 KiB-block layout covering `blocks_count` blocks, sized for small
    /// test volumes.
    #[must_use]
    pub fn small(blocks_count: u32) -> Self {
        Self {
            block_size: 1024,
            blocks_count,
            blocks_per_group: 8192,
            inodes_per_group: 1024,
            reserved_blocks_count: blocks_count / 20,
        }
    }
}

/// Write a fresh filesystem onto `dev`. Everything on the device is
/// overwritten.
pub fn format<D: ByteDevice>(dev: &D, geo: &Geometry) -> Result<()> {
    let bs = BlockSize::new(geo.block_size).map_err(|e| parse_to_ext2(&e))?;
    let block_size = bs.get();
    let first_data_block = u32::from(block_size == 1024);

    if u64::from(geo.blocks_count) * u64::from(block_size) > dev.len_bytes() {
        return Err(Ext2Error::Format(format!(
            "device holds fewer than {} blocks of {}",
            geo.blocks_count, block_size
        )));
    }

    let stamp = crate::now();
    let mut uuid = [0_u8; 16];
    rand::thread_rng().fill_bytes(&mut uuid);

    let mut sb = Superblock {
        inodes_count: 0,
        blocks_count: geo.blocks_count,
        reserved_blocks_count: geo.reserved_blocks_count,
        free_blocks_count: 0,
        free_inodes_count: 0,
        first_data_block,
        block_size: bs,
        blocks_per_group: geo.blocks_per_group,
        inodes_per_group: geo.inodes_per_group,
        mtime: 0,
        wtime: stamp,
        mnt_count: 0,
        max_mnt_count: u16::MAX,
        magic: EXT2_SUPER_MAGIC,
        state: STATE_CLEAN,
        errors: 1,
        rev_level: 1,
        first_ino: EXT2_FIRST_INO,
        inode_size: 128,
        feature_compat: ext2d_ondisk::CompatFeatures(0),
        feature_incompat: IncompatFeatures::FILETYPE,
        feature_ro_compat: RoCompatFeatures::SPARSE_SUPER,
        uuid,
        prealloc_blocks: PREALLOC_BLOCKS as u8,
        prealloc_dir_blocks: 0,
    };
    let groups = sb.groups_count();
    sb.inodes_count = groups
        .checked_mul(geo.inodes_per_group)
        .ok_or_else(|| Ext2Error::Format("inode count overflows u32".to_owned()))?;
    sb.validate_geometry().map_err(|e| parse_to_ext2(&e))?;

    let gdt_blocks = sb.gdt_blocks();
    let table_blocks = sb.inode_table_blocks();
    let bsz = block_size as usize;

    let mut descs = Vec::with_capacity(groups as usize);
    let mut free_blocks_total: u32 = 0;
    let mut free_inodes_total: u32 = 0;
    let mut root_block = BlockNumber::HOLE;

    for g in 0..groups {
        let start = first_data_block + g * geo.blocks_per_group;
        let in_group = geo.blocks_per_group.min(geo.blocks_count - start);
        let meta = if sb.group_has_super(GroupNumber(g)) {
            1 + gdt_blocks
        } else {
            0
        };
        let block_bitmap = start + meta;
        let inode_bitmap = block_bitmap + 1;
        let inode_table = inode_bitmap + 1;
        let data_start = inode_table + table_blocks;
        let overhead = data_start - start;
        // Group 0 additionally holds the root directory's block.
        let extra = u32::from(g == 0);
        if overhead + extra > in_group {
            return Err(Ext2Error::Format(format!(
                "group {g} too small for its metadata"
            )));
        }

        let mut bbm = vec![0_u8; bsz];
        for bit in 0..overhead {
            bitmap_set(&mut bbm, bit);
        }
        // Pad bits past the group's last real block.
        for bit in in_group..block_size * 8 {
            bitmap_set(&mut bbm, bit);
        }
        let mut ibm = vec![0_u8; bsz];
        for bit in geo.inodes_per_group..block_size * 8 {
            bitmap_set(&mut ibm, bit);
        }

        let mut free_inodes = geo.inodes_per_group;
        let mut free_blocks = in_group - overhead;
        let mut used_dirs = 0;
        let mut table = vec![0_u8; table_blocks as usize * bsz];

        if g == 0 {
            // Inodes 1..=10 are reserved; the root directory is inode 2.
            for bit in 0..EXT2_FIRST_INO - 1 {
                bitmap_set(&mut ibm, bit);
            }
            free_inodes -= EXT2_FIRST_INO - 1;

            root_block = BlockNumber(data_start);
            bitmap_set(&mut bbm, data_start - start);
            free_blocks -= 1;
            used_dirs = 1;

            let root = RawInode {
                mode: S_IFDIR | 0o755,
                links_count: 2,
                size: block_size,
                atime: stamp,
                ctime: stamp,
                mtime: stamp,
                blocks512: block_size / 512,
                block: {
                    let mut slots = [0_u32; ext2d_types::N_BLOCK_SLOTS];
                    slots[0] = data_start;
                    slots
                },
                ..RawInode::default()
            };
            let offset = (ROOT_INO - 1) as usize * 128;
            root.encode_into(&mut table[offset..offset + 128]);
        }

        write_block(dev, bs, BlockNumber(block_bitmap), &bbm)?;
        write_block(dev, bs, BlockNumber(inode_bitmap), &ibm)?;
        dev.write_all_at(bs.block_to_byte(BlockNumber(inode_table)), &table)?;

        free_blocks_total += free_blocks;
        free_inodes_total += free_inodes;
        descs.push(GroupDesc {
            block_bitmap: BlockNumber(block_bitmap),
            inode_bitmap: BlockNumber(inode_bitmap),
            inode_table: BlockNumber(inode_table),
            free_blocks_count: u16::try_from(free_blocks)
                .map_err(|_| Ext2Error::Format("group free-block count exceeds u16".to_owned()))?,
            free_inodes_count: u16::try_from(free_inodes)
                .map_err(|_| Ext2Error::Format("group free-inode count exceeds u16".to_owned()))?,
            used_dirs_count: used_dirs,
        });
    }

    let mut root_dir = vec![0_u8; bsz];
    ext2d_dir::init_dir_block(&mut root_dir, ROOT_INO, ROOT_INO)?;
    write_block(dev, bs, root_block, &root_dir)?;

    let mut gdt = vec![0_u8; gdt_blocks as usize * bsz];
    for (i, desc) in descs.iter().enumerate() {
        desc.encode_into(&mut gdt[i * GROUP_DESC_SIZE..(i + 1) * GROUP_DESC_SIZE]);
    }
    dev.write_all_at(bs.block_to_byte(sb.gdt_start()), &gdt)?;

    sb.free_blocks_count = free_blocks_total;
    sb.free_inodes_count = free_inodes_total;
    let mut region = vec![0_u8; SUPERBLOCK_SIZE];
    sb.encode_into(&mut region);
    dev.write_all_at(SUPERBLOCK_OFFSET, &region)?;
    dev.sync()?;

    info!(
        blocks = geo.blocks_count,
        inodes = sb.inodes_count,
        groups,
        block_size,
        "formatted"
    );
    Ok(())
}

fn write_block<D: ByteDevice>(dev: &D, bs: BlockSize, block: BlockNumber, data: &[u8]) -> Result<()> {
    dev.write_all_at(bs.block_to_byte(block), data)
}
