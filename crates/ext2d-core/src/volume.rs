//! Mounted-volume state: superblock, group descriptor table, block cache,
//! allocation cursors and the placement policies resolved at mount.
//!
//! The superblock and GDT are read and written through the raw byte device
//! because their offsets need not be block-aligned; everything else goes
//! through the block cache.

use crate::MountOptions;
use crate::PlacementMode;
use ext2d_alloc::policy::{FirstFit, HashAffinity, Orlov, Parent, PlacementPolicy};
use ext2d_alloc::{AllocCtx, Cursors, InodeAlloc, PreallocCache};
use ext2d_block::{BlockCache, ByteDevice};
use ext2d_error::{Ext2Error, Result};
use ext2d_ondisk::{GroupDesc, RawInode, Superblock};
use ext2d_types::{
    BlockNumber, GroupNumber, InodeNumber, ParseError, GROUP_DESC_SIZE, SUPERBLOCK_OFFSET,
    SUPERBLOCK_SIZE,
};
use tracing::{debug, warn};

/// Convert an on-disk parse failure into the runtime error family, keeping
/// block-size complaints distinguishable for the caller.
pub(crate) fn parse_to_ext2(err: &ParseError) -> Ext2Error {
    match err {
        ParseError::InvalidField { field, .. }
            if field.contains("block_size") || field.contains("log_block_size") =>
        {
            Ext2Error::UnsupportedBlockSize(err.to_string())
        }
        _ => Ext2Error::Format(err.to_string()),
    }
}

pub struct Volume<D: ByteDevice> {
    pub cache: BlockCache<D>,
    pub sb: Superblock,
    pub groups: Vec<GroupDesc>,
    /// Any group descriptor changed since the last flush.
    pub meta_dirty: bool,
    pub cursors: Cursors,
    pub read_only: bool,
    privileged: bool,
    prealloc_enabled: bool,
    /// Computed once at mount for the volume's block size.
    pub max_file_size: u64,
    dir_policy: Box<dyn PlacementPolicy>,
    file_policy: Box<dyn PlacementPolicy>,
}

impl<D: ByteDevice> Volume<D> {
    /// Load and validate the superblock and group descriptor table.
    pub fn mount(dev: D, options: &MountOptions) -> Result<Self> {
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        dev.read_exact_at(SUPERBLOCK_OFFSET, &mut region)?;
        let sb = Superblock::parse_region(&region).map_err(|e| parse_to_ext2(&e))?;
        sb.validate_geometry().map_err(|e| parse_to_ext2(&e))?;

        let unsupported = sb.feature_incompat.unsupported_bits();
        if unsupported != 0 {
            let names = sb.feature_incompat.describe_unsupported();
            warn!(bits = unsupported, ?names, "rejecting volume");
            return Err(Ext2Error::UnsupportedFeature(format!(
                "incompatible features {names:?} (bits {unsupported:#x})"
            )));
        }
        let mut read_only = options.read_only;
        if sb.feature_ro_compat.unsupported_bits() != 0 {
            warn!(
                bits = sb.feature_ro_compat.unsupported_bits(),
                "unknown read-only-compatible features, forcing read-only"
            );
            read_only = true;
        }

        let mut cache = BlockCache::new(dev, sb.block_size.get(), options.cache_blocks)?;
        let groups = load_group_descs(&mut cache, &sb)?;

        let (dir_policy, file_policy): (Box<dyn PlacementPolicy>, Box<dyn PlacementPolicy>) =
            match options.placement {
                PlacementMode::Standard => (Box::new(Orlov::new()), Box::new(HashAffinity)),
                PlacementMode::FirstFit => (Box::new(FirstFit), Box::new(FirstFit)),
            };

        let max_file_size = sb.max_file_size();
        let first_data_block = sb.first_data_block;
        debug!(
            blocks = sb.blocks_count,
            inodes = sb.inodes_count,
            block_size = sb.block_size.get(),
            groups = groups.len(),
            read_only,
            "mounted"
        );
        Ok(Self {
            cache,
            sb,
            groups,
            meta_dirty: false,
            cursors: Cursors {
                next_block: first_data_block,
                next_inode_group: 0,
            },
            read_only,
            privileged: options.privileged,
            prealloc_enabled: options.preallocate,
            max_file_size,
            dir_policy,
            file_policy,
        })
    }

    pub fn into_device(self) -> D {
        self.cache.into_device()
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Ext2Error::ReadOnly);
        }
        Ok(())
    }

    /// Bounds-checked group descriptor lookup. An out-of-range index can
    /// only come from corrupt metadata.
    pub fn group_desc(&self, group: GroupNumber) -> Result<&GroupDesc> {
        self.groups.get(group.0 as usize).ok_or_else(|| {
            Ext2Error::corruption(
                0,
                format!("group {} past group count {}", group.0, self.groups.len()),
            )
        })
    }

    #[must_use]
    pub fn group_of_inode(&self, ino: InodeNumber) -> GroupNumber {
        GroupNumber(ino.0.saturating_sub(1) / self.sb.inodes_per_group)
    }

    fn alloc_ctx(&mut self) -> AllocCtx<'_, D> {
        AllocCtx {
            cache: &mut self.cache,
            sb: &mut self.sb,
            groups: &mut self.groups,
            meta_dirty: &mut self.meta_dirty,
            cursors: &mut self.cursors,
        }
    }

    /// Allocate one block near `goal`. `prealloc_ok` says whether this
    /// inode may hold a preallocation window (regular files only).
    pub fn alloc_block(
        &mut self,
        prealloc: &mut PreallocCache,
        prealloc_ok: bool,
        goal: Option<BlockNumber>,
    ) -> Result<BlockNumber> {
        self.ensure_writable()?;
        let enabled = prealloc_ok && self.prealloc_enabled;
        let privileged = self.privileged;
        ext2d_alloc::alloc_block(&mut self.alloc_ctx(), prealloc, enabled, goal, privileged)
    }

    /// Return a block and drop any cached copy of its contents.
    pub fn free_block(&mut self, block: BlockNumber) -> Result<()> {
        self.ensure_writable()?;
        ext2d_alloc::free_block(&mut self.alloc_ctx(), block)?;
        self.cache.discard(block);
        Ok(())
    }

    pub fn discard_prealloc(&mut self, prealloc: &mut PreallocCache) -> Result<()> {
        if prealloc.is_empty() {
            return Ok(());
        }
        ext2d_alloc::discard_prealloc(&mut self.alloc_ctx(), prealloc)
    }

    pub fn alloc_inode(&mut self, parent: Parent, is_dir: bool) -> Result<InodeAlloc> {
        self.ensure_writable()?;
        let Self {
            cache,
            sb,
            groups,
            meta_dirty,
            cursors,
            dir_policy,
            file_policy,
            ..
        } = self;
        let mut ctx = AllocCtx {
            cache,
            sb,
            groups,
            meta_dirty,
            cursors,
        };
        let policy = if is_dir { dir_policy } else { file_policy };
        ext2d_alloc::alloc_inode(&mut ctx, policy.as_mut(), parent, is_dir)
    }

    pub fn free_inode(&mut self, ino: InodeNumber, is_dir: bool) -> Result<()> {
        self.ensure_writable()?;
        ext2d_alloc::free_inode(&mut self.alloc_ctx(), ino, is_dir)
    }

    // ── On-disk inode records ───────────────────────────────────────────────

    /// Inode-table block and in-block byte offset of `ino`'s record.
    fn inode_location(&self, ino: InodeNumber) -> Result<(BlockNumber, usize)> {
        if ino.0 == 0 || ino.0 > self.sb.inodes_count {
            return Err(Ext2Error::corruption(
                0,
                format!("inode {} outside 1..={}", ino.0, self.sb.inodes_count),
            ));
        }
        let idx = ino.0 - 1;
        let group = GroupNumber(idx / self.sb.inodes_per_group);
        let slot = idx % self.sb.inodes_per_group;
        let table = self.group_desc(group)?.inode_table;
        let per_block = self.sb.inodes_per_block();
        let block = BlockNumber(table.0 + slot / per_block);
        let offset = (slot % per_block) as usize * usize::from(self.sb.inode_size);
        Ok((block, offset))
    }

    pub fn read_raw_inode(&mut self, ino: InodeNumber) -> Result<RawInode> {
        let (block, offset) = self.inode_location(ino)?;
        let buf = self
            .cache
            .get(block, ext2d_block::FetchMode::Normal)?
            .ok_or_else(|| Ext2Error::corruption(u64::from(block.0), "inode table fetch failed"))?;
        RawInode::parse_from_bytes(&buf.as_slice()[offset..offset + 128])
            .map_err(|e| parse_to_ext2(&e))
    }

    pub fn write_raw_inode(&mut self, ino: InodeNumber, raw: &RawInode) -> Result<()> {
        let (block, offset) = self.inode_location(ino)?;
        let mut buf = self
            .cache
            .get(block, ext2d_block::FetchMode::Normal)?
            .ok_or_else(|| Ext2Error::corruption(u64::from(block.0), "inode table fetch failed"))?
            .into_inner();
        raw.encode_into(&mut buf[offset..offset + 128]);
        self.cache.write(block, &buf)
    }

    // ── Flush ───────────────────────────────────────────────────────────────

    /// Rewrite the superblock, the descriptor table when dirty, then flush
    /// the block cache. An I/O failure here is treated as fatal by callers:
    /// the volume's on-disk accounting can no longer be trusted.
    pub fn flush(&mut self) -> Result<()> {
        let dev = self.cache.device();

        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        dev.read_exact_at(SUPERBLOCK_OFFSET, &mut region)?;
        self.sb.wtime = crate::now();
        self.sb.encode_into(&mut region);
        dev.write_all_at(SUPERBLOCK_OFFSET, &region)?;

        if self.meta_dirty {
            let bs = self.sb.block_size.get() as usize;
            let mut table = vec![0_u8; self.sb.gdt_blocks() as usize * bs];
            for (i, gd) in self.groups.iter().enumerate() {
                gd.encode_into(&mut table[i * GROUP_DESC_SIZE..(i + 1) * GROUP_DESC_SIZE]);
            }
            let offset = self.sb.block_size.block_to_byte(self.sb.gdt_start());
            dev.write_all_at(offset, &table)?;
            self.meta_dirty = false;
        }

        self.cache.flush()
    }
}

fn load_group_descs<D: ByteDevice>(
    cache: &mut BlockCache<D>,
    sb: &Superblock,
) -> Result<Vec<GroupDesc>> {
    let count = sb.groups_count() as usize;
    let per_block = sb.descs_per_block() as usize;
    let start = sb.gdt_start();
    let mut groups = Vec::with_capacity(count);
    for block_idx in 0..sb.gdt_blocks() {
        let block = BlockNumber(start.0 + block_idx);
        let buf = cache
            .get(block, ext2d_block::FetchMode::Normal)?
            .ok_or_else(|| Ext2Error::corruption(u64::from(block.0), "GDT fetch failed"))?;
        let bytes = buf.as_slice();
        for i in 0..per_block {
            if groups.len() == count {
                break;
            }
            let desc = GroupDesc::parse_from_bytes(&bytes[i * GROUP_DESC_SIZE..])
                .map_err(|e| parse_to_ext2(&e))?;
            groups.push(desc);
        }
    }
    Ok(groups)
}
