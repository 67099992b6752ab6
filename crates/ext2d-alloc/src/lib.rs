#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! Layered the same way as the on-disk format:
//!
//! 1. **Bitmap primitives** — raw bit manipulation on bitmap buffers.
//! 2. **Block allocator** — goal-directed placement with byte-granularity
//!    preallocation for sequential writers.
//! 3. **Inode allocator** — group placement behind [`PlacementPolicy`]
//!    (Orlov spread, parent-affinity hash, first-fit).
//!
//! All allocator entry points mutate the superblock counters and the group
//! descriptor they touch in the same call, so the per-group/filesystem
//! free-count invariant holds incrementally and is never re-derived. A block
//! or inode that would land inside a group's reserved system range is
//! reported as [`Ext2Error::Corruption`], never returned.

pub mod policy;

use ext2d_block::{BlockCache, ByteDevice, FetchMode};
use ext2d_error::{Ext2Error, Result};
use ext2d_ondisk::{GroupDesc, Superblock};
use ext2d_types::{BlockNumber, GroupNumber, InodeNumber, PREALLOC_BLOCKS};
use policy::PlacementPolicy;
use tracing::debug;

// ── Bitmap primitives ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap buffer.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte = (idx / 8) as usize;
    byte < bitmap.len() && (bitmap[byte] >> (idx % 8)) & 1 == 1
}

/// Set bit `idx` in a bitmap buffer.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte = (idx / 8) as usize;
    if byte < bitmap.len() {
        bitmap[byte] |= 1 << (idx % 8);
    }
}

/// Clear bit `idx` in a bitmap buffer.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte = (idx / 8) as usize;
    if byte < bitmap.len() {
        bitmap[byte] &= !(1 << (idx % 8));
    }
}

/// Count free (zero) bits among the first `count` bits.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full = (count / 8) as usize;
    let mut free: u32 = bitmap
        .iter()
        .take(full)
        .map(|b| b.count_zeros())
        .sum();
    for bit in (count / 8) * 8..count {
        if !bitmap_get(bitmap, bit) {
            free += 1;
        }
    }
    free
}

/// First free bit among the first `count` bits, searching from `start` and
/// wrapping around. Searching from the goal's byte keeps sequential files in
/// nearby bits.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    let start = if start >= count { 0 } else { start };
    (start..count)
        .chain(0..start)
        .find(|&idx| !bitmap_get(bitmap, idx))
}

/// First fully-free aligned byte (8 contiguous bits) among the first `count`
/// bits, searching from the byte containing `start` and wrapping.
#[must_use]
pub fn bitmap_find_free_byte(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    let whole_bytes = count / 8;
    if whole_bytes == 0 {
        return None;
    }
    let first = (start / 8).min(whole_bytes - 1);
    (first..whole_bytes)
        .chain(0..first)
        .find(|&byte| bitmap.get(byte as usize) == Some(&0))
        .map(|byte| byte * 8)
}

// ── Allocator context ───────────────────────────────────────────────────────

/// In-core allocation cursors. These never hit the disk; they only bias
/// where the next search starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cursors {
    /// Next block search origin; lowered on every free below it.
    pub next_block: u32,
    /// First group believed to hold a free inode.
    pub next_inode_group: u32,
}

/// Borrowed view of the volume metadata the allocators mutate.
///
/// The owning context assembles one of these per call; the borrow split
/// keeps the allocator free functions independent of the context type.
pub struct AllocCtx<'a, D: ByteDevice> {
    pub cache: &'a mut BlockCache<D>,
    pub sb: &'a mut Superblock,
    pub groups: &'a mut [GroupDesc],
    /// Set whenever a group descriptor changes; the superblock manager
    /// rewrites the whole descriptor table on flush when set.
    pub meta_dirty: &'a mut bool,
    pub cursors: &'a mut Cursors,
}

impl<D: ByteDevice> AllocCtx<'_, D> {
    fn group_desc(&self, group: GroupNumber) -> Result<&GroupDesc> {
        self.groups.get(group.0 as usize).ok_or_else(|| {
            Ext2Error::corruption(
                0,
                format!("group {} past group count {}", group.0, self.groups.len()),
            )
        })
    }

    /// Blocks in `group`; the last group may be short.
    fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let start = u64::from(self.sb.first_data_block)
            + u64::from(group.0) * u64::from(self.sb.blocks_per_group);
        let remaining = u64::from(self.sb.blocks_count).saturating_sub(start);
        u32::try_from(remaining.min(u64::from(self.sb.blocks_per_group))).unwrap_or(0)
    }

    fn inodes_in_group(&self, group: GroupNumber) -> u32 {
        let start = u64::from(group.0) * u64::from(self.sb.inodes_per_group);
        let remaining = u64::from(self.sb.inodes_count).saturating_sub(start);
        u32::try_from(remaining.min(u64::from(self.sb.inodes_per_group))).unwrap_or(0)
    }

    fn abs_block(&self, group: GroupNumber, rel: u32) -> BlockNumber {
        BlockNumber(self.sb.first_data_block + group.0 * self.sb.blocks_per_group + rel)
    }

    fn split_block(&self, block: BlockNumber) -> Result<(GroupNumber, u32)> {
        if block.0 < self.sb.first_data_block || block.0 >= self.sb.blocks_count {
            return Err(Ext2Error::corruption(
                u64::from(block.0),
                "block outside the data area",
            ));
        }
        let rel = block.0 - self.sb.first_data_block;
        Ok((
            GroupNumber(rel / self.sb.blocks_per_group),
            rel % self.sb.blocks_per_group,
        ))
    }

    /// Whether `block` is one of `group`'s reserved system blocks: its block
    /// bitmap, inode bitmap, or part of the inode table span.
    fn is_reserved(&self, group: GroupNumber, block: BlockNumber) -> Result<bool> {
        let itable_blocks = self.sb.inode_table_blocks();
        let gd = self.group_desc(group)?;
        Ok(block == gd.block_bitmap
            || block == gd.inode_bitmap
            || (block.0 >= gd.inode_table.0 && block.0 < gd.inode_table.0 + itable_blocks))
    }
}

// ── Preallocation ───────────────────────────────────────────────────────────

/// Per-inode cache of speculatively reserved contiguous blocks.
///
/// Holds at most `PREALLOC_BLOCKS - 1` entries: the byte-granularity
/// reservation returns its first bit to the caller and caches the rest.
/// The cached blocks are already marked in the bitmap and counted as used;
/// consuming one is free, discarding returns them through [`free_block`].
#[derive(Debug, Clone, Default)]
pub struct PreallocCache {
    slots: [u32; PREALLOC_BLOCKS],
    head: u8,
    len: u8,
}

impl PreallocCache {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    #[must_use]
    pub fn head(&self) -> Option<BlockNumber> {
        (self.len > 0).then(|| BlockNumber(self.slots[usize::from(self.head)]))
    }

    fn take_head(&mut self) -> Option<BlockNumber> {
        let block = self.head()?;
        self.head += 1;
        self.len -= 1;
        if self.len == 0 {
            self.head = 0;
        }
        Some(block)
    }

    fn refill(&mut self, blocks: &[u32]) {
        debug_assert!(self.len == 0 && blocks.len() < PREALLOC_BLOCKS);
        self.head = 0;
        self.len = blocks.len() as u8;
        self.slots[..blocks.len()].copy_from_slice(blocks);
    }

    fn drain(&mut self) -> Vec<BlockNumber> {
        let out = (0..self.len)
            .map(|i| BlockNumber(self.slots[usize::from(self.head + i)]))
            .collect();
        self.head = 0;
        self.len = 0;
        out
    }
}

/// Return every cached preallocated block to the bitmap. Called whenever an
/// inode leaves active use or its write pattern stops being sequential.
pub fn discard_prealloc<D: ByteDevice>(
    ctx: &mut AllocCtx<'_, D>,
    prealloc: &mut PreallocCache,
) -> Result<()> {
    for block in prealloc.drain() {
        free_block(ctx, block)?;
    }
    Ok(())
}

// ── Block allocator ─────────────────────────────────────────────────────────

fn space_exhausted(sb: &Superblock, privileged: bool) -> bool {
    sb.free_blocks_count == 0
        || (!privileged && sb.free_blocks_count <= sb.reserved_blocks_count)
}

/// Allocate one block, preferring `goal` for sequential locality.
///
/// `prealloc_enabled` reflects the inode's preallocation eligibility
/// (regular files with the feature not disabled); `privileged` grants access
/// to the reserved-block watermark.
pub fn alloc_block<D: ByteDevice>(
    ctx: &mut AllocCtx<'_, D>,
    prealloc: &mut PreallocCache,
    prealloc_enabled: bool,
    goal: Option<BlockNumber>,
    privileged: bool,
) -> Result<BlockNumber> {
    // Reclaim margin from our own preallocation before refusing.
    if space_exhausted(ctx.sb, privileged)
        || u64::from(ctx.sb.free_blocks_count) < PREALLOC_BLOCKS as u64
    {
        discard_prealloc(ctx, prealloc)?;
    }
    if space_exhausted(ctx.sb, privileged) {
        return Err(Ext2Error::NoSpace);
    }

    // Sequential fast path: a goal matching the preallocation head consumes
    // the cached block without touching the bitmap. A mismatching goal means
    // this inode stopped writing sequentially; drop the whole cache.
    if let Some(goal) = goal {
        if let Some(head) = prealloc.head() {
            if head.0 == goal.0 || head.0 == goal.0 + 1 {
                let block = prealloc.take_head().unwrap_or(head);
                ctx.cursors.next_block = block.0;
                return Ok(block);
            }
            discard_prealloc(ctx, prealloc)?;
        }
    }

    let (start_group, start_bit) = match goal {
        Some(goal) if goal.0 >= ctx.sb.first_data_block && goal.0 < ctx.sb.blocks_count => {
            ctx.split_block(goal)?
        }
        _ => ctx.split_block(BlockNumber(
            ctx.cursors
                .next_block
                .clamp(ctx.sb.first_data_block, ctx.sb.blocks_count - 1),
        ))?,
    };

    let group_count = ctx.groups.len() as u32;
    for step in 0..group_count {
        let group = GroupNumber((start_group.0 + step) % group_count);
        let gd = *ctx.group_desc(group)?;
        if gd.free_blocks_count == 0 {
            continue;
        }
        // Only the goal group gets the goal's bit offset; round-robin
        // candidates start from the front.
        let bit_hint = if group == start_group { start_bit } else { 0 };
        if let Some(block) =
            alloc_in_group(ctx, prealloc, prealloc_enabled, group, bit_hint)?
        {
            ctx.cursors.next_block = block.0;
            return Ok(block);
        }
    }

    Err(Ext2Error::NoSpace)
}

/// Try to allocate within one group: a whole aligned byte when preallocation
/// applies and the group is comfortably free, otherwise a single bit near
/// `bit_hint`.
fn alloc_in_group<D: ByteDevice>(
    ctx: &mut AllocCtx<'_, D>,
    prealloc: &mut PreallocCache,
    prealloc_enabled: bool,
    group: GroupNumber,
    bit_hint: u32,
) -> Result<Option<BlockNumber>> {
    let gd = *ctx.group_desc(group)?;
    let bits = ctx.blocks_in_group(group);
    let bitmap_block = gd.block_bitmap;
    let buf = ctx
        .cache
        .get(bitmap_block, FetchMode::Normal)?
        .ok_or_else(|| Ext2Error::corruption(u64::from(bitmap_block.0), "bitmap fetch failed"))?;
    let mut bitmap = buf.into_inner();

    let want_byte = prealloc_enabled
        && prealloc.is_empty()
        && u32::from(gd.free_blocks_count) >= 4 * PREALLOC_BLOCKS as u32;

    if want_byte {
        if let Some(first_bit) = bitmap_find_free_byte(&bitmap, bits, bit_hint) {
            for bit in first_bit..first_bit + 8 {
                bitmap_set(&mut bitmap, bit);
            }
            // Check the whole byte against the reserved ranges before any of
            // it can reach a caller, now or later via the cache.
            for bit in first_bit..first_bit + 8 {
                let abs = ctx.abs_block(group, bit);
                if ctx.is_reserved(group, abs)? {
                    return Err(Ext2Error::corruption(
                        u64::from(abs.0),
                        "allocator selected a reserved system block",
                    ));
                }
            }
            ctx.cache.write(bitmap_block, &bitmap)?;
            let gd = &mut ctx.groups[group.0 as usize];
            gd.free_blocks_count -= 8;
            ctx.sb.free_blocks_count -= 8;
            *ctx.meta_dirty = true;

            let rest: Vec<u32> = (first_bit + 1..first_bit + 8)
                .map(|bit| ctx.abs_block(group, bit).0)
                .collect();
            let first = ctx.abs_block(group, first_bit);
            prealloc.refill(&rest);
            debug!(group = group.0, block = first.0, "preallocated byte");
            return Ok(Some(first));
        }
    }

    let Some(bit) = bitmap_find_free(&bitmap, bits, bit_hint) else {
        return Ok(None);
    };
    let abs = ctx.abs_block(group, bit);
    if ctx.is_reserved(group, abs)? {
        return Err(Ext2Error::corruption(
            u64::from(abs.0),
            "allocator selected a reserved system block",
        ));
    }
    bitmap_set(&mut bitmap, bit);
    ctx.cache.write(bitmap_block, &bitmap)?;
    let gd = &mut ctx.groups[group.0 as usize];
    gd.free_blocks_count -= 1;
    ctx.sb.free_blocks_count -= 1;
    *ctx.meta_dirty = true;
    Ok(Some(abs))
}

/// Return `block` to its group's bitmap.
pub fn free_block<D: ByteDevice>(ctx: &mut AllocCtx<'_, D>, block: BlockNumber) -> Result<()> {
    let (group, bit) = ctx.split_block(block)?;
    if ctx.is_reserved(group, block)? {
        return Err(Ext2Error::corruption(
            u64::from(block.0),
            "attempt to free a reserved system block",
        ));
    }
    let bitmap_block = ctx.group_desc(group)?.block_bitmap;
    let buf = ctx
        .cache
        .get(bitmap_block, FetchMode::Normal)?
        .ok_or_else(|| Ext2Error::corruption(u64::from(bitmap_block.0), "bitmap fetch failed"))?;
    let mut bitmap = buf.into_inner();
    if !bitmap_get(&bitmap, bit) {
        return Err(Ext2Error::corruption(
            u64::from(block.0),
            "freeing a block whose bit is already clear",
        ));
    }
    bitmap_clear(&mut bitmap, bit);
    ctx.cache.write(bitmap_block, &bitmap)?;

    ctx.groups[group.0 as usize].free_blocks_count += 1;
    ctx.sb.free_blocks_count += 1;
    *ctx.meta_dirty = true;
    if block.0 < ctx.cursors.next_block {
        ctx.cursors.next_block = block.0;
    }
    Ok(())
}

// ── Inode allocator ─────────────────────────────────────────────────────────

/// Result of an inode allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAlloc {
    pub ino: InodeNumber,
    pub group: GroupNumber,
}

/// Allocate an inode, placing it via `placement`.
pub fn alloc_inode<D: ByteDevice>(
    ctx: &mut AllocCtx<'_, D>,
    placement: &mut dyn PlacementPolicy,
    parent: policy::Parent,
    is_dir: bool,
) -> Result<InodeAlloc> {
    if ctx.sb.free_inodes_count == 0 {
        return Err(Ext2Error::NoSpace);
    }

    let view = policy::GroupView {
        sb: ctx.sb,
        groups: ctx.groups,
        cursors: ctx.cursors,
    };
    let group = placement
        .choose_group(&view, parent, is_dir)
        .ok_or(Ext2Error::NoSpace)?;

    let gd = *ctx.group_desc(group)?;
    if gd.free_inodes_count == 0 {
        // The policy contract requires a group with a free inode; a stale
        // counter here means the incremental invariant broke somewhere.
        return Err(Ext2Error::corruption(
            u64::from(gd.inode_bitmap.0),
            format!("policy chose group {} with no free inodes", group.0),
        ));
    }

    let bits = ctx.inodes_in_group(group);
    let buf = ctx
        .cache
        .get(gd.inode_bitmap, FetchMode::Normal)?
        .ok_or_else(|| {
            Ext2Error::corruption(u64::from(gd.inode_bitmap.0), "bitmap fetch failed")
        })?;
    let mut bitmap = buf.into_inner();
    let Some(bit) = bitmap_find_free(&bitmap, bits, 0) else {
        return Err(Ext2Error::corruption(
            u64::from(gd.inode_bitmap.0),
            format!("group {} free-inode count disagrees with its bitmap", group.0),
        ));
    };

    let ino = InodeNumber(group.0 * ctx.sb.inodes_per_group + bit + 1);
    if ino.0 < ctx.sb.first_ino && ino.0 != ext2d_types::ROOT_INO {
        return Err(Ext2Error::corruption(
            u64::from(gd.inode_bitmap.0),
            format!("allocator selected reserved inode {}", ino.0),
        ));
    }

    bitmap_set(&mut bitmap, bit);
    ctx.cache.write(gd.inode_bitmap, &bitmap)?;

    let gd = &mut ctx.groups[group.0 as usize];
    gd.free_inodes_count -= 1;
    ctx.sb.free_inodes_count -= 1;
    if is_dir {
        gd.used_dirs_count += 1;
    }
    *ctx.meta_dirty = true;
    if gd.free_inodes_count == 0 && ctx.cursors.next_inode_group == group.0 {
        // The cursor group just filled up; first-fit resumes past it.
        ctx.cursors.next_inode_group = group.0 + 1;
    }
    debug!(ino = ino.0, group = group.0, is_dir, "allocated inode");
    Ok(InodeAlloc { ino, group })
}

/// Return `ino` to its group's bitmap. The exact inverse of [`alloc_inode`].
pub fn free_inode<D: ByteDevice>(
    ctx: &mut AllocCtx<'_, D>,
    ino: InodeNumber,
    is_dir: bool,
) -> Result<()> {
    let Some(idx) = ino.0.checked_sub(1) else {
        return Err(Ext2Error::corruption(0, "inode number 0 is invalid"));
    };
    let group = GroupNumber(idx / ctx.sb.inodes_per_group);
    let bit = idx % ctx.sb.inodes_per_group;
    let gd = *ctx.group_desc(group)?;

    let buf = ctx
        .cache
        .get(gd.inode_bitmap, FetchMode::Normal)?
        .ok_or_else(|| {
            Ext2Error::corruption(u64::from(gd.inode_bitmap.0), "bitmap fetch failed")
        })?;
    let mut bitmap = buf.into_inner();
    if !bitmap_get(&bitmap, bit) {
        return Err(Ext2Error::corruption(
            u64::from(gd.inode_bitmap.0),
            format!("freeing inode {} whose bit is already clear", ino.0),
        ));
    }
    bitmap_clear(&mut bitmap, bit);
    ctx.cache.write(gd.inode_bitmap, &bitmap)?;

    let gd = &mut ctx.groups[group.0 as usize];
    gd.free_inodes_count += 1;
    ctx.sb.free_inodes_count += 1;
    if is_dir {
        gd.used_dirs_count = gd.used_dirs_count.saturating_sub(1);
    }
    *ctx.meta_dirty = true;
    if group.0 < ctx.cursors.next_inode_group {
        ctx.cursors.next_inode_group = group.0;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
