//! Logical-to-physical block translation.
//!
//! An inode addresses its data through 12 direct pointer slots, then one
//! single-, one double- and one triple-indirect tree. Per-level strides are
//! a function of the block size only, so the path through the trees is
//! computed arithmetically before any block is fetched. A zero pointer at
//! any level is a hole, distinct from an error.
//!
//! The write path ([`block_for_writing`]) allocates missing data and
//! indirect blocks; fresh indirect blocks are fetched zero-filled and never
//! read from the device. The read path gets advisory read-ahead
//! ([`prefetch_from`]) built on non-blocking cache peeks.

use crate::icache::Inode;
use crate::volume::Volume;
use ext2d_block::{ByteDevice, FetchMode};
use ext2d_error::{Ext2Error, Result};
use ext2d_ondisk::RawInode;
use ext2d_types::{
    BlockNumber, LogicalBlock, DIND_SLOT, IND_SLOT, NDIR_BLOCKS, TIND_SLOT,
};
use tracing::trace;

/// Result of resolving a logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// No block allocated; reads see zeroes.
    Hole,
    Block(BlockNumber),
}

/// Pointer path to one logical block: the inode slot, then an index per
/// indirect level.
#[derive(Debug, Clone, Copy)]
struct PtrPath {
    slot: usize,
    indices: [usize; 3],
    depth: usize,
}

fn path_for(apb: u32, lblock: u32) -> Result<PtrPath> {
    let apb = apb as u64;
    let mut l = u64::from(lblock);
    if l < NDIR_BLOCKS as u64 {
        return Ok(PtrPath {
            slot: lblock as usize,
            indices: [0; 3],
            depth: 0,
        });
    }
    l -= NDIR_BLOCKS as u64;
    if l < apb {
        return Ok(PtrPath {
            slot: IND_SLOT,
            indices: [l as usize, 0, 0],
            depth: 1,
        });
    }
    l -= apb;
    if l < apb * apb {
        return Ok(PtrPath {
            slot: DIND_SLOT,
            indices: [(l / apb) as usize, (l % apb) as usize, 0],
            depth: 2,
        });
    }
    l -= apb * apb;
    if l < apb * apb * apb {
        return Ok(PtrPath {
            slot: TIND_SLOT,
            indices: [
                (l / (apb * apb)) as usize,
                ((l / apb) % apb) as usize,
                (l % apb) as usize,
            ],
            depth: 3,
        });
    }
    Err(Ext2Error::FileTooBig)
}

fn ptr_at(block: &[u8], index: usize) -> Result<u32> {
    ext2d_types::read_le_u32(block, index * 4)
        .map_err(|_| Ext2Error::corruption(0, format!("indirect index {index} out of block")))
}

/// Map a logical block to its physical block, or a hole.
pub fn resolve<D: ByteDevice>(
    vol: &mut Volume<D>,
    raw: &RawInode,
    lblock: LogicalBlock,
) -> Result<Mapping> {
    let path = path_for(vol.sb.block_size.addresses_per_block(), lblock.0)?;
    let mut ptr = raw.block[path.slot];
    for &index in &path.indices[..path.depth] {
        if ptr == 0 {
            return Ok(Mapping::Hole);
        }
        let buf = vol
            .cache
            .get(BlockNumber(ptr), FetchMode::Normal)?
            .ok_or_else(|| Ext2Error::corruption(u64::from(ptr), "indirect fetch failed"))?;
        ptr = ptr_at(buf.as_slice(), index)?;
    }
    Ok(if ptr == 0 {
        Mapping::Hole
    } else {
        Mapping::Block(BlockNumber(ptr))
    })
}

/// Like [`resolve`] but touches only resident blocks. `None` means an
/// indirect block on the path is absent and answering would cost I/O.
fn resolve_peek<D: ByteDevice>(
    vol: &mut Volume<D>,
    raw: &RawInode,
    lblock: LogicalBlock,
) -> Result<Option<Mapping>> {
    let path = path_for(vol.sb.block_size.addresses_per_block(), lblock.0)?;
    let mut ptr = raw.block[path.slot];
    for &index in &path.indices[..path.depth] {
        if ptr == 0 {
            return Ok(Some(Mapping::Hole));
        }
        let Some(buf) = vol.cache.get(BlockNumber(ptr), FetchMode::Peek)? else {
            return Ok(None);
        };
        ptr = ptr_at(buf.as_slice(), index)?;
    }
    Ok(Some(if ptr == 0 {
        Mapping::Hole
    } else {
        Mapping::Block(BlockNumber(ptr))
    }))
}

// ── Write path ──────────────────────────────────────────────────────────────

/// Where a block pointer lives: the inode's slot array or an indirect block.
type Container = Option<BlockNumber>;

fn read_ptr<D: ByteDevice>(
    vol: &mut Volume<D>,
    inode: &Inode,
    container: Container,
    index: usize,
) -> Result<u32> {
    match container {
        None => Ok(inode.raw.block[index]),
        Some(block) => {
            let buf = vol
                .cache
                .get(block, FetchMode::Normal)?
                .ok_or_else(|| {
                    Ext2Error::corruption(u64::from(block.0), "indirect fetch failed")
                })?;
            ptr_at(buf.as_slice(), index)
        }
    }
}

fn write_ptr<D: ByteDevice>(
    vol: &mut Volume<D>,
    inode: &mut Inode,
    container: Container,
    index: usize,
    value: u32,
) -> Result<()> {
    match container {
        None => {
            inode.raw.block[index] = value;
            inode.dirty = true;
            Ok(())
        }
        Some(block) => {
            let mut buf = vol
                .cache
                .get(block, FetchMode::Normal)?
                .ok_or_else(|| {
                    Ext2Error::corruption(u64::from(block.0), "indirect fetch failed")
                })?
                .into_inner();
            ext2d_types::write_le_u32(&mut buf, index * 4, value);
            vol.cache.write(block, &buf)
        }
    }
}

/// Allocation goal near an existing pointer: the previous sibling if it is
/// mapped, else the indirect block the pointer lives in, else the last
/// mapped direct slot.
fn goal_near<D: ByteDevice>(
    vol: &mut Volume<D>,
    inode: &Inode,
    container: Container,
    index: usize,
) -> Result<Option<BlockNumber>> {
    if index > 0 {
        let prev = read_ptr(vol, inode, container, index - 1)?;
        if prev != 0 {
            return Ok(Some(BlockNumber(prev)));
        }
    }
    if let Some(block) = container {
        return Ok(Some(block));
    }
    Ok(inode.raw.block[..index.min(NDIR_BLOCKS)]
        .iter()
        .rev()
        .find(|&&p| p != 0)
        .map(|&p| BlockNumber(p)))
}

/// Resolve `lblock` for writing, allocating the data block and any missing
/// indirect blocks. Returns the physical block and whether it is new
/// (zero-filled, safe to fetch `Fresh`).
pub fn block_for_writing<D: ByteDevice>(
    vol: &mut Volume<D>,
    inode: &mut Inode,
    lblock: LogicalBlock,
) -> Result<(BlockNumber, bool)> {
    let path = path_for(vol.sb.block_size.addresses_per_block(), lblock.0)?;
    let prealloc_ok = inode.raw.is_regular();
    let sectors = vol.sb.block_size.get() / 512;

    let mut container: Container = None;
    let mut index = path.slot;
    for &child_index in &path.indices[..path.depth] {
        let ptr = read_ptr(vol, inode, container, index)?;
        let block = if ptr == 0 {
            let goal = goal_near(vol, inode, container, index)?;
            let block = vol.alloc_block(&mut inode.prealloc, prealloc_ok, goal)?;
            // Instantiate the new indirect block as all holes; its on-disk
            // contents are garbage and must never be read.
            vol.cache.get(block, FetchMode::Fresh)?;
            write_ptr(vol, inode, container, index, block.0)?;
            inode.raw.blocks512 += sectors;
            inode.dirty = true;
            block
        } else {
            BlockNumber(ptr)
        };
        container = Some(block);
        index = child_index;
    }

    let ptr = read_ptr(vol, inode, container, index)?;
    if ptr != 0 {
        return Ok((BlockNumber(ptr), false));
    }
    let goal = goal_near(vol, inode, container, index)?;
    let block = vol.alloc_block(&mut inode.prealloc, prealloc_ok, goal)?;
    write_ptr(vol, inode, container, index, block.0)?;
    inode.raw.blocks512 += sectors;
    inode.dirty = true;
    Ok((block, true))
}

// ── Hole punching and truncation ────────────────────────────────────────────

/// A symlink short enough to live in the pointer area has no blocks at all.
fn is_fast_symlink(raw: &RawInode) -> bool {
    raw.is_symlink() && raw.blocks512 == 0
}

/// Free the data blocks whose logical indices fall in `[first, last)`,
/// releasing indirect blocks that end up empty. Returns how many blocks
/// (data plus indirect) went back to the bitmap.
fn punch_tree<D: ByteDevice>(
    vol: &mut Volume<D>,
    raw: &mut RawInode,
    first: u64,
    last: u64,
) -> Result<u64> {
    let apb = u64::from(vol.sb.block_size.addresses_per_block());
    let mut freed = 0_u64;

    for slot in 0..NDIR_BLOCKS {
        let l = slot as u64;
        if raw.block[slot] != 0 && l >= first && l < last {
            vol.free_block(BlockNumber(raw.block[slot]))?;
            raw.block[slot] = 0;
            freed += 1;
        }
    }

    let bases = [
        (IND_SLOT, NDIR_BLOCKS as u64, apb),
        (DIND_SLOT, NDIR_BLOCKS as u64 + apb, apb * apb),
        (TIND_SLOT, NDIR_BLOCKS as u64 + apb + apb * apb, apb * apb * apb),
    ];
    for (slot, base, span) in bases {
        let (ptr, sub_freed) =
            punch_subtree(vol, raw.block[slot], span / apb, base, first, last)?;
        freed += sub_freed;
        raw.block[slot] = ptr;
    }
    Ok(freed)
}

/// Punch one indirect subtree. `child_span` is the logical blocks each
/// child entry covers (1 for a leaf-level indirect block). Returns the new
/// pointer value (0 when the subtree block itself was freed) and the number
/// of blocks freed underneath.
fn punch_subtree<D: ByteDevice>(
    vol: &mut Volume<D>,
    ptr: u32,
    child_span: u64,
    base: u64,
    first: u64,
    last: u64,
) -> Result<(u32, u64)> {
    if ptr == 0 {
        return Ok((0, 0));
    }
    let apb = u64::from(vol.sb.block_size.addresses_per_block());
    let span = child_span * apb;
    if last <= base || first >= base + span {
        return Ok((ptr, 0));
    }

    let block = BlockNumber(ptr);
    let mut buf = vol
        .cache
        .get(block, FetchMode::Normal)?
        .ok_or_else(|| Ext2Error::corruption(u64::from(ptr), "indirect fetch failed"))?
        .into_inner();

    let mut freed = 0_u64;
    let mut changed = false;
    let mut live = false;
    for index in 0..apb as usize {
        let child_base = base + index as u64 * child_span;
        let child = ptr_at(&buf, index)?;
        if child == 0 {
            continue;
        }
        let new_child = if child_span == 1 {
            if child_base >= first && child_base < last {
                vol.free_block(BlockNumber(child))?;
                freed += 1;
                0
            } else {
                child
            }
        } else {
            let (new_child, sub_freed) =
                punch_subtree(vol, child, child_span / apb, child_base, first, last)?;
            freed += sub_freed;
            new_child
        };
        if new_child != child {
            ext2d_types::write_le_u32(&mut buf, index * 4, new_child);
            changed = true;
        }
        if new_child != 0 {
            live = true;
        }
    }

    if !live {
        // Every pointer under this block is gone; release the block itself.
        vol.free_block(block)?;
        return Ok((0, freed + 1));
    }
    if changed {
        vol.cache.write(block, &buf)?;
    }
    Ok((ptr, freed))
}

/// Punch a byte hole: free blocks strictly inside `[start, end)`, zero the
/// partial boundary blocks in place, never allocate. File size does not
/// change.
pub fn punch_hole<D: ByteDevice>(
    vol: &mut Volume<D>,
    inode: &mut Inode,
    start: u64,
    end: u64,
) -> Result<()> {
    if is_fast_symlink(&inode.raw) || start >= end {
        return Ok(());
    }
    let bs = u64::from(vol.sb.block_size.get());
    let size = inode.size();
    let end = end.min(size);
    if start >= end {
        return Ok(());
    }

    // Zero the partial head block in place.
    if start % bs != 0 {
        let head_end = (start / bs + 1) * bs;
        zero_range(vol, inode, start, end.min(head_end))?;
    }
    // Zero the partial tail block unless the head pass already covered it.
    if end % bs != 0 && (start % bs == 0 || end / bs != start / bs) {
        zero_range(vol, inode, (end / bs) * bs, end)?;
    }

    let first = start.div_ceil(bs);
    let last = end / bs;
    if first < last {
        let freed = punch_tree(vol, &mut inode.raw, first, last)?;
        let sectors = vol.sb.block_size.get() / 512;
        inode.raw.blocks512 = inode
            .raw
            .blocks512
            .saturating_sub(u32::try_from(freed).unwrap_or(u32::MAX).saturating_mul(sectors));
        trace!(ino = inode.ino.0, first, last, freed, "hole punched");
    }
    inode.dirty = true;
    Ok(())
}

fn zero_range<D: ByteDevice>(
    vol: &mut Volume<D>,
    inode: &mut Inode,
    start: u64,
    end: u64,
) -> Result<()> {
    let bs = u64::from(vol.sb.block_size.get());
    let lblock = LogicalBlock(u32::try_from(start / bs).map_err(|_| Ext2Error::FileTooBig)?);
    let Mapping::Block(block) = resolve(vol, &inode.raw, lblock)? else {
        return Ok(());
    };
    let mut buf = vol
        .cache
        .get(block, FetchMode::Normal)?
        .ok_or_else(|| Ext2Error::corruption(u64::from(block.0), "data fetch failed"))?
        .into_inner();
    let from = (start % bs) as usize;
    let to = from + (end - start) as usize;
    buf[from..to].fill(0);
    vol.cache.write(block, &buf)
}

/// Shrink (or sparsely grow) the file to `new_size` bytes, freeing every
/// block past the new end. The partial final block keeps its bytes.
pub fn truncate_to<D: ByteDevice>(
    vol: &mut Volume<D>,
    inode: &mut Inode,
    new_size: u64,
) -> Result<()> {
    let old_size = inode.size();
    if is_fast_symlink(&inode.raw) {
        if new_size == 0 {
            inode.raw.block = [0; ext2d_types::N_BLOCK_SLOTS];
        }
        inode.raw.size = u32::try_from(new_size.min(old_size)).unwrap_or(inode.raw.size);
        inode.dirty = true;
        return Ok(());
    }
    if new_size < old_size {
        let bs = u64::from(vol.sb.block_size.get());
        let first = new_size.div_ceil(bs);
        let last = old_size.div_ceil(bs);
        if first < last {
            let freed = punch_tree(vol, &mut inode.raw, first, last)?;
            let sectors = vol.sb.block_size.get() / 512;
            inode.raw.blocks512 = inode.raw.blocks512.saturating_sub(
                u32::try_from(freed).unwrap_or(u32::MAX).saturating_mul(sectors),
            );
        }
        // Zero the tail of the partial final block so later growth reads
        // zeroes, not stale bytes.
        if new_size % bs != 0 {
            zero_range(vol, inode, new_size, first * bs)?;
        }
    }
    inode.raw.size = u32::try_from(new_size).map_err(|_| Ext2Error::FileTooBig)?;
    inode.dirty = true;
    Ok(())
}

// ── Read-ahead ──────────────────────────────────────────────────────────────

/// Minimum read-ahead window, in blocks.
const READ_AHEAD_MIN: u32 = 8;

/// Advisory read-ahead starting at `from`: translate a window of upcoming
/// logical blocks using only resident metadata, stop at the first block
/// that is already cached, and batch-prefetch the rest. Failure here only
/// costs performance; the read path logs the error and carries on with
/// demand fetches.
pub fn prefetch_from<D: ByteDevice>(
    vol: &mut Volume<D>,
    raw: &RawInode,
    from: LogicalBlock,
) -> Result<()> {
    let bs = u64::from(vol.sb.block_size.get());
    let file_blocks = u64::from(raw.size).div_ceil(bs);
    let file_blocks = u32::try_from(file_blocks).unwrap_or(u32::MAX);
    if from.0 >= file_blocks {
        return Ok(());
    }

    let mut window = READ_AHEAD_MIN;
    // A window about to cross into the single-indirect range gets extended
    // so the crossing itself is covered.
    let ndir = NDIR_BLOCKS as u32;
    if from.0 < ndir && from.0 + window >= ndir {
        window += READ_AHEAD_MIN;
    }
    let end = from.0.saturating_add(window).min(file_blocks);

    let mut targets = Vec::new();
    for l in from.0..end {
        match resolve_peek(vol, raw, LogicalBlock(l))? {
            // Translation would block on an absent indirect block.
            None => break,
            Some(Mapping::Hole) => continue,
            Some(Mapping::Block(block)) => {
                if vol.cache.is_resident(block) {
                    break;
                }
                targets.push(block);
            }
        }
    }
    if !targets.is_empty() {
        trace!(from = from.0, count = targets.len(), "read-ahead");
        vol.cache.prefetch(&targets)?;
    }
    Ok(())
}
