use super::*;
use ext2d_block::MemByteDevice;
use ext2d_types::{BlockSize, EXT2_SUPER_MAGIC, ROOT_INO};
use policy::{FirstFit, Parent};

/// Two groups of 256 blocks each; per group the layout is
/// `[sb copy, gdt copy, block bitmap, inode bitmap, inode table x4]`,
/// i.e. relative blocks 0..8 are in use from the start.
struct Fx {
    cache: BlockCache<MemByteDevice>,
    sb: Superblock,
    groups: Vec<GroupDesc>,
    meta_dirty: bool,
    cursors: Cursors,
}

const BPG: u32 = 256;
const IPG: u32 = 32;

fn fixture() -> Fx {
    let blocks_count = 1 + 2 * BPG;
    let dev = MemByteDevice::new((blocks_count as usize) * 1024);
    let mut cache = BlockCache::new(dev, 1024, 64).unwrap();

    let sb = Superblock {
        inodes_count: 2 * IPG,
        blocks_count,
        reserved_blocks_count: 0,
        free_blocks_count: 2 * (BPG - 8),
        free_inodes_count: 2 * IPG - 10,
        first_data_block: 1,
        block_size: BlockSize::new(1024).unwrap(),
        blocks_per_group: BPG,
        inodes_per_group: IPG,
        mtime: 0,
        wtime: 0,
        mnt_count: 0,
        max_mnt_count: 0,
        magic: EXT2_SUPER_MAGIC,
        state: 1,
        errors: 1,
        rev_level: 1,
        first_ino: 11,
        inode_size: 128,
        feature_compat: Default::default(),
        feature_incompat: Default::default(),
        feature_ro_compat: Default::default(),
        uuid: [0; 16],
        prealloc_blocks: 8,
        prealloc_dir_blocks: 0,
    };

    let mut groups = Vec::new();
    for g in 0..2_u32 {
        let start = 1 + g * BPG;
        groups.push(GroupDesc {
            block_bitmap: BlockNumber(start + 2),
            inode_bitmap: BlockNumber(start + 3),
            inode_table: BlockNumber(start + 4),
            free_blocks_count: (BPG - 8) as u16,
            free_inodes_count: if g == 0 { (IPG - 10) as u16 } else { IPG as u16 },
            used_dirs_count: if g == 0 { 1 } else { 0 },
        });

        // System blocks occupy the first byte of each group's block bitmap.
        let mut bitmap = vec![0_u8; 1024];
        for bit in 0..8 {
            bitmap_set(&mut bitmap, bit);
        }
        cache.write(BlockNumber(start + 2), &bitmap).unwrap();

        // Reserved inodes 1..=10 live in group 0.
        let mut ibitmap = vec![0_u8; 1024];
        if g == 0 {
            for bit in 0..10 {
                bitmap_set(&mut ibitmap, bit);
            }
        }
        cache.write(BlockNumber(start + 3), &ibitmap).unwrap();
    }

    Fx {
        cache,
        sb,
        groups,
        meta_dirty: false,
        cursors: Cursors {
            next_block: 1,
            next_inode_group: 0,
        },
    }
}

impl Fx {
    fn ctx(&mut self) -> AllocCtx<'_, MemByteDevice> {
        AllocCtx {
            cache: &mut self.cache,
            sb: &mut self.sb,
            groups: &mut self.groups,
            meta_dirty: &mut self.meta_dirty,
            cursors: &mut self.cursors,
        }
    }

    fn assert_count_invariant(&self) {
        let sum_blocks: u32 = self
            .groups
            .iter()
            .map(|g| u32::from(g.free_blocks_count))
            .sum();
        let sum_inodes: u32 = self
            .groups
            .iter()
            .map(|g| u32::from(g.free_inodes_count))
            .sum();
        assert_eq!(sum_blocks, self.sb.free_blocks_count);
        assert_eq!(sum_inodes, self.sb.free_inodes_count);
    }
}

#[test]
fn bitmap_primitives() {
    let mut bm = vec![0_u8; 4];
    assert_eq!(bitmap_count_free(&bm, 32), 32);
    bitmap_set(&mut bm, 9);
    assert!(bitmap_get(&bm, 9));
    assert_eq!(bitmap_count_free(&bm, 32), 31);
    assert_eq!(bitmap_find_free(&bm, 32, 9), Some(10));
    // Wrap-around search.
    for bit in 10..32 {
        bitmap_set(&mut bm, bit);
    }
    assert_eq!(bitmap_find_free(&bm, 32, 12), Some(0));
    bitmap_clear(&mut bm, 9);
    assert!(!bitmap_get(&bm, 9));
    // Byte search skips partially used bytes.
    assert_eq!(bitmap_find_free_byte(&bm, 32, 0), Some(0));
    bitmap_set(&mut bm, 3);
    // Every byte now has at least one used bit.
    assert_eq!(bitmap_find_free_byte(&bm, 32, 0), None);
    for bit in 10..16 {
        bitmap_clear(&mut bm, bit);
    }
    assert_eq!(bitmap_find_free_byte(&bm, 32, 0), Some(8));
}

#[test]
fn single_block_alloc_and_free_round_trip() {
    let mut fx = fixture();
    let mut prealloc = PreallocCache::default();
    let block = alloc_block(&mut fx.ctx(), &mut prealloc, false, None, false).unwrap();
    // First data block after the system area of group 0.
    assert_eq!(block, BlockNumber(9));
    assert!(prealloc.is_empty());
    assert_eq!(fx.sb.free_blocks_count, 2 * (BPG - 8) - 1);
    fx.assert_count_invariant();
    assert!(fx.meta_dirty);

    free_block(&mut fx.ctx(), block).unwrap();
    assert_eq!(fx.sb.free_blocks_count, 2 * (BPG - 8));
    fx.assert_count_invariant();
}

#[test]
fn preallocation_reserves_a_byte_and_feeds_sequential_goals() {
    let mut fx = fixture();
    let mut prealloc = PreallocCache::default();
    let first = alloc_block(&mut fx.ctx(), &mut prealloc, true, None, false).unwrap();
    assert_eq!(first, BlockNumber(9));
    assert_eq!(prealloc.len(), PREALLOC_BLOCKS - 1);
    // The whole byte is accounted at once.
    assert_eq!(fx.sb.free_blocks_count, 2 * (BPG - 8) - 8);
    fx.assert_count_invariant();

    // Sequential writer: goal = previously allocated block.
    let mut prev = first;
    for expected in 10..=16_u32 {
        let b = alloc_block(&mut fx.ctx(), &mut prealloc, true, Some(prev), false).unwrap();
        assert_eq!(b, BlockNumber(expected));
        prev = b;
    }
    assert!(prealloc.is_empty());
    // Consumption cost nothing: counts unchanged since the byte grab.
    assert_eq!(fx.sb.free_blocks_count, 2 * (BPG - 8) - 8);
    fx.assert_count_invariant();
}

#[test]
fn prealloc_cache_never_exceeds_bound() {
    let mut fx = fixture();
    let mut prealloc = PreallocCache::default();
    let mut prev = alloc_block(&mut fx.ctx(), &mut prealloc, true, None, false).unwrap();
    for _ in 0..40 {
        assert!(prealloc.len() <= PREALLOC_BLOCKS - 1);
        prev = alloc_block(&mut fx.ctx(), &mut prealloc, true, Some(prev), false).unwrap();
    }
}

#[test]
fn goal_mismatch_invalidates_the_cache() {
    let mut fx = fixture();
    let mut prealloc = PreallocCache::default();
    let _ = alloc_block(&mut fx.ctx(), &mut prealloc, true, None, false).unwrap();
    assert_eq!(prealloc.len(), 7);
    let after_byte = fx.sb.free_blocks_count;

    // Jump to an unrelated goal: cached blocks go back to the bitmap and a
    // fresh search runs.
    let far_goal = BlockNumber(1 + BPG + 50);
    let b = alloc_block(&mut fx.ctx(), &mut prealloc, false, Some(far_goal), false).unwrap();
    assert_eq!(b, far_goal);
    // 7 returned, 1 newly taken.
    assert_eq!(fx.sb.free_blocks_count, after_byte + 7 - 1);
    fx.assert_count_invariant();
}

#[test]
fn discard_returns_every_cached_block() {
    let mut fx = fixture();
    let mut prealloc = PreallocCache::default();
    let _ = alloc_block(&mut fx.ctx(), &mut prealloc, true, None, false).unwrap();
    let before = fx.sb.free_blocks_count;
    discard_prealloc(&mut fx.ctx(), &mut prealloc).unwrap();
    assert!(prealloc.is_empty());
    assert_eq!(fx.sb.free_blocks_count, before + 7);
    fx.assert_count_invariant();
}

#[test]
fn reserved_watermark_refuses_unprivileged_callers() {
    let mut fx = fixture();
    fx.sb.reserved_blocks_count = fx.sb.free_blocks_count;
    let mut prealloc = PreallocCache::default();
    assert!(matches!(
        alloc_block(&mut fx.ctx(), &mut prealloc, false, None, false),
        Err(Ext2Error::NoSpace)
    ));
    // A privileged caller may dip into the reserve.
    assert!(alloc_block(&mut fx.ctx(), &mut prealloc, false, None, true).is_ok());
}

#[test]
fn exhaustion_returns_no_space() {
    let mut fx = fixture();
    fx.sb.free_blocks_count = 0;
    for gd in &mut fx.groups {
        gd.free_blocks_count = 0;
    }
    let mut prealloc = PreallocCache::default();
    assert!(matches!(
        alloc_block(&mut fx.ctx(), &mut prealloc, false, None, false),
        Err(Ext2Error::NoSpace)
    ));
}

#[test]
fn double_free_is_fatal() {
    let mut fx = fixture();
    let mut prealloc = PreallocCache::default();
    let block = alloc_block(&mut fx.ctx(), &mut prealloc, false, None, false).unwrap();
    free_block(&mut fx.ctx(), block).unwrap();
    let err = free_block(&mut fx.ctx(), block).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn freeing_a_system_block_is_fatal() {
    let mut fx = fixture();
    let bitmap_block = fx.groups[0].block_bitmap;
    let err = free_block(&mut fx.ctx(), bitmap_block).unwrap_err();
    assert!(err.is_fatal());
    // Inode table span too.
    let itable_mid = BlockNumber(fx.groups[1].inode_table.0 + 2);
    assert!(free_block(&mut fx.ctx(), itable_mid).unwrap_err().is_fatal());
}

#[test]
fn block_outside_data_area_is_fatal() {
    let mut fx = fixture();
    assert!(free_block(&mut fx.ctx(), BlockNumber(0)).unwrap_err().is_fatal());
    let past_end = BlockNumber(fx.sb.blocks_count);
    assert!(free_block(&mut fx.ctx(), past_end).unwrap_err().is_fatal());
}

#[test]
fn inode_alloc_skips_reserved_numbers() {
    let mut fx = fixture();
    let mut policy = FirstFit;
    let parent = Parent {
        group: GroupNumber(0),
        ino: InodeNumber(ROOT_INO),
        is_topdir: true,
    };
    let alloc = alloc_inode(&mut fx.ctx(), &mut policy, parent, false).unwrap();
    assert_eq!(alloc.ino, InodeNumber(11));
    assert_eq!(alloc.group, GroupNumber(0));
    fx.assert_count_invariant();
}

#[test]
fn directory_alloc_updates_dir_counters() {
    let mut fx = fixture();
    let mut policy = FirstFit;
    let parent = Parent {
        group: GroupNumber(0),
        ino: InodeNumber(ROOT_INO),
        is_topdir: true,
    };
    let before = fx.groups[0].used_dirs_count;
    let alloc = alloc_inode(&mut fx.ctx(), &mut policy, parent, true).unwrap();
    assert_eq!(fx.groups[0].used_dirs_count, before + 1);

    free_inode(&mut fx.ctx(), alloc.ino, true).unwrap();
    assert_eq!(fx.groups[0].used_dirs_count, before);
    fx.assert_count_invariant();
}

#[test]
fn inode_double_free_is_fatal() {
    let mut fx = fixture();
    let mut policy = FirstFit;
    let parent = Parent {
        group: GroupNumber(0),
        ino: InodeNumber(ROOT_INO),
        is_topdir: false,
    };
    let alloc = alloc_inode(&mut fx.ctx(), &mut policy, parent, false).unwrap();
    free_inode(&mut fx.ctx(), alloc.ino, false).unwrap();
    assert!(free_inode(&mut fx.ctx(), alloc.ino, false)
        .unwrap_err()
        .is_fatal());
}

#[test]
fn inode_exhaustion_returns_no_space() {
    let mut fx = fixture();
    fx.sb.free_inodes_count = 0;
    let mut policy = FirstFit;
    let parent = Parent {
        group: GroupNumber(0),
        ino: InodeNumber(ROOT_INO),
        is_topdir: false,
    };
    assert!(matches!(
        alloc_inode(&mut fx.ctx(), &mut policy, parent, false),
        Err(Ext2Error::NoSpace)
    ));
}

#[test]
fn freeing_lowers_the_block_cursor() {
    let mut fx = fixture();
    let mut prealloc = PreallocCache::default();
    let a = alloc_block(&mut fx.ctx(), &mut prealloc, false, None, false).unwrap();
    let b = alloc_block(&mut fx.ctx(), &mut prealloc, false, Some(BlockNumber(a.0 + 1)), false)
        .unwrap();
    assert!(fx.cursors.next_block >= b.0);
    free_block(&mut fx.ctx(), a).unwrap();
    assert_eq!(fx.cursors.next_block, a.0);
}
