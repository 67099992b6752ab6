//! Inode group placement policies.
//!
//! The policy is chosen once at mount and handed to [`crate::alloc_inode`]
//! as a trait object; the allocator itself contains no strategy flags.

use ext2d_ondisk::{GroupDesc, Superblock};
use ext2d_types::{GroupNumber, InodeNumber};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::Cursors;

/// What the policies may inspect: group statistics and the search cursors.
pub struct GroupView<'a> {
    pub sb: &'a Superblock,
    pub groups: &'a [GroupDesc],
    pub cursors: &'a Cursors,
}

impl GroupView<'_> {
    #[must_use]
    pub fn group_count(&self) -> u32 {
        self.groups.len() as u32
    }

    #[must_use]
    pub fn avg_free_inodes(&self) -> u32 {
        if self.groups.is_empty() {
            return 0;
        }
        self.sb.free_inodes_count / self.group_count()
    }

    #[must_use]
    pub fn avg_free_blocks(&self) -> u32 {
        if self.groups.is_empty() {
            return 0;
        }
        u32::try_from(u64::from(self.sb.free_blocks_count) / u64::from(self.group_count()))
            .unwrap_or(u32::MAX)
    }

    fn any_with_free_inode(&self, start: u32) -> Option<GroupNumber> {
        let n = self.group_count();
        let start = if n == 0 { return None } else { start % n };
        (start..n)
            .chain(0..start)
            .find(|&g| self.groups[g as usize].free_inodes_count > 0)
            .map(GroupNumber)
    }
}

/// Placement of a new inode relative to its parent directory.
#[derive(Debug, Clone, Copy)]
pub struct Parent {
    pub group: GroupNumber,
    pub ino: InodeNumber,
    /// Parent is the root or flagged "top of hierarchy"; children should be
    /// spread rather than clustered next to it.
    pub is_topdir: bool,
}

/// Group selection for a new inode. Returns `None` when no group can take
/// another inode, which the allocator reports as `NoSpace`.
pub trait PlacementPolicy: std::fmt::Debug {
    fn choose_group(&mut self, view: &GroupView<'_>, parent: Parent, is_dir: bool)
        -> Option<GroupNumber>;
}

// ── Orlov ───────────────────────────────────────────────────────────────────

/// Directory spreading in the style of the Orlov allocator.
///
/// Top-of-hierarchy directories scan all groups from a random offset,
/// preferring groups at or above the filesystem-average free-inode and
/// free-block counts with the fewest existing directories; any group with a
/// free inode is the fallback. Ordinary subdirectories stay in the parent's
/// group when it meets the averages.
#[derive(Debug)]
pub struct Orlov {
    rng: StdRng,
}

impl Orlov {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic variant for tests.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn spread(&mut self, view: &GroupView<'_>) -> Option<GroupNumber> {
        let n = view.group_count();
        if n == 0 {
            return None;
        }
        let avg_inodes = view.avg_free_inodes();
        let avg_blocks = view.avg_free_blocks();
        let start: u32 = self.rng.gen_range(0..n);

        let mut best: Option<(u16, GroupNumber)> = None;
        let mut fallback: Option<GroupNumber> = None;
        for step in 0..n {
            let g = (start + step) % n;
            let gd = &view.groups[g as usize];
            if gd.free_inodes_count == 0 {
                continue;
            }
            fallback.get_or_insert(GroupNumber(g));
            if u32::from(gd.free_inodes_count) < avg_inodes
                || u32::from(gd.free_blocks_count) < avg_blocks
            {
                continue;
            }
            if best.map_or(true, |(dirs, _)| gd.used_dirs_count < dirs) {
                best = Some((gd.used_dirs_count, GroupNumber(g)));
            }
        }
        best.map(|(_, g)| g).or(fallback)
    }
}

impl Default for Orlov {
    fn default() -> Self {
        Self::new()
    }
}

impl PlacementPolicy for Orlov {
    fn choose_group(
        &mut self,
        view: &GroupView<'_>,
        parent: Parent,
        _is_dir: bool,
    ) -> Option<GroupNumber> {
        if !parent.is_topdir {
            if let Some(gd) = view.groups.get(parent.group.0 as usize) {
                if gd.free_inodes_count > 0
                    && u32::from(gd.free_inodes_count) >= view.avg_free_inodes()
                    && u32::from(gd.free_blocks_count) >= view.avg_free_blocks()
                {
                    return Some(parent.group);
                }
            }
        }
        self.spread(view)
    }
}

// ── Hash affinity ───────────────────────────────────────────────────────────

/// Parent-affinity placement for regular files: the parent's own group
/// first, then quadratically strided probes from a hash of (parent group,
/// parent inode), then a linear scan.
#[derive(Debug, Default)]
pub struct HashAffinity;

impl PlacementPolicy for HashAffinity {
    fn choose_group(
        &mut self,
        view: &GroupView<'_>,
        parent: Parent,
        _is_dir: bool,
    ) -> Option<GroupNumber> {
        let n = view.group_count();
        if n == 0 {
            return None;
        }

        if let Some(gd) = view.groups.get(parent.group.0 as usize) {
            if gd.free_inodes_count > 0 {
                return Some(parent.group);
            }
        }

        // Strided probe: both a free inode and a free block, so the file's
        // data has a home near its inode.
        let hash = parent.group.0.wrapping_mul(0x9E37_79B9) ^ parent.ino.0;
        let mut g = hash % n;
        let mut stride = 1_u32;
        loop {
            let gd = &view.groups[g as usize];
            if gd.free_inodes_count > 0 && gd.free_blocks_count > 0 {
                return Some(GroupNumber(g));
            }
            if stride >= n {
                break;
            }
            g = (g + stride) % n;
            stride *= 2;
        }

        view.any_with_free_inode(parent.group.0)
    }
}

// ── First fit ───────────────────────────────────────────────────────────────

/// Simplified opt-in mode: linear scan from the persistent inode-group
/// cursor for the first group with any free inode.
#[derive(Debug, Default)]
pub struct FirstFit;

impl PlacementPolicy for FirstFit {
    fn choose_group(
        &mut self,
        view: &GroupView<'_>,
        _parent: Parent,
        _is_dir: bool,
    ) -> Option<GroupNumber> {
        view.any_with_free_inode(view.cursors.next_inode_group)
    }
}
