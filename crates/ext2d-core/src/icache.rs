//! The in-core inode table.
//!
//! A fixed arena of slots addressed by index, a `HashMap` from inode number
//! to slot for O(1) lookup, and an explicit deque of unreferenced slots in
//! LRU order. Raw-pointer link fields have no place here; everything is an
//! index.
//!
//! Lifecycle contract: [`InodeCache::get`] pins a slot (reference count up),
//! [`InodeCache::put`] unpins it. The transition to zero references is where
//! deferred work happens: preallocated blocks always go back to the bitmap,
//! pending timestamps land in the record, a dirty record is written back,
//! and an inode whose link count reached zero is truncated and returned to
//! the inode bitmap. Reclamation is lazy by design; `unlink` only drops the
//! name and the link count.

use crate::volume::Volume;
use crate::{map, now};
use ext2d_alloc::PreallocCache;
use ext2d_block::ByteDevice;
use ext2d_error::{Ext2Error, Result};
use ext2d_ondisk::RawInode;
use ext2d_types::InodeNumber;
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Pending timestamp updates, applied when the inode leaves active use.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeUpdate {
    pub atime: bool,
    pub ctime: bool,
    pub mtime: bool,
}

impl TimeUpdate {
    fn any(self) -> bool {
        self.atime || self.ctime || self.mtime
    }
}

/// One in-core inode.
#[derive(Debug)]
pub struct Inode {
    pub ino: InodeNumber,
    pub raw: RawInode,
    /// Blocks speculatively reserved for this inode, already marked used.
    pub prealloc: PreallocCache,
    /// Logical block where the last directory insertion landed; the next
    /// insert scan starts there.
    pub enter_hint: u32,
    pub dirty: bool,
    pub times: TimeUpdate,
    refs: u32,
}

impl Inode {
    #[must_use]
    pub fn refs(&self) -> u32 {
        self.refs
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        u64::from(self.raw.size)
    }
}

/// Fixed-size arena of in-core inodes with an LRU of unreferenced slots.
pub struct InodeCache {
    slots: Vec<Option<Inode>>,
    index: HashMap<InodeNumber, usize>,
    /// Slots with zero references, least recently used first. A slot here
    /// may still hold a clean cached inode; reclaiming it unhashes first.
    unused: VecDeque<usize>,
}

impl InodeCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            index: HashMap::with_capacity(capacity),
            unused: (0..capacity).collect(),
        }
    }

    /// Pin `ino` into a slot, loading it from disk on a miss.
    pub fn get<D: ByteDevice>(
        &mut self,
        vol: &mut Volume<D>,
        ino: InodeNumber,
    ) -> Result<usize> {
        if let Some(&slot) = self.index.get(&ino) {
            let inode = self.slot_mut(slot)?;
            if inode.refs == 0 {
                let pos = self.unused.iter().position(|&s| s == slot);
                if let Some(pos) = pos {
                    self.unused.remove(pos);
                }
            }
            let inode = self.slot_mut(slot)?;
            inode.refs += 1;
            return Ok(slot);
        }

        let Some(slot) = self.unused.pop_front() else {
            return Err(Ext2Error::OutOfCacheSlots);
        };
        // The reclaimed slot may hold a different, clean inode; unhash it.
        if let Some(old) = self.slots[slot].take() {
            self.index.remove(&old.ino);
            if old.dirty {
                vol.write_raw_inode(old.ino, &old.raw)?;
            }
        }

        let raw = vol.read_raw_inode(ino)?;
        trace!(ino = ino.0, slot, "inode load");
        self.slots[slot] = Some(Inode {
            ino,
            raw,
            prealloc: PreallocCache::default(),
            enter_hint: 0,
            dirty: false,
            times: TimeUpdate::default(),
            refs: 1,
        });
        self.index.insert(ino, slot);
        Ok(slot)
    }

    /// Unpin a slot. At zero references the deferred work runs; see the
    /// module docs.
    pub fn put<D: ByteDevice>(&mut self, vol: &mut Volume<D>, slot: usize) -> Result<()> {
        let inode = self.slot_mut(slot)?;
        if inode.refs == 0 {
            return Err(Ext2Error::corruption(
                0,
                format!("releasing unreferenced inode {}", inode.ino.0),
            ));
        }
        inode.refs -= 1;
        if inode.refs > 0 {
            return Ok(());
        }

        let inode = self.slot_mut(slot)?;
        let mut prealloc = std::mem::take(&mut inode.prealloc);
        vol.discard_prealloc(&mut prealloc)?;

        let inode = self.slot_mut(slot)?;
        if inode.raw.links_count == 0 && !vol.read_only {
            let ino = inode.ino;
            let res = reclaim(vol, inode);
            // The slot comes back either way; a failed reclamation must not
            // leak cache capacity.
            self.slots[slot] = None;
            self.index.remove(&ino);
            // Freed slots are the first choice for the next load.
            self.unused.push_front(slot);
            return res;
        }

        if inode.times.any() {
            let stamp = now();
            if inode.times.atime {
                inode.raw.atime = stamp;
            }
            if inode.times.ctime {
                inode.raw.ctime = stamp;
            }
            if inode.times.mtime {
                inode.raw.mtime = stamp;
            }
            inode.times = TimeUpdate::default();
            inode.dirty = true;
        }
        if inode.dirty {
            let (ino, raw) = (inode.ino, inode.raw.clone());
            vol.write_raw_inode(ino, &raw)?;
            self.slot_mut(slot)?.dirty = false;
        }
        // Still addressable: stays hashed, reclaimed last.
        self.unused.push_back(slot);
        Ok(())
    }

    fn slot_mut(&mut self, slot: usize) -> Result<&mut Inode> {
        self.slots
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or_else(|| Ext2Error::corruption(0, format!("empty inode slot {slot}")))
    }

    pub fn inode(&self, slot: usize) -> Result<&Inode> {
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or_else(|| Ext2Error::corruption(0, format!("empty inode slot {slot}")))
    }

    pub fn inode_mut(&mut self, slot: usize) -> Result<&mut Inode> {
        self.slot_mut(slot)
    }

    /// Any pinned inode anywhere? Unmount refuses while true.
    #[must_use]
    pub fn any_referenced(&self) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|inode| inode.refs > 0)
    }

    /// Write every dirty cached record back. Part of `sync`; pins are not
    /// disturbed.
    pub fn write_back_all<D: ByteDevice>(&mut self, vol: &mut Volume<D>) -> Result<()> {
        for slot in self.slots.iter_mut().flatten() {
            if slot.dirty {
                vol.write_raw_inode(slot.ino, &slot.raw)?;
                slot.dirty = false;
            }
        }
        Ok(())
    }
}

/// Truncate, stamp `dtime`, write the record back and return the inode to
/// the bitmap.
fn reclaim<D: ByteDevice>(vol: &mut Volume<D>, inode: &mut Inode) -> Result<()> {
    let ino = inode.ino;
    let was_dir = inode.raw.is_dir();
    map::truncate_to(vol, inode, 0)?;
    inode.raw.dtime = now();
    vol.write_raw_inode(ino, &inode.raw)?;
    vol.free_inode(ino, was_dir)
}
