//! The nameable filesystem operations.
//!
//! Every operation pins the inodes it touches through the inode cache and
//! unpins them on the way out whatever happened; deferred reclamation runs
//! inside those unpins. The uniform shape is: pin, delegate to an inner
//! function that may fail, unpin, first error wins.
//!
//! Directory bookkeeping conventions, matching the on-disk contract:
//! a directory's size is always a whole number of blocks, its `links_count`
//! is 2 plus one per child directory (the children's `..` entries), and the
//! insertion scan starts at the block where the last insertion landed.

use crate::icache::{Inode, InodeCache};
use crate::map::{self, Mapping};
use crate::volume::Volume;
use crate::{now, FsContext};
use ext2d_alloc::policy::Parent;
use ext2d_block::{ByteDevice, FetchMode};
use ext2d_error::{Ext2Error, Result};
use ext2d_ondisk::{FileType, RawInode};
use ext2d_types::{
    BlockNumber, InodeNumber, LogicalBlock, MAX_LINKS, N_BLOCK_SLOTS, ROOT_INO, S_IFBLK, S_IFCHR,
    S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
};
use serde::Serialize;
use tracing::debug;

/// A symlink target this short lives in the pointer slots, no data block.
const SYMLINK_INLINE_MAX: usize = N_BLOCK_SLOTS * 4;

/// Upper bound on `..` hops before a directory tree is declared cyclic.
const MAX_DIR_DEPTH: u32 = 1000;

/// Snapshot of one inode's attributes.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stat {
    pub ino: u32,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub links: u16,
    pub size: u64,
    pub blocks512: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    /// Device number for character and block nodes, zero otherwise.
    pub rdev: u32,
}

/// Volume-wide usage counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VfsStats {
    pub block_size: u32,
    pub blocks: u32,
    pub free_blocks: u32,
    pub reserved_blocks: u32,
    pub inodes: u32,
    pub free_inodes: u32,
    pub groups: u32,
    pub max_file_size: u64,
}

/// One live directory entry as reported by [`FsContext::readdir`].
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub ino: InodeNumber,
    pub file_type: FileType,
    pub name: Vec<u8>,
    /// Position to pass back to resume the listing after this entry.
    pub next_pos: u64,
}

impl<D: ByteDevice> FsContext<D> {
    /// Resolve `name` inside the directory `parent`.
    pub fn lookup(&mut self, parent: InodeNumber, name: &[u8]) -> Result<(InodeNumber, FileType)> {
        let Self { vol, icache } = self;
        let slot = icache.get(vol, parent)?;
        let res = lookup_inner(vol, icache, slot, name);
        let put = icache.put(vol, slot);
        let found = res?;
        put?;
        Ok(found)
    }

    /// Create a regular file. `perm` is the permission-bit part of the mode;
    /// `uid` and `gid` become the owner of the new inode.
    pub fn create(
        &mut self,
        parent: InodeNumber,
        name: &[u8],
        perm: u16,
        uid: u16,
        gid: u16,
    ) -> Result<InodeNumber> {
        self.new_child(parent, name, S_IFREG | (perm & 0o7777), 0, uid, gid)
    }

    /// Create a directory holding `.` and `..`.
    pub fn mkdir(
        &mut self,
        parent: InodeNumber,
        name: &[u8],
        perm: u16,
        uid: u16,
        gid: u16,
    ) -> Result<InodeNumber> {
        self.new_child(parent, name, S_IFDIR | (perm & 0o7777), 0, uid, gid)
    }

    /// Create a device node, FIFO or socket.
    pub fn mknod(
        &mut self,
        parent: InodeNumber,
        name: &[u8],
        mode: u16,
        rdev: u32,
        uid: u16,
        gid: u16,
    ) -> Result<InodeNumber> {
        match mode & S_IFMT {
            S_IFCHR | S_IFBLK | S_IFIFO | S_IFSOCK => {
                self.new_child(parent, name, mode, rdev, uid, gid)
            }
            _ => Err(Ext2Error::InvalidArgument(format!(
                "mknod mode {mode:#o} is not a device, fifo or socket"
            ))),
        }
    }

    /// Create a symbolic link to `target`.
    pub fn symlink(
        &mut self,
        parent: InodeNumber,
        name: &[u8],
        target: &[u8],
        uid: u16,
        gid: u16,
    ) -> Result<InodeNumber> {
        if target.is_empty() {
            return Err(Ext2Error::InvalidArgument(
                "empty symlink target".to_owned(),
            ));
        }
        if target.len() >= self.vol.sb.block_size.get() as usize {
            return Err(Ext2Error::NameTooLong);
        }
        let ino = self.new_child(parent, name, S_IFLNK | 0o777, 0, uid, gid)?;
        let Self { vol, icache } = self;
        let slot = icache.get(vol, ino)?;
        let res = write_symlink_target(vol, icache, slot, target);
        let put = icache.put(vol, slot);
        res?;
        put?;
        Ok(ino)
    }

    /// Read a symlink's target.
    pub fn read_link(&mut self, ino: InodeNumber) -> Result<Vec<u8>> {
        let Self { vol, icache } = self;
        let slot = icache.get(vol, ino)?;
        let res = read_link_inner(vol, icache, slot);
        let put = icache.put(vol, slot);
        let target = res?;
        put?;
        Ok(target)
    }

    /// Add another name for an existing non-directory inode.
    pub fn link(&mut self, parent: InodeNumber, name: &[u8], ino: InodeNumber) -> Result<()> {
        let Self { vol, icache } = self;
        vol.ensure_writable()?;
        let pslot = icache.get(vol, parent)?;
        let res = link_inner(vol, icache, pslot, name, ino);
        let put = icache.put(vol, pslot);
        res?;
        put
    }

    /// Remove one name of a non-directory. The inode itself is reclaimed
    /// when its link count and reference count both reach zero.
    pub fn unlink(&mut self, parent: InodeNumber, name: &[u8]) -> Result<()> {
        let Self { vol, icache } = self;
        vol.ensure_writable()?;
        refuse_dots(name)?;
        let pslot = icache.get(vol, parent)?;
        let res = unlink_inner(vol, icache, pslot, name);
        let put = icache.put(vol, pslot);
        res?;
        put
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, parent: InodeNumber, name: &[u8]) -> Result<()> {
        let Self { vol, icache } = self;
        vol.ensure_writable()?;
        refuse_dots(name)?;
        let pslot = icache.get(vol, parent)?;
        let res = rmdir_inner(vol, icache, pslot, name);
        let put = icache.put(vol, pslot);
        res?;
        put
    }

    /// Move `old_parent/old_name` to `new_parent/new_name`, replacing a
    /// compatible existing destination.
    pub fn rename(
        &mut self,
        old_parent: InodeNumber,
        old_name: &[u8],
        new_parent: InodeNumber,
        new_name: &[u8],
    ) -> Result<()> {
        let Self { vol, icache } = self;
        vol.ensure_writable()?;
        refuse_dots(old_name)?;
        refuse_dots(new_name)?;
        let op_slot = icache.get(vol, old_parent)?;
        let np_slot = icache.get(vol, new_parent)?;
        let res = rename_inner(
            vol, icache, op_slot, np_slot, old_parent, new_parent, old_name, new_name,
        );
        let put_np = icache.put(vol, np_slot);
        let put_op = icache.put(vol, op_slot);
        res?;
        put_np?;
        put_op
    }

    /// Read up to `out.len()` bytes at `offset`. Holes read as zeroes; the
    /// count is clamped at end of file.
    pub fn read(&mut self, ino: InodeNumber, offset: u64, out: &mut [u8]) -> Result<usize> {
        let Self { vol, icache } = self;
        let slot = icache.get(vol, ino)?;
        let res = read_inner(vol, icache, slot, offset, out);
        let put = icache.put(vol, slot);
        let n = res?;
        put?;
        Ok(n)
    }

    /// Write `data` at `offset`, allocating blocks as needed and extending
    /// the file size.
    pub fn write(&mut self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<usize> {
        let Self { vol, icache } = self;
        vol.ensure_writable()?;
        let slot = icache.get(vol, ino)?;
        let res = write_inner(vol, icache, slot, offset, data);
        let put = icache.put(vol, slot);
        let n = res?;
        put?;
        Ok(n)
    }

    /// Set a regular file's length, freeing blocks past the new end. Growth
    /// is sparse; no blocks are allocated.
    pub fn truncate(&mut self, ino: InodeNumber, new_size: u64) -> Result<()> {
        if new_size > self.vol.max_file_size {
            return Err(Ext2Error::FileTooBig);
        }
        let Self { vol, icache } = self;
        vol.ensure_writable()?;
        let slot = icache.get(vol, ino)?;
        let res = truncate_inner(vol, icache, slot, new_size);
        let put = icache.put(vol, slot);
        res?;
        put
    }

    /// Deallocate the byte range `[start, end)` without changing the file
    /// size; subsequent reads there return zeroes.
    pub fn punch_hole(&mut self, ino: InodeNumber, start: u64, end: u64) -> Result<()> {
        let Self { vol, icache } = self;
        vol.ensure_writable()?;
        let slot = icache.get(vol, ino)?;
        let res = punch_inner(vol, icache, slot, start, end);
        let put = icache.put(vol, slot);
        res?;
        put
    }

    /// List the live entries of a directory starting at `pos` (0 for the
    /// beginning; `DirEntryInfo::next_pos` of the last entry to resume).
    pub fn readdir(&mut self, ino: InodeNumber, pos: u64) -> Result<Vec<DirEntryInfo>> {
        let Self { vol, icache } = self;
        let slot = icache.get(vol, ino)?;
        let res = readdir_inner(vol, icache, slot, pos);
        let put = icache.put(vol, slot);
        let entries = res?;
        put?;
        Ok(entries)
    }

    /// Attribute snapshot of one inode.
    pub fn stat(&mut self, ino: InodeNumber) -> Result<Stat> {
        let Self { vol, icache } = self;
        let slot = icache.get(vol, ino)?;
        let res = icache.inode(slot).map(|inode| stat_of(inode.ino, &inode.raw));
        let put = icache.put(vol, slot);
        let stat = res?;
        put?;
        Ok(stat)
    }

    /// Volume-wide usage counters from the superblock.
    #[must_use]
    pub fn statvfs(&self) -> VfsStats {
        let sb = &self.vol.sb;
        VfsStats {
            block_size: sb.block_size.get(),
            blocks: sb.blocks_count,
            free_blocks: sb.free_blocks_count,
            reserved_blocks: sb.reserved_blocks_count,
            inodes: sb.inodes_count,
            free_inodes: sb.free_inodes_count,
            groups: sb.groups_count(),
            max_file_size: self.vol.max_file_size,
        }
    }

    /// Write back every dirty in-core inode record, the superblock, the
    /// descriptor table when dirty, and all dirty cached blocks.
    pub fn sync(&mut self) -> Result<()> {
        let Self { vol, icache } = self;
        if vol.read_only {
            return Ok(());
        }
        icache.write_back_all(vol)?;
        vol.flush()
    }

    fn new_child(
        &mut self,
        parent: InodeNumber,
        name: &[u8],
        mode: u16,
        rdev: u32,
        uid: u16,
        gid: u16,
    ) -> Result<InodeNumber> {
        let Self { vol, icache } = self;
        vol.ensure_writable()?;
        let pslot = icache.get(vol, parent)?;
        let res = new_child_inner(vol, icache, pslot, parent, name, mode, rdev, uid, gid);
        let put = icache.put(vol, pslot);
        let ino = res?;
        put?;
        Ok(ino)
    }
}

fn refuse_dots(name: &[u8]) -> Result<()> {
    if name == b"." || name == b".." {
        return Err(Ext2Error::InvalidArgument(
            "operation on . or ..".to_owned(),
        ));
    }
    Ok(())
}

fn regular_only(icache: &InodeCache, slot: usize) -> Result<()> {
    let raw = &icache.inode(slot)?.raw;
    if raw.is_dir() {
        return Err(Ext2Error::IsDirectory);
    }
    if !raw.is_regular() {
        return Err(Ext2Error::InvalidArgument(
            "byte range operation on a non-regular file".to_owned(),
        ));
    }
    Ok(())
}

fn touch_mtime(icache: &mut InodeCache, slot: usize) -> Result<()> {
    let inode = icache.inode_mut(slot)?;
    inode.times.mtime = true;
    inode.times.ctime = true;
    inode.dirty = true;
    Ok(())
}

fn stat_of(ino: InodeNumber, raw: &RawInode) -> Stat {
    let is_dev = matches!(raw.mode & S_IFMT, S_IFCHR | S_IFBLK);
    Stat {
        ino: ino.0,
        mode: raw.mode,
        uid: raw.uid,
        gid: raw.gid,
        links: raw.links_count,
        size: u64::from(raw.size),
        blocks512: raw.blocks512,
        atime: raw.atime,
        ctime: raw.ctime,
        mtime: raw.mtime,
        rdev: if is_dev { raw.block[0] } else { 0 },
    }
}

// ── Directory scanning ──────────────────────────────────────────────────────

fn fetch_dir_block<D: ByteDevice>(
    vol: &mut Volume<D>,
    raw: &RawInode,
    lblock: u32,
) -> Result<(BlockNumber, Vec<u8>)> {
    match map::resolve(vol, raw, LogicalBlock(lblock))? {
        Mapping::Block(block) => {
            let buf = vol
                .cache
                .get(block, FetchMode::Normal)?
                .ok_or_else(|| {
                    Ext2Error::corruption(u64::from(block.0), "directory block fetch failed")
                })?;
            Ok((block, buf.into_inner()))
        }
        // A directory's blocks are allocated up front on growth; a hole in
        // the middle means the mapping or the size is corrupt.
        Mapping::Hole => Err(Ext2Error::corruption(
            0,
            format!("hole at directory block {lblock}"),
        )),
    }
}

fn dir_block_count<D: ByteDevice>(vol: &Volume<D>, raw: &RawInode) -> u32 {
    let bs = u64::from(vol.sb.block_size.get());
    u32::try_from(u64::from(raw.size).div_ceil(bs)).unwrap_or(u32::MAX)
}

fn dir_lookup<D: ByteDevice>(
    vol: &mut Volume<D>,
    raw: &RawInode,
    name: &[u8],
) -> Result<Option<(InodeNumber, FileType)>> {
    for lblock in 0..dir_block_count(vol, raw) {
        let (_, buf) = fetch_dir_block(vol, raw, lblock)?;
        if let Some(entry) = ext2d_dir::find_entry(&buf, name)? {
            return Ok(Some((InodeNumber(entry.ino), entry.file_type)));
        }
    }
    Ok(None)
}

/// Insert `name -> ino`. The scan starts at the hint block where the last
/// insertion landed, then wraps; when every block refuses, the directory
/// grows by exactly one block and the new length is made durable before the
/// entry is written into it.
fn dir_enter<D: ByteDevice>(
    vol: &mut Volume<D>,
    dirnode: &mut Inode,
    name: &[u8],
    ino: InodeNumber,
    file_type: FileType,
) -> Result<()> {
    let nblocks = dir_block_count(vol, &dirnode.raw);
    if nblocks > 0 {
        let hint = dirnode.enter_hint.min(nblocks - 1);
        let order = std::iter::once(hint).chain((0..nblocks).filter(|&b| b != hint));
        for lblock in order {
            let (block, mut buf) = fetch_dir_block(vol, &dirnode.raw, lblock)?;
            match ext2d_dir::add_entry(&mut buf, ino.0, name, file_type) {
                Ok(_) => {
                    vol.cache.write(block, &buf)?;
                    dirnode.enter_hint = lblock;
                    dirnode.times.mtime = true;
                    dirnode.times.ctime = true;
                    dirnode.dirty = true;
                    return Ok(());
                }
                Err(Ext2Error::NoSpace) => {}
                Err(err) => return Err(err),
            }
        }
    }

    let (block, _) = map::block_for_writing(vol, dirnode, LogicalBlock(nblocks))?;
    let bs = vol.sb.block_size.get() as usize;
    let mut buf = vec![0_u8; bs];
    // One free record owning the whole block.
    ext2d_types::write_le_u16(&mut buf, 4, u16::try_from(bs).map_err(|_| {
        Ext2Error::Format("block size exceeds directory record length".to_owned())
    })?);
    ext2d_dir::add_entry(&mut buf, ino.0, name, file_type)?;
    vol.cache.write(block, &buf)?;
    dirnode.raw.size += bs as u32;
    dirnode.enter_hint = nblocks;
    vol.write_raw_inode(dirnode.ino, &dirnode.raw)?;
    dirnode.dirty = false;
    dirnode.times.mtime = true;
    dirnode.times.ctime = true;
    Ok(())
}

fn dir_delete<D: ByteDevice>(
    vol: &mut Volume<D>,
    dirnode: &mut Inode,
    name: &[u8],
) -> Result<InodeNumber> {
    for lblock in 0..dir_block_count(vol, &dirnode.raw) {
        let (block, mut buf) = fetch_dir_block(vol, &dirnode.raw, lblock)?;
        if let Some(ino) = ext2d_dir::remove_entry(&mut buf, name)? {
            vol.cache.write(block, &buf)?;
            dirnode.times.mtime = true;
            dirnode.times.ctime = true;
            dirnode.dirty = true;
            return Ok(InodeNumber(ino));
        }
    }
    Err(Ext2Error::NotFound)
}

fn dir_is_empty<D: ByteDevice>(vol: &mut Volume<D>, raw: &RawInode) -> Result<bool> {
    for lblock in 0..dir_block_count(vol, raw) {
        let (_, buf) = fetch_dir_block(vol, raw, lblock)?;
        if !ext2d_dir::only_dots(&buf)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Whether `cur` is `dirno` or lies beneath it, walking `..` up to the root.
fn is_beneath<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    dirno: InodeNumber,
    mut cur: InodeNumber,
) -> Result<bool> {
    let mut hops = 0_u32;
    while cur.0 != ROOT_INO {
        if cur == dirno {
            return Ok(true);
        }
        let slot = icache.get(vol, cur)?;
        let res = icache
            .inode(slot)
            .map(|inode| inode.raw.clone())
            .and_then(|raw| dir_lookup(vol, &raw, b".."));
        let put = icache.put(vol, slot);
        let up = res?;
        put?;
        let Some((parent, _)) = up else {
            return Err(Ext2Error::corruption(
                0,
                format!("directory {} has no .. entry", cur.0),
            ));
        };
        cur = parent;
        hops += 1;
        if hops > MAX_DIR_DEPTH {
            return Err(Ext2Error::corruption(0, "loop in the directory tree"));
        }
    }
    Ok(false)
}

// ── Inner operation bodies ──────────────────────────────────────────────────

fn lookup_inner<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &InodeCache,
    slot: usize,
    name: &[u8],
) -> Result<(InodeNumber, FileType)> {
    let raw = icache.inode(slot)?.raw.clone();
    if !raw.is_dir() {
        return Err(Ext2Error::NotDirectory);
    }
    dir_lookup(vol, &raw, name)?.ok_or(Ext2Error::NotFound)
}

#[allow(clippy::too_many_arguments)]
fn new_child_inner<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    pslot: usize,
    parent: InodeNumber,
    name: &[u8],
    mode: u16,
    rdev: u32,
    uid: u16,
    gid: u16,
) -> Result<InodeNumber> {
    let is_dir = mode & S_IFMT == S_IFDIR;
    let praw = icache.inode(pslot)?.raw.clone();
    if !praw.is_dir() {
        return Err(Ext2Error::NotDirectory);
    }
    if is_dir && praw.links_count >= MAX_LINKS {
        return Err(Ext2Error::TooManyLinks);
    }
    if dir_lookup(vol, &praw, name)?.is_some() {
        return Err(Ext2Error::Exists);
    }

    let placement = Parent {
        group: vol.group_of_inode(parent),
        ino: parent,
        is_topdir: parent.0 == ROOT_INO,
    };
    let alloc = vol.alloc_inode(placement, is_dir)?;

    let stamp = now();
    let mut raw = RawInode {
        mode,
        uid,
        gid,
        links_count: if is_dir { 2 } else { 1 },
        atime: stamp,
        ctime: stamp,
        mtime: stamp,
        ..RawInode::default()
    };
    if matches!(mode & S_IFMT, S_IFCHR | S_IFBLK) {
        raw.block[0] = rdev;
    }
    vol.write_raw_inode(alloc.ino, &raw)?;

    let cslot = icache.get(vol, alloc.ino)?;
    let res = attach_child(vol, icache, pslot, cslot, parent, alloc.ino, name, mode);
    match res {
        Ok(()) => {
            icache.put(vol, cslot)?;
            debug!(ino = alloc.ino.0, parent = parent.0, mode, "created");
            Ok(alloc.ino)
        }
        Err(err) => {
            // Undo through normal reclamation: a zero link count makes the
            // unpin free the inode and whatever it allocated.
            if let Ok(child) = icache.inode_mut(cslot) {
                child.raw.links_count = 0;
                child.dirty = true;
            }
            let _ = icache.put(vol, cslot);
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn attach_child<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    pslot: usize,
    cslot: usize,
    parent: InodeNumber,
    ino: InodeNumber,
    name: &[u8],
    mode: u16,
) -> Result<()> {
    let is_dir = mode & S_IFMT == S_IFDIR;
    if is_dir {
        let child = icache.inode_mut(cslot)?;
        let (block, _) = map::block_for_writing(vol, child, LogicalBlock(0))?;
        let bs = vol.sb.block_size.get() as usize;
        let mut buf = vec![0_u8; bs];
        ext2d_dir::init_dir_block(&mut buf, ino.0, parent.0)?;
        vol.cache.write(block, &buf)?;
        let child = icache.inode_mut(cslot)?;
        child.raw.size = bs as u32;
        child.dirty = true;
    }

    let pnode = icache.inode_mut(pslot)?;
    dir_enter(vol, pnode, name, ino, FileType::from_mode(mode))?;
    if is_dir {
        // The child's `..` back-link.
        let pnode = icache.inode_mut(pslot)?;
        pnode.raw.links_count += 1;
        pnode.dirty = true;
    }
    Ok(())
}

fn write_symlink_target<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    slot: usize,
    target: &[u8],
) -> Result<()> {
    let inode = icache.inode_mut(slot)?;
    if target.len() <= SYMLINK_INLINE_MAX {
        let mut bytes = [0_u8; SYMLINK_INLINE_MAX];
        bytes[..target.len()].copy_from_slice(target);
        for (i, ptr) in inode.raw.block.iter_mut().enumerate() {
            *ptr = u32::from_le_bytes([
                bytes[i * 4],
                bytes[i * 4 + 1],
                bytes[i * 4 + 2],
                bytes[i * 4 + 3],
            ]);
        }
    } else {
        let (block, _) = map::block_for_writing(vol, inode, LogicalBlock(0))?;
        let mut buf = vol
            .cache
            .get(block, FetchMode::Fresh)?
            .ok_or_else(|| {
                Ext2Error::corruption(u64::from(block.0), "symlink block fetch failed")
            })?
            .into_inner();
        buf[..target.len()].copy_from_slice(target);
        vol.cache.write(block, &buf)?;
    }
    let inode = icache.inode_mut(slot)?;
    inode.raw.size = u32::try_from(target.len()).map_err(|_| Ext2Error::NameTooLong)?;
    inode.dirty = true;
    Ok(())
}

fn read_link_inner<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &InodeCache,
    slot: usize,
) -> Result<Vec<u8>> {
    let raw = icache.inode(slot)?.raw.clone();
    if !raw.is_symlink() {
        return Err(Ext2Error::InvalidArgument("not a symlink".to_owned()));
    }
    let len = raw.size as usize;
    if raw.blocks512 == 0 {
        if len > SYMLINK_INLINE_MAX {
            return Err(Ext2Error::corruption(
                0,
                "inline symlink longer than the pointer area",
            ));
        }
        let mut bytes = Vec::with_capacity(SYMLINK_INLINE_MAX);
        for ptr in &raw.block {
            bytes.extend_from_slice(&ptr.to_le_bytes());
        }
        bytes.truncate(len);
        return Ok(bytes);
    }
    let Mapping::Block(block) = map::resolve(vol, &raw, LogicalBlock(0))? else {
        return Err(Ext2Error::corruption(0, "symlink without a data block"));
    };
    let buf = vol
        .cache
        .get(block, FetchMode::Normal)?
        .ok_or_else(|| Ext2Error::corruption(u64::from(block.0), "symlink block fetch failed"))?;
    if len > buf.as_slice().len() {
        return Err(Ext2Error::corruption(
            u64::from(block.0),
            "symlink longer than its block",
        ));
    }
    Ok(buf.as_slice()[..len].to_vec())
}

fn link_inner<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    pslot: usize,
    name: &[u8],
    ino: InodeNumber,
) -> Result<()> {
    let praw = icache.inode(pslot)?.raw.clone();
    if !praw.is_dir() {
        return Err(Ext2Error::NotDirectory);
    }
    if dir_lookup(vol, &praw, name)?.is_some() {
        return Err(Ext2Error::Exists);
    }
    let tslot = icache.get(vol, ino)?;
    let res = link_attach(vol, icache, pslot, tslot, name, ino);
    let put = icache.put(vol, tslot);
    res?;
    put
}

fn link_attach<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    pslot: usize,
    tslot: usize,
    name: &[u8],
    ino: InodeNumber,
) -> Result<()> {
    let target = icache.inode(tslot)?;
    if target.raw.is_dir() {
        return Err(Ext2Error::IsDirectory);
    }
    if target.raw.links_count >= MAX_LINKS {
        return Err(Ext2Error::TooManyLinks);
    }
    let file_type = FileType::from_mode(target.raw.mode);

    dir_enter(vol, icache.inode_mut(pslot)?, name, ino, file_type)?;
    let target = icache.inode_mut(tslot)?;
    target.raw.links_count += 1;
    target.times.ctime = true;
    target.dirty = true;
    Ok(())
}

fn unlink_inner<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    pslot: usize,
    name: &[u8],
) -> Result<()> {
    let praw = icache.inode(pslot)?.raw.clone();
    if !praw.is_dir() {
        return Err(Ext2Error::NotDirectory);
    }
    let Some((ino, _)) = dir_lookup(vol, &praw, name)? else {
        return Err(Ext2Error::NotFound);
    };
    let tslot = icache.get(vol, ino)?;
    let res = drop_file_name(vol, icache, pslot, tslot, name);
    let put = icache.put(vol, tslot);
    res?;
    put
}

fn drop_file_name<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    pslot: usize,
    tslot: usize,
    name: &[u8],
) -> Result<()> {
    if icache.inode(tslot)?.raw.is_dir() {
        return Err(Ext2Error::IsDirectory);
    }
    dir_delete(vol, icache.inode_mut(pslot)?, name)?;
    let target = icache.inode_mut(tslot)?;
    target.raw.links_count = target.raw.links_count.saturating_sub(1);
    target.times.ctime = true;
    target.dirty = true;
    Ok(())
}

fn rmdir_inner<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    pslot: usize,
    name: &[u8],
) -> Result<()> {
    let praw = icache.inode(pslot)?.raw.clone();
    if !praw.is_dir() {
        return Err(Ext2Error::NotDirectory);
    }
    let Some((ino, _)) = dir_lookup(vol, &praw, name)? else {
        return Err(Ext2Error::NotFound);
    };
    let tslot = icache.get(vol, ino)?;
    let res = drop_dir_name(vol, icache, pslot, tslot, name);
    let put = icache.put(vol, tslot);
    res?;
    put
}

fn drop_dir_name<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    pslot: usize,
    tslot: usize,
    name: &[u8],
) -> Result<()> {
    let target = icache.inode(tslot)?;
    if !target.raw.is_dir() {
        return Err(Ext2Error::NotDirectory);
    }
    if target.refs() > 1 {
        return Err(Ext2Error::Busy);
    }
    let traw = target.raw.clone();
    if !dir_is_empty(vol, &traw)? {
        return Err(Ext2Error::NotEmpty);
    }

    dir_delete(vol, icache.inode_mut(pslot)?, name)?;
    let pnode = icache.inode_mut(pslot)?;
    // The removed child's `..` back-link.
    pnode.raw.links_count = pnode.raw.links_count.saturating_sub(1);
    pnode.dirty = true;

    let target = icache.inode_mut(tslot)?;
    target.raw.links_count = 0;
    target.dirty = true;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn rename_inner<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    op_slot: usize,
    np_slot: usize,
    old_parent: InodeNumber,
    new_parent: InodeNumber,
    old_name: &[u8],
    new_name: &[u8],
) -> Result<()> {
    let opraw = icache.inode(op_slot)?.raw.clone();
    let npraw = icache.inode(np_slot)?.raw.clone();
    if !opraw.is_dir() || !npraw.is_dir() {
        return Err(Ext2Error::NotDirectory);
    }
    let Some((ino, _)) = dir_lookup(vol, &opraw, old_name)? else {
        return Err(Ext2Error::NotFound);
    };

    let mslot = icache.get(vol, ino)?;
    let res = rename_move(
        vol, icache, op_slot, np_slot, mslot, old_parent, new_parent, old_name, new_name, ino,
    );
    let put = icache.put(vol, mslot);
    res?;
    put
}

#[allow(clippy::too_many_arguments)]
fn rename_move<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    op_slot: usize,
    np_slot: usize,
    mslot: usize,
    old_parent: InodeNumber,
    new_parent: InodeNumber,
    old_name: &[u8],
    new_name: &[u8],
    ino: InodeNumber,
) -> Result<()> {
    let moved_is_dir = icache.inode(mslot)?.raw.is_dir();
    let cross = old_parent != new_parent;

    if moved_is_dir && cross && is_beneath(vol, icache, ino, new_parent)? {
        return Err(Ext2Error::InvalidArgument(
            "rename would move a directory beneath itself".to_owned(),
        ));
    }

    let npraw = icache.inode(np_slot)?.raw.clone();
    if let Some((dst_ino, _)) = dir_lookup(vol, &npraw, new_name)? {
        if dst_ino == ino {
            // Both names already point at the same inode.
            return Ok(());
        }
        remove_rename_dest(vol, icache, np_slot, dst_ino, new_name, moved_is_dir)?;
    }

    if moved_is_dir && cross && icache.inode(np_slot)?.raw.links_count >= MAX_LINKS {
        return Err(Ext2Error::TooManyLinks);
    }

    let file_type = FileType::from_mode(icache.inode(mslot)?.raw.mode);
    if cross {
        // Insert before removing: a failure in between leaves the inode
        // reachable under both names instead of neither.
        dir_enter(vol, icache.inode_mut(np_slot)?, new_name, ino, file_type)?;
        dir_delete(vol, icache.inode_mut(op_slot)?, old_name)?;
    } else {
        dir_delete(vol, icache.inode_mut(op_slot)?, old_name)?;
        dir_enter(vol, icache.inode_mut(np_slot)?, new_name, ino, file_type)?;
    }

    if moved_is_dir && cross {
        repoint_dotdot(vol, icache, mslot, new_parent)?;
        let op = icache.inode_mut(op_slot)?;
        op.raw.links_count = op.raw.links_count.saturating_sub(1);
        op.dirty = true;
        let np = icache.inode_mut(np_slot)?;
        np.raw.links_count += 1;
        np.dirty = true;
    }
    let moved = icache.inode_mut(mslot)?;
    moved.times.ctime = true;
    moved.dirty = true;
    debug!(
        ino = ino.0,
        from = old_parent.0,
        to = new_parent.0,
        "renamed"
    );
    Ok(())
}

fn remove_rename_dest<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    np_slot: usize,
    dst_ino: InodeNumber,
    new_name: &[u8],
    moved_is_dir: bool,
) -> Result<()> {
    let dslot = icache.get(vol, dst_ino)?;
    let res = remove_rename_dest_pinned(vol, icache, np_slot, dslot, new_name, moved_is_dir);
    let put = icache.put(vol, dslot);
    res?;
    put
}

fn remove_rename_dest_pinned<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    np_slot: usize,
    dslot: usize,
    new_name: &[u8],
    moved_is_dir: bool,
) -> Result<()> {
    let dest = icache.inode(dslot)?;
    let dest_is_dir = dest.raw.is_dir();
    if moved_is_dir && !dest_is_dir {
        return Err(Ext2Error::NotDirectory);
    }
    if !moved_is_dir && dest_is_dir {
        return Err(Ext2Error::IsDirectory);
    }
    if dest_is_dir {
        if dest.refs() > 1 {
            return Err(Ext2Error::Busy);
        }
        let draw = dest.raw.clone();
        if !dir_is_empty(vol, &draw)? {
            return Err(Ext2Error::NotEmpty);
        }
    }

    dir_delete(vol, icache.inode_mut(np_slot)?, new_name)?;
    if dest_is_dir {
        let np = icache.inode_mut(np_slot)?;
        np.raw.links_count = np.raw.links_count.saturating_sub(1);
        np.dirty = true;
    }
    let dest = icache.inode_mut(dslot)?;
    dest.raw.links_count = if dest_is_dir {
        0
    } else {
        dest.raw.links_count.saturating_sub(1)
    };
    dest.times.ctime = true;
    dest.dirty = true;
    Ok(())
}

fn repoint_dotdot<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &InodeCache,
    mslot: usize,
    new_parent: InodeNumber,
) -> Result<()> {
    let raw = icache.inode(mslot)?.raw.clone();
    let (block, mut buf) = fetch_dir_block(vol, &raw, 0)?;
    if !ext2d_dir::set_dotdot(&mut buf, new_parent.0)? {
        return Err(Ext2Error::corruption(
            u64::from(block.0),
            "directory without a .. entry",
        ));
    }
    vol.cache.write(block, &buf)
}

// ── Byte I/O ────────────────────────────────────────────────────────────────

fn read_inner<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    slot: usize,
    offset: u64,
    out: &mut [u8],
) -> Result<usize> {
    let raw = {
        let inode = icache.inode(slot)?;
        if inode.raw.is_dir() {
            return Err(Ext2Error::IsDirectory);
        }
        if inode.raw.is_symlink() {
            return Err(Ext2Error::InvalidArgument(
                "byte read on a symlink".to_owned(),
            ));
        }
        inode.raw.clone()
    };
    let size = u64::from(raw.size);
    if offset >= size || out.is_empty() {
        return Ok(0);
    }
    let end = size.min(offset + out.len() as u64);
    let bs = u64::from(vol.sb.block_size.get());

    let first = u32::try_from(offset / bs).map_err(|_| Ext2Error::FileTooBig)?;
    if let Err(err) = map::prefetch_from(vol, &raw, LogicalBlock(first)) {
        debug!(%err, "read-ahead abandoned");
    }

    let mut done = 0_usize;
    let mut pos = offset;
    while pos < end {
        let lblock = LogicalBlock((pos / bs) as u32);
        let in_block = (pos % bs) as usize;
        let take = ((end - pos) as usize).min(bs as usize - in_block);
        match map::resolve(vol, &raw, lblock)? {
            Mapping::Hole => out[done..done + take].fill(0),
            Mapping::Block(block) => {
                let buf = vol.cache.get(block, FetchMode::Normal)?.ok_or_else(|| {
                    Ext2Error::corruption(u64::from(block.0), "data block fetch failed")
                })?;
                out[done..done + take]
                    .copy_from_slice(&buf.as_slice()[in_block..in_block + take]);
            }
        }
        done += take;
        pos += take as u64;
    }

    if !vol.read_only {
        icache.inode_mut(slot)?.times.atime = true;
    }
    Ok(done)
}

fn write_inner<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    slot: usize,
    offset: u64,
    data: &[u8],
) -> Result<usize> {
    regular_only(icache, slot)?;
    if data.is_empty() {
        return Ok(0);
    }
    let end = offset
        .checked_add(data.len() as u64)
        .ok_or(Ext2Error::FileTooBig)?;
    if end > vol.max_file_size {
        return Err(Ext2Error::FileTooBig);
    }
    let bs = u64::from(vol.sb.block_size.get());

    let mut done = 0_usize;
    let mut pos = offset;
    while pos < end {
        let lblock = LogicalBlock((pos / bs) as u32);
        let in_block = (pos % bs) as usize;
        let take = ((end - pos) as usize).min(bs as usize - in_block);

        let (block, new) = map::block_for_writing(vol, icache.inode_mut(slot)?, lblock)?;
        // A brand-new or fully overwritten block never needs the old bytes.
        let mode = if new || take == bs as usize {
            FetchMode::Fresh
        } else {
            FetchMode::Normal
        };
        let mut buf = vol
            .cache
            .get(block, mode)?
            .ok_or_else(|| {
                Ext2Error::corruption(u64::from(block.0), "data block fetch failed")
            })?
            .into_inner();
        buf[in_block..in_block + take].copy_from_slice(&data[done..done + take]);
        vol.cache.write(block, &buf)?;

        done += take;
        pos += take as u64;
    }

    let inode = icache.inode_mut(slot)?;
    if end > u64::from(inode.raw.size) {
        inode.raw.size = u32::try_from(end).map_err(|_| Ext2Error::FileTooBig)?;
    }
    inode.times.mtime = true;
    inode.times.ctime = true;
    inode.dirty = true;
    Ok(done)
}

fn truncate_inner<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    slot: usize,
    new_size: u64,
) -> Result<()> {
    regular_only(icache, slot)?;
    map::truncate_to(vol, icache.inode_mut(slot)?, new_size)?;
    touch_mtime(icache, slot)
}

fn punch_inner<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    slot: usize,
    start: u64,
    end: u64,
) -> Result<()> {
    regular_only(icache, slot)?;
    map::punch_hole(vol, icache.inode_mut(slot)?, start, end)?;
    touch_mtime(icache, slot)
}

fn readdir_inner<D: ByteDevice>(
    vol: &mut Volume<D>,
    icache: &mut InodeCache,
    slot: usize,
    pos: u64,
) -> Result<Vec<DirEntryInfo>> {
    let raw = icache.inode(slot)?.raw.clone();
    if !raw.is_dir() {
        return Err(Ext2Error::NotDirectory);
    }
    let bs = u64::from(vol.sb.block_size.get());
    let nblocks = dir_block_count(vol, &raw);

    let mut out = Vec::new();
    for lblock in (pos / bs) as u32..nblocks {
        let (_, buf) = fetch_dir_block(vol, &raw, lblock)?;
        for entry in ext2d_dir::entries(&buf) {
            let entry = entry?;
            let entry_pos = u64::from(lblock) * bs + entry.offset as u64;
            if entry_pos < pos || entry.is_free() {
                continue;
            }
            out.push(DirEntryInfo {
                ino: InodeNumber(entry.ino),
                file_type: entry.file_type,
                name: entry.name.to_vec(),
                next_pos: entry_pos + entry.rec_len as u64,
            });
        }
    }

    if !vol.read_only {
        icache.inode_mut(slot)?.times.atime = true;
    }
    Ok(out)
}
