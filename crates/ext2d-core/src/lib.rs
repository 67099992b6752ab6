#![forbid(unsafe_code)]
//! The mounted-volume context and the filesystem operations built on it.
//!
//! [`FsContext`] owns the two pieces of process-wide state the storage core
//! needs: the [`Volume`] (device, block cache, superblock, group descriptor
//! table, allocation cursors) and the [`InodeCache`] of in-core inodes. Every
//! operation takes `&mut self`; the core is single-threaded run-to-completion
//! and relies on that for mutual exclusion rather than locks.
//!
//! Operations are grouped by module:
//!
//! - [`volume`] — mount-time load/validation and metadata flush.
//! - [`icache`] — the reference-counted in-core inode table.
//! - [`map`] — logical-to-physical block translation, allocation on the
//!   write path, hole punching, read-ahead.
//! - [`ops`] — lookup/create/link/unlink/rename/read/write/readdir and the
//!   rest of the nameable calls.
//! - [`format`] — a minimal volume formatter for tests and tooling.

pub mod format;
pub mod icache;
pub mod map;
pub mod ops;
pub mod volume;

use ext2d_block::ByteDevice;
use ext2d_error::Result;
use tracing::debug;

pub use icache::{Inode, InodeCache};
pub use map::Mapping;
pub use ops::{DirEntryInfo, Stat, VfsStats};
pub use volume::Volume;

/// Inode placement strategy selection, resolved once at mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementMode {
    /// Orlov spread for directories, parent-affinity hash for files.
    #[default]
    Standard,
    /// First-fit from a cursor for everything.
    FirstFit,
}

/// Mount-time configuration.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Refuse all mutation. Also forced on when the volume carries
    /// read-only-compatible feature bits this build does not know.
    pub read_only: bool,
    pub placement: PlacementMode,
    /// Block cache capacity, in blocks.
    pub cache_blocks: usize,
    /// In-core inode slots.
    pub inode_slots: usize,
    /// May allocate from the reserved-block watermark.
    pub privileged: bool,
    /// Block preallocation for regular files.
    pub preallocate: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            placement: PlacementMode::default(),
            cache_blocks: 256,
            inode_slots: 64,
            privileged: false,
            preallocate: true,
        }
    }
}

/// A mounted volume plus its in-core inode table.
pub struct FsContext<D: ByteDevice> {
    pub vol: Volume<D>,
    pub icache: InodeCache,
}

impl<D: ByteDevice> FsContext<D> {
    /// Mount `dev`. Validation failures, unsupported incompatible features
    /// and unsupported block sizes refuse the mount.
    pub fn mount(dev: D, options: MountOptions) -> Result<Self> {
        let icache = InodeCache::new(options.inode_slots);
        let vol = Volume::mount(dev, &options)?;
        Ok(Self { vol, icache })
    }

    /// Flush everything and give the device back.
    ///
    /// Fails with [`ext2d_error::Ext2Error::Busy`] while any inode is still
    /// referenced.
    pub fn unmount(mut self) -> Result<D> {
        if self.icache.any_referenced() {
            return Err(ext2d_error::Ext2Error::Busy);
        }
        self.sync()?;
        debug!("unmounted");
        Ok(self.vol.into_device())
    }
}

/// Current time as an on-disk 32-bit timestamp.
pub(crate) fn now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}
