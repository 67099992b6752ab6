#![forbid(unsafe_code)]
//! Byte devices, block-addressed I/O, and the block cache.
//!
//! The storage core consumes three fetch modes:
//!
//! - [`FetchMode::Normal`] — may trigger device I/O.
//! - [`FetchMode::Fresh`] — zero-filled, for freshly allocated blocks whose
//!   old contents are garbage; never reads the device.
//! - [`FetchMode::Peek`] — non-blocking probe; absent blocks return `None`
//!   instead of triggering I/O. Used by read-ahead.
//!
//! The cache is write-back: [`BlockCache::write`] dirties the in-core copy
//! and the device sees it on eviction or [`BlockCache::flush`]. The
//! superblock and group descriptor table bypass this layer through the raw
//! [`ByteDevice`] because their byte offsets need not be block-aligned.

use ext2d_error::{Ext2Error, Result};
use ext2d_types::BlockNumber;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Owned copy of one block's bytes.
#[derive(Debug, Clone)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Positioned byte I/O (pread/pwrite semantics).
pub trait ByteDevice {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
    fn len_bytes(&self) -> u64;
    fn sync(&self) -> Result<()>;
}

/// A regular file or block special file as a [`ByteDevice`].
#[derive(Debug)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, true)
    }

    pub fn open_with(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| Ext2Error::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(Ext2Error::Format(format!(
                "read out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Ext2Error::ReadOnly);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| Ext2Error::Format("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(Ext2Error::Format(format!(
                "write out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory [`ByteDevice`], used by the test suites and the formatter.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
    len: u64,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
            len: len as u64,
        }
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self {
            bytes: Mutex::new(bytes),
            len,
        }
    }

    /// Snapshot of the whole device, for golden comparisons.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let start = usize::try_from(offset)
            .map_err(|_| Ext2Error::Format("offset does not fit usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&e| e <= bytes.len())
            .ok_or_else(|| Ext2Error::Format("read out of bounds".to_owned()))?;
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let start = usize::try_from(offset)
            .map_err(|_| Ext2Error::Format("offset does not fit usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&e| e <= bytes.len())
            .ok_or_else(|| Ext2Error::Format("write out of bounds".to_owned()))?;
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Block cache ─────────────────────────────────────────────────────────────

/// How a block fetch may touch the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Read from the device on a miss.
    Normal,
    /// Zero-fill on a miss; the block was just allocated and its previous
    /// contents are meaningless.
    Fresh,
    /// Never touch the device; a miss returns `None`.
    Peek,
}

#[derive(Debug)]
struct CacheEntry {
    data: Vec<u8>,
    dirty: bool,
}

/// Write-back LRU cache of fixed-size blocks over a [`ByteDevice`].
///
/// Single-threaded by design: the owning context serializes all access, so
/// methods take `&mut self` and no internal locking exists.
#[derive(Debug)]
pub struct BlockCache<D: ByteDevice> {
    dev: D,
    block_size: u32,
    block_count: u64,
    capacity: usize,
    entries: HashMap<u32, CacheEntry>,
    /// Recency order, least recent at the front.
    recency: VecDeque<u32>,
}

impl<D: ByteDevice> BlockCache<D> {
    pub fn new(dev: D, block_size: u32, capacity: usize) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Ext2Error::Format(format!(
                "invalid block_size={block_size} (must be a power of two)"
            )));
        }
        if capacity == 0 {
            return Err(Ext2Error::Format("cache capacity must be > 0".to_owned()));
        }
        let block_count = dev.len_bytes() / u64::from(block_size);
        Ok(Self {
            dev,
            block_size,
            block_count,
            capacity,
            entries: HashMap::new(),
            recency: VecDeque::new(),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// The raw device underneath, for non-block-aligned metadata I/O.
    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Give the device back, dropping all cached blocks. Callers flush
    /// first; anything still dirty is lost.
    #[must_use]
    pub fn into_device(self) -> D {
        self.dev
    }

    fn check_range(&self, block: BlockNumber) -> Result<()> {
        if u64::from(block.0) >= self.block_count {
            return Err(Ext2Error::corruption(
                u64::from(block.0),
                format!("block past device end ({} blocks)", self.block_count),
            ));
        }
        Ok(())
    }

    fn touch(&mut self, block: u32) {
        if let Some(pos) = self.recency.iter().position(|&b| b == block) {
            self.recency.remove(pos);
        }
        self.recency.push_back(block);
    }

    fn evict_to_capacity(&mut self) -> Result<()> {
        while self.entries.len() > self.capacity {
            let Some(victim) = self.recency.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&victim) {
                if entry.dirty {
                    self.dev.write_all_at(
                        u64::from(victim) * u64::from(self.block_size),
                        &entry.data,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Fetch one block. `Peek` misses return `Ok(None)`; the other modes
    /// always return a buffer.
    pub fn get(&mut self, block: BlockNumber, mode: FetchMode) -> Result<Option<BlockBuf>> {
        self.check_range(block)?;
        if let Some(entry) = self.entries.get(&block.0) {
            let buf = BlockBuf::new(entry.data.clone());
            self.touch(block.0);
            return Ok(Some(buf));
        }
        let data = match mode {
            FetchMode::Peek => return Ok(None),
            FetchMode::Fresh => vec![0_u8; self.block_size as usize],
            FetchMode::Normal => {
                let mut buf = vec![0_u8; self.block_size as usize];
                self.dev
                    .read_exact_at(u64::from(block.0) * u64::from(self.block_size), &mut buf)?;
                buf
            }
        };
        self.entries.insert(
            block.0,
            CacheEntry {
                data: data.clone(),
                dirty: mode == FetchMode::Fresh,
            },
        );
        self.touch(block.0);
        self.evict_to_capacity()?;
        Ok(Some(BlockBuf::new(data)))
    }

    /// Whether `block` is resident without touching recency.
    #[must_use]
    pub fn is_resident(&self, block: BlockNumber) -> bool {
        self.entries.contains_key(&block.0)
    }

    /// Replace the block's contents and mark it dirty. Write-back happens on
    /// eviction or [`Self::flush`].
    pub fn write(&mut self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.check_range(block)?;
        if data.len() != self.block_size as usize {
            return Err(Ext2Error::Format(format!(
                "write size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        self.entries.insert(
            block.0,
            CacheEntry {
                data: data.to_vec(),
                dirty: true,
            },
        );
        self.touch(block.0);
        self.evict_to_capacity()
    }

    /// Drop a block from the cache without write-back. Used when the block
    /// was freed and its contents no longer matter.
    pub fn discard(&mut self, block: BlockNumber) {
        if self.entries.remove(&block.0).is_some() {
            if let Some(pos) = self.recency.iter().position(|&b| b == block.0) {
                self.recency.remove(pos);
            }
        }
    }

    /// Batch prefetch, advisory: reads each absent block into the cache and
    /// ignores nothing — errors are real I/O failures and do propagate.
    pub fn prefetch(&mut self, blocks: &[BlockNumber]) -> Result<()> {
        trace!(count = blocks.len(), "prefetch");
        for &block in blocks {
            if u64::from(block.0) >= self.block_count || self.entries.contains_key(&block.0) {
                continue;
            }
            let mut buf = vec![0_u8; self.block_size as usize];
            self.dev
                .read_exact_at(u64::from(block.0) * u64::from(self.block_size), &mut buf)?;
            self.entries.insert(block.0, CacheEntry {
                data: buf,
                dirty: false,
            });
            self.touch(block.0);
        }
        self.evict_to_capacity()
    }

    /// Write every dirty block back and sync the device.
    pub fn flush(&mut self) -> Result<()> {
        let mut dirty: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(&b, _)| b)
            .collect();
        dirty.sort_unstable();
        for block in dirty {
            if let Some(entry) = self.entries.get_mut(&block) {
                self.dev
                    .write_all_at(u64::from(block) * u64::from(self.block_size), &entry.data)?;
                entry.dirty = false;
            }
        }
        self.dev.sync()
    }
}
