#![forbid(unsafe_code)]
//! Error types for ext2d.
//!
//! Two tiers are deliberately distinct:
//!
//! - **Recoverable errors** are returned to the calling operation and map to
//!   a POSIX errno (`NoSpace` → `ENOSPC`, `NotFound` → `ENOENT`, ...). They
//!   describe conditions a caller can act on.
//! - **Fatal errors** ([`Ext2Error::Corruption`]) indicate either a corrupt
//!   volume or a logic bug: an allocator handing out a reserved system block,
//!   a bitmap bit cleared twice, a group-descriptor index past the group
//!   count. Their only legal handling is to propagate to the top-level caller
//!   which stops serving the volume; continuing would risk writing further
//!   corruption to disk. [`Ext2Error::is_fatal`] classifies.
//!
//! This crate is intentionally independent of `ext2d-types`; the conversion
//! from `ParseError` happens in `ext2d-core`, which knows the mount context.

use thiserror::Error;

/// Unified error type for all ext2d operations.
#[derive(Debug, Error)]
pub enum Ext2Error {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption or an internal invariant violation at a
    /// known block. Fatal: the volume must stop being served.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Structurally invalid on-disk format (bad magic, bad geometry field).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// The volume declares an incompatible feature this build does not
    /// implement. Mount is refused rather than guessed at.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Block size valid for ext2 but outside the supported range.
    #[error("unsupported block size: {0}")]
    UnsupportedBlockSize(String),

    /// No free blocks or inodes remain.
    #[error("no space left on device")]
    NoSpace,

    /// Name not present in the directory.
    #[error("not found")]
    NotFound,

    /// Name already present in the directory.
    #[error("already exists")]
    Exists,

    /// A directory operation was applied to a non-directory.
    #[error("not a directory")]
    NotDirectory,

    /// A file operation was applied to a directory.
    #[error("is a directory")]
    IsDirectory,

    /// rmdir of a directory still holding entries.
    #[error("directory not empty")]
    NotEmpty,

    /// Write attempted on a read-only volume.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Offset past the maximum file size for this block size.
    #[error("file too big")]
    FileTooBig,

    /// Directory entry name longer than 255 bytes.
    #[error("name too long")]
    NameTooLong,

    /// Link count would exceed the per-inode maximum.
    #[error("too many links")]
    TooManyLinks,

    /// Arguments that can never succeed: renaming a directory beneath
    /// itself, byte I/O on a non-regular file, an empty symlink target.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The object is in use (unmount with live references, unlinking a
    /// mount point).
    #[error("resource busy")]
    Busy,

    /// Every in-core inode slot holds a referenced inode.
    #[error("out of in-core inode slots")]
    OutOfCacheSlots,
}

/// Result alias used throughout the workspace.
pub type Result<T, E = Ext2Error> = std::result::Result<T, E>;

impl Ext2Error {
    /// Whether this error ends service of the volume.
    ///
    /// Superblock/GDT I/O failures surface as `Io` from the flush path and
    /// are treated as fatal by the caller of `flush`, not here; only
    /// invariant violations are unconditionally fatal.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    /// Map to a POSIX errno. Exhaustive on purpose: adding a variant does
    /// not compile until an errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Io(_) | Self::Corruption { .. } => libc_consts::EIO,
            Self::Format(_) => libc_consts::EINVAL,
            Self::UnsupportedFeature(_) | Self::UnsupportedBlockSize(_) => libc_consts::EOPNOTSUPP,
            Self::NoSpace => libc_consts::ENOSPC,
            Self::NotFound => libc_consts::ENOENT,
            Self::Exists => libc_consts::EEXIST,
            Self::NotDirectory => libc_consts::ENOTDIR,
            Self::IsDirectory => libc_consts::EISDIR,
            Self::NotEmpty => libc_consts::ENOTEMPTY,
            Self::ReadOnly => libc_consts::EROFS,
            Self::FileTooBig => libc_consts::EFBIG,
            Self::NameTooLong => libc_consts::ENAMETOOLONG,
            Self::TooManyLinks => libc_consts::EMLINK,
            Self::InvalidArgument(_) => libc_consts::EINVAL,
            Self::Busy => libc_consts::EBUSY,
            Self::OutOfCacheSlots => libc_consts::ENFILE,
        }
    }

    /// Convenience constructor for the fatal tier.
    #[must_use]
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }
}

/// Errno values used by [`Ext2Error::to_errno`] (Linux numbering), inlined
/// here so the crate does not pull in `libc` for sixteen constants.
mod libc_consts {
    pub const EIO: i32 = 5;
    pub const ENOENT: i32 = 2;
    pub const EINVAL: i32 = 22;
    pub const EOPNOTSUPP: i32 = 95;
    pub const ENOSPC: i32 = 28;
    pub const EEXIST: i32 = 17;
    pub const ENOTDIR: i32 = 20;
    pub const EISDIR: i32 = 21;
    pub const ENOTEMPTY: i32 = 39;
    pub const EROFS: i32 = 30;
    pub const EFBIG: i32 = 27;
    pub const ENAMETOOLONG: i32 = 36;
    pub const EMLINK: i32 = 31;
    pub const EBUSY: i32 = 16;
    pub const ENFILE: i32 = 23;
}
