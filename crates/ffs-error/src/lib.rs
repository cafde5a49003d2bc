#![forbid(unsafe_code)]
//! Error types for the ext2 metadata core.
//!
//! # Error Taxonomy
//!
//! Two layers, same as the rest of the workspace:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ffs-types` | Byte-level decode/encode failures |
//! | Runtime | `FfsError` | `ffs-error` (this crate) | Errors returned by every library operation |
//!
//! `ffs-error` does not depend on `ffs-types`; `ffs-core` owns the
//! `ParseError → FfsError` conversion. Truncated or inconsistent metadata
//! read from a live image becomes `Corruption { block, detail }`; a bad magic
//! or unknown revision becomes `Format`.
//!
//! ## Layout and allocation failures
//!
//! | Failure | Variant | errno |
//! |---------|---------|-------|
//! | Zero blocks, reserved ≥ total, bad parameter | `InvalidArgument` | `EINVAL` |
//! | Unknown incompat feature bit | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | Unknown ro_compat feature bit | `UnsupportedReadOnlyFeature` | `EROFS` |
//! | Cannot form one viable group | `TooSmall` | `EINVAL` |
//! | Inode density does not fit the geometry | `TooManyInodes` | `EINVAL` |
//! | Reserved GDT count above one block of pointers | `ReservedGdtBlocks` | `EINVAL` |
//! | No free run for group metadata | `AllocationExhausted` | `ENOSPC` |
//!
//! `UnsupportedFeature` and `UnsupportedReadOnlyFeature` stay separate: an
//! image with only unknown read-only bits can still be opened read-only.
//!
//! ## Directory failures
//!
//! | Failure | Variant | errno |
//! |---------|---------|-------|
//! | Record fails structural validation | `DirectoryCorrupted` | `EIO` |
//! | No record in any block can hold the name | `DirectoryFull` | `ENOSPC` |
//! | Inode is not a directory | `NotDirectory` | `ENOTDIR` |
//!
//! `DirectoryFull` is not corruption: the caller grows the directory with
//! `expand_dir` and retries.
//!
//! ## Errno mapping
//!
//! Every variant maps to exactly one errno via [`FfsError::to_errno`]. The
//! match has no wildcard arm, so adding a variant fails to compile until its
//! errno is chosen.

use thiserror::Error;

/// Unified error type for all library operations.
#[derive(Debug, Error)]
pub enum FfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    /// Not an ext2 image, or a revision this library cannot read.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Caller-supplied parameter is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Derived geometry is inconsistent (e.g. the initializer failed to converge).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Incompatible feature bits outside the supported set.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Read-only-compatible feature bits outside the supported set.
    #[error("unsupported read-only feature: {0}")]
    UnsupportedReadOnlyFeature(String),

    /// The device cannot hold even one viable block group.
    #[error("filesystem too small")]
    TooSmall,

    /// The requested inode count cannot be laid out with this geometry.
    #[error("too many inodes requested")]
    TooManyInodes,

    /// Reserved GDT blocks exceed what one block of pointers addresses.
    #[error("too many reserved group descriptor blocks: {requested} > {max}")]
    ReservedGdtBlocks { requested: u32, max: u32 },

    /// No free run large enough for group metadata or a new block.
    #[error("allocation exhausted: {0}")]
    AllocationExhausted(String),

    /// A directory block failed record-structural validation.
    #[error("directory block {block} corrupted at offset {offset}")]
    DirectoryCorrupted { block: u32, offset: usize },

    /// No room for the new entry in any directory block.
    #[error("no free space in the directory")]
    DirectoryFull,

    /// No free inodes or blocks left.
    #[error("no space left on device")]
    NoSpace,

    /// Named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Mutation attempted on a handle opened without write access.
    #[error("read-only filesystem")]
    ReadOnly,

    /// The inode is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Name exceeds 255 bytes.
    #[error("name too long")]
    NameTooLong,

    /// Target already exists.
    #[error("file exists")]
    Exists,

    /// The I/O channel lacks a requested primitive.
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl FfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// Policy notes:
    /// - `UnsupportedReadOnlyFeature` → `EROFS`: the image may still be
    ///   opened read-only.
    /// - `DirectoryFull` → `ENOSPC`: same errno as a full device so shells
    ///   report "No space left", but the variant stays distinct for callers
    ///   that grow the directory.
    /// - `AllocationExhausted` → `ENOSPC`.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::DirectoryCorrupted { .. } => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidArgument(_)
            | Self::InvalidGeometry(_)
            | Self::TooSmall
            | Self::TooManyInodes
            | Self::ReservedGdtBlocks { .. } => libc::EINVAL,
            Self::UnsupportedFeature(_) | Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::UnsupportedReadOnlyFeature(_) | Self::ReadOnly => libc::EROFS,
            Self::AllocationExhausted(_) | Self::DirectoryFull | Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
        }
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;
