#![forbid(unsafe_code)]
//! Filesystem handle for the ext2 metadata core.
//!
//! A [`Filesystem`] owns the superblock, the group descriptor array and the
//! two allocation bitmaps of one image, plus the block device they live on.
//! Handles come from [`Filesystem::initialize`] (a fresh, storage-empty
//! layout) or [`Filesystem::open`] (an existing image), are mutated through
//! accessors that track dirtiness, and reach stable storage only through
//! [`Filesystem::flush`] / [`Filesystem::close`].
//!
//! Everything is single-threaded and blocking. The handle assumes it is the
//! only writer; the one accommodation for a concurrently updated device is
//! the byte-diffed primary superblock write in `flush`.

mod alloc;
mod bitmaps;
mod dir;
mod flush;
mod initialize;
mod inode;
pub mod mkfs;

use std::time::{SystemTime, UNIX_EPOCH};

pub use ffs_alloc::{Bitmap, FsLayout, GroupLocation, group_has_full_backup};
pub use ffs_block::{
    BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice, MemByteDevice, read_region,
    write_region, zero_blocks,
};
pub use ffs_dir::{DirAction, DirEntry, EntryKind, IterFlags};
pub use ffs_error::{FfsError, Result};
pub use ffs_ondisk::{
    CompatFeatures, Ext2GroupDesc, Ext2Inode, Ext2Superblock, FeatureSet, FileType,
    IncompatFeatures, RoCompatFeatures,
};
pub use ffs_types::{BlockNumber, InodeNumber};
pub use initialize::InitParams;
pub use mkfs::{MkfsOptions, MkfsProfile, MkfsReport, ProfileEntry, mkfs};

use ffs_ondisk::parse_group_desc_table;
use ffs_types::{EXT2_DYNAMIC_REV, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE, ParseError};
use tracing::debug;

// ── Handle flags ────────────────────────────────────────────────────────────

/// State bits of an open handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FsFlags(u32);

impl FsFlags {
    pub const NONE: Self = Self(0);
    /// Opened (or created) with write access.
    pub const RW: Self = Self(0x01);
    /// Superblock or descriptors changed since the last flush.
    pub const DIRTY: Self = Self(0x02);
    pub const BB_DIRTY: Self = Self(0x04);
    pub const IB_DIRTY: Self = Self(0x08);
    /// Flush writes only the primary superblock and group 0's descriptors.
    pub const MASTER_SB_ONLY: Self = Self(0x10);
    /// Flush writes superblocks but no descriptor tables.
    pub const SUPER_ONLY: Self = Self(0x20);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for FsFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ── Open options ────────────────────────────────────────────────────────────

/// Options controlling how an existing image is opened.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Allow mutation. Unknown read-only-compatible features then block the
    /// open.
    pub write: bool,
    /// Skip the feature checks entirely. Diagnostics only.
    pub force: bool,
    /// Accept an external journal device image (no group layout).
    pub journal_dev_ok: bool,
}

/// Deferred bitmap writeback, installed once bitmaps are loaded or built.
pub type BitmapHook = fn(&mut Filesystem) -> Result<()>;

// ── Filesystem handle ───────────────────────────────────────────────────────

pub struct Filesystem {
    name: String,
    dev: Box<dyn BlockDevice>,
    sb: Ext2Superblock,
    /// Superblock bytes as last read or written; the diff base for flush.
    orig_super: Option<Box<[u8; EXT2_SUPERBLOCK_SIZE]>>,
    layout: FsLayout,
    group_desc: Vec<Ext2GroupDesc>,
    block_map: Option<Bitmap>,
    inode_map: Option<Bitmap>,
    flags: FsFlags,
    stride: u32,
    umask: u16,
    now: Option<u32>,
    write_bitmaps_hook: Option<BitmapHook>,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("flags", &self.flags)
            .field("block_map_loaded", &self.block_map.is_some())
            .field("inode_map_loaded", &self.inode_map.is_some())
            .field("dev_blocks", &self.dev.block_count())
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    /// Open an existing image on `dev`.
    ///
    /// Reads and checks the primary superblock, derives the layout and
    /// loads the descriptor table. Bitmaps are loaded lazily by
    /// [`Filesystem::read_bitmaps`].
    pub fn open(name: &str, mut dev: Box<dyn BlockDevice>, options: &OpenOptions) -> Result<Self> {
        let region = read_region(dev.as_ref(), EXT2_SUPERBLOCK_OFFSET as u64, EXT2_SUPERBLOCK_SIZE)?;
        let sb = Ext2Superblock::parse_superblock_region(&region)
            .map_err(|err| parse_error_to_ffs(&err))?;

        if sb.rev_level > EXT2_DYNAMIC_REV {
            return Err(FfsError::Format(format!(
                "revision {} is newer than this library",
                sb.rev_level
            )));
        }

        if !options.force {
            let features = sb.features();
            let incompat = features.incompat.outside(IncompatFeatures::SUPPORTED);
            if incompat.bits() != 0 {
                return Err(FfsError::UnsupportedFeature(incompat.to_string()));
            }
            let ro = features.ro_compat.outside(RoCompatFeatures::SUPPORTED);
            if options.write && ro.bits() != 0 {
                return Err(FfsError::UnsupportedReadOnlyFeature(ro.to_string()));
            }
        }

        let block_size = sb.block_size().map_err(|err| parse_error_to_ffs(&err))?.get();
        dev.set_block_size(block_size)?;
        let journal_dev = sb.has_incompat(IncompatFeatures::JOURNAL_DEV);
        let layout = if journal_dev {
            FsLayout::without_groups(&sb)?
        } else {
            FsLayout::from_superblock(&sb)?
        };
        let group_desc = if journal_dev {
            if !options.journal_dev_ok {
                return Err(FfsError::UnsupportedFeature(
                    "external journal device".to_owned(),
                ));
            }
            Vec::new()
        } else {
            let bits = block_size * 8;
            if sb.inodes_per_group == 0 || sb.inodes_per_group > bits {
                return Err(FfsError::InvalidGeometry(format!(
                    "inodes_per_group {} outside 1..={bits}",
                    sb.inodes_per_group
                )));
            }
            if sb.blocks_per_group > bits || sb.blocks_per_group % 8 != 0 {
                return Err(FfsError::InvalidGeometry(format!(
                    "blocks_per_group {} must be a multiple of 8 up to {bits}",
                    sb.blocks_per_group
                )));
            }
            let mut table = Vec::with_capacity(layout.desc_blocks as usize * block_size as usize);
            for i in 0..layout.desc_blocks {
                let blk = layout.descriptor_block(sb.first_data_block, i);
                table.extend_from_slice(dev.read_block(BlockNumber(blk))?.as_slice());
            }
            parse_group_desc_table(&table, layout.group_count as usize)
                .map_err(|err| parse_error_to_ffs(&err))?
        };

        let mut orig = Box::new([0_u8; EXT2_SUPERBLOCK_SIZE]);
        orig.copy_from_slice(&region);

        debug!(
            name,
            groups = layout.group_count,
            block_size,
            write = options.write,
            "opened filesystem"
        );

        Ok(Self {
            name: name.to_owned(),
            dev,
            sb,
            orig_super: Some(orig),
            layout,
            group_desc,
            block_map: None,
            inode_map: None,
            flags: if options.write { FsFlags::RW } else { FsFlags::NONE },
            stride: 0,
            umask: 0o022,
            now: None,
            write_bitmaps_hook: None,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn device(&self) -> &dyn BlockDevice {
        self.dev.as_ref()
    }

    #[must_use]
    pub fn superblock(&self) -> &Ext2Superblock {
        &self.sb
    }

    /// Mutable superblock access; marks the handle dirty.
    pub fn superblock_mut(&mut self) -> &mut Ext2Superblock {
        self.flags.insert(FsFlags::DIRTY);
        &mut self.sb
    }

    #[must_use]
    pub fn layout(&self) -> &FsLayout {
        &self.layout
    }

    #[must_use]
    pub fn group_descs(&self) -> &[Ext2GroupDesc] {
        &self.group_desc
    }

    /// Mutable descriptor access; marks the handle dirty.
    pub fn group_desc_mut(&mut self, group: u32) -> Result<&mut Ext2GroupDesc> {
        self.flags.insert(FsFlags::DIRTY);
        self.group_desc
            .get_mut(group as usize)
            .ok_or_else(|| FfsError::InvalidArgument(format!("group {group} out of range")))
    }

    #[must_use]
    pub fn block_map(&self) -> Option<&Bitmap> {
        self.block_map.as_ref()
    }

    #[must_use]
    pub fn inode_map(&self) -> Option<&Bitmap> {
        self.inode_map.as_ref()
    }

    /// Mutable block bitmap; marks it for writeback.
    pub fn block_map_mut(&mut self) -> Option<&mut Bitmap> {
        self.flags.insert(FsFlags::BB_DIRTY);
        self.block_map.as_mut()
    }

    /// Mutable inode bitmap; marks it for writeback.
    pub fn inode_map_mut(&mut self) -> Option<&mut Bitmap> {
        self.flags.insert(FsFlags::IB_DIRTY);
        self.inode_map.as_mut()
    }

    #[must_use]
    pub fn flags(&self) -> FsFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: FsFlags) {
        self.flags = flags;
    }

    pub(crate) fn require_rw(&self) -> Result<()> {
        if self.flags.contains(FsFlags::RW) {
            Ok(())
        } else {
            Err(FfsError::ReadOnly)
        }
    }

    #[must_use]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Stride hint for [`Filesystem::allocate_tables`].
    pub fn set_stride(&mut self, stride: u32) {
        self.stride = stride;
    }

    #[must_use]
    pub fn umask(&self) -> u16 {
        self.umask
    }

    /// Permission bits cleared from directories created by `mkdir`.
    pub fn set_umask(&mut self, umask: u16) {
        self.umask = umask & 0o777;
    }

    /// Pin the clock used for timestamps.
    pub fn set_now(&mut self, now: u32) {
        self.now = Some(now);
    }

    /// Current timestamp: the pinned clock, else wall time.
    #[must_use]
    pub fn now(&self) -> u32 {
        self.now.unwrap_or_else(wall_clock)
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.layout.block_size
    }

    /// Group count; 0 for an external journal device.
    #[must_use]
    pub fn group_count(&self) -> u32 {
        self.layout.group_count
    }

    /// Assign bitmap and inode-table blocks to every group that lacks them.
    pub fn allocate_tables(&mut self) -> Result<()> {
        let map = self
            .block_map
            .as_mut()
            .ok_or_else(|| FfsError::InvalidArgument("block bitmap not loaded".to_owned()))?;
        ffs_alloc::allocate_tables(&self.layout, &mut self.group_desc, map, self.stride)?;
        self.flags.insert(FsFlags::DIRTY | FsFlags::BB_DIRTY);
        Ok(())
    }

    /// Assign tables for a single group.
    pub fn allocate_group_table(&mut self, group: u32) -> Result<()> {
        let map = self
            .block_map
            .as_mut()
            .ok_or_else(|| FfsError::InvalidArgument("block bitmap not loaded".to_owned()))?;
        let desc = self
            .group_desc
            .get_mut(group as usize)
            .ok_or_else(|| FfsError::InvalidArgument(format!("group {group} out of range")))?;
        ffs_alloc::allocate_group_table(&self.layout, group, desc, map, self.stride)?;
        self.flags.insert(FsFlags::DIRTY | FsFlags::BB_DIRTY);
        Ok(())
    }
}

fn wall_clock() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

// ── Parse-layer conversion ──────────────────────────────────────────────────

fn parse_error_to_ffs(e: &ParseError) -> FfsError {
    match e {
        ParseError::InvalidField { field, reason } => {
            if field.contains("feature") || reason.contains("unsupported") {
                FfsError::UnsupportedFeature(format!("{field}: {reason}"))
            } else if field.contains("block_size")
                || field.contains("blocks_per_group")
                || field.contains("inodes_per_group")
                || field.contains("inode_size")
                || field.contains("first_data_block")
                || field.contains("blocks_count")
                || field.contains("inodes_count")
            {
                FfsError::InvalidGeometry(format!("{field}: {reason}"))
            } else {
                FfsError::Format(e.to_string())
            }
        }
        ParseError::InvalidMagic { .. } => FfsError::Format(e.to_string()),
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            FfsError::Corruption {
                block: 0,
                detail: e.to_string(),
            }
        }
    }
}

/// Like [`parse_error_to_ffs`] but pinned to the block being decoded.
fn corrupt_at(block: u32, e: &ParseError) -> FfsError {
    FfsError::Corruption {
        block,
        detail: e.to_string(),
    }
}
