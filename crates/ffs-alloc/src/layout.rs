//! Group layout placement.
//!
//! Pure arithmetic over the superblock geometry: no I/O, no allocation
//! beyond the small result structs. Every block number here is a `u32`
//! because ext2 descriptors are 32-bit.

use crate::Bitmap;
use ffs_error::{FfsError, Result};
use ffs_ondisk::{Ext2Superblock, IncompatFeatures, RoCompatFeatures};
use ffs_types::{BlockNumber, EXT2_GROUP_DESC_SIZE};
use serde::Serialize;
use tracing::trace;

// ── Backup placement ────────────────────────────────────────────────────────

/// True when `a` is 0, 1 or an exact power of `b`.
fn test_root(mut a: u32, b: u32) -> bool {
    if a == 0 {
        return true;
    }
    loop {
        if a == 1 {
            return true;
        }
        if a % b != 0 {
            return false;
        }
        a /= b;
    }
}

/// Does `group` carry a superblock and descriptor table backup?
///
/// Every group does without `sparse_super`. With it, only groups 0, 1 and
/// the powers of 3, 5 and 7 do.
#[must_use]
pub fn group_has_full_backup(group: u32, sparse_super: bool) -> bool {
    if !sparse_super {
        return true;
    }
    test_root(group, 3) || test_root(group, 5) || test_root(group, 7)
}

/// Reserved GDT blocks needed to grow to 1024x the current size (or the
/// 32-bit block ceiling), capped at one block of block pointers.
#[must_use]
pub fn calc_reserved_gdt_blocks(
    blocks_count: u32,
    first_data_block: u32,
    blocks_per_group: u32,
    block_size: u32,
    desc_blocks: u32,
) -> u32 {
    let descs_per_block = u64::from(block_size / EXT2_GROUP_DESC_SIZE);
    let addr_per_block = block_size / 4;
    let max_blocks = if u64::from(blocks_count) < u64::from(u32::MAX) / 1024 {
        u64::from(blocks_count) * 1024
    } else {
        u64::from(u32::MAX)
    };
    let bpg = u64::from(blocks_per_group.max(1));
    let rsv_groups = (max_blocks - u64::from(first_data_block)).div_ceil(bpg);
    let rsv_gdb = rsv_groups
        .div_ceil(descs_per_block.max(1))
        .saturating_sub(u64::from(desc_blocks));
    u32::try_from(rsv_gdb.min(u64::from(addr_per_block))).unwrap_or(addr_per_block)
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Derived filesystem geometry: everything the placement math needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsLayout {
    pub block_size: u32,
    pub blocks_count: u32,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u32,
    pub group_count: u32,
    pub desc_blocks: u32,
    pub inode_blocks_per_group: u32,
    pub reserved_gdt_blocks: u32,
    pub first_meta_bg: u32,
    pub sparse_super: bool,
    pub meta_bg: bool,
}

/// Where one group's fixed metadata sits and what it leaves for data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupLocation {
    pub group: u32,
    /// Superblock copy, if the group carries one.
    pub super_block: Option<BlockNumber>,
    /// First block of a classic descriptor table copy.
    pub old_desc: Option<BlockNumber>,
    /// One-block meta-bg descriptor slice.
    pub new_desc: Option<BlockNumber>,
    pub meta_bg: u32,
    /// Blocks left once the superblock, descriptors, both bitmaps and the
    /// inode table are accounted for.
    pub free_blocks: u32,
}

impl FsLayout {
    /// Derive the layout from a superblock, validating the fields the
    /// arithmetic divides by.
    pub fn from_superblock(sb: &Ext2Superblock) -> Result<Self> {
        let block_size = sb
            .block_size()
            .map_err(|err| FfsError::Format(err.to_string()))?
            .get();
        if sb.blocks_per_group == 0 {
            return Err(FfsError::InvalidGeometry("blocks_per_group is zero".into()));
        }
        if sb.first_data_block >= sb.blocks_count && sb.blocks_count != 0 {
            return Err(FfsError::InvalidGeometry(format!(
                "first_data_block {} beyond blocks_count {}",
                sb.first_data_block, sb.blocks_count
            )));
        }
        let inode_size = u32::from(sb.inode_size());
        if inode_size == 0 || inode_size > block_size || !inode_size.is_power_of_two() {
            return Err(FfsError::InvalidGeometry(format!("bad inode size {inode_size}")));
        }

        let group_count =
            (sb.blocks_count.saturating_sub(sb.first_data_block)).div_ceil(sb.blocks_per_group);
        let descs_per_block = block_size / EXT2_GROUP_DESC_SIZE;
        let desc_blocks = group_count.div_ceil(descs_per_block);
        let inode_blocks_per_group =
            u32::try_from((u64::from(sb.inodes_per_group) * u64::from(inode_size)).div_ceil(u64::from(block_size)))
                .map_err(|_| FfsError::InvalidGeometry("inode table too large".into()))?;

        Ok(Self {
            block_size,
            blocks_count: sb.blocks_count,
            first_data_block: sb.first_data_block,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            inode_size,
            group_count,
            desc_blocks,
            inode_blocks_per_group,
            reserved_gdt_blocks: u32::from(sb.reserved_gdt_blocks),
            first_meta_bg: sb.first_meta_bg,
            sparse_super: sb.has_ro_compat(RoCompatFeatures::SPARSE_SUPER),
            meta_bg: sb.has_incompat(IncompatFeatures::META_BG),
        })
    }

    /// Layout of a device that carries a superblock but no block groups,
    /// such as an external journal. Block geometry is taken as-is.
    pub fn without_groups(sb: &Ext2Superblock) -> Result<Self> {
        let block_size = sb
            .block_size()
            .map_err(|err| FfsError::Format(err.to_string()))?
            .get();
        Ok(Self {
            block_size,
            blocks_count: sb.blocks_count,
            first_data_block: sb.first_data_block,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: 0,
            inode_size: u32::from(sb.inode_size()),
            group_count: 0,
            desc_blocks: 0,
            inode_blocks_per_group: 0,
            reserved_gdt_blocks: 0,
            first_meta_bg: sb.first_meta_bg,
            sparse_super: sb.has_ro_compat(RoCompatFeatures::SPARSE_SUPER),
            meta_bg: sb.has_incompat(IncompatFeatures::META_BG),
        })
    }

    #[must_use]
    pub fn descs_per_block(&self) -> u32 {
        self.block_size / EXT2_GROUP_DESC_SIZE
    }

    #[must_use]
    pub fn has_super(&self, group: u32) -> bool {
        group_has_full_backup(group, self.sparse_super)
    }

    /// First block of `group`.
    #[must_use]
    pub fn group_first_block(&self, group: u32) -> u32 {
        self.first_data_block
            .saturating_add(group.saturating_mul(self.blocks_per_group))
    }

    /// Last block of `group`, clipped to the device.
    #[must_use]
    pub fn group_last_block(&self, group: u32) -> u32 {
        if group + 1 >= self.group_count {
            self.blocks_count.saturating_sub(1)
        } else {
            self.group_first_block(group) + self.blocks_per_group - 1
        }
    }

    /// Blocks in `group`: a full group, or the tail remainder for the last.
    #[must_use]
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        if group + 1 == self.group_count {
            let rem = (self.blocks_count - self.first_data_block) % self.blocks_per_group;
            if rem == 0 { self.blocks_per_group } else { rem }
        } else {
            self.blocks_per_group
        }
    }

    /// Descriptor blocks behind a classic superblock copy.
    ///
    /// Under `meta_bg` only the first `first_meta_bg` descriptor blocks stay
    /// in the classic position; otherwise the whole table plus the reserved
    /// growth area does.
    #[must_use]
    pub fn old_desc_blocks(&self) -> u32 {
        if self.meta_bg {
            self.first_meta_bg
        } else {
            self.desc_blocks + self.reserved_gdt_blocks
        }
    }

    /// Place `group`'s superblock and descriptor copies.
    #[must_use]
    pub fn locate(&self, group: u32) -> GroupLocation {
        let group_block = self.group_first_block(group);
        let mut numblocks = i64::from(self.blocks_in_group(group));

        let has_super = self.has_super(group);
        let mut super_block = None;
        if has_super {
            super_block = Some(BlockNumber(group_block));
            numblocks -= 1;
        }

        let meta_bg_size = self.descs_per_block();
        let meta_bg = group / meta_bg_size;
        let mut old_desc = None;
        let mut new_desc = None;

        if !self.meta_bg || meta_bg < self.first_meta_bg {
            if has_super {
                old_desc = Some(BlockNumber(group_block + 1));
                numblocks -= i64::from(self.old_desc_blocks());
            }
        } else {
            let pos = group % meta_bg_size;
            if pos == 0 || pos == 1 || pos == meta_bg_size - 1 {
                new_desc = Some(BlockNumber(group_block + u32::from(has_super)));
                numblocks -= 1;
            }
        }

        numblocks -= 2 + i64::from(self.inode_blocks_per_group);

        GroupLocation {
            group,
            super_block,
            old_desc,
            new_desc,
            meta_bg,
            free_blocks: u32::try_from(numblocks.max(0)).unwrap_or(0),
        }
    }

    /// Block holding descriptor block `i` relative to a superblock at
    /// `group_block` (the first data block for the primary copy).
    #[must_use]
    pub fn descriptor_block(&self, group_block: u32, i: u32) -> u32 {
        if !self.meta_bg || i < self.first_meta_bg {
            return group_block + i + 1;
        }
        let bg = self.descs_per_block() * i;
        self.group_first_block(bg) + u32::from(self.has_super(bg))
    }

    /// Groups carrying a superblock copy, group 0 included.
    pub fn backup_groups(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.group_count).filter(|&g| self.has_super(g))
    }
}

/// Mark `group`'s superblock and descriptor blocks in `bmap` and return the
/// group's data block yield.
pub fn reserve_super_and_bgd(layout: &FsLayout, group: u32, bmap: &mut Bitmap) -> u32 {
    let loc = layout.locate(group);

    if let Some(sb) = loc.super_block {
        bmap.mark(sb.0);
    }
    if let Some(old) = loc.old_desc {
        bmap.mark_range(old.0, layout.old_desc_blocks());
    }
    if let Some(new) = loc.new_desc {
        bmap.mark(new.0);
    }

    trace!(
        group,
        super_block = ?loc.super_block,
        old_desc = ?loc.old_desc,
        new_desc = ?loc.new_desc,
        free = loc.free_blocks,
        "reserved group metadata"
    );
    loc.free_blocks
}
