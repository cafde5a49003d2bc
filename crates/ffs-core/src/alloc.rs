//! Block and inode allocation against the in-memory bitmaps.
//!
//! `new_block` and `new_inode` only pick a free unit; the caller commits it
//! with the matching `*_alloc_stats` call once the unit is actually used.

use crate::{Filesystem, FsFlags};
use ffs_error::{FfsError, Result};
use ffs_types::{
    BlockNumber, EXT2_BG_BLOCK_UNINIT, EXT2_BG_INODE_UNINIT, InodeNumber, block_to_group,
    inode_to_group,
};
use tracing::{trace, warn};

fn not_loaded(what: &str) -> FfsError {
    FfsError::InvalidArgument(format!("{what} bitmap not loaded"))
}

/// `value - delta`, clamped to the field's range.
fn adjust_u16(value: u16, delta: i32) -> u16 {
    let next = i64::from(value) - i64::from(delta);
    u16::try_from(next.clamp(0, i64::from(u16::MAX))).unwrap_or(u16::MAX)
}

fn adjust_u32(value: u32, delta: i32) -> u32 {
    let next = i64::from(value) - i64::from(delta);
    u32::try_from(next.clamp(0, i64::from(u32::MAX))).unwrap_or(u32::MAX)
}

impl Filesystem {
    /// First free block at or after `goal`, wrapping to the first data
    /// block. A goal outside the filesystem starts at the first data block.
    pub fn new_block(&self, goal: BlockNumber) -> Result<BlockNumber> {
        let map = self.block_map.as_ref().ok_or_else(|| not_loaded("block"))?;
        let first = self.sb.first_data_block;
        let goal = if goal.0 < first || goal.0 >= self.sb.blocks_count {
            first
        } else {
            goal.0
        };
        map.find_zero_wrapping(goal, first)
            .map(BlockNumber)
            .ok_or(FfsError::NoSpace)
    }

    /// First free inode starting in `dir`'s group, wrapping to the first
    /// non-reserved inode. `dir` of 0 starts at the beginning.
    pub fn new_inode(&self, dir: InodeNumber) -> Result<InodeNumber> {
        let map = self.inode_map.as_ref().ok_or_else(|| not_loaded("inode"))?;
        let first_ino = self.sb.first_ino();
        let ipg = self.layout.inodes_per_group;
        let start = if dir.0 > 0 {
            inode_to_group(dir, ipg).0 * ipg + 1
        } else {
            0
        }
        .max(first_ino);
        if start > self.sb.inodes_count {
            return Err(FfsError::NoSpace);
        }
        map.find_zero_wrapping(start, first_ino)
            .map(InodeNumber)
            .ok_or(FfsError::NoSpace)
    }

    /// Mark `block` in use (`inuse > 0`) or free (`inuse < 0`) and adjust
    /// the group and superblock free counts.
    pub fn block_alloc_stats(&mut self, block: BlockNumber, inuse: i32) -> Result<()> {
        let group = block_to_group(block, self.layout.blocks_per_group, self.sb.first_data_block).0;
        let map = self.block_map.as_mut().ok_or_else(|| not_loaded("block"))?;
        if inuse > 0 {
            map.mark(block.0);
        } else {
            map.unmark(block.0);
        }
        let Some(desc) = self.group_desc.get_mut(group as usize) else {
            warn!(block = block.0, group, "block outside every group");
            return Err(FfsError::InvalidArgument(format!("block {block} out of range")));
        };
        desc.free_blocks_count = adjust_u16(desc.free_blocks_count, inuse);
        desc.flags &= !EXT2_BG_BLOCK_UNINIT;
        self.sb.free_blocks_count = adjust_u32(self.sb.free_blocks_count, inuse);
        self.flags.insert(FsFlags::DIRTY | FsFlags::BB_DIRTY);
        trace!(block = block.0, group, inuse, "block alloc stats");
        Ok(())
    }

    /// Inode counterpart of [`Filesystem::block_alloc_stats`]; `is_dir`
    /// also adjusts the group's directory count.
    pub fn inode_alloc_stats(&mut self, ino: InodeNumber, inuse: i32, is_dir: bool) -> Result<()> {
        let group = inode_to_group(ino, self.layout.inodes_per_group).0;
        let map = self.inode_map.as_mut().ok_or_else(|| not_loaded("inode"))?;
        if inuse > 0 {
            map.mark(ino.0);
        } else {
            map.unmark(ino.0);
        }
        let Some(desc) = self.group_desc.get_mut(group as usize) else {
            warn!(ino = ino.0, group, "inode outside every group");
            return Err(FfsError::InvalidArgument(format!("inode {ino} out of range")));
        };
        desc.free_inodes_count = adjust_u16(desc.free_inodes_count, inuse);
        if is_dir {
            desc.used_dirs_count = adjust_u16(desc.used_dirs_count, -inuse);
        }
        desc.flags &= !EXT2_BG_INODE_UNINIT;
        self.sb.free_inodes_count = adjust_u32(self.sb.free_inodes_count, inuse);
        self.flags.insert(FsFlags::DIRTY | FsFlags::IB_DIRTY);
        trace!(ino = ino.0, group, inuse, is_dir, "inode alloc stats");
        Ok(())
    }
}
