//! Group table allocation: concrete blocks for each group's block bitmap,
//! inode bitmap and inode table.

use crate::Bitmap;
use crate::layout::FsLayout;
use ffs_error::{FfsError, Result};
use ffs_ondisk::Ext2GroupDesc;
use tracing::debug;

fn exhausted(group: u32, what: &str) -> FfsError {
    FfsError::AllocationExhausted(format!("group {group}: no free blocks for {what}"))
}

/// Find one free block from `start`, falling back to the group start.
fn single_block(bmap: &Bitmap, start: u32, group_blk: u32, search_end: u32) -> Option<u32> {
    bmap.find_free_run(start, search_end, 1)
        .or_else(|| bmap.find_free_run(group_blk, search_end, 1))
}

/// Assign `desc`'s unset table locations for `group`, marking them in `bmap`.
///
/// With a nonzero `stride` the bitmaps start past the first free run plus
/// the inode table span, shifted by `stride * group` within the group, so a
/// striped array sees them spread across its members.
pub fn allocate_group_table(
    layout: &FsLayout,
    group: u32,
    desc: &mut Ext2GroupDesc,
    bmap: &mut Bitmap,
    stride: u32,
) -> Result<()> {
    let group_blk = layout.group_first_block(group);
    let mut search_end = group_blk.saturating_add(layout.blocks_per_group);
    if search_end >= layout.blocks_count {
        search_end = layout.blocks_count.saturating_sub(1);
    }

    let start_blk = if stride == 0 {
        group_blk
    } else {
        let first_free = bmap
            .find_free_run(group_blk, search_end, 1)
            .ok_or_else(|| exhausted(group, "stride anchor"))?;
        let base = u64::from(first_free) + u64::from(layout.inode_blocks_per_group);
        let end = u64::from(search_end);
        if base >= end {
            group_blk
        } else {
            let start = base + (u64::from(stride) * u64::from(group)) % (end - base);
            u32::try_from(start).unwrap_or(group_blk)
        }
    };

    if desc.block_bitmap == 0 {
        let blk = single_block(bmap, start_blk, group_blk, search_end)
            .ok_or_else(|| exhausted(group, "block bitmap"))?;
        bmap.mark(blk);
        desc.block_bitmap = blk;
    }

    if desc.inode_bitmap == 0 {
        let blk = single_block(bmap, start_blk, group_blk, search_end)
            .ok_or_else(|| exhausted(group, "inode bitmap"))?;
        bmap.mark(blk);
        desc.inode_bitmap = blk;
    }

    if desc.inode_table == 0 {
        let blk = bmap
            .find_free_run(group_blk, search_end, layout.inode_blocks_per_group)
            .ok_or_else(|| exhausted(group, "inode table"))?;
        bmap.mark_range(blk, layout.inode_blocks_per_group);
        desc.inode_table = blk;
    }

    debug!(
        group,
        block_bitmap = desc.block_bitmap,
        inode_bitmap = desc.inode_bitmap,
        inode_table = desc.inode_table,
        "placed group tables"
    );
    Ok(())
}

/// Allocate tables for every group in order, stopping at the first failure.
pub fn allocate_tables(
    layout: &FsLayout,
    descs: &mut [Ext2GroupDesc],
    bmap: &mut Bitmap,
    stride: u32,
) -> Result<()> {
    for (group, desc) in (0_u32..).zip(descs.iter_mut()) {
        allocate_group_table(layout, group, desc, bmap, stride)?;
    }
    Ok(())
}
