//! Inode table access and block-map walking.

use crate::{Filesystem, corrupt_at};
use ffs_block::zero_blocks;
use ffs_error::{FfsError, Result};
use ffs_ondisk::Ext2Inode;
use ffs_types::{
    BlockNumber, EXT2_DIND_BLOCK, EXT2_IND_BLOCK, EXT2_NDIR_BLOCKS, EXT2_TIND_BLOCK, InodeNumber,
    inode_index_in_group, inode_to_group, read_le_u32,
};
use tracing::trace;

/// Where an inode's on-disk slot lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InodeSlot {
    block: BlockNumber,
    offset: usize,
}

/// Root pointer slot and per-level indices that reach logical block
/// `lblk`; `None` past the triple-indirect range.
fn block_path(lblk: u64, apb: u64) -> Option<(usize, Vec<usize>)> {
    let idx = |v: u64| usize::try_from(v).ok();
    let ndir = EXT2_NDIR_BLOCKS as u64;
    if lblk < ndir {
        return Some((idx(lblk)?, Vec::new()));
    }
    let mut rest = lblk - ndir;
    if rest < apb {
        return Some((EXT2_IND_BLOCK, vec![idx(rest)?]));
    }
    rest -= apb;
    if rest < apb * apb {
        return Some((EXT2_DIND_BLOCK, vec![idx(rest / apb)?, idx(rest % apb)?]));
    }
    rest -= apb * apb;
    if rest < apb * apb * apb {
        return Some((
            EXT2_TIND_BLOCK,
            vec![
                idx(rest / (apb * apb))?,
                idx((rest / apb) % apb)?,
                idx(rest % apb)?,
            ],
        ));
    }
    None
}

impl Filesystem {
    fn inode_slot(&self, ino: InodeNumber) -> Result<InodeSlot> {
        if ino.0 == 0 || ino.0 > self.sb.inodes_count {
            return Err(FfsError::InvalidArgument(format!("inode {ino} out of range")));
        }
        let ipg = self.layout.inodes_per_group;
        let group = inode_to_group(ino, ipg).0;
        let table = self
            .group_desc
            .get(group as usize)
            .map(|desc| desc.inode_table)
            .ok_or_else(|| FfsError::InvalidArgument(format!("inode {ino} out of range")))?;
        if table == 0 {
            return Err(FfsError::Corruption {
                block: 0,
                detail: format!("group {group} has no inode table"),
            });
        }
        let isz = u64::from(self.sb.inode_size());
        let bs = u64::from(self.layout.block_size);
        let byte = u64::from(inode_index_in_group(ino, ipg)) * isz;
        let block = u32::try_from(u64::from(table) + byte / bs)
            .map_err(|_| FfsError::InvalidArgument(format!("inode {ino} out of range")))?;
        Ok(InodeSlot {
            block: BlockNumber(block),
            offset: usize::try_from(byte % bs).unwrap_or(0),
        })
    }

    /// Decode inode `ino` from its table slot.
    pub fn read_inode(&self, ino: InodeNumber) -> Result<Ext2Inode> {
        let slot = self.inode_slot(ino)?;
        let block = self.dev.read_block(slot.block)?;
        Ext2Inode::parse_from_bytes(&block.as_slice()[slot.offset..])
            .map_err(|err| corrupt_at(slot.block.0, &err))
    }

    /// Encode `inode` over the first 128 bytes of its slot; any larger
    /// slot tail is left as it was.
    pub fn write_inode(&mut self, ino: InodeNumber, inode: &Ext2Inode) -> Result<()> {
        self.store_inode(ino, inode, false)
    }

    /// Like [`Filesystem::write_inode`] but zeroes the whole slot first.
    pub fn write_new_inode(&mut self, ino: InodeNumber, inode: &Ext2Inode) -> Result<()> {
        self.store_inode(ino, inode, true)
    }

    fn store_inode(&mut self, ino: InodeNumber, inode: &Ext2Inode, fresh: bool) -> Result<()> {
        self.require_rw()?;
        let slot = self.inode_slot(ino)?;
        let isz = usize::from(self.sb.inode_size());
        let mut block = self.dev.read_block(slot.block)?.into_inner();
        let region = &mut block[slot.offset..slot.offset + isz];
        if fresh {
            region.fill(0);
        }
        inode
            .write_to_bytes(region)
            .map_err(|err| corrupt_at(slot.block.0, &err))?;
        self.dev.write_block(slot.block, &block)?;
        trace!(ino = ino.0, block = slot.block.0, fresh, "wrote inode");
        Ok(())
    }

    /// `NotDirectory` unless `ino` is a directory.
    pub fn check_directory(&self, ino: InodeNumber) -> Result<()> {
        if self.read_inode(ino)?.is_dir() {
            Ok(())
        } else {
            Err(FfsError::NotDirectory)
        }
    }

    fn check_pointer(&self, ptr: u32, holder: u32) -> Result<BlockNumber> {
        if ptr < self.sb.first_data_block || ptr >= self.sb.blocks_count {
            return Err(FfsError::Corruption {
                block: holder,
                detail: format!("block pointer {ptr} outside the filesystem"),
            });
        }
        Ok(BlockNumber(ptr))
    }

    /// Every mapped data block of `inode` as `(logical, physical)`, in
    /// logical order. Holes are skipped.
    pub fn data_blocks(&self, inode: &Ext2Inode) -> Result<Vec<(u64, BlockNumber)>> {
        let apb = u64::from(self.layout.block_size / 4);
        let mut out = Vec::new();
        for (lblk, &ptr) in (0_u64..).zip(inode.block[..EXT2_NDIR_BLOCKS].iter()) {
            if ptr != 0 {
                out.push((lblk, self.check_pointer(ptr, 0)?));
            }
        }
        let mut base = EXT2_NDIR_BLOCKS as u64;
        let mut span = apb;
        for (depth, slot) in [(1_u32, EXT2_IND_BLOCK), (2, EXT2_DIND_BLOCK), (3, EXT2_TIND_BLOCK)] {
            let ptr = inode.block[slot];
            if ptr != 0 {
                let table = self.check_pointer(ptr, 0)?;
                self.walk_indirect(table, depth, base, apb, &mut out)?;
            }
            base += span;
            span *= apb;
        }
        Ok(out)
    }

    fn walk_indirect(
        &self,
        table: BlockNumber,
        depth: u32,
        base: u64,
        apb: u64,
        out: &mut Vec<(u64, BlockNumber)>,
    ) -> Result<()> {
        let block = self.dev.read_block(table)?;
        let per_entry = apb.pow(depth - 1);
        for i in 0..apb {
            let off = usize::try_from(i * 4).unwrap_or(usize::MAX);
            let ptr = read_le_u32(block.as_slice(), off).map_err(|err| corrupt_at(table.0, &err))?;
            if ptr == 0 {
                continue;
            }
            let child = self.check_pointer(ptr, table.0)?;
            let lblk = base + i * per_entry;
            if depth == 1 {
                out.push((lblk, child));
            } else {
                self.walk_indirect(child, depth - 1, lblk, apb, out)?;
            }
        }
        Ok(())
    }

    /// Map logical block `lblk` of `inode` to `pblk`, allocating and
    /// zeroing indirect blocks on the way.
    ///
    /// `pblk` must already be marked in use, or an indirect block could be
    /// placed on top of it. The caller writes `inode` back afterwards.
    pub fn set_data_block(&mut self, inode: &mut Ext2Inode, lblk: u64, pblk: BlockNumber) -> Result<()> {
        self.require_rw()?;
        let apb = u64::from(self.layout.block_size / 4);
        let (slot, path) = block_path(lblk, apb).ok_or_else(|| {
            FfsError::InvalidArgument(format!("logical block {lblk} beyond triple indirect"))
        })?;
        if path.is_empty() {
            inode.block[slot] = pblk.0;
            return Ok(());
        }

        let mut table = inode.block[slot];
        if table == 0 {
            table = self.new_map_block(inode, pblk)?;
            inode.block[slot] = table;
        }
        for (level, &index) in path.iter().enumerate() {
            let table_blk = self.check_pointer(table, 0)?;
            let mut buf = self.dev.read_block(table_blk)?.into_inner();
            let off = index * 4;
            if level + 1 == path.len() {
                buf[off..off + 4].copy_from_slice(&pblk.0.to_le_bytes());
                self.dev.write_block(table_blk, &buf)?;
                break;
            }
            let mut next = read_le_u32(&buf, off).map_err(|err| corrupt_at(table, &err))?;
            if next == 0 {
                next = self.new_map_block(inode, pblk)?;
                buf[off..off + 4].copy_from_slice(&next.to_le_bytes());
                self.dev.write_block(table_blk, &buf)?;
            }
            table = next;
        }
        Ok(())
    }

    /// Allocate one zeroed indirect block charged to `inode`.
    fn new_map_block(&mut self, inode: &mut Ext2Inode, goal: BlockNumber) -> Result<u32> {
        let blk = self.new_block(goal)?;
        zero_blocks(self.dev.as_ref(), blk, 1)?;
        self.block_alloc_stats(blk, 1)?;
        inode.blocks += self.layout.block_size / 512;
        trace!(block = blk.0, "allocated indirect block");
        Ok(blk.0)
    }
}
