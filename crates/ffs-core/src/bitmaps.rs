//! Block and inode bitmap load/store, one bitmap block per group.

use crate::initialize::{new_block_bitmap, new_inode_bitmap};
use crate::{Filesystem, FsFlags};
use ffs_alloc::bitmap_set;
use ffs_error::Result;
use ffs_ondisk::CompatFeatures;
use ffs_types::{BlockNumber, EXT2_BG_BLOCK_UNINIT, EXT2_BG_INODE_UNINIT};
use tracing::{debug, warn};

impl Filesystem {
    /// Load whichever bitmaps are not yet in memory.
    pub fn read_bitmaps(&mut self) -> Result<()> {
        if self.block_map.is_some() && self.inode_map.is_some() {
            return Ok(());
        }
        self.load_bitmaps(self.inode_map.is_none(), self.block_map.is_none())
    }

    /// (Re)load the block bitmap from disk.
    pub fn read_block_bitmap(&mut self) -> Result<()> {
        self.load_bitmaps(false, true)
    }

    /// (Re)load the inode bitmap from disk.
    pub fn read_inode_bitmap(&mut self) -> Result<()> {
        self.load_bitmaps(true, false)
    }

    /// Write every loaded bitmap that has pending changes.
    pub fn write_bitmaps(&mut self) -> Result<()> {
        let do_block = self.block_map.is_some() && self.flags.contains(FsFlags::BB_DIRTY);
        let do_inode = self.inode_map.is_some() && self.flags.contains(FsFlags::IB_DIRTY);
        if !do_block && !do_inode {
            return Ok(());
        }
        self.store_bitmaps(do_inode, do_block)
    }

    pub fn write_block_bitmap(&mut self) -> Result<()> {
        self.store_bitmaps(false, true)
    }

    pub fn write_inode_bitmap(&mut self) -> Result<()> {
        self.store_bitmaps(true, false)
    }

    fn load_bitmaps(&mut self, do_inode: bool, do_block: bool) -> Result<()> {
        self.write_bitmaps_hook = Some(Self::write_bitmaps);
        let lazy = self.sb.has_compat(CompatFeatures::LAZY_BG);
        let block_nbytes = (self.layout.blocks_per_group / 8) as usize;
        let inode_nbytes = (self.layout.inodes_per_group / 8) as usize;

        let mut block_map = do_block
            .then(|| new_block_bitmap(&self.layout))
            .transpose()?;
        let mut inode_map = do_inode
            .then(|| new_inode_bitmap(&self.layout, self.sb.inodes_count))
            .transpose()?;

        for (group, desc) in (0_u32..).zip(self.group_desc.iter()) {
            if let Some(map) = block_map.as_mut() {
                let blk = if lazy && desc.has_flag(EXT2_BG_BLOCK_UNINIT) {
                    0
                } else {
                    desc.block_bitmap
                };
                let bytes = self.bitmap_slice(blk, block_nbytes)?;
                map.copy_in_bytes(group as usize * block_nbytes, &bytes);
            }
            if let Some(map) = inode_map.as_mut() {
                let blk = if lazy && desc.has_flag(EXT2_BG_INODE_UNINIT) {
                    0
                } else {
                    desc.inode_bitmap
                };
                let bytes = self.bitmap_slice(blk, inode_nbytes)?;
                map.copy_in_bytes(group as usize * inode_nbytes, &bytes);
            }
        }

        if block_map.is_some() {
            self.block_map = block_map;
            self.flags.remove(FsFlags::BB_DIRTY);
        }
        if inode_map.is_some() {
            self.inode_map = inode_map;
            self.flags.remove(FsFlags::IB_DIRTY);
        }
        debug!(name = %self.name, do_block, do_inode, "loaded bitmaps");
        Ok(())
    }

    /// First `nbytes` of bitmap block `blk`; an unassigned block reads as
    /// all in use.
    fn bitmap_slice(&self, blk: u32, nbytes: usize) -> Result<Vec<u8>> {
        if blk == 0 {
            return Ok(vec![0xFF; nbytes]);
        }
        let mut buf = self.dev.read_block(BlockNumber(blk))?.into_inner();
        buf.truncate(nbytes);
        Ok(buf)
    }

    fn store_bitmaps(&mut self, do_inode: bool, do_block: bool) -> Result<()> {
        self.require_rw()?;
        let lazy = self.sb.has_compat(CompatFeatures::LAZY_BG);
        let bs = self.layout.block_size as usize;
        let groups = self.layout.group_count;

        if do_block {
            if let Some(map) = self.block_map.as_ref() {
                let nbytes = (self.layout.blocks_per_group / 8) as usize;
                let mut buf = vec![0xFF_u8; bs];
                for (group, desc) in (0_u32..).zip(self.group_desc.iter()) {
                    if lazy && desc.has_flag(EXT2_BG_BLOCK_UNINIT) {
                        continue;
                    }
                    let src = map.byte_slice(group as usize * nbytes, nbytes);
                    buf[..src.len()].copy_from_slice(src);
                    if group + 1 == groups {
                        let nbits = (self.sb.blocks_count - self.sb.first_data_block)
                            % self.layout.blocks_per_group;
                        if nbits != 0 {
                            for bit in nbits..self.layout.block_size * 8 {
                                bitmap_set(&mut buf, bit);
                            }
                        }
                    }
                    if desc.block_bitmap != 0 {
                        self.dev.write_block(BlockNumber(desc.block_bitmap), &buf)?;
                    } else {
                        warn!(group, "block bitmap has no location; skipped");
                    }
                }
            }
            self.flags.remove(FsFlags::BB_DIRTY);
        }

        if do_inode {
            if let Some(map) = self.inode_map.as_ref() {
                let nbytes = self.layout.inodes_per_group.div_ceil(8) as usize;
                let mut buf = vec![0xFF_u8; bs];
                for (group, desc) in (0_u32..).zip(self.group_desc.iter()) {
                    if lazy && desc.has_flag(EXT2_BG_INODE_UNINIT) {
                        continue;
                    }
                    let src = map.byte_slice(group as usize * nbytes, nbytes);
                    buf[..src.len()].copy_from_slice(src);
                    if desc.inode_bitmap != 0 {
                        self.dev.write_block(BlockNumber(desc.inode_bitmap), &buf)?;
                    } else {
                        warn!(group, "inode bitmap has no location; skipped");
                    }
                }
            }
            self.flags.remove(FsFlags::IB_DIRTY);
        }

        debug!(name = %self.name, do_block, do_inode, "wrote bitmaps");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InitParams, OpenOptions};
    use ffs_alloc::bitmap_get;
    use ffs_block::{BlockDevice, ByteBlockDevice, MemByteDevice};
    use ffs_error::FfsError;
    use ffs_ondisk::{FeatureSet, RoCompatFeatures};

    fn fresh(mem: &MemByteDevice, blocks: u32) -> Filesystem {
        let dev = ByteBlockDevice::new(mem.clone(), 1024).unwrap();
        let params = InitParams {
            blocks_count: blocks,
            rev_level: 1,
            features: FeatureSet {
                ro_compat: RoCompatFeatures::SPARSE_SUPER,
                ..FeatureSet::NONE
            },
            mkfs_time: 1_000,
            ..InitParams::default()
        };
        let mut fs = Filesystem::initialize("bitmaps", Box::new(dev), &params).unwrap();
        fs.allocate_tables().unwrap();
        fs
    }

    #[test]
    fn last_group_tail_is_padded_in_use() {
        let mem = MemByteDevice::new(20_000 * 1024);
        // Three groups; the last holds (20000 - 1) % 8192 blocks.
        let mut fs = fresh(&mem, 20_000);
        assert_eq!(fs.group_count(), 3);
        fs.write_bitmaps().unwrap();
        assert!(!fs.flags().contains(FsFlags::BB_DIRTY));
        assert!(!fs.flags().contains(FsFlags::IB_DIRTY));

        let last = fs.group_descs()[2];
        let block = fs.device().read_block(BlockNumber(last.block_bitmap)).unwrap();
        let nbits = (20_000 - 1) % 8192;
        assert!(bitmap_get(block.as_slice(), nbits));
        assert!(bitmap_get(block.as_slice(), 8191));
        // The group's own bitmaps and inode table are marked.
        assert!(bitmap_get(block.as_slice(), 0));
    }

    #[test]
    fn bitmaps_round_trip_through_disk() {
        let mem = MemByteDevice::new(8192 * 1024);
        let mut fs = fresh(&mem, 8192);
        fs.block_map_mut().unwrap().mark(5000);
        fs.inode_map_mut().unwrap().mark(17);
        fs.close().unwrap();

        let dev = ByteBlockDevice::new(mem, 1024).unwrap();
        let mut fs = Filesystem::open("bitmaps", Box::new(dev), &OpenOptions::default()).unwrap();
        assert!(fs.block_map().is_none());
        fs.read_bitmaps().unwrap();
        assert!(fs.block_map().unwrap().test(5000));
        assert!(!fs.block_map().unwrap().test(5001));
        assert!(fs.inode_map().unwrap().test(17));
        assert!(!fs.inode_map().unwrap().test(18));
    }

    #[test]
    fn unassigned_bitmap_reads_as_full() {
        let mem = MemByteDevice::new(8192 * 1024);
        let mut fs = fresh(&mem, 8192);
        fs.group_desc_mut(0).unwrap().inode_bitmap = 0;
        fs.read_inode_bitmap().unwrap();
        assert!(fs.inode_map().unwrap().test(1));
        assert!(fs.inode_map().unwrap().test(fs.superblock().inodes_count));
    }

    #[test]
    fn read_only_handle_cannot_write_bitmaps() {
        let mem = MemByteDevice::new(8192 * 1024);
        fresh(&mem, 8192).close().unwrap();
        let dev = ByteBlockDevice::new(mem, 1024).unwrap();
        let mut fs = Filesystem::open("ro", Box::new(dev), &OpenOptions::default()).unwrap();
        fs.read_bitmaps().unwrap();
        fs.block_map_mut().unwrap().mark(4000);
        assert!(matches!(fs.write_bitmaps(), Err(FfsError::ReadOnly)));
    }
}
