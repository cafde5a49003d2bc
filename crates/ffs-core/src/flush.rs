//! Persistence: descriptor tables, backup superblocks, bitmaps and the
//! byte-diffed primary superblock.

use crate::{Filesystem, FsFlags, parse_error_to_ffs};
use ffs_block::write_region;
use ffs_error::{FfsError, Result};
use ffs_ondisk::{IncompatFeatures, encode_group_desc_table};
use ffs_types::{
    BlockNumber, EXT2_DYNAMIC_REV, EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE,
    EXT2_GOOD_OLD_REV, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE, EXT2_VALID_FS,
};
use tracing::{debug, info, trace};

impl Filesystem {
    /// Write the superblock, every descriptor copy and pending bitmaps.
    ///
    /// The valid bit is cleared while backups are written and restored
    /// before the primary superblock goes out last. The in-memory state is
    /// restored whether or not the flush succeeds.
    pub fn flush(&mut self) -> Result<()> {
        self.require_rw()?;
        let state = self.sb.state;
        self.sb.wtime = self.now();
        self.sb.block_group_nr = 0;
        self.sb.state &= !EXT2_VALID_FS;

        let result = self.flush_inner(state);
        self.sb.state = state;
        self.sb.block_group_nr = 0;
        result
    }

    fn flush_inner(&mut self, state: u16) -> Result<()> {
        if !self.sb.has_incompat(IncompatFeatures::JOURNAL_DEV) {
            self.write_group_metadata()?;
            if let Some(hook) = self.write_bitmaps_hook {
                hook(self)?;
            }
        }

        self.sb.block_group_nr = 0;
        self.sb.state = state;
        self.dev.sync()?;
        self.write_primary_superblock()?;
        self.flags.remove(FsFlags::DIRTY);
        self.dev.sync()?;
        info!(name = %self.name, groups = self.layout.group_count, "flushed filesystem");
        Ok(())
    }

    /// Backup superblocks and descriptor copies, group by group.
    fn write_group_metadata(&mut self) -> Result<()> {
        let bs = self.layout.block_size as usize;
        let old_desc_blocks = if self.layout.meta_bg {
            self.layout.first_meta_bg
        } else {
            self.layout.desc_blocks
        } as usize;
        let table_blocks = old_desc_blocks.max(self.layout.desc_blocks as usize);
        let table = encode_group_desc_table(&self.group_desc, table_blocks * bs)
            .map_err(|err| parse_error_to_ffs(&err))?;

        let master_only = self.flags.contains(FsFlags::MASTER_SB_ONLY);
        let super_only = self.flags.contains(FsFlags::SUPER_ONLY);

        for group in 0..self.layout.group_count {
            let loc = self.layout.locate(group);

            if !master_only && group > 0 {
                if let Some(super_blk) = loc.super_block {
                    self.write_backup_super(group, super_blk)?;
                }
            }
            if super_only {
                continue;
            }
            if let Some(old) = loc.old_desc {
                if !master_only || group == 0 {
                    trace!(group, block = old.0, blocks = old_desc_blocks, "write descriptor table");
                    self.dev.write_blocks(old, &table[..old_desc_blocks * bs])?;
                }
            }
            if let Some(new) = loc.new_desc {
                let start = loc.meta_bg as usize * bs;
                let slice = table.get(start..start + bs).ok_or_else(|| {
                    FfsError::InvalidGeometry(format!(
                        "meta group {} beyond descriptor table",
                        loc.meta_bg
                    ))
                })?;
                trace!(group, block = new.0, meta_bg = loc.meta_bg, "write meta_bg descriptors");
                self.dev.write_block(new, slice)?;
            }
        }
        Ok(())
    }

    /// Superblock copy at the start of `super_blk`, stamped with its group.
    fn write_backup_super(&mut self, group: u32, super_blk: BlockNumber) -> Result<()> {
        self.sb.block_group_nr = u16::try_from(group).unwrap_or(u16::MAX);
        let region = self.encode_superblock()?;
        let offset = u64::from(super_blk.0) * u64::from(self.layout.block_size);
        trace!(group, block = super_blk.0, "write backup superblock");
        write_region(self.dev.as_ref(), offset, &region)
    }

    /// Encode over the last known on-disk bytes so fields this library does
    /// not model survive.
    fn encode_superblock(&self) -> Result<[u8; EXT2_SUPERBLOCK_SIZE]> {
        let mut region = self
            .orig_super
            .as_deref()
            .copied()
            .unwrap_or([0_u8; EXT2_SUPERBLOCK_SIZE]);
        self.sb
            .encode_into(&mut region)
            .map_err(|err| parse_error_to_ffs(&err))?;
        Ok(region)
    }

    /// Write only the 16-bit words that differ from the last known copy
    /// when the device supports byte writes; otherwise the whole region.
    fn write_primary_superblock(&mut self) -> Result<()> {
        let region = self.encode_superblock()?;
        let offset = EXT2_SUPERBLOCK_OFFSET as u64;

        match self.orig_super.as_deref() {
            None => write_region(self.dev.as_ref(), offset, &region)?,
            Some(old) => {
                let runs = diff_runs(old, &region);
                let mut full = false;
                for (i, (lo, hi)) in runs.iter().copied().enumerate() {
                    match self.dev.write_byte(offset + lo as u64, &region[lo..hi]) {
                        Ok(()) => {}
                        Err(FfsError::Unsupported(_)) if i == 0 => {
                            full = true;
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                }
                if full {
                    write_region(self.dev.as_ref(), offset, &region)?;
                } else {
                    debug!(runs = runs.len(), "wrote superblock changes");
                }
            }
        }

        self.orig_super = Some(Box::new(region));
        Ok(())
    }

    /// Flush if dirty, write any pending bitmaps, and release the device.
    pub fn close(mut self) -> Result<()> {
        if self.flags.contains(FsFlags::DIRTY) {
            self.flush()?;
        }
        if let Some(hook) = self.write_bitmaps_hook {
            hook(&mut self)?;
        }
        self.dev.sync()
    }

    /// Upgrade a revision 0 superblock to the dynamic revision.
    pub fn update_dynamic_rev(&mut self) {
        if self.sb.rev_level > EXT2_GOOD_OLD_REV {
            return;
        }
        let sb = self.superblock_mut();
        sb.rev_level = EXT2_DYNAMIC_REV;
        sb.first_ino = EXT2_GOOD_OLD_FIRST_INO;
        sb.inode_size = EXT2_GOOD_OLD_INODE_SIZE;
    }
}

/// Byte ranges `[lo, hi)` covering every differing 16-bit word, with
/// adjacent differing words merged.
fn diff_runs(old: &[u8], new: &[u8]) -> Vec<(usize, usize)> {
    let words = old.len().min(new.len()) / 2;
    let differs = |i: usize| old[2 * i..2 * i + 2] != new[2 * i..2 * i + 2];
    let mut runs = Vec::new();
    let mut i = 0;
    while i < words {
        if !differs(i) {
            i += 1;
            continue;
        }
        let start = i;
        while i < words && differs(i) {
            i += 1;
        }
        runs.push((2 * start, 2 * i));
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InitParams, OpenOptions};
    use ffs_block::{BlockDevice, ByteBlockDevice, MemByteDevice, read_region};
    use ffs_ondisk::{Ext2Superblock, FeatureSet, RoCompatFeatures};

    fn fresh(mem: &MemByteDevice, blocks: u32) -> Filesystem {
        let dev = ByteBlockDevice::new(mem.clone(), 1024).unwrap();
        let params = InitParams {
            blocks_count: blocks,
            rev_level: 1,
            features: FeatureSet {
                ro_compat: RoCompatFeatures::SPARSE_SUPER,
                ..FeatureSet::NONE
            },
            mkfs_time: 7_000,
            ..InitParams::default()
        };
        let mut fs = Filesystem::initialize("flush", Box::new(dev), &params).unwrap();
        fs.allocate_tables().unwrap();
        fs
    }

    fn super_at(mem: &MemByteDevice, offset: usize) -> Ext2Superblock {
        Ext2Superblock::parse_superblock_region(&mem.snapshot()[offset..offset + 1024]).unwrap()
    }

    #[test]
    fn diff_runs_merge_adjacent_words() {
        let old = [0_u8; 16];
        let mut new = old;
        new[2] = 1;
        new[5] = 1;
        new[11] = 9;
        assert_eq!(diff_runs(&old, &new), vec![(2, 6), (10, 12)]);
        assert!(diff_runs(&old, &old).is_empty());
    }

    #[test]
    fn backups_carry_their_group_number() {
        let mem = MemByteDevice::new(4 * 8192 * 1024);
        let fs = fresh(&mem, 4 * 8192);
        fs.close().unwrap();

        let primary = super_at(&mem, 1024);
        assert_eq!(primary.block_group_nr, 0);
        assert_eq!(primary.state & EXT2_VALID_FS, EXT2_VALID_FS);
        assert_eq!(primary.wtime, 7_000);

        // Sparse backups in groups 1 and 3; none in group 2.
        let g1 = super_at(&mem, (8192 + 1) * 1024);
        assert_eq!(g1.block_group_nr, 1);
        assert_eq!(g1.state & EXT2_VALID_FS, 0);
        assert_eq!(g1.blocks_count, primary.blocks_count);
        let g3 = super_at(&mem, (3 * 8192 + 1) * 1024);
        assert_eq!(g3.block_group_nr, 3);
        assert!(Ext2Superblock::parse_superblock_region(
            &mem.snapshot()[(2 * 8192 + 1) * 1024..(2 * 8192 + 2) * 1024]
        )
        .is_err());
    }

    #[test]
    fn master_only_skips_backups() {
        let mem = MemByteDevice::new(2 * 8192 * 1024);
        let mut fs = fresh(&mem, 2 * 8192);
        fs.set_flags(fs.flags() | FsFlags::MASTER_SB_ONLY);
        fs.close().unwrap();
        assert!(mem.snapshot()[(8192 + 1) * 1024..(8192 + 3) * 1024]
            .iter()
            .all(|b| *b == 0));
        assert_eq!(super_at(&mem, 1024).magic, 0xEF53);
    }

    #[test]
    fn descriptor_table_reopens() {
        let mem = MemByteDevice::new(2 * 8192 * 1024);
        let fs = fresh(&mem, 2 * 8192);
        let descs = fs.group_descs().to_vec();
        fs.close().unwrap();

        let dev = ByteBlockDevice::new(mem, 1024).unwrap();
        let fs = Filesystem::open("flush", Box::new(dev), &OpenOptions::default()).unwrap();
        assert_eq!(fs.group_descs(), &descs[..]);
    }

    #[test]
    fn diffed_write_preserves_foreign_fields() {
        let mem = MemByteDevice::new(8192 * 1024);
        fresh(&mem, 8192).close().unwrap();

        let dev = ByteBlockDevice::new(mem.clone(), 1024).unwrap();
        let options = OpenOptions {
            write: true,
            ..OpenOptions::default()
        };
        let mut fs = Filesystem::open("flush", Box::new(dev), &options).unwrap();

        // A mount bumps the mount count behind our back.
        mem.poke(1024 + 0x34, &7_u16.to_le_bytes());
        fs.superblock_mut().volume_name[..4].copy_from_slice(b"data");
        fs.flush().unwrap();

        let sb = super_at(&mem, 1024);
        assert_eq!(sb.mnt_count, 7);
        assert_eq!(sb.volume_name_str(), "data");
    }

    #[test]
    fn full_write_without_byte_primitive() {
        let mem = MemByteDevice::new(8192 * 1024);
        fresh(&mem, 8192).close().unwrap();

        let dev = ByteBlockDevice::new(mem.clone(), 1024)
            .unwrap()
            .without_byte_writes();
        let options = OpenOptions {
            write: true,
            ..OpenOptions::default()
        };
        let mut fs = Filesystem::open("flush", Box::new(dev), &options).unwrap();
        mem.poke(1024 + 0x34, &7_u16.to_le_bytes());
        fs.superblock_mut().volume_name[..4].copy_from_slice(b"full");
        fs.flush().unwrap();

        // The whole region went out, so the stale mount count wins.
        let sb = super_at(&mem, 1024);
        assert_eq!(sb.mnt_count, 0);
        assert_eq!(sb.volume_name_str(), "full");
        let raw = read_region(fs.device(), 1024, 1024).unwrap();
        assert_eq!(raw, mem.snapshot()[1024..2048].to_vec());
    }

    #[test]
    fn read_only_flush_is_refused() {
        let mem = MemByteDevice::new(8192 * 1024);
        fresh(&mem, 8192).close().unwrap();
        let dev = ByteBlockDevice::new(mem, 1024).unwrap();
        let mut fs = Filesystem::open("ro", Box::new(dev), &OpenOptions::default()).unwrap();
        assert!(matches!(fs.flush(), Err(FfsError::ReadOnly)));
    }

    #[test]
    fn dynamic_rev_upgrade() {
        let mem = MemByteDevice::new(8192 * 1024);
        let dev = ByteBlockDevice::new(mem, 1024).unwrap();
        let params = InitParams {
            blocks_count: 8192,
            ..InitParams::default()
        };
        let mut fs = Filesystem::initialize("old", Box::new(dev), &params).unwrap();
        assert_eq!(fs.superblock().rev_level, EXT2_GOOD_OLD_REV);
        fs.update_dynamic_rev();
        let sb = fs.superblock();
        assert_eq!(sb.rev_level, EXT2_DYNAMIC_REV);
        assert_eq!(sb.first_ino, EXT2_GOOD_OLD_FIRST_INO);
        assert_eq!(sb.inode_size, EXT2_GOOD_OLD_INODE_SIZE);
        assert!(fs.device().block_count() >= 8192);
    }
}
