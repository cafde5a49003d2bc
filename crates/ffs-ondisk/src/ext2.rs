use crate::feature::{CompatFeatures, FeatureSet, IncompatFeatures, RoCompatFeatures};
use ffs_types::{
    BlockSize, EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE, EXT2_GOOD_OLD_REV,
    EXT2_GROUP_DESC_SIZE, EXT2_N_BLOCKS, EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_SIZE, ParseError,
    S_IFDIR, S_IFMT, ensure_slice, read_fixed, read_le_u16, read_le_u32, trim_nul_padded,
    write_bytes, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

// ── Superblock ──────────────────────────────────────────────────────────────

/// Decoded ext2 superblock.
///
/// Only the fields this library reads or writes are decoded. Encoding goes
/// through [`Ext2Superblock::encode_into`], which overwrites those fields in
/// an existing 1024-byte region and leaves every other byte alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ext2Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub reserved_gdt_blocks: u16,
    pub first_meta_bg: u32,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub last_mounted: [u8; 64],

    // ── Revision & OS ────────────────────────────────────────────────────
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub creator_os: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,

    // ── Features ─────────────────────────────────────────────────────────
    pub feature_compat: CompatFeatures,
    pub feature_incompat: IncompatFeatures,
    pub feature_ro_compat: RoCompatFeatures,
    pub default_mount_opts: u32,

    // ── State & error tracking ───────────────────────────────────────────
    pub state: u16,
    pub errors: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub block_group_nr: u16,
    pub checkinterval: u32,

    // ── Timestamps ───────────────────────────────────────────────────────
    pub mtime: u32,
    pub wtime: u32,
    pub lastcheck: u32,
    pub mkfs_time: u32,

    // ── Journal ──────────────────────────────────────────────────────────
    pub journal_uuid: [u8; 16],
    pub journal_inum: u32,
    pub journal_dev: u32,
    pub last_orphan: u32,

    // ── Htree directory hashing ──────────────────────────────────────────
    pub hash_seed: [u32; 4],
    pub def_hash_version: u8,
}

impl Default for Ext2Superblock {
    fn default() -> Self {
        Self {
            inodes_count: 0,
            blocks_count: 0,
            r_blocks_count: 0,
            free_blocks_count: 0,
            free_inodes_count: 0,
            first_data_block: 0,
            log_block_size: 0,
            log_frag_size: 0,
            blocks_per_group: 0,
            frags_per_group: 0,
            inodes_per_group: 0,
            first_ino: 0,
            inode_size: 0,
            reserved_gdt_blocks: 0,
            first_meta_bg: 0,
            magic: 0,
            uuid: [0; 16],
            volume_name: [0; 16],
            last_mounted: [0; 64],
            rev_level: 0,
            minor_rev_level: 0,
            creator_os: 0,
            def_resuid: 0,
            def_resgid: 0,
            feature_compat: CompatFeatures(0),
            feature_incompat: IncompatFeatures(0),
            feature_ro_compat: RoCompatFeatures(0),
            default_mount_opts: 0,
            state: 0,
            errors: 0,
            mnt_count: 0,
            max_mnt_count: 0,
            block_group_nr: 0,
            checkinterval: 0,
            mtime: 0,
            wtime: 0,
            lastcheck: 0,
            mkfs_time: 0,
            journal_uuid: [0; 16],
            journal_inum: 0,
            journal_dev: 0,
            last_orphan: 0,
            hash_seed: [0; 4],
            def_hash_version: 0,
        }
    }
}

impl Ext2Superblock {
    /// Parse a superblock from a 1024-byte region and check its magic.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let byte_at = |offset: usize| ensure_slice(region, offset, 1).map(|b| b[0]);

        Ok(Self {
            // Core geometry
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            r_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size: read_le_u32(region, 0x18)?,
            log_frag_size: read_le_u32(region, 0x1C)?,
            blocks_per_group: read_le_u32(region, 0x20)?,
            frags_per_group: read_le_u32(region, 0x24)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            first_ino: read_le_u32(region, 0x54)?,
            inode_size: read_le_u16(region, 0x58)?,
            reserved_gdt_blocks: read_le_u16(region, 0xCE)?,
            first_meta_bg: read_le_u32(region, 0x104)?,

            // Identity
            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: read_fixed::<16>(region, 0x78)?,
            last_mounted: read_fixed::<64>(region, 0x88)?,

            // Revision & OS
            rev_level: read_le_u32(region, 0x4C)?,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            creator_os: read_le_u32(region, 0x48)?,
            def_resuid: read_le_u16(region, 0x50)?,
            def_resgid: read_le_u16(region, 0x52)?,

            // Features
            feature_compat: CompatFeatures(read_le_u32(region, 0x5C)?),
            feature_incompat: IncompatFeatures(read_le_u32(region, 0x60)?),
            feature_ro_compat: RoCompatFeatures(read_le_u32(region, 0x64)?),
            default_mount_opts: read_le_u32(region, 0x100)?,

            // State & error tracking
            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            block_group_nr: read_le_u16(region, 0x5A)?,
            checkinterval: read_le_u32(region, 0x44)?,

            // Timestamps
            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            lastcheck: read_le_u32(region, 0x40)?,
            mkfs_time: read_le_u32(region, 0x108)?,

            // Journal
            journal_uuid: read_fixed::<16>(region, 0xD0)?,
            journal_inum: read_le_u32(region, 0xE0)?,
            journal_dev: read_le_u32(region, 0xE4)?,
            last_orphan: read_le_u32(region, 0xE8)?,

            // Htree directory hashing
            hash_seed: [
                read_le_u32(region, 0xEC)?,
                read_le_u32(region, 0xF0)?,
                read_le_u32(region, 0xF4)?,
                read_le_u32(region, 0xF8)?,
            ],
            def_hash_version: byte_at(0xFC)?,
        })
    }

    /// Write every decoded field into `region`, leaving other bytes intact.
    pub fn encode_into(&self, region: &mut [u8]) -> Result<(), ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        write_le_u32(region, 0x00, self.inodes_count)?;
        write_le_u32(region, 0x04, self.blocks_count)?;
        write_le_u32(region, 0x08, self.r_blocks_count)?;
        write_le_u32(region, 0x0C, self.free_blocks_count)?;
        write_le_u32(region, 0x10, self.free_inodes_count)?;
        write_le_u32(region, 0x14, self.first_data_block)?;
        write_le_u32(region, 0x18, self.log_block_size)?;
        write_le_u32(region, 0x1C, self.log_frag_size)?;
        write_le_u32(region, 0x20, self.blocks_per_group)?;
        write_le_u32(region, 0x24, self.frags_per_group)?;
        write_le_u32(region, 0x28, self.inodes_per_group)?;
        write_le_u32(region, 0x2C, self.mtime)?;
        write_le_u32(region, 0x30, self.wtime)?;
        write_le_u16(region, 0x34, self.mnt_count)?;
        write_le_u16(region, 0x36, self.max_mnt_count)?;
        write_le_u16(region, 0x38, self.magic)?;
        write_le_u16(region, 0x3A, self.state)?;
        write_le_u16(region, 0x3C, self.errors)?;
        write_le_u16(region, 0x3E, self.minor_rev_level)?;
        write_le_u32(region, 0x40, self.lastcheck)?;
        write_le_u32(region, 0x44, self.checkinterval)?;
        write_le_u32(region, 0x48, self.creator_os)?;
        write_le_u32(region, 0x4C, self.rev_level)?;
        write_le_u16(region, 0x50, self.def_resuid)?;
        write_le_u16(region, 0x52, self.def_resgid)?;
        write_le_u32(region, 0x54, self.first_ino)?;
        write_le_u16(region, 0x58, self.inode_size)?;
        write_le_u16(region, 0x5A, self.block_group_nr)?;
        write_le_u32(region, 0x5C, self.feature_compat.0)?;
        write_le_u32(region, 0x60, self.feature_incompat.0)?;
        write_le_u32(region, 0x64, self.feature_ro_compat.0)?;
        write_bytes(region, 0x68, &self.uuid)?;
        write_bytes(region, 0x78, &self.volume_name)?;
        write_bytes(region, 0x88, &self.last_mounted)?;
        write_le_u16(region, 0xCE, self.reserved_gdt_blocks)?;
        write_bytes(region, 0xD0, &self.journal_uuid)?;
        write_le_u32(region, 0xE0, self.journal_inum)?;
        write_le_u32(region, 0xE4, self.journal_dev)?;
        write_le_u32(region, 0xE8, self.last_orphan)?;
        for (i, word) in self.hash_seed.iter().enumerate() {
            write_le_u32(region, 0xEC + i * 4, *word)?;
        }
        write_bytes(region, 0xFC, &[self.def_hash_version])?;
        write_le_u32(region, 0x100, self.default_mount_opts)?;
        write_le_u32(region, 0x104, self.first_meta_bg)?;
        write_le_u32(region, 0x108, self.mkfs_time)?;
        Ok(())
    }

    /// Encode onto a zeroed 1024-byte region.
    pub fn to_region(&self) -> Result<[u8; EXT2_SUPERBLOCK_SIZE], ParseError> {
        let mut region = [0_u8; EXT2_SUPERBLOCK_SIZE];
        self.encode_into(&mut region)?;
        Ok(region)
    }

    pub fn block_size(&self) -> Result<BlockSize, ParseError> {
        BlockSize::from_log(self.log_block_size)
    }

    /// Inode size in bytes; revision 0 images always use 128.
    #[must_use]
    pub fn inode_size(&self) -> u16 {
        if self.rev_level == EXT2_GOOD_OLD_REV {
            EXT2_GOOD_OLD_INODE_SIZE
        } else {
            self.inode_size
        }
    }

    /// First inode available to users; revision 0 images always use 11.
    #[must_use]
    pub fn first_ino(&self) -> u32 {
        if self.rev_level == EXT2_GOOD_OLD_REV {
            EXT2_GOOD_OLD_FIRST_INO
        } else {
            self.first_ino
        }
    }

    #[must_use]
    pub fn features(&self) -> FeatureSet {
        FeatureSet {
            compat: self.feature_compat,
            incompat: self.feature_incompat,
            ro_compat: self.feature_ro_compat,
        }
    }

    pub fn set_features(&mut self, set: FeatureSet) {
        self.feature_compat = set.compat;
        self.feature_incompat = set.incompat;
        self.feature_ro_compat = set.ro_compat;
    }

    #[must_use]
    pub fn has_compat(&self, flag: CompatFeatures) -> bool {
        self.feature_compat.contains(flag)
    }

    #[must_use]
    pub fn has_incompat(&self, flag: IncompatFeatures) -> bool {
        self.feature_incompat.contains(flag)
    }

    #[must_use]
    pub fn has_ro_compat(&self, flag: RoCompatFeatures) -> bool {
        self.feature_ro_compat.contains(flag)
    }

    #[must_use]
    pub fn volume_name_str(&self) -> String {
        trim_nul_padded(&self.volume_name)
    }

    #[must_use]
    pub fn last_mounted_str(&self) -> String {
        trim_nul_padded(&self.last_mounted)
    }

    /// Canonical 8-4-4-4-12 hex spelling of the filesystem uuid.
    #[must_use]
    pub fn uuid_string(&self) -> String {
        let hex: Vec<String> = self.uuid.iter().map(|b| format!("{b:02x}")).collect();
        format!(
            "{}-{}-{}-{}-{}",
            hex[0..4].concat(),
            hex[4..6].concat(),
            hex[6..8].concat(),
            hex[8..10].concat(),
            hex[10..16].concat()
        )
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

/// 32-byte block group descriptor. A location of 0 means "not assigned".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
    pub flags: u16,
}

impl Ext2GroupDesc {
    pub const SIZE: usize = EXT2_GROUP_DESC_SIZE as usize;

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, Self::SIZE)?;
        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
            flags: read_le_u16(bytes, 0x12)?,
        })
    }

    /// Encode into the first 32 bytes of `out`; the reserved tail is zeroed.
    pub fn write_to_bytes(&self, out: &mut [u8]) -> Result<(), ParseError> {
        ffs_types::ensure_slice_mut(out, 0, Self::SIZE)?.fill(0);
        write_le_u32(out, 0x00, self.block_bitmap)?;
        write_le_u32(out, 0x04, self.inode_bitmap)?;
        write_le_u32(out, 0x08, self.inode_table)?;
        write_le_u16(out, 0x0C, self.free_blocks_count)?;
        write_le_u16(out, 0x0E, self.free_inodes_count)?;
        write_le_u16(out, 0x10, self.used_dirs_count)?;
        write_le_u16(out, 0x12, self.flags)?;
        Ok(())
    }

    #[must_use]
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Decode `count` descriptors from a contiguous table.
pub fn parse_group_desc_table(bytes: &[u8], count: usize) -> Result<Vec<Ext2GroupDesc>, ParseError> {
    (0..count)
        .map(|i| {
            let offset = i * Ext2GroupDesc::SIZE;
            Ext2GroupDesc::parse_from_bytes(ensure_slice(bytes, offset, Ext2GroupDesc::SIZE)?)
        })
        .collect()
}

/// Encode descriptors into a zero-padded buffer of `total_len` bytes.
pub fn encode_group_desc_table(
    descs: &[Ext2GroupDesc],
    total_len: usize,
) -> Result<Vec<u8>, ParseError> {
    let mut out = vec![0_u8; total_len.max(descs.len() * Ext2GroupDesc::SIZE)];
    for (i, desc) in descs.iter().enumerate() {
        desc.write_to_bytes(&mut out[i * Ext2GroupDesc::SIZE..])?;
    }
    out.truncate(total_len);
    Ok(out)
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// The 128-byte classic inode. Larger on-disk inodes keep their tail bytes
/// because [`Ext2Inode::write_to_bytes`] only touches the first 128.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Inode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// 512-byte sectors, not filesystem blocks.
    pub blocks: u32,
    pub flags: u32,
    pub block: [u32; EXT2_N_BLOCKS],
    pub generation: u32,
    pub file_acl: u32,
    pub dir_acl: u32,
    pub uid_high: u16,
    pub gid_high: u16,
}

impl Ext2Inode {
    pub const SIZE: usize = EXT2_GOOD_OLD_INODE_SIZE as usize;

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, Self::SIZE)?;
        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, 0x28 + i * 4)?;
        }
        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: read_le_u16(bytes, 0x02)?,
            size: read_le_u32(bytes, 0x04)?,
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            gid: read_le_u16(bytes, 0x18)?,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            block,
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: read_le_u32(bytes, 0x68)?,
            dir_acl: read_le_u32(bytes, 0x6C)?,
            uid_high: read_le_u16(bytes, 0x78)?,
            gid_high: read_le_u16(bytes, 0x7A)?,
        })
    }

    pub fn write_to_bytes(&self, out: &mut [u8]) -> Result<(), ParseError> {
        ffs_types::ensure_slice_mut(out, 0, Self::SIZE)?.fill(0);
        write_le_u16(out, 0x00, self.mode)?;
        write_le_u16(out, 0x02, self.uid)?;
        write_le_u32(out, 0x04, self.size)?;
        write_le_u32(out, 0x08, self.atime)?;
        write_le_u32(out, 0x0C, self.ctime)?;
        write_le_u32(out, 0x10, self.mtime)?;
        write_le_u32(out, 0x14, self.dtime)?;
        write_le_u16(out, 0x18, self.gid)?;
        write_le_u16(out, 0x1A, self.links_count)?;
        write_le_u32(out, 0x1C, self.blocks)?;
        write_le_u32(out, 0x20, self.flags)?;
        for (i, blk) in self.block.iter().enumerate() {
            write_le_u32(out, 0x28 + i * 4, *blk)?;
        }
        write_le_u32(out, 0x64, self.generation)?;
        write_le_u32(out, 0x68, self.file_acl)?;
        write_le_u32(out, 0x6C, self.dir_acl)?;
        write_le_u16(out, 0x78, self.uid_high)?;
        write_le_u16(out, 0x7A, self.gid_high)?;
        Ok(())
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}
