//! Fresh filesystem layout: superblock defaults, the group/inode fixed
//! point, and the reservation of every group's superblock and descriptor
//! blocks.

use crate::{Filesystem, FsFlags, parse_error_to_ffs};
use ffs_alloc::layout::calc_reserved_gdt_blocks;
use ffs_alloc::{Bitmap, FsLayout, group_has_full_backup, reserve_super_and_bgd};
use ffs_block::BlockDevice;
use ffs_error::{FfsError, Result};
use ffs_ondisk::{
    CompatFeatures, Ext2GroupDesc, Ext2Superblock, FeatureSet, IncompatFeatures, RoCompatFeatures,
};
use ffs_types::{
    EXT2_DFL_CHECKINTERVAL, EXT2_DFL_MAX_MNT_COUNT, EXT2_DYNAMIC_REV, EXT2_ERRORS_DEFAULT,
    EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE, EXT2_GROUP_DESC_SIZE,
    EXT2_MAX_BLOCKS_PER_GROUP, EXT2_MAX_INODES_PER_GROUP, EXT2_MIN_BLOCKS_PER_GROUP,
    EXT2_OS_LINUX, EXT2_SUPER_MAGIC, EXT2_VALID_FS,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Upper bound on fixed-point iterations. Each pass either shrinks
/// `blocks_per_group` by 8 or drops a ragged tail, so real inputs settle
/// long before this.
const MAX_LAYOUT_PASSES: u32 = 65_536;

/// Requested geometry. A zero field takes its default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitParams {
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    /// log2(block size) - 10.
    pub log_block_size: u32,
    pub log_frag_size: u32,
    pub first_data_block: u32,
    pub max_mnt_count: u16,
    pub errors: u16,
    pub features: FeatureSet,
    pub first_meta_bg: u32,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub checkinterval: u32,
    pub blocks_per_group: u32,
    pub inodes_count: u32,
    pub reserved_gdt_blocks: u16,
    /// Creation time; also pins the handle's clock when nonzero.
    pub mkfs_time: u32,
}

fn or_default<T: Copy + Default + PartialEq>(value: T, default: T) -> T {
    if value == T::default() { default } else { value }
}

/// Geometry the fixed point settled on.
struct Settled {
    group_count: u32,
    desc_blocks: u32,
    inode_blocks_per_group: u32,
}

impl Filesystem {
    /// Build a storage-empty filesystem on `dev` from `params`.
    ///
    /// The returned handle has its superblock, descriptors and both bitmaps
    /// in memory with every group's superblock and descriptor blocks marked
    /// in use. Nothing is written until [`Filesystem::flush`].
    pub fn initialize(
        name: &str,
        mut dev: Box<dyn BlockDevice>,
        params: &InitParams,
    ) -> Result<Self> {
        if params.blocks_count == 0 {
            return Err(FfsError::InvalidArgument("blocks_count is zero".to_owned()));
        }

        let mut sb = Ext2Superblock {
            magic: EXT2_SUPER_MAGIC,
            state: EXT2_VALID_FS,
            log_block_size: params.log_block_size,
            log_frag_size: params.log_frag_size,
            ..Ext2Superblock::default()
        };
        sb.first_data_block =
            or_default(params.first_data_block, u32::from(sb.log_block_size == 0));
        sb.max_mnt_count = or_default(params.max_mnt_count, EXT2_DFL_MAX_MNT_COUNT);
        sb.errors = or_default(params.errors, EXT2_ERRORS_DEFAULT);
        sb.set_features(params.features);
        sb.first_meta_bg = params.first_meta_bg;

        let incompat = sb.feature_incompat.outside(IncompatFeatures::SUPPORTED);
        if incompat.bits() != 0 {
            return Err(FfsError::UnsupportedFeature(incompat.to_string()));
        }
        let ro = sb.feature_ro_compat.outside(RoCompatFeatures::SUPPORTED);
        if ro.bits() != 0 {
            return Err(FfsError::UnsupportedReadOnlyFeature(ro.to_string()));
        }

        sb.rev_level = params.rev_level;
        if sb.rev_level >= EXT2_DYNAMIC_REV {
            sb.first_ino = or_default(params.first_ino, EXT2_GOOD_OLD_FIRST_INO);
            sb.inode_size = or_default(params.inode_size, EXT2_GOOD_OLD_INODE_SIZE);
        }
        sb.checkinterval = or_default(params.checkinterval, EXT2_DFL_CHECKINTERVAL);
        sb.mkfs_time = or_default(params.mkfs_time, crate::wall_clock());
        sb.lastcheck = sb.mkfs_time;
        sb.creator_os = EXT2_OS_LINUX;

        let block_size = sb.block_size().map_err(|err| parse_error_to_ffs(&err))?.get();
        let frag_size = ffs_types::block_size_from_log(sb.log_frag_size)
            .filter(|size| *size <= block_size)
            .ok_or_else(|| {
                FfsError::InvalidArgument(format!(
                    "fragment size log {} incompatible with block size {block_size}",
                    sb.log_frag_size
                ))
            })?;
        let frags_per_block = block_size / frag_size;
        let inode_size = u32::from(sb.inode_size());
        if !inode_size.is_power_of_two()
            || inode_size < u32::from(EXT2_GOOD_OLD_INODE_SIZE)
            || inode_size > block_size
        {
            return Err(FfsError::InvalidArgument(format!(
                "inode size {inode_size} must be a power of two in 128..={block_size}"
            )));
        }

        sb.blocks_per_group =
            or_default(params.blocks_per_group, block_size * 8).min(EXT2_MAX_BLOCKS_PER_GROUP);
        if sb.blocks_per_group % 8 != 0 {
            return Err(FfsError::InvalidArgument(format!(
                "blocks_per_group {} is not a multiple of 8",
                sb.blocks_per_group
            )));
        }
        sb.frags_per_group = sb.blocks_per_group * frags_per_block;

        sb.blocks_count = params.blocks_count;
        sb.r_blocks_count = params.r_blocks_count;
        if sb.r_blocks_count >= params.blocks_count {
            return Err(FfsError::InvalidArgument(format!(
                "reserved blocks {} not below total {}",
                sb.r_blocks_count, params.blocks_count
            )));
        }

        if sb.has_incompat(IncompatFeatures::JOURNAL_DEV) {
            let layout = FsLayout::without_groups(&sb)?;
            dev.set_block_size(block_size)?;
            let mut fs = Self::from_parts(name, dev, sb, layout, Vec::new(), None, None);
            fs.now = (params.mkfs_time != 0).then_some(params.mkfs_time);
            info!(name, block_size, "initialized external journal device");
            return Ok(fs);
        }

        if sb.first_data_block >= sb.blocks_count {
            return Err(FfsError::TooSmall);
        }
        let settled = settle_geometry(&mut sb, params, block_size, frags_per_block)?;

        let mut layout = FsLayout::from_superblock(&sb)?;
        layout.group_count = settled.group_count;
        layout.desc_blocks = settled.desc_blocks;
        layout.inode_blocks_per_group = settled.inode_blocks_per_group;

        let mut block_map = new_block_bitmap(&layout)?;
        let inode_map = new_inode_bitmap(&layout, sb.inodes_count)?;

        let mut group_desc = vec![Ext2GroupDesc::default(); layout.group_count as usize];
        sb.free_blocks_count = 0;
        for (group, desc) in (0_u32..).zip(group_desc.iter_mut()) {
            let free = reserve_super_and_bgd(&layout, group, &mut block_map);
            sb.free_blocks_count += free;
            desc.free_blocks_count = u16::try_from(free).map_err(|_| {
                FfsError::InvalidGeometry(format!("group {group} yields {free} free blocks"))
            })?;
            desc.free_inodes_count = u16::try_from(sb.inodes_per_group).map_err(|_| {
                FfsError::InvalidGeometry(format!(
                    "{} inodes per group overflow a descriptor",
                    sb.inodes_per_group
                ))
            })?;
            desc.used_dirs_count = 0;
        }

        dev.set_block_size(block_size)?;
        let mut fs = Self::from_parts(
            name,
            dev,
            sb,
            layout,
            group_desc,
            Some(block_map),
            Some(inode_map),
        );
        fs.now = (params.mkfs_time != 0).then_some(params.mkfs_time);
        info!(
            name,
            block_size,
            blocks = fs.sb.blocks_count,
            groups = fs.layout.group_count,
            inodes = fs.sb.inodes_count,
            inodes_per_group = fs.sb.inodes_per_group,
            "initialized filesystem"
        );
        Ok(fs)
    }

    /// Assemble a freshly built handle. Everything is dirty and the
    /// bitmap writeback hook is armed when bitmaps exist.
    fn from_parts(
        name: &str,
        dev: Box<dyn BlockDevice>,
        sb: Ext2Superblock,
        layout: FsLayout,
        group_desc: Vec<Ext2GroupDesc>,
        block_map: Option<Bitmap>,
        inode_map: Option<Bitmap>,
    ) -> Self {
        let mut flags = FsFlags::RW | FsFlags::DIRTY;
        if block_map.is_some() {
            flags.insert(FsFlags::BB_DIRTY | FsFlags::IB_DIRTY);
        }
        let hook = block_map.is_some().then_some(Self::write_bitmaps as crate::BitmapHook);
        Self {
            name: name.to_owned(),
            dev,
            now: None,
            sb,
            orig_super: None,
            layout,
            group_desc,
            block_map,
            inode_map,
            flags,
            stride: 0,
            umask: 0o022,
            write_bitmaps_hook: hook,
        }
    }
}

/// Run the group count / inodes-per-group / overhead fixed point, leaving
/// the settled values in `sb`.
fn settle_geometry(
    sb: &mut Ext2Superblock,
    params: &InitParams,
    block_size: u32,
    frags_per_block: u32,
) -> Result<Settled> {
    let bits_per_block = block_size * 8;
    let descs_per_block = block_size / EXT2_GROUP_DESC_SIZE;
    let inode_size = u32::from(sb.inode_size());
    let sparse_super = sb.has_ro_compat(RoCompatFeatures::SPARSE_SUPER);

    for pass in 0..MAX_LAYOUT_PASSES {
        let bpg = sb.blocks_per_group;
        let data_blocks = sb
            .blocks_count
            .checked_sub(sb.first_data_block)
            .ok_or(FfsError::TooSmall)?;
        let group_count = data_blocks.div_ceil(bpg);
        if group_count == 0 {
            return Err(FfsError::TooSmall);
        }
        let desc_blocks = group_count.div_ceil(descs_per_block);

        let per_inode = if block_size >= 4096 { 1 } else { 4096 / block_size };
        sb.inodes_count = or_default(params.inodes_count, sb.blocks_count / per_inode);
        let floor = sb.first_ino() + 1;
        if sb.inodes_count < floor {
            sb.inodes_count = floor;
        }

        let mut ipg = sb.inodes_count.div_ceil(group_count);
        if ipg > bits_per_block {
            if bpg >= EXT2_MIN_BLOCKS_PER_GROUP {
                sb.blocks_per_group -= 8;
                sb.blocks_count = params.blocks_count;
                sb.frags_per_group = sb.blocks_per_group * frags_per_block;
                debug!(
                    pass,
                    inodes_per_group = ipg,
                    blocks_per_group = sb.blocks_per_group,
                    "inodes exceed one bitmap; shrinking groups"
                );
                continue;
            }
            return Err(FfsError::TooManyInodes);
        }

        let max_ipg = EXT2_MAX_INODES_PER_GROUP - block_size / inode_size;
        ipg = ipg.min(max_ipg);
        sb.inodes_per_group = ipg;
        if u64::from(sb.inodes_count) > u64::from(ipg) * u64::from(group_count) {
            sb.inodes_count = ipg * group_count;
        }

        // Fill whole inode-table blocks, then round down to a multiple of 8.
        let table_bytes = u64::from(sb.inodes_per_group) * u64::from(inode_size);
        let mut inode_blocks = table_bytes.div_ceil(u64::from(block_size));
        let filled = inode_blocks * u64::from(block_size) / u64::from(inode_size);
        let mut ipg = u32::try_from(filled).map_err(|_| FfsError::TooManyInodes)? & !7;
        if ipg == 0 {
            ipg = 8;
        }
        sb.inodes_per_group = ipg;
        inode_blocks = (u64::from(ipg) * u64::from(inode_size)).div_ceil(u64::from(block_size));
        let inode_blocks = u32::try_from(inode_blocks).map_err(|_| FfsError::TooManyInodes)?;

        sb.inodes_count = ipg.checked_mul(group_count).ok_or(FfsError::TooManyInodes)?;
        sb.free_inodes_count = sb.inodes_count;

        let rsv_gdt = if sb.has_compat(CompatFeatures::RESIZE_INODE) {
            calc_reserved_gdt_blocks(
                sb.blocks_count,
                sb.first_data_block,
                bpg,
                block_size,
                desc_blocks,
            )
        } else {
            0
        };
        let rsv_gdt = or_default(u32::from(params.reserved_gdt_blocks), rsv_gdt);
        let addr_per_block = block_size / 4;
        if rsv_gdt > addr_per_block {
            return Err(FfsError::ReservedGdtBlocks {
                requested: rsv_gdt,
                max: addr_per_block,
            });
        }
        sb.reserved_gdt_blocks = u16::try_from(rsv_gdt).map_err(|_| FfsError::ReservedGdtBlocks {
            requested: rsv_gdt,
            max: addr_per_block,
        })?;

        let mut overhead = 2 + inode_blocks;
        if group_has_full_backup(group_count - 1, sparse_super) {
            overhead += 1 + desc_blocks + rsv_gdt;
        }
        if overhead > bpg {
            return Err(FfsError::TooManyInodes);
        }

        let rem = data_blocks % bpg;
        if group_count == 1 && rem != 0 && rem < overhead {
            return Err(FfsError::TooSmall);
        }
        if rem != 0 && rem < overhead + 50 {
            debug!(pass, dropped = rem, overhead, "discarding undersized last group");
            sb.blocks_count -= rem;
            continue;
        }

        return Ok(Settled {
            group_count,
            desc_blocks,
            inode_blocks_per_group: inode_blocks,
        });
    }

    Err(FfsError::InvalidGeometry(format!(
        "layout did not settle after {MAX_LAYOUT_PASSES} passes"
    )))
}

/// All-clear block bitmap over `[first_data_block, blocks_count)`, with
/// storage padded out to whole groups.
pub(crate) fn new_block_bitmap(layout: &FsLayout) -> Result<Bitmap> {
    let padded = u64::from(layout.blocks_per_group) * u64::from(layout.group_count)
        + u64::from(layout.first_data_block)
        - 1;
    let real_end = u32::try_from(padded)
        .map_err(|_| FfsError::InvalidGeometry("block bitmap beyond 32 bits".to_owned()))?;
    Bitmap::new(
        "block bitmap",
        layout.first_data_block,
        layout.blocks_count - 1,
        real_end.max(layout.blocks_count - 1),
    )
}

/// All-clear inode bitmap over `[1, inodes_count]`.
pub(crate) fn new_inode_bitmap(layout: &FsLayout, inodes_count: u32) -> Result<Bitmap> {
    let padded = u64::from(layout.inodes_per_group) * u64::from(layout.group_count);
    let real_end = u32::try_from(padded)
        .map_err(|_| FfsError::InvalidGeometry("inode bitmap beyond 32 bits".to_owned()))?;
    Bitmap::new("inode bitmap", 1, inodes_count, real_end.max(inodes_count))
}
