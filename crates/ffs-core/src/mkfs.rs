//! Filesystem creation: option resolution against a sizing profile, then
//! initialize, place tables, and lay down the root and `lost+found`
//! directories.

use std::collections::BTreeMap;
use std::fmt;

use crate::{Filesystem, FsFlags, InitParams};
use ffs_block::{BlockDevice, write_region, zero_blocks};
use ffs_error::{FfsError, Result};
use ffs_ondisk::{
    CompatFeatures, FeatureError, FeatureSet, IncompatFeatures, RoCompatFeatures,
    edit_features,
};
use ffs_types::{
    BlockNumber, EXT2_BG_BLOCK_UNINIT, EXT2_BG_INODE_UNINIT, EXT2_DFL_MAX_MNT_COUNT,
    EXT2_DYNAMIC_REV, EXT2_ERROR_FS, EXT2_GOOD_OLD_INODE_SIZE, EXT2_GOOD_OLD_REV,
    EXT2_HASH_TEA, EXT2_MAX_BLOCK_SIZE, EXT2_MIN_BLOCK_SIZE, EXT2_MIN_BLOCKS_PER_GROUP,
    EXT2_NDIR_BLOCKS, EXT2_OS_FREEBSD, EXT2_OS_HURD, EXT2_OS_LINUX, EXT2_OS_LITES,
    EXT2_OS_MASIX, InodeNumber, nul_padded,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// `lost+found` grows until the next block would reach this size, and
/// never past the direct blocks.
const LOST_FOUND_BYTES: u32 = 16 * 1024;

/// Old RAID superblocks live in the last 64 KiB-aligned chunk.
const TAIL_WIPE_BYTES: u32 = 65_536;

const LOST_FOUND: &[u8] = b"lost+found";

// ── Profile ─────────────────────────────────────────────────────────────────

/// One profile stanza. Unset fields fall through to `defaults`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileEntry {
    pub blocksize: Option<u32>,
    pub inode_ratio: Option<u32>,
    pub base_features: Option<String>,
    pub default_features: Option<String>,
}

/// Sizing defaults keyed by filesystem type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MkfsProfile {
    pub defaults: ProfileEntry,
    pub fs_types: BTreeMap<String, ProfileEntry>,
}

impl Default for MkfsProfile {
    fn default() -> Self {
        let entry = |blocksize, inode_ratio| ProfileEntry {
            blocksize: Some(blocksize),
            inode_ratio: Some(inode_ratio),
            ..ProfileEntry::default()
        };
        let mut fs_types = BTreeMap::new();
        fs_types.insert("small".to_owned(), entry(1024, 4096));
        fs_types.insert("floppy".to_owned(), entry(1024, 8192));
        Self {
            defaults: ProfileEntry {
                base_features: Some("sparse_super,filetype,dir_index".to_owned()),
                ..entry(4096, 8192)
            },
            fs_types,
        }
    }
}

impl MkfsProfile {
    /// Parse a JSON profile document.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| FfsError::Parse(format!("mkfs profile: {err}")))
    }

    fn lookup<T>(&self, fs_type: &str, field: impl Fn(&ProfileEntry) -> Option<T>) -> Option<T> {
        self.fs_types
            .get(fs_type)
            .and_then(&field)
            .or_else(|| field(&self.defaults))
    }

    #[must_use]
    pub fn blocksize(&self, fs_type: &str) -> u32 {
        self.lookup(fs_type, |e| e.blocksize).unwrap_or(1024)
    }

    #[must_use]
    pub fn inode_ratio(&self, fs_type: &str) -> u32 {
        self.lookup(fs_type, |e| e.inode_ratio).unwrap_or(8192)
    }

    #[must_use]
    pub fn base_features(&self, fs_type: &str) -> String {
        self.lookup(fs_type, |e| e.base_features.clone())
            .unwrap_or_else(|| "filetype,sparse_super".to_owned())
    }

    #[must_use]
    pub fn default_features(&self, fs_type: &str) -> String {
        self.lookup(fs_type, |e| e.default_features.clone())
            .unwrap_or_default()
    }
}

/// Filesystem type for a size in KiB.
fn fs_type_for(size_kib: u64) -> &'static str {
    match size_kib / 1024 {
        0..=3 => "floppy",
        4..=512 => "small",
        _ => "default",
    }
}

// ── Options ─────────────────────────────────────────────────────────────────

/// Caller choices. Unset fields come from the profile or the library
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MkfsOptions {
    /// Filesystem size in blocks of `block_size`, or in KiB when no block
    /// size is given. Defaults to the whole device.
    pub blocks_count: Option<u32>,
    pub block_size: Option<u32>,
    /// Bytes per inode.
    pub inode_ratio: Option<u32>,
    pub inode_size: Option<u16>,
    pub inodes_count: Option<u32>,
    pub blocks_per_group: Option<u32>,
    /// Percentage of blocks reserved for the superuser; 5 when unset.
    pub reserved_percent: Option<u32>,
    /// Feature edit list applied after the profile's base features.
    pub features: Option<String>,
    pub fs_type: Option<String>,
    pub revision: Option<u32>,
    pub label: Option<String>,
    pub last_mounted: Option<String>,
    pub creator_os: Option<String>,
    pub stride: u32,
    /// Write only the superblock and descriptors.
    pub super_only: bool,
    /// Seed for the uuid and hash seed; random when unset.
    pub seed: Option<u64>,
    /// Fixed timestamp for every time field written.
    pub now: Option<u32>,
}

impl MkfsOptions {
    /// Apply a comma separated extended option list (`stride=N`).
    pub fn apply_extended(&mut self, list: &str) -> Result<()> {
        for token in list.split(',').filter(|t| !t.is_empty()) {
            let (key, value) = token.split_once('=').unwrap_or((token, ""));
            match key {
                "stride" => {
                    self.stride = value.parse().map_err(|_| {
                        FfsError::InvalidArgument(format!("invalid stride: {value:?}"))
                    })?;
                }
                _ => {
                    return Err(FfsError::InvalidArgument(format!(
                        "unknown extended option: {key}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Features mkfs can turn on or off.
const MKFS_OK_FEATURES: FeatureSet = FeatureSet {
    compat: CompatFeatures(CompatFeatures::DIR_INDEX.0 | CompatFeatures::LAZY_BG.0),
    incompat: IncompatFeatures(
        IncompatFeatures::FILETYPE.0 | IncompatFeatures::JOURNAL_DEV.0 | IncompatFeatures::META_BG.0,
    ),
    ro_compat: RoCompatFeatures::SPARSE_SUPER,
};

fn feature_error(err: &FeatureError) -> FfsError {
    match err {
        FeatureError::Unknown(name) => FfsError::InvalidArgument(format!("unknown feature: {name}")),
        FeatureError::NotAllowed(name) => {
            FfsError::InvalidArgument(format!("feature {name} cannot be set by mkfs"))
        }
    }
}

/// Creator OS by name or number.
fn parse_creator_os(name: &str) -> Option<u32> {
    if let Ok(num) = name.parse::<u32>() {
        return Some(num);
    }
    let os = match name.to_ascii_lowercase().as_str() {
        "linux" => EXT2_OS_LINUX,
        "hurd" | "gnu" => EXT2_OS_HURD,
        "masix" => EXT2_OS_MASIX,
        "freebsd" => EXT2_OS_FREEBSD,
        "lites" => EXT2_OS_LITES,
        _ => return None,
    };
    Some(os)
}

fn creator_os_name(os: u32) -> &'static str {
    match os {
        EXT2_OS_LINUX => "Linux",
        EXT2_OS_HURD => "GNU/Hurd",
        EXT2_OS_MASIX => "Masix",
        EXT2_OS_FREEBSD => "FreeBSD",
        EXT2_OS_LITES => "Lites",
        _ => "(unknown os)",
    }
}

fn check_block_size(size: u32, what: &str) -> Result<u32> {
    if size.is_power_of_two() && (EXT2_MIN_BLOCK_SIZE..=EXT2_MAX_BLOCK_SIZE).contains(&size) {
        Ok(size)
    } else {
        Err(FfsError::InvalidArgument(format!("invalid {what} {size}")))
    }
}

/// Everything mkfs decided before touching the device.
#[derive(Debug)]
struct Plan {
    fs_type: String,
    params: InitParams,
}

fn plan(options: &MkfsOptions, profile: &MkfsProfile, device_bytes: u64) -> Result<Plan> {
    let explicit_bs = options
        .block_size
        .map(|bs| check_block_size(bs, "block size"))
        .transpose()?;

    let revision = options.revision.unwrap_or(EXT2_DYNAMIC_REV);
    if revision > EXT2_DYNAMIC_REV {
        return Err(FfsError::InvalidArgument(format!("bad revision level {revision}")));
    }

    let size_kib = match options.blocks_count {
        Some(0) => return Err(FfsError::InvalidArgument("invalid blocks count 0".to_owned())),
        Some(count) => u64::from(count) * u64::from(explicit_bs.unwrap_or(1024) / 1024),
        None => {
            let kib = device_bytes / 1024;
            if kib == 0 {
                return Err(FfsError::InvalidArgument("device size is zero".to_owned()));
            }
            // Whole 4 KiB pages only.
            kib & !3
        }
    };

    let fs_type = options
        .fs_type
        .clone()
        .unwrap_or_else(|| fs_type_for(size_kib).to_owned());

    if revision == EXT2_GOOD_OLD_REV && options.features.is_some() {
        return Err(FfsError::InvalidArgument(
            "filesystem features not supported with revision 0".to_owned(),
        ));
    }
    let mut features = FeatureSet::NONE;
    edit_features(&profile.base_features(&fs_type), &mut features, Some(&MKFS_OK_FEATURES))
        .map_err(|err| feature_error(&err))?;
    let edits = options
        .features
        .clone()
        .unwrap_or_else(|| profile.default_features(&fs_type));
    edit_features(&edits, &mut features, Some(&MKFS_OK_FEATURES))
        .map_err(|err| feature_error(&err))?;

    let mut reserved_percent = options.reserved_percent.unwrap_or(5);
    if reserved_percent > 50 {
        return Err(FfsError::InvalidArgument(format!(
            "reserved blocks percentage {reserved_percent} above 50"
        )));
    }
    let (fs_type, features) = if features.incompat.contains(IncompatFeatures::JOURNAL_DEV) {
        reserved_percent = 0;
        let only = FeatureSet {
            incompat: IncompatFeatures::JOURNAL_DEV,
            ..FeatureSet::NONE
        };
        (
            options.fs_type.clone().unwrap_or_else(|| "journal".to_owned()),
            only,
        )
    } else {
        (fs_type, features)
    };
    let features = if revision == EXT2_GOOD_OLD_REV {
        FeatureSet::NONE
    } else {
        features
    };

    let block_size = match explicit_bs {
        Some(bs) => bs,
        None => check_block_size(profile.blocksize(&fs_type), "profile block size")?,
    };
    let blocks = size_kib / u64::from(block_size / 1024);
    if blocks >= 1 << 31 {
        return Err(FfsError::InvalidArgument(
            "filesystem too large: at most 2^31 - 1 blocks".to_owned(),
        ));
    }
    if blocks * u64::from(block_size) > device_bytes {
        return Err(FfsError::InvalidArgument(format!(
            "filesystem of {blocks} blocks larger than the device"
        )));
    }
    let blocks = u32::try_from(blocks).map_err(|_| FfsError::TooSmall)?;
    if blocks == 0 {
        return Err(FfsError::TooSmall);
    }

    let inode_ratio = match options.inode_ratio {
        Some(ratio) => {
            if !(EXT2_MIN_BLOCK_SIZE..=EXT2_MAX_BLOCK_SIZE * 1024).contains(&ratio) {
                return Err(FfsError::InvalidArgument(format!("invalid inode ratio {ratio}")));
            }
            ratio
        }
        None => profile.inode_ratio(&fs_type).max(block_size),
    };

    if let Some(bpg) = options.blocks_per_group {
        if bpg % 8 != 0 || bpg < EXT2_MIN_BLOCKS_PER_GROUP || bpg > 8 * block_size {
            return Err(FfsError::InvalidArgument(format!(
                "blocks per group {bpg} out of range"
            )));
        }
    }

    if let Some(size) = options.inode_size {
        if size < EXT2_GOOD_OLD_INODE_SIZE || u32::from(size) > block_size || !size.is_power_of_two() {
            return Err(FfsError::InvalidArgument(format!(
                "invalid inode size {size} (min {EXT2_GOOD_OLD_INODE_SIZE}/max {block_size})"
            )));
        }
    }

    let inodes_count = match options.inodes_count {
        Some(count) => count,
        None => u32::try_from(u64::from(blocks) * u64::from(block_size) / u64::from(inode_ratio))
            .map_err(|_| FfsError::TooManyInodes)?,
    };
    let r_blocks_count =
        u32::try_from(u64::from(blocks) * u64::from(reserved_percent) / 100).unwrap_or(0);
    let log_block_size = block_size.trailing_zeros() - EXT2_MIN_BLOCK_SIZE.trailing_zeros();

    debug!(%fs_type, block_size, blocks, inodes_count, inode_ratio, "mkfs plan");
    Ok(Plan {
        fs_type,
        params: InitParams {
            blocks_count: blocks,
            r_blocks_count,
            log_block_size,
            log_frag_size: log_block_size,
            features,
            rev_level: revision,
            inode_size: options.inode_size.unwrap_or(0),
            blocks_per_group: options.blocks_per_group.unwrap_or(0),
            inodes_count,
            mkfs_time: options.now.unwrap_or(0),
            ..InitParams::default()
        },
    })
}

// ── Report ──────────────────────────────────────────────────────────────────

/// What mkfs built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MkfsReport {
    pub fs_type: String,
    pub label: String,
    pub uuid: String,
    pub creator_os: String,
    pub features: String,
    pub block_size: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub inodes_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_blocks_per_group: u32,
    pub group_count: u32,
    /// First block of every group carrying a backup superblock.
    pub backup_superblocks: Vec<u32>,
    pub journal_device: bool,
    pub super_only: bool,
}

impl MkfsReport {
    fn from_fs(fs: &Filesystem, fs_type: &str, super_only: bool) -> Self {
        let sb = fs.superblock();
        let layout = fs.layout();
        Self {
            fs_type: fs_type.to_owned(),
            label: sb.volume_name_str(),
            uuid: sb.uuid_string(),
            creator_os: creator_os_name(sb.creator_os).to_owned(),
            features: sb.features().to_string(),
            block_size: layout.block_size,
            blocks_count: sb.blocks_count,
            r_blocks_count: sb.r_blocks_count,
            free_blocks_count: sb.free_blocks_count,
            inodes_count: sb.inodes_count,
            free_inodes_count: sb.free_inodes_count,
            first_data_block: sb.first_data_block,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            inode_blocks_per_group: layout.inode_blocks_per_group,
            group_count: layout.group_count,
            backup_superblocks: layout
                .backup_groups()
                .skip(1)
                .map(|g| layout.group_first_block(g))
                .collect(),
            journal_device: sb.has_incompat(IncompatFeatures::JOURNAL_DEV),
            super_only,
        }
    }
}

impl fmt::Display for MkfsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Filesystem label={}", self.label)?;
        writeln!(f, "OS type: {}", self.creator_os)?;
        writeln!(f, "Filesystem type: {}", self.fs_type)?;
        writeln!(f, "Block size={}", self.block_size)?;
        writeln!(f, "Filesystem UUID: {}", self.uuid)?;
        writeln!(f, "Features: {}", self.features)?;
        if self.journal_device {
            return writeln!(f, "{} blocks (external journal device)", self.blocks_count);
        }
        writeln!(f, "{} inodes, {} blocks", self.inodes_count, self.blocks_count)?;
        writeln!(f, "{} blocks reserved for the super user", self.r_blocks_count)?;
        writeln!(f, "First data block={}", self.first_data_block)?;
        writeln!(
            f,
            "{} block group{}",
            self.group_count,
            if self.group_count == 1 { "" } else { "s" }
        )?;
        writeln!(
            f,
            "{} blocks per group, {} inodes per group",
            self.blocks_per_group, self.inodes_per_group
        )?;
        if !self.backup_superblocks.is_empty() {
            let list: Vec<String> = self.backup_superblocks.iter().map(u32::to_string).collect();
            writeln!(f, "Superblock backups stored on blocks:")?;
            writeln!(f, "\t{}", list.join(", "))?;
        }
        Ok(())
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────────

/// Create an ext2 filesystem on `dev`.
pub fn mkfs(
    name: &str,
    dev: Box<dyn BlockDevice>,
    options: &MkfsOptions,
    profile: &MkfsProfile,
) -> Result<MkfsReport> {
    let device_bytes = dev.block_count() * u64::from(dev.block_size());
    let plan = plan(options, profile, device_bytes)?;
    let mut fs = Filesystem::initialize(name, dev, &plan.params)?;

    // Stale signatures in sectors 2..7 (the old primary superblock area).
    write_region(fs.device(), 1024, &[0_u8; 3072])?;

    stamp_identity(&mut fs, options)?;

    if fs.superblock().has_incompat(IncompatFeatures::JOURNAL_DEV) {
        let blocks = fs.superblock().blocks_count;
        zero_blocks(fs.device(), BlockNumber(0), blocks)?;
        let report = MkfsReport::from_fs(&fs, &plan.fs_type, false);
        fs.close()?;
        info!(name, blocks, "created external journal device");
        return Ok(report);
    }

    fs.set_stride(options.stride);
    fs.allocate_tables()?;

    if options.super_only {
        fs.superblock_mut().state |= EXT2_ERROR_FS;
        let mut flags = fs.flags();
        flags.remove(FsFlags::BB_DIRTY | FsFlags::IB_DIRTY);
        fs.set_flags(flags);
    } else {
        wipe_device_tail(&fs)?;
        setup_lazy_bg(&mut fs);
        write_inode_tables(&fs)?;
        create_root_dir(&mut fs)?;
        create_lost_and_found(&mut fs)?;
        reserve_inodes(&mut fs)?;
        create_bad_block_inode(&mut fs)?;
    }

    let report = MkfsReport::from_fs(&fs, &plan.fs_type, options.super_only);
    fs.close()?;
    info!(
        name,
        fs_type = %report.fs_type,
        blocks = report.blocks_count,
        groups = report.group_count,
        "created filesystem"
    );
    Ok(report)
}

/// UUID, hash seed, mount-count jitter, creator OS, label and last
/// mount point.
fn stamp_identity(fs: &mut Filesystem, options: &MkfsOptions) -> Result<()> {
    let mut rng = options
        .seed
        .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
    let uuid = random_uuid(&mut rng);
    let seed = random_uuid(&mut rng);

    let creator_os = match options.creator_os.as_deref() {
        Some(name) => parse_creator_os(name)
            .ok_or_else(|| FfsError::InvalidArgument(format!("unknown os - {name}")))?,
        None => EXT2_OS_LINUX,
    };

    let sb = fs.superblock_mut();
    sb.uuid = uuid;
    sb.def_hash_version = EXT2_HASH_TEA;
    for (word, chunk) in sb.hash_seed.iter_mut().zip(seed.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    let jitter: u32 = uuid.iter().map(|b| u32::from(*b)).sum();
    let jitter = u16::try_from(jitter % u32::from(EXT2_DFL_MAX_MNT_COUNT)).unwrap_or(0);
    sb.max_mnt_count = sb.max_mnt_count.saturating_add(jitter);

    sb.creator_os = creator_os;
    if creator_os == EXT2_OS_HURD {
        sb.feature_incompat.remove(IncompatFeatures::FILETYPE);
    }
    if let Some(label) = options.label.as_deref() {
        sb.volume_name = nul_padded::<16>(label);
    }
    if let Some(dir) = options.last_mounted.as_deref() {
        sb.last_mounted = nul_padded::<64>(dir);
    }
    debug!(uuid = %sb.uuid_string(), creator_os, "stamped identity");
    Ok(())
}

/// Random (version 4) UUID bytes.
fn random_uuid(rng: &mut StdRng) -> [u8; 16] {
    let mut uuid = [0_u8; 16];
    rng.fill_bytes(&mut uuid);
    uuid[6] = (uuid[6] & 0x0F) | 0x40;
    uuid[8] = (uuid[8] & 0x3F) | 0x80;
    uuid
}

/// Zero the last 64 KiB-aligned chunk of the device.
fn wipe_device_tail(fs: &Filesystem) -> Result<()> {
    let rsv = (TAIL_WIPE_BYTES / fs.block_size()).max(1);
    let blocks = fs.superblock().blocks_count;
    let mut start = blocks & !(rsv - 1);
    if start > rsv {
        start -= rsv;
    }
    if start > 0 {
        debug!(start, count = blocks - start, "wiping device tail");
        zero_blocks(fs.device(), BlockNumber(start), blocks - start)?;
    }
    Ok(())
}

/// Mark interior groups that hold nothing as uninitialised.
fn setup_lazy_bg(fs: &mut Filesystem) {
    if !fs.superblock().has_compat(CompatFeatures::LAZY_BG) {
        return;
    }
    let groups = fs.group_count();
    let ipg = fs.superblock().inodes_per_group;
    for group in 1..groups.saturating_sub(1) {
        let blks = fs.layout.locate(group).free_blocks;
        let desc = &mut fs.group_desc[group as usize];
        if u32::from(desc.free_inodes_count) == ipg {
            desc.free_inodes_count = 0;
            desc.flags |= EXT2_BG_INODE_UNINIT;
            fs.sb.free_inodes_count = fs.sb.free_inodes_count.saturating_sub(ipg);
        }
        if u32::from(desc.free_blocks_count) == blks {
            desc.free_blocks_count = 0;
            desc.flags |= EXT2_BG_BLOCK_UNINIT;
            fs.sb.free_blocks_count = fs.sb.free_blocks_count.saturating_sub(blks);
        }
    }
    fs.flags.insert(FsFlags::DIRTY);
}

fn write_inode_tables(fs: &Filesystem) -> Result<()> {
    let lazy = fs.superblock().has_compat(CompatFeatures::LAZY_BG);
    let span = fs.layout().inode_blocks_per_group;
    for desc in fs.group_descs() {
        if lazy && desc.has_flag(EXT2_BG_INODE_UNINIT) {
            continue;
        }
        zero_blocks(fs.device(), BlockNumber(desc.inode_table), span)?;
    }
    Ok(())
}

fn create_root_dir(fs: &mut Filesystem) -> Result<()> {
    fs.mkdir(InodeNumber::ROOT, Some(InodeNumber::ROOT), None)?;
    Ok(())
}

fn create_lost_and_found(fs: &mut Filesystem) -> Result<()> {
    fs.set_umask(0o077);
    let ino = fs.mkdir(InodeNumber::ROOT, None, Some(LOST_FOUND))?;

    let mut size = 0;
    for _ in 1..EXT2_NDIR_BLOCKS {
        size += fs.block_size();
        if size >= LOST_FOUND_BYTES {
            break;
        }
        fs.expand_dir(ino)?;
    }
    Ok(())
}

/// Inodes between the root and the first ordinary inode stay reserved.
fn reserve_inodes(fs: &mut Filesystem) -> Result<()> {
    let first_ino = fs.superblock().first_ino();
    for ino in (InodeNumber::ROOT.0 + 1)..first_ino {
        fs.inode_alloc_stats(InodeNumber(ino), 1, false)?;
    }
    Ok(())
}

/// Inode 1 holds the (empty) bad block list.
fn create_bad_block_inode(fs: &mut Filesystem) -> Result<()> {
    fs.inode_alloc_stats(InodeNumber::BAD, 1, false)?;
    let now = fs.now();
    let mut inode = fs.read_inode(InodeNumber::BAD)?;
    inode.atime = now;
    inode.mtime = now;
    if inode.ctime == 0 {
        inode.ctime = now;
    }
    inode.size = 0;
    inode.blocks = 0;
    fs.write_inode(InodeNumber::BAD, &inode)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_block::{ByteBlockDevice, MemByteDevice};

    const MIB: u64 = 1024 * 1024;

    fn opts() -> MkfsOptions {
        MkfsOptions {
            seed: Some(7),
            now: Some(1_000_000),
            ..MkfsOptions::default()
        }
    }

    #[test]
    fn fs_type_follows_size() {
        assert_eq!(fs_type_for(1440), "floppy");
        assert_eq!(fs_type_for(3 * 1024), "floppy");
        assert_eq!(fs_type_for(64 * 1024), "small");
        assert_eq!(fs_type_for(512 * 1024), "small");
        assert_eq!(fs_type_for(600 * 1024), "default");
    }

    #[test]
    fn builtin_profile_values() {
        let profile = MkfsProfile::default();
        assert_eq!(profile.blocksize("default"), 4096);
        assert_eq!(profile.blocksize("small"), 1024);
        assert_eq!(profile.inode_ratio("small"), 4096);
        assert_eq!(profile.inode_ratio("floppy"), 8192);
        assert_eq!(profile.base_features("floppy"), "sparse_super,filetype,dir_index");
        assert_eq!(profile.default_features("small"), "");
        // Unknown types fall back to the defaults stanza.
        assert_eq!(profile.blocksize("news"), 4096);
    }

    #[test]
    fn profile_loads_from_json() {
        let profile = MkfsProfile::from_json(
            r#"{"defaults": {"blocksize": 2048}, "fs_types": {"news": {"inode_ratio": 4096}}}"#,
        )
        .unwrap();
        assert_eq!(profile.blocksize("news"), 2048);
        assert_eq!(profile.inode_ratio("news"), 4096);
        assert_eq!(profile.inode_ratio("small"), 8192);
        assert_eq!(profile.base_features("small"), "filetype,sparse_super");
        assert!(matches!(MkfsProfile::from_json("{"), Err(FfsError::Parse(_))));
    }

    #[test]
    fn plan_for_small_device() {
        let plan = plan(&opts(), &MkfsProfile::default(), 64 * MIB).unwrap();
        assert_eq!(plan.fs_type, "small");
        let p = &plan.params;
        assert_eq!(p.log_block_size, 0);
        assert_eq!(p.blocks_count, 65_536);
        assert_eq!(p.inodes_count, 16_384);
        assert_eq!(p.r_blocks_count, 3_276);
        assert!(p.features.ro_compat.contains(RoCompatFeatures::SPARSE_SUPER));
        assert!(p.features.incompat.contains(IncompatFeatures::FILETYPE));
        assert!(p.features.compat.contains(CompatFeatures::DIR_INDEX));
        assert_eq!(p.mkfs_time, 1_000_000);
    }

    #[test]
    fn plan_rejects_bad_options() {
        let profile = MkfsProfile::default();
        let bad = |o: MkfsOptions| plan(&o, &profile, 64 * MIB).unwrap_err();

        assert!(matches!(
            bad(MkfsOptions { features: Some("resize_inode".into()), ..opts() }),
            FfsError::InvalidArgument(_)
        ));
        assert!(matches!(
            bad(MkfsOptions { features: Some("bogus".into()), ..opts() }),
            FfsError::InvalidArgument(_)
        ));
        assert!(matches!(
            bad(MkfsOptions { block_size: Some(3000), ..opts() }),
            FfsError::InvalidArgument(_)
        ));
        assert!(matches!(
            bad(MkfsOptions { blocks_per_group: Some(1020), ..opts() }),
            FfsError::InvalidArgument(_)
        ));
        assert!(matches!(
            bad(MkfsOptions { inode_size: Some(192), ..opts() }),
            FfsError::InvalidArgument(_)
        ));
        assert!(matches!(
            bad(MkfsOptions { reserved_percent: Some(51), ..opts() }),
            FfsError::InvalidArgument(_)
        ));
        assert!(matches!(
            bad(MkfsOptions { blocks_count: Some(200_000), ..opts() }),
            FfsError::InvalidArgument(_)
        ));
        assert!(matches!(
            bad(MkfsOptions {
                revision: Some(0),
                features: Some("filetype".into()),
                ..opts()
            }),
            FfsError::InvalidArgument(_)
        ));
    }

    #[test]
    fn journal_device_plan_strips_features() {
        let options = MkfsOptions {
            features: Some("journal_dev".into()),
            ..opts()
        };
        let plan = plan(&options, &MkfsProfile::default(), 64 * MIB).unwrap();
        assert_eq!(plan.fs_type, "journal");
        assert_eq!(plan.params.r_blocks_count, 0);
        assert_eq!(
            plan.params.features,
            FeatureSet {
                incompat: IncompatFeatures::JOURNAL_DEV,
                ..FeatureSet::NONE
            }
        );
    }

    #[test]
    fn extended_options() {
        let mut options = MkfsOptions::default();
        options.apply_extended("stride=16").unwrap();
        assert_eq!(options.stride, 16);
        assert!(options.apply_extended("stride=x").is_err());
        assert!(options.apply_extended("resize=100").is_err());
    }

    #[test]
    fn creator_os_names() {
        assert_eq!(parse_creator_os("Linux"), Some(EXT2_OS_LINUX));
        assert_eq!(parse_creator_os("GNU"), Some(EXT2_OS_HURD));
        assert_eq!(parse_creator_os("3"), Some(EXT2_OS_FREEBSD));
        assert_eq!(parse_creator_os("plan9"), None);
    }

    #[test]
    fn uuid_is_version_four_and_seeded() {
        let mut a = StdRng::seed_from_u64(1);
        let mut b = StdRng::seed_from_u64(1);
        let uuid = random_uuid(&mut a);
        assert_eq!(uuid, random_uuid(&mut b));
        assert_eq!(uuid[6] >> 4, 4);
        assert_eq!(uuid[8] & 0xC0, 0x80);
    }

    #[test]
    fn hurd_drops_filetype() {
        let mem = MemByteDevice::new(8 * MIB as usize);
        let dev = ByteBlockDevice::new(mem, 1024).unwrap();
        let options = MkfsOptions {
            creator_os: Some("hurd".into()),
            ..opts()
        };
        let report = mkfs("hurd", Box::new(dev), &options, &MkfsProfile::default()).unwrap();
        assert_eq!(report.creator_os, "GNU/Hurd");
        assert!(!report.features.contains("filetype"));
    }

    #[test]
    fn lost_and_found_is_pre_grown() {
        let mem = MemByteDevice::new(8 * MIB as usize);
        let dev = ByteBlockDevice::new(mem.clone(), 1024).unwrap();
        mkfs("lpf", Box::new(dev), &opts(), &MkfsProfile::default()).unwrap();

        let dev = ByteBlockDevice::new(mem, 1024).unwrap();
        let fs = Filesystem::open("lpf", Box::new(dev), &crate::OpenOptions::default()).unwrap();
        let ino = fs.lookup(InodeNumber::ROOT, LOST_FOUND).unwrap();
        assert_eq!(ino, InodeNumber(11));
        let inode = fs.read_inode(ino).unwrap();
        // 1 KiB blocks: the initial block plus eleven expansions.
        assert_eq!(inode.size, 12 * 1024);
        assert_eq!(inode.blocks, 12 * 2);
        assert_eq!(inode.mode & 0o777, 0o700);
    }
}
