#![forbid(unsafe_code)]

use ffs_core::{
    ByteBlockDevice, CompatFeatures, DirAction, EntryKind, Ext2Superblock, FfsError,
    FileByteDevice, Filesystem, InodeNumber, IterFlags, MemByteDevice, MkfsOptions, MkfsProfile,
    MkfsReport, OpenOptions, mkfs, read_region,
};
use ffs_types::{
    EXT2_BG_BLOCK_UNINIT, EXT2_BG_INODE_UNINIT, EXT2_ERROR_FS, EXT2_SUPERBLOCK_SIZE, S_IFDIR,
};

const MIB: usize = 1024 * 1024;
const BLOCK_SIZE: u32 = 1024;

fn pinned() -> MkfsOptions {
    MkfsOptions {
        seed: Some(0x5eed),
        now: Some(1_200_000_000),
        ..MkfsOptions::default()
    }
}

fn build(mem: &MemByteDevice, options: &MkfsOptions) -> MkfsReport {
    let dev = ByteBlockDevice::new(mem.clone(), BLOCK_SIZE).unwrap();
    mkfs("image", Box::new(dev), options, &MkfsProfile::default()).unwrap()
}

fn reopen(mem: &MemByteDevice, write: bool) -> Filesystem {
    let dev = ByteBlockDevice::new(mem.clone(), BLOCK_SIZE).unwrap();
    let options = OpenOptions {
        write,
        journal_dev_ok: true,
        ..OpenOptions::default()
    };
    Filesystem::open("image", Box::new(dev), &options).unwrap()
}

fn names(fs: &Filesystem, dir: InodeNumber, flags: IterFlags) -> Vec<(String, bool)> {
    let mut out = Vec::new();
    fs.dir_iterate(dir, flags, |_, entry, _| {
        out.push((entry.name_lossy(), entry.kind == EntryKind::Deleted));
        Ok(DirAction::CONTINUE)
    })
    .unwrap();
    out
}

#[test]
fn counters_agree_with_bitmaps_after_reopen() {
    let mem = MemByteDevice::new(32 * MIB);
    let report = build(&mem, &pinned());
    assert_eq!(report.fs_type, "small");
    assert_eq!(report.group_count, 4);
    assert_eq!(report.backup_superblocks, vec![8193, 24577]);

    let mut fs = reopen(&mem, false);
    fs.read_bitmaps().unwrap();
    let sb = fs.superblock().clone();
    assert_eq!(sb.free_blocks_count, report.free_blocks_count);

    let block_map = fs.block_map().unwrap();
    assert_eq!(
        block_map.count_zeros(sb.first_data_block, sb.blocks_count - 1),
        sb.free_blocks_count
    );
    let inode_map = fs.inode_map().unwrap();
    assert_eq!(inode_map.count_zeros(1, sb.inodes_count), sb.free_inodes_count);
    // Reserved inodes plus lost+found.
    assert_eq!(sb.free_inodes_count, sb.inodes_count - 11);

    let desc_blocks: u32 = fs
        .group_descs()
        .iter()
        .map(|d| u32::from(d.free_blocks_count))
        .sum();
    let desc_inodes: u32 = fs
        .group_descs()
        .iter()
        .map(|d| u32::from(d.free_inodes_count))
        .sum();
    assert_eq!(desc_blocks, sb.free_blocks_count);
    assert_eq!(desc_inodes, sb.free_inodes_count);
    assert_eq!(fs.group_descs()[0].used_dirs_count, 2);
}

#[test]
fn root_and_lost_and_found_are_linked() {
    let mem = MemByteDevice::new(16 * MIB);
    build(&mem, &pinned());
    let fs = reopen(&mem, false);

    let root = fs.read_inode(InodeNumber::ROOT).unwrap();
    assert_eq!(root.mode & S_IFDIR, S_IFDIR);
    assert_eq!(root.links_count, 3);
    assert_eq!(root.mtime, 1_200_000_000);

    let listing: Vec<String> = names(&fs, InodeNumber::ROOT, IterFlags::NONE)
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(listing, vec![".", "..", "lost+found"]);

    let lpf = fs.lookup(InodeNumber::ROOT, b"lost+found").unwrap();
    assert_eq!(fs.lookup(lpf, b"..").unwrap(), InodeNumber::ROOT);
    assert!(matches!(
        fs.lookup(InodeNumber::ROOT, b"missing"),
        Err(FfsError::NotFound(_))
    ));

    let bad = fs.read_inode(InodeNumber::BAD).unwrap();
    assert_eq!(bad.size, 0);
    assert_eq!(bad.mtime, 1_200_000_000);
}

#[test]
fn backup_superblocks_carry_their_group() {
    let mem = MemByteDevice::new(32 * MIB);
    let report = build(&mem, &pinned());
    let fs = reopen(&mem, false);
    let primary = fs.superblock().clone();

    for (blk, group) in report.backup_superblocks.iter().zip([1_u16, 3]) {
        let region = read_region(
            fs.device(),
            u64::from(*blk) * u64::from(BLOCK_SIZE),
            EXT2_SUPERBLOCK_SIZE,
        )
        .unwrap();
        let backup = Ext2Superblock::parse_superblock_region(&region).unwrap();
        assert_eq!(backup.block_group_nr, group);
        assert_eq!(backup.uuid, primary.uuid);
        assert_eq!(backup.blocks_count, primary.blocks_count);
    }
}

#[test]
fn same_seed_and_clock_give_identical_images() {
    let a = MemByteDevice::new(8 * MIB);
    let b = MemByteDevice::new(8 * MIB);
    let ra = build(&a, &pinned());
    let rb = build(&b, &pinned());
    assert_eq!(ra, rb);
    assert!(a.snapshot() == b.snapshot());

    let c = MemByteDevice::new(8 * MIB);
    let rc = build(
        &c,
        &MkfsOptions {
            seed: Some(1),
            ..pinned()
        },
    );
    assert_ne!(ra.uuid, rc.uuid);
}

#[test]
fn lazy_groups_are_left_uninitialised() {
    let mem = MemByteDevice::new(64 * MIB);
    let options = MkfsOptions {
        features: Some("lazy_bg".into()),
        ..pinned()
    };
    let report = build(&mem, &options);
    assert_eq!(report.group_count, 8);

    let mut fs = reopen(&mem, false);
    assert!(fs.superblock().has_compat(CompatFeatures::LAZY_BG));
    let descs = fs.group_descs().to_vec();
    assert!(!descs[0].has_flag(EXT2_BG_INODE_UNINIT));
    assert!(!descs[7].has_flag(EXT2_BG_BLOCK_UNINIT));
    for desc in &descs[1..7] {
        assert!(desc.has_flag(EXT2_BG_INODE_UNINIT));
        assert_eq!(desc.free_inodes_count, 0);
    }
    let desc_free: u32 = descs.iter().map(|d| u32::from(d.free_inodes_count)).sum();
    assert_eq!(desc_free, fs.superblock().free_inodes_count);
    fs.read_bitmaps().unwrap();
}

#[test]
fn super_only_marks_errors_and_skips_directories() {
    let mem = MemByteDevice::new(8 * MIB);
    let options = MkfsOptions {
        super_only: true,
        ..pinned()
    };
    let report = build(&mem, &options);
    assert!(report.super_only);
    let fs = reopen(&mem, false);
    assert_ne!(fs.superblock().state & EXT2_ERROR_FS, 0);
    assert_eq!(fs.group_descs().len(), 1);
}

#[test]
fn journal_device_has_no_groups() {
    let mem = MemByteDevice::new(8 * MIB);
    let options = MkfsOptions {
        features: Some("journal_dev".into()),
        ..pinned()
    };
    let report = build(&mem, &options);
    assert!(report.journal_device);
    assert_eq!(report.fs_type, "journal");

    let fs = reopen(&mem, false);
    assert_eq!(fs.group_count(), 0);
    assert!(fs.group_descs().is_empty());

    let dev = ByteBlockDevice::new(mem, BLOCK_SIZE).unwrap();
    let err = Filesystem::open("image", Box::new(dev), &OpenOptions::default()).unwrap_err();
    assert!(matches!(err, FfsError::UnsupportedFeature(_)));
}

#[test]
fn reopened_image_accepts_new_directories() {
    let mem = MemByteDevice::new(8 * MIB);
    build(&mem, &pinned());

    let mut fs = reopen(&mem, true);
    fs.read_bitmaps().unwrap();
    let free_before = fs.superblock().free_inodes_count;
    let dir = fs.mkdir(InodeNumber::ROOT, None, Some(b"etc")).unwrap();
    fs.close().unwrap();

    let mut fs = reopen(&mem, true);
    assert_eq!(fs.lookup(InodeNumber::ROOT, b"etc").unwrap(), dir);
    assert_eq!(fs.superblock().free_inodes_count, free_before - 1);

    fs.unlink(InodeNumber::ROOT, b"etc", None).unwrap();
    let listing = names(&fs, InodeNumber::ROOT, IterFlags::INCLUDE_REMOVED);
    assert!(listing.contains(&("etc".to_owned(), true)));
    assert!(!names(&fs, InodeNumber::ROOT, IterFlags::NONE)
        .iter()
        .any(|(name, _)| name == "etc"));
}

#[test]
fn mkfs_on_an_image_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let file = FileByteDevice::create(&path, 4 * MIB as u64).unwrap();
    let dev = ByteBlockDevice::new(file, BLOCK_SIZE).unwrap();
    let options = MkfsOptions {
        label: Some("scratch".into()),
        ..pinned()
    };
    let report = mkfs("disk", Box::new(dev), &options, &MkfsProfile::default()).unwrap();
    assert_eq!(report.fs_type, "small");
    assert_eq!(report.label, "scratch");

    let file = FileByteDevice::open_read_only(&path).unwrap();
    let dev = ByteBlockDevice::new(file, BLOCK_SIZE).unwrap();
    let fs = Filesystem::open("disk", Box::new(dev), &OpenOptions::default()).unwrap();
    assert_eq!(fs.superblock().volume_name_str(), "scratch");
    assert_eq!(fs.superblock().blocks_count, 4096);
    assert!(fs.lookup(InodeNumber::ROOT, b"lost+found").is_ok());
}

#[test]
fn explicit_block_size_and_count() {
    let mem = MemByteDevice::new(16 * MIB);
    let options = MkfsOptions {
        block_size: Some(4096),
        blocks_count: Some(2048),
        ..pinned()
    };
    let report = build(&mem, &options);
    assert_eq!(report.block_size, 4096);
    assert_eq!(report.blocks_count, 2048);
    assert_eq!(report.first_data_block, 0);

    let fs = reopen(&mem, false);
    assert_eq!(fs.block_size(), 4096);
    let lpf = fs.lookup(InodeNumber::ROOT, b"lost+found").unwrap();
    // Four 4 KiB blocks reach 16 KiB.
    assert_eq!(fs.read_inode(lpf).unwrap().size, 16 * 1024);
}

proptest::proptest! {
    #![proptest_config(proptest::prelude::ProptestConfig::with_cases(12))]

    #[test]
    fn any_small_image_is_self_consistent(
        kib in 1024_u32..12_288,
        ratio_shift in 0_u32..3,
        lazy in proptest::bool::ANY,
    ) {
        let mem = MemByteDevice::new(12 * MIB);
        let options = MkfsOptions {
            blocks_count: Some(kib),
            inode_ratio: Some(4096 << ratio_shift),
            features: lazy.then(|| "lazy_bg".to_owned()),
            ..pinned()
        };
        let report = build(&mem, &options);
        // A ragged last group may be dropped.
        proptest::prop_assert!(report.blocks_count <= kib);

        let mut fs = reopen(&mem, false);
        fs.read_bitmaps().unwrap();
        let sb = fs.superblock().clone();
        let desc_inodes: u32 = fs
            .group_descs()
            .iter()
            .map(|d| u32::from(d.free_inodes_count))
            .sum();
        let desc_blocks: u32 = fs
            .group_descs()
            .iter()
            .map(|d| u32::from(d.free_blocks_count))
            .sum();
        proptest::prop_assert_eq!(desc_inodes, sb.free_inodes_count);
        proptest::prop_assert_eq!(desc_blocks, sb.free_blocks_count);
        proptest::prop_assert!(fs.lookup(InodeNumber::ROOT, b"lost+found").is_ok());
    }
}
