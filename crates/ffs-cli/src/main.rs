#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use ffs_core::{
    ByteBlockDevice, DirAction, EntryKind, FileByteDevice, Filesystem, InodeNumber, IterFlags,
    MkfsOptions, MkfsProfile, OpenOptions, mkfs,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Block size the device is opened with before the superblock is known.
const PROBE_BLOCK_SIZE: u32 = 1024;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "ffs", about = "ext2 image toolkit: create, inspect, list")]
struct Cli {
    /// Log at debug level (overrides FFS_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an ext2 filesystem on an image file or device.
    Mkfs(MkfsArgs),
    /// Print superblock geometry, features and per-group placement.
    Inspect {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List a directory.
    Ls {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Directory inside the image.
        #[arg(default_value = "/")]
        path: String,
        /// Also show deleted entries that are still recoverable.
        #[arg(long)]
        deleted: bool,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct MkfsArgs {
    /// Image file or device. A missing file is created when `--blocks` is given.
    device: PathBuf,
    /// Filesystem size in blocks (KiB when no block size is given).
    #[arg(long)]
    blocks: Option<u32>,
    #[arg(long, short = 'b')]
    block_size: Option<u32>,
    /// Bytes per inode.
    #[arg(short = 'i')]
    inode_ratio: Option<u32>,
    #[arg(short = 'I')]
    inode_size: Option<u16>,
    #[arg(short = 'N')]
    inodes: Option<u32>,
    #[arg(short = 'g')]
    blocks_per_group: Option<u32>,
    /// Reserved blocks percentage.
    #[arg(short = 'm')]
    reserved_percent: Option<u32>,
    /// Feature edit list, e.g. `^dir_index,lazy_bg`.
    #[arg(short = 'O')]
    features: Option<String>,
    #[arg(short = 'L')]
    label: Option<String>,
    /// Last mounted directory.
    #[arg(short = 'M')]
    last_mounted: Option<String>,
    /// Creator OS.
    #[arg(short = 'o')]
    creator_os: Option<String>,
    /// Extended options, e.g. `stride=16`.
    #[arg(short = 'E')]
    extended: Option<String>,
    /// Write superblock and descriptors only.
    #[arg(short = 'S')]
    super_only: bool,
    /// Filesystem type used to pick profile defaults.
    #[arg(short = 'T')]
    fs_type: Option<String>,
    #[arg(short = 'r')]
    revision: Option<u32>,
    /// JSON sizing profile replacing the built-in one.
    #[arg(long)]
    profile: Option<PathBuf>,
    /// JSON options file; flags given on the command line win.
    #[arg(long)]
    options: Option<PathBuf>,
    /// Seed for uuid generation, for reproducible images.
    #[arg(long)]
    seed: Option<u64>,
    /// Fixed timestamp for every time field.
    #[arg(long)]
    now: Option<u32>,
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    volume_name: String,
    uuid: String,
    last_mounted: String,
    rev_level: u32,
    state: u16,
    creator_os: u32,
    features: String,
    block_size: u32,
    blocks_count: u32,
    r_blocks_count: u32,
    free_blocks_count: u32,
    inodes_count: u32,
    free_inodes_count: u32,
    first_data_block: u32,
    first_ino: u32,
    inode_size: u16,
    blocks_per_group: u32,
    inodes_per_group: u32,
    reserved_gdt_blocks: u16,
    mount_count: u16,
    max_mount_count: u16,
    mkfs_time: u32,
    write_time: u32,
    groups: Vec<GroupOutput>,
}

#[derive(Debug, Serialize)]
struct GroupOutput {
    group: u32,
    first_block: u32,
    last_block: u32,
    superblock: Option<u32>,
    old_desc: Option<u32>,
    new_desc: Option<u32>,
    block_bitmap: u32,
    inode_bitmap: u32,
    inode_table: u32,
    free_blocks: u16,
    free_inodes: u16,
    used_dirs: u16,
    flags: u16,
}

#[derive(Debug, Serialize)]
struct LsEntry {
    inode: u32,
    rec_len: usize,
    file_type: u8,
    name: String,
    deleted: bool,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(error) = run(cli.command) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("FFS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Mkfs(args) => mkfs_cmd(&args),
        Command::Inspect { image, json } => inspect(&image, json),
        Command::Ls {
            image,
            path,
            deleted,
            json,
        } => ls(&image, &path, deleted, json),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

// ── mkfs ────────────────────────────────────────────────────────────────────

fn mkfs_options(args: &MkfsArgs) -> Result<MkfsOptions> {
    let mut options = match &args.options {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read options file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("invalid options file {}", path.display()))?
        }
        None => MkfsOptions::default(),
    };

    macro_rules! take {
        ($($field:ident <- $arg:expr),* $(,)?) => {
            $(if let Some(value) = $arg.clone() { options.$field = Some(value); })*
        };
    }
    take!(
        blocks_count <- args.blocks,
        block_size <- args.block_size,
        inode_ratio <- args.inode_ratio,
        inode_size <- args.inode_size,
        inodes_count <- args.inodes,
        blocks_per_group <- args.blocks_per_group,
        reserved_percent <- args.reserved_percent,
        features <- args.features,
        fs_type <- args.fs_type,
        revision <- args.revision,
        label <- args.label,
        last_mounted <- args.last_mounted,
        creator_os <- args.creator_os,
        seed <- args.seed,
        now <- args.now,
    );
    if args.super_only {
        options.super_only = true;
    }
    if let Some(list) = &args.extended {
        options
            .apply_extended(list)
            .context("bad extended options")?;
    }
    Ok(options)
}

fn mkfs_cmd(args: &MkfsArgs) -> Result<()> {
    let options = mkfs_options(args)?;
    let profile = match &args.profile {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read profile {}", path.display()))?;
            MkfsProfile::from_json(&text)
                .with_context(|| format!("invalid profile {}", path.display()))?
        }
        None => MkfsProfile::default(),
    };

    let file = if args.device.exists() {
        FileByteDevice::open(&args.device)
    } else {
        let Some(blocks) = options.blocks_count else {
            bail!(
                "{} does not exist; pass --blocks to create it",
                args.device.display()
            );
        };
        let unit = u64::from(options.block_size.unwrap_or(1024));
        debug!(path = %args.device.display(), blocks, "creating image file");
        FileByteDevice::create(&args.device, u64::from(blocks) * unit)
    }
    .with_context(|| format!("failed to open {}", args.device.display()))?;
    let dev = ByteBlockDevice::new(file, PROBE_BLOCK_SIZE)?;

    let name = args.device.display().to_string();
    let report = mkfs(&name, Box::new(dev), &options, &profile)
        .with_context(|| format!("mkfs failed on {name}"))?;

    if args.json {
        print_json(&report)
    } else {
        print!("{report}");
        Ok(())
    }
}

// ── inspect / ls ────────────────────────────────────────────────────────────

fn open_image(path: &Path) -> Result<Filesystem> {
    let file = FileByteDevice::open_read_only(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let dev = ByteBlockDevice::new(file, PROBE_BLOCK_SIZE)?;
    let options = OpenOptions {
        journal_dev_ok: true,
        ..OpenOptions::default()
    };
    Filesystem::open(&path.display().to_string(), Box::new(dev), &options)
        .with_context(|| format!("failed to read ext2 metadata in {}", path.display()))
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let fs = open_image(path)?;
    let sb = fs.superblock();
    let layout = fs.layout();

    let groups = (0_u32..)
        .zip(fs.group_descs())
        .map(|(group, desc)| {
            let loc = layout.locate(group);
            GroupOutput {
                group,
                first_block: layout.group_first_block(group),
                last_block: layout.group_last_block(group),
                superblock: loc.super_block.map(|b| b.0),
                old_desc: loc.old_desc.map(|b| b.0),
                new_desc: loc.new_desc.map(|b| b.0),
                block_bitmap: desc.block_bitmap,
                inode_bitmap: desc.inode_bitmap,
                inode_table: desc.inode_table,
                free_blocks: desc.free_blocks_count,
                free_inodes: desc.free_inodes_count,
                used_dirs: desc.used_dirs_count,
                flags: desc.flags,
            }
        })
        .collect();

    let output = InspectOutput {
        volume_name: sb.volume_name_str(),
        uuid: sb.uuid_string(),
        last_mounted: sb.last_mounted_str(),
        rev_level: sb.rev_level,
        state: sb.state,
        creator_os: sb.creator_os,
        features: sb.features().to_string(),
        block_size: fs.block_size(),
        blocks_count: sb.blocks_count,
        r_blocks_count: sb.r_blocks_count,
        free_blocks_count: sb.free_blocks_count,
        inodes_count: sb.inodes_count,
        free_inodes_count: sb.free_inodes_count,
        first_data_block: sb.first_data_block,
        first_ino: sb.first_ino(),
        inode_size: sb.inode_size(),
        blocks_per_group: sb.blocks_per_group,
        inodes_per_group: sb.inodes_per_group,
        reserved_gdt_blocks: sb.reserved_gdt_blocks,
        mount_count: sb.mnt_count,
        max_mount_count: sb.max_mnt_count,
        mkfs_time: sb.mkfs_time,
        write_time: sb.wtime,
        groups,
    };

    if json {
        return print_json(&output);
    }

    println!("Filesystem volume name:   {}", output.volume_name);
    println!("Last mounted on:          {}", output.last_mounted);
    println!("Filesystem UUID:          {}", output.uuid);
    println!("Filesystem revision #:    {}", output.rev_level);
    println!("Filesystem features:      {}", output.features);
    println!("Filesystem state:         {:#06x}", output.state);
    println!("Filesystem OS type:       {}", output.creator_os);
    println!("Inode count:              {}", output.inodes_count);
    println!("Block count:              {}", output.blocks_count);
    println!("Reserved block count:     {}", output.r_blocks_count);
    println!("Free blocks:              {}", output.free_blocks_count);
    println!("Free inodes:              {}", output.free_inodes_count);
    println!("First block:              {}", output.first_data_block);
    println!("Block size:               {}", output.block_size);
    println!("Reserved GDT blocks:      {}", output.reserved_gdt_blocks);
    println!("Blocks per group:         {}", output.blocks_per_group);
    println!("Inodes per group:         {}", output.inodes_per_group);
    println!("First inode:              {}", output.first_ino);
    println!("Inode size:               {}", output.inode_size);
    println!("Mount count:              {}", output.mount_count);
    println!("Maximum mount count:      {}", output.max_mount_count);
    for g in &output.groups {
        println!();
        println!("Group {}: (Blocks {}-{})", g.group, g.first_block, g.last_block);
        if let Some(sb_blk) = g.superblock {
            print!("  Superblock at {sb_blk}");
            match (g.old_desc, g.new_desc) {
                (Some(old), _) => println!(", Group descriptors at {old}"),
                (None, Some(new)) => println!(", Group descriptor at {new}"),
                (None, None) => println!(),
            }
        } else if let Some(new) = g.new_desc {
            println!("  Group descriptor at {new}");
        }
        println!(
            "  Block bitmap at {}, Inode bitmap at {}, Inode table at {}",
            g.block_bitmap, g.inode_bitmap, g.inode_table
        );
        println!(
            "  {} free blocks, {} free inodes, {} directories{}",
            g.free_blocks,
            g.free_inodes,
            g.used_dirs,
            if g.flags == 0 {
                String::new()
            } else {
                format!(", flags {:#x}", g.flags)
            }
        );
    }
    Ok(())
}

fn resolve_path(fs: &Filesystem, path: &str) -> Result<InodeNumber> {
    let mut ino = InodeNumber::ROOT;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        ino = fs
            .lookup(ino, component.as_bytes())
            .with_context(|| format!("cannot resolve {component:?} in {path}"))?;
    }
    Ok(ino)
}

fn ls(image: &Path, path: &str, deleted: bool, json: bool) -> Result<()> {
    let fs = open_image(image)?;
    let dir = resolve_path(&fs, path)?;
    let flags = if deleted {
        IterFlags::INCLUDE_REMOVED
    } else {
        IterFlags::NONE
    };

    let mut entries = Vec::new();
    fs.dir_iterate(dir, flags, |_, entry, _| {
        entries.push(LsEntry {
            inode: entry.inode,
            rec_len: entry.rec_len,
            file_type: entry.file_type,
            name: entry.name_lossy(),
            deleted: entry.kind == EntryKind::Deleted,
        });
        Ok(DirAction::CONTINUE)
    })
    .with_context(|| format!("failed to list {path}"))?;

    if json {
        return print_json(&entries);
    }
    for e in &entries {
        let mark = if e.deleted { "<deleted>" } else { "" };
        println!("{:>8}  {:>5}  {}{mark}", e.inode, e.rec_len, e.name);
    }
    Ok(())
}
