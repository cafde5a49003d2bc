#![forbid(unsafe_code)]
//! Directory record engine.
//!
//! Works on one directory block at a time. A block is a run of
//! variable-length records tiled by `rec_len`; the engine validates that
//! tiling, walks it (optionally surfacing records hidden inside a
//! predecessor's slack after deletion), and inserts or removes names by
//! splitting and merging records in place.
//!
//! Callers drive the walk through a visitor closure that gets the decoded
//! entry and the mutable block, and answers with a [`DirAction`].

use std::ops::BitOr;

use ffs_error::{FfsError, Result};
use ffs_ondisk::DirEntryHeader;
use ffs_ondisk::dirent::{DIR_ENTRY_HEADER_LEN, entry_name, write_entry};
use ffs_ondisk::{FileType, rec_len_for};
use ffs_types::EXT2_NAME_LEN;
use tracing::trace;

// ── Walk control ────────────────────────────────────────────────────────────

/// Position of an entry as reported to visitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// First reported entry of a directory's first block.
    Dot,
    /// Second reported entry of a directory's first block.
    DotDot,
    Other,
    /// Record hidden in the slack of a live predecessor.
    Deleted,
}

/// Which records a walk reports besides live ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterFlags {
    /// Report records with inode 0.
    pub include_empty: bool,
    /// Scan predecessor slack for deleted records.
    pub include_removed: bool,
}

impl IterFlags {
    pub const NONE: Self = Self {
        include_empty: false,
        include_removed: false,
    };
    pub const INCLUDE_EMPTY: Self = Self {
        include_empty: true,
        include_removed: false,
    };
    pub const INCLUDE_REMOVED: Self = Self {
        include_empty: false,
        include_removed: true,
    };
}

impl BitOr for IterFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self {
            include_empty: self.include_empty || rhs.include_empty,
            include_removed: self.include_removed || rhs.include_removed,
        }
    }
}

/// Visitor answer: whether the block was modified and whether to stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirAction {
    pub changed: bool,
    pub abort: bool,
}

impl DirAction {
    pub const CONTINUE: Self = Self {
        changed: false,
        abort: false,
    };
    pub const CHANGED: Self = Self {
        changed: true,
        abort: false,
    };
    pub const ABORT: Self = Self {
        changed: false,
        abort: true,
    };
}

impl BitOr for DirAction {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self {
            changed: self.changed || rhs.changed,
            abort: self.abort || rhs.abort,
        }
    }
}

/// Result of walking one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockWalk {
    /// Some visitor modified the block; the caller must write it back.
    pub changed: bool,
    /// Some visitor asked to stop.
    pub aborted: bool,
}

/// A decoded record handed to visitors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: EntryKind,
    pub offset: usize,
    pub inode: u32,
    pub rec_len: usize,
    pub name_len: u8,
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl DirEntry {
    #[must_use]
    pub fn file_type(&self) -> FileType {
        FileType::from_raw(self.file_type)
    }

    #[must_use]
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

// ── Validation ──────────────────────────────────────────────────────────────

fn corrupted(block_nr: u32, offset: usize) -> FfsError {
    FfsError::DirectoryCorrupted {
        block: block_nr,
        offset,
    }
}

/// Header at `offset` if it passes the structural checks.
fn checked_header(block: &[u8], offset: usize) -> Option<DirEntryHeader> {
    let header = DirEntryHeader::decode(block, offset).ok()?;
    let sound = offset + header.rec_len <= block.len()
        && header.rec_len >= DIR_ENTRY_HEADER_LEN
        && header.rec_len % 4 == 0
        && usize::from(header.name_len) + DIR_ENTRY_HEADER_LEN <= header.rec_len;
    sound.then_some(header)
}

/// Check that every record in `block` is sound and the records tile it.
pub fn validate_block(block: &[u8], block_nr: u32) -> Result<()> {
    let mut offset = 0;
    while offset < block.len() {
        let header = checked_header(block, offset).ok_or_else(|| corrupted(block_nr, offset))?;
        offset += header.rec_len;
    }
    Ok(())
}

/// Do the records from `offset` form a sound run ending exactly at
/// `final_offset`?
fn validate_run(block: &[u8], mut offset: usize, final_offset: usize) -> bool {
    while offset < final_offset {
        let Ok(header) = DirEntryHeader::decode(block, offset) else {
            return false;
        };
        if header.rec_len < DIR_ENTRY_HEADER_LEN
            || header.rec_len % 4 != 0
            || usize::from(header.name_len) + DIR_ENTRY_HEADER_LEN > header.rec_len
        {
            return false;
        }
        offset += header.rec_len;
    }
    offset == final_offset
}

// ── Iteration ───────────────────────────────────────────────────────────────

/// Walk every record of `block`, calling `visit` for the ones `flags` asks
/// for.
///
/// `first_block` selects the dot/dotdot classification. With
/// `include_removed`, a live record longer than its name needs has its
/// slack probed at 4-byte steps for a run of records ending exactly where
/// the live record ends; the first alignment that validates is walked and
/// its records reported as [`EntryKind::Deleted`]. A structural error stops
/// the walk with `DirectoryCorrupted`; entries already visited stay visited.
pub fn iterate_block<F>(
    block: &mut [u8],
    block_nr: u32,
    first_block: bool,
    flags: IterFlags,
    mut visit: F,
) -> Result<BlockWalk>
where
    F: FnMut(&DirEntry, &mut [u8]) -> Result<DirAction>,
{
    let block_size = block.len();
    let mut offset = 0_usize;
    let mut next_real_entry = 0_usize;
    let mut kind = if first_block {
        EntryKind::Dot
    } else {
        EntryKind::Other
    };
    let mut walk = BlockWalk::default();

    while offset < block_size {
        let header = checked_header(block, offset).ok_or_else(|| corrupted(block_nr, offset))?;

        if header.inode != 0 || flags.include_empty {
            let entry = DirEntry {
                kind: if next_real_entry > offset {
                    EntryKind::Deleted
                } else {
                    kind
                },
                offset,
                inode: header.inode,
                rec_len: header.rec_len,
                name_len: header.name_len,
                file_type: header.file_type,
                name: entry_name(block, offset, &header)
                    .map_err(|_| corrupted(block_nr, offset))?
                    .to_vec(),
            };
            trace!(block = block_nr, offset, kind = ?entry.kind, inode = entry.inode, "dirent");
            let action = visit(&entry, block)?;
            kind = match kind {
                EntryKind::Dot => EntryKind::DotDot,
                _ => EntryKind::Other,
            };
            walk.changed |= action.changed;
            if action.abort {
                walk.aborted = true;
                break;
            }
        }

        // The visitor may have resized this record.
        let header = checked_header(block, offset).ok_or_else(|| corrupted(block_nr, offset))?;
        if next_real_entry == offset {
            next_real_entry += header.rec_len;
        }

        if flags.include_removed {
            let size = header.min_rec_len();
            if header.rec_len != size {
                let final_offset = offset + header.rec_len;
                offset += size;
                while offset < final_offset && !validate_run(block, offset, final_offset) {
                    offset += 4;
                }
                continue;
            }
        }
        offset += header.rec_len;
    }

    Ok(walk)
}

// ── Block initialisation ────────────────────────────────────────────────────

/// Format `block` as a single empty record.
pub fn init_empty_block(block: &mut [u8]) -> Result<()> {
    block.fill(0);
    let header = DirEntryHeader {
        inode: 0,
        rec_len: block.len(),
        name_len: 0,
        file_type: 0,
    };
    header
        .encode(block, 0)
        .map_err(|err| FfsError::InvalidArgument(err.to_string()))
}

/// Format `block` as the first block of a directory: `.` then `..`.
///
/// `with_file_type` stamps both with the directory type byte.
pub fn init_dir_block(
    block: &mut [u8],
    self_ino: u32,
    parent_ino: u32,
    with_file_type: bool,
) -> Result<()> {
    let dot_len = rec_len_for(1);
    if block.len() < dot_len + rec_len_for(2) {
        return Err(FfsError::InvalidArgument(
            "directory block too small for . and ..".to_owned(),
        ));
    }
    block.fill(0);
    let file_type = if with_file_type {
        FileType::Dir.as_raw()
    } else {
        0
    };
    let dot = DirEntryHeader {
        inode: self_ino,
        rec_len: dot_len,
        name_len: 1,
        file_type,
    };
    let dotdot = DirEntryHeader {
        inode: parent_ino,
        rec_len: block.len() - dot_len,
        name_len: 2,
        file_type,
    };
    write_entry(block, 0, &dot, b".")
        .and_then(|()| write_entry(block, dot_len, &dotdot, b".."))
        .map_err(|err| FfsError::InvalidArgument(err.to_string()))
}

// ── Insertion ───────────────────────────────────────────────────────────────

fn check_name(name: &[u8]) -> Result<u8> {
    if name.is_empty() {
        return Err(FfsError::InvalidArgument("empty directory entry name".to_owned()));
    }
    if name.len() > EXT2_NAME_LEN {
        return Err(FfsError::NameTooLong);
    }
    u8::try_from(name.len()).map_err(|_| FfsError::NameTooLong)
}

fn encode_at(block: &mut [u8], offset: usize, header: &DirEntryHeader, block_nr: u32) -> Result<()> {
    header
        .encode(block, offset)
        .map_err(|_| corrupted(block_nr, offset))
}

/// Visitor state that places one name into the first record with room.
///
/// Feed it every record including empty ones. For each record it first
/// absorbs an unused successor, then either splits a live record whose
/// slack fits the name (leaving an empty record the walk visits next) or
/// claims an unused record that is large enough.
#[derive(Debug)]
pub struct LinkRequest<'a> {
    name: &'a [u8],
    name_len: u8,
    inode: u32,
    file_type: u8,
    block_nr: u32,
    inserted_at: Option<usize>,
}

impl<'a> LinkRequest<'a> {
    /// `file_type` is written only when nonzero; pass 0 when the
    /// filesystem lacks the `filetype` feature.
    pub fn new(name: &'a [u8], inode: u32, file_type: u8) -> Result<Self> {
        let name_len = check_name(name)?;
        if inode == 0 {
            return Err(FfsError::InvalidArgument("cannot link inode 0".to_owned()));
        }
        Ok(Self {
            name,
            name_len,
            inode,
            file_type: file_type & 0x7,
            block_nr: 0,
            inserted_at: None,
        })
    }

    /// Tag corruption reports with `block_nr`.
    pub fn set_block(&mut self, block_nr: u32) {
        self.block_nr = block_nr;
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.inserted_at.is_some()
    }

    /// Offset of the new record within its block.
    #[must_use]
    pub fn inserted_at(&self) -> Option<usize> {
        self.inserted_at
    }

    pub fn visit(&mut self, entry: &DirEntry, block: &mut [u8]) -> Result<DirAction> {
        let block_size = block.len();
        let offset = entry.offset;
        let needed = rec_len_for(self.name.len());
        let mut current = DirEntryHeader::decode(block, offset)
            .map_err(|_| corrupted(self.block_nr, offset))?;
        let mut action = DirAction::CONTINUE;

        // Absorb an unused successor.
        let next_off = offset + current.rec_len;
        if next_off + DIR_ENTRY_HEADER_LEN < block_size {
            let next = DirEntryHeader::decode(block, next_off)
                .map_err(|_| corrupted(self.block_nr, next_off))?;
            if next.inode == 0 && next_off + next.rec_len <= block_size {
                current.rec_len += next.rec_len;
                encode_at(block, offset, &current, self.block_nr)?;
                action = DirAction::CHANGED;
            }
        }

        if current.inode != 0 {
            let min_rec_len = current.min_rec_len();
            if current.rec_len < min_rec_len + needed {
                return Ok(action);
            }
            let tail = DirEntryHeader {
                inode: 0,
                rec_len: current.rec_len - min_rec_len,
                name_len: 0,
                file_type: 0,
            };
            current.rec_len = min_rec_len;
            encode_at(block, offset, &current, self.block_nr)?;
            encode_at(block, offset + min_rec_len, &tail, self.block_nr)?;
            trace!(block = self.block_nr, offset, split_at = offset + min_rec_len, "split live record");
            return Ok(DirAction::CHANGED);
        }

        if current.rec_len < needed {
            return Ok(action);
        }
        let claimed = DirEntryHeader {
            inode: self.inode,
            rec_len: current.rec_len,
            name_len: self.name_len,
            file_type: self.file_type,
        };
        write_entry(block, offset, &claimed, self.name)
            .map_err(|_| corrupted(self.block_nr, offset))?;
        self.inserted_at = Some(offset);
        trace!(block = self.block_nr, offset, inode = self.inode, "claimed record");
        Ok(DirAction::CHANGED | DirAction::ABORT)
    }
}

/// Insert `name -> inode` into a single block.
///
/// Returns the record offset, or `DirectoryFull` when no record has room.
pub fn insert_entry(
    block: &mut [u8],
    block_nr: u32,
    name: &[u8],
    inode: u32,
    file_type: u8,
) -> Result<usize> {
    let mut request = LinkRequest::new(name, inode, file_type)?;
    request.set_block(block_nr);
    iterate_block(block, block_nr, false, IterFlags::INCLUDE_EMPTY, |entry, buf| {
        request.visit(entry, buf)
    })?;
    request.inserted_at().ok_or(FfsError::DirectoryFull)
}

// ── Lookup & removal ────────────────────────────────────────────────────────

/// Live entry named `name` in `block`, if any.
pub fn lookup_in_block(block: &mut [u8], block_nr: u32, name: &[u8]) -> Result<Option<DirEntry>> {
    let mut found = None;
    iterate_block(block, block_nr, false, IterFlags::NONE, |entry, _| {
        if entry.name == name {
            found = Some(entry.clone());
            return Ok(DirAction::ABORT);
        }
        Ok(DirAction::CONTINUE)
    })?;
    Ok(found)
}

/// Visitor state that removes one live entry by name (and optionally by
/// inode).
///
/// The record is folded into its predecessor; the first record of a block
/// has no predecessor and gets its inode zeroed instead.
#[derive(Debug)]
pub struct UnlinkRequest<'a> {
    name: &'a [u8],
    inode: Option<u32>,
    prev: Option<usize>,
    removed: Option<u32>,
}

impl<'a> UnlinkRequest<'a> {
    #[must_use]
    pub fn new(name: &'a [u8], inode: Option<u32>) -> Self {
        Self {
            name,
            inode,
            prev: None,
            removed: None,
        }
    }

    /// Inode number of the removed entry.
    #[must_use]
    pub fn removed(&self) -> Option<u32> {
        self.removed
    }

    pub fn visit(&mut self, entry: &DirEntry, block: &mut [u8]) -> Result<DirAction> {
        let prev = if entry.offset == 0 { None } else { self.prev };
        self.prev = Some(entry.offset);

        if entry.inode == 0 || entry.name != self.name {
            return Ok(DirAction::CONTINUE);
        }
        if self.inode.is_some_and(|ino| ino != entry.inode) {
            return Ok(DirAction::CONTINUE);
        }

        match prev {
            Some(prev_off) => {
                let mut header = DirEntryHeader::decode(block, prev_off)
                    .map_err(|_| corrupted(0, prev_off))?;
                header.rec_len += entry.rec_len;
                encode_at(block, prev_off, &header, 0)?;
            }
            None => {
                let mut header = DirEntryHeader::decode(block, entry.offset)
                    .map_err(|_| corrupted(0, entry.offset))?;
                header.inode = 0;
                encode_at(block, entry.offset, &header, 0)?;
            }
        }
        self.removed = Some(entry.inode);
        Ok(DirAction::CHANGED | DirAction::ABORT)
    }
}

/// Remove the live entry `name` from `block`; returns its inode.
pub fn remove_entry(block: &mut [u8], block_nr: u32, name: &[u8]) -> Result<Option<u32>> {
    let mut request = UnlinkRequest::new(name, None);
    iterate_block(block, block_nr, false, IterFlags::INCLUDE_EMPTY, |entry, buf| {
        request.visit(entry, buf)
    })?;
    Ok(request.removed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn put(block: &mut [u8], offset: usize, inode: u32, rec_len: usize, name: &[u8]) {
        let header = DirEntryHeader {
            inode,
            rec_len,
            name_len: u8::try_from(name.len()).unwrap(),
            file_type: 1,
        };
        write_entry(block, offset, &header, name).unwrap();
    }

    fn live_names(block: &mut [u8]) -> Vec<(Vec<u8>, u32)> {
        let mut out = Vec::new();
        iterate_block(block, 0, false, IterFlags::NONE, |entry, _| {
            out.push((entry.name.clone(), entry.inode));
            Ok(DirAction::CONTINUE)
        })
        .unwrap();
        out
    }

    fn tiles(block: &[u8]) -> bool {
        validate_block(block, 0).is_ok()
    }

    // ── Validation tests ──────────────────────────────────────────────────

    #[test]
    fn validate_rejects_bad_records() {
        let mut block = vec![0_u8; 64];
        init_empty_block(&mut block).unwrap();
        assert!(tiles(&block));

        // rec_len not a multiple of 4.
        block[4] = 62;
        assert!(matches!(
            validate_block(&block, 9),
            Err(FfsError::DirectoryCorrupted { block: 9, offset: 0 })
        ));

        // Name longer than the record.
        put(&mut block, 0, 5, 12, b"abcd");
        put(&mut block, 12, 6, 52, b"x");
        block[12 + 6] = 60;
        assert!(matches!(
            validate_block(&block, 0),
            Err(FfsError::DirectoryCorrupted { offset: 12, .. })
        ));

        // Record running past the block end.
        put(&mut block, 12, 6, 52, b"x");
        block[12 + 4] = 56;
        assert!(validate_block(&block, 0).is_err());
    }

    // ── Iteration tests ───────────────────────────────────────────────────

    #[test]
    fn first_block_reports_dot_and_dotdot() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 12, 2, true).unwrap();
        insert_entry(&mut block, 0, b"file", 13, 1).unwrap();

        let mut kinds = Vec::new();
        iterate_block(&mut block, 0, true, IterFlags::NONE, |entry, _| {
            kinds.push((entry.kind, entry.name_lossy()));
            Ok(DirAction::CONTINUE)
        })
        .unwrap();
        assert_eq!(
            kinds,
            vec![
                (EntryKind::Dot, ".".to_owned()),
                (EntryKind::DotDot, "..".to_owned()),
                (EntryKind::Other, "file".to_owned()),
            ]
        );
    }

    #[test]
    fn empty_records_need_include_empty() {
        let mut block = vec![0_u8; 256];
        init_empty_block(&mut block).unwrap();
        assert!(live_names(&mut block).is_empty());

        let mut seen = 0;
        iterate_block(&mut block, 0, false, IterFlags::INCLUDE_EMPTY, |entry, _| {
            assert_eq!(entry.inode, 0);
            assert_eq!(entry.rec_len, 256);
            seen += 1;
            Ok(DirAction::CONTINUE)
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn deleted_record_in_slack_is_found() {
        let mut block = vec![0_u8; 1024];
        put(&mut block, 0, 2, 12, b".");
        // "a" absorbed its deleted neighbour "b": rec_len is twice its need.
        put(&mut block, 12, 12, 24, b"a");
        put(&mut block, 24, 13, 12, b"b");
        put(&mut block, 36, 14, 988, b"c");

        let mut deleted = Vec::new();
        let mut live = Vec::new();
        iterate_block(&mut block, 0, true, IterFlags::INCLUDE_REMOVED, |entry, _| {
            if entry.kind == EntryKind::Deleted {
                deleted.push((entry.offset, entry.name.clone(), entry.rec_len));
            } else {
                live.push(entry.name.clone());
            }
            Ok(DirAction::CONTINUE)
        })
        .unwrap();

        assert_eq!(deleted, vec![(24, b"b".to_vec(), 12)]);
        assert_eq!(live, vec![b".".to_vec(), b"a".to_vec(), b"c".to_vec()]);
        // Without the flag the deleted record stays hidden.
        assert_eq!(live_names(&mut block).len(), 3);
    }

    #[test]
    fn unaligned_slack_is_skipped_as_one_span() {
        let mut block = vec![0_u8; 64];
        put(&mut block, 0, 12, 64, b"a");
        // Garbage in the slack: no alignment forms a run ending at 64.
        for byte in &mut block[12..64] {
            *byte = 0xFF;
        }
        let mut count = 0;
        iterate_block(&mut block, 0, false, IterFlags::INCLUDE_REMOVED, |_, _| {
            count += 1;
            Ok(DirAction::CONTINUE)
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn abort_stops_the_walk() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 12, 2, false).unwrap();
        let mut visits = 0;
        let walk = iterate_block(&mut block, 0, true, IterFlags::NONE, |_, _| {
            visits += 1;
            Ok(DirAction::ABORT)
        })
        .unwrap();
        assert_eq!(visits, 1);
        assert!(walk.aborted);
        assert!(!walk.changed);
    }

    #[test]
    fn corruption_mid_walk_is_reported() {
        let mut block = vec![0_u8; 64];
        put(&mut block, 0, 5, 12, b"ok");
        put(&mut block, 12, 6, 52, b"x");
        block[12 + 4] = 3;
        let mut visited = 0;
        let err = iterate_block(&mut block, 7, false, IterFlags::NONE, |_, _| {
            visited += 1;
            Ok(DirAction::CONTINUE)
        })
        .unwrap_err();
        assert_eq!(visited, 1);
        assert_eq!(err.to_errno(), libc::EIO);
    }

    // ── Insertion tests ───────────────────────────────────────────────────

    #[test]
    fn insert_splits_live_slack() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 2, 2, true).unwrap();
        let off = insert_entry(&mut block, 0, b"hello", 33, 1).unwrap();
        assert_eq!(off, 24);
        assert_eq!(
            live_names(&mut block),
            vec![(b".".to_vec(), 2), (b"..".to_vec(), 2), (b"hello".to_vec(), 33)]
        );
        assert!(tiles(&block));
    }

    #[test]
    fn exact_fit_then_full() {
        // Three 12-byte records: ".", "..", and one free slot.
        let mut block = vec![0_u8; 36];
        put(&mut block, 0, 2, 12, b".");
        put(&mut block, 12, 2, 12, b"..");
        put(&mut block, 24, 0, 12, b"");

        let off = insert_entry(&mut block, 0, b"ab", 20, 1).unwrap();
        assert_eq!(off, 24);
        assert!(tiles(&block));

        let header = DirEntryHeader::decode(&block, 24).unwrap();
        assert_eq!(header.rec_len, header.min_rec_len());

        let err = insert_entry(&mut block, 0, b"cd", 21, 1).unwrap_err();
        assert!(matches!(err, FfsError::DirectoryFull));
    }

    #[test]
    fn insert_merges_adjacent_empty_records() {
        let mut block = vec![0_u8; 48];
        put(&mut block, 0, 0, 16, b"");
        put(&mut block, 16, 0, 32, b"");
        // The first free record absorbs the second and is claimed whole.
        let off = insert_entry(&mut block, 0, b"sixteen-chars-xx", 9, 1).unwrap();
        assert_eq!(off, 0);
        let header = DirEntryHeader::decode(&block, 0).unwrap();
        assert_eq!(header.rec_len, 48);
    }

    #[test]
    fn delete_then_reinsert_reuses_space() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 2, 2, true).unwrap();
        insert_entry(&mut block, 0, b"alpha", 40, 1).unwrap();
        insert_entry(&mut block, 0, b"beta", 41, 1).unwrap();
        let before = block.clone();

        assert_eq!(remove_entry(&mut block, 0, b"alpha").unwrap(), Some(40));
        assert!(!live_names(&mut block).iter().any(|(n, _)| n == b"alpha"));

        let off = insert_entry(&mut block, 0, b"gamma", 42, 1).unwrap();
        assert_eq!(off, 24);
        // "beta" did not move.
        assert_eq!(block[40..52], before[40..52]);
        assert!(tiles(&block));
        let found = lookup_in_block(&mut block, 0, b"gamma").unwrap().unwrap();
        assert_eq!(found.inode, 42);
        assert_eq!(found.file_type(), FileType::RegFile);
    }

    #[test]
    fn remove_first_record_zeroes_inode() {
        let mut block = vec![0_u8; 128];
        put(&mut block, 0, 10, 128, b"a");
        assert_eq!(remove_entry(&mut block, 0, b"a").unwrap(), Some(10));
        assert_eq!(DirEntryHeader::decode(&block, 0).unwrap().inode, 0);
        assert_eq!(remove_entry(&mut block, 0, b"a").unwrap(), None);
    }

    #[test]
    fn bad_names_are_rejected() {
        let mut block = vec![0_u8; 1024];
        init_empty_block(&mut block).unwrap();
        assert!(matches!(
            insert_entry(&mut block, 0, b"", 5, 0),
            Err(FfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            insert_entry(&mut block, 0, &[b'x'; 256], 5, 0),
            Err(FfsError::NameTooLong)
        ));
        assert!(matches!(
            insert_entry(&mut block, 0, b"zero", 0, 0),
            Err(FfsError::InvalidArgument(_))
        ));
        assert!(insert_entry(&mut block, 0, &[b'x'; 255], 5, 0).is_ok());
    }

    #[test]
    fn init_dir_block_too_small() {
        let mut block = vec![0_u8; 16];
        assert!(init_dir_block(&mut block, 1, 2, true).is_err());
    }

    proptest! {
        #[test]
        fn inserts_preserve_tiling(names in proptest::collection::vec("[a-z]{1,40}", 1..60)) {
            let mut block = vec![0_u8; 1024];
            init_dir_block(&mut block, 2, 2, true).unwrap();
            let mut inserted = Vec::new();
            for (i, name) in names.iter().enumerate() {
                let ino = 100 + u32::try_from(i).unwrap();
                if lookup_in_block(&mut block, 0, name.as_bytes()).unwrap().is_some() {
                    continue;
                }
                match insert_entry(&mut block, 0, name.as_bytes(), ino, 1) {
                    Ok(_) => inserted.push((name.clone(), ino)),
                    Err(FfsError::DirectoryFull) => break,
                    Err(other) => panic!("unexpected {other:?}"),
                }
                prop_assert!(tiles(&block));
            }
            for (name, ino) in inserted {
                let found = lookup_in_block(&mut block, 0, name.as_bytes()).unwrap();
                prop_assert_eq!(found.map(|e| e.inode), Some(ino));
            }
        }
    }
}
