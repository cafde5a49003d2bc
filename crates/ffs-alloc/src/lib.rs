#![forbid(unsafe_code)]
//! Block and inode bitmaps, group layout placement, and group table
//! allocation.
//!
//! ## Design
//!
//! The crate is layered:
//!
//! 1. **Bit helpers**: raw bit manipulation on bitmap byte slices.
//! 2. **Bitmap**: an owned, bounds-checked presence set over a numeric
//!    domain `[start, end]`, padded out to `real_end` so each group's slice
//!    is a whole number of bytes.
//! 3. **Layout** ([`layout`]): pure placement math: which groups carry a
//!    superblock backup, where descriptor tables sit, how many blocks each
//!    group has left for data.
//! 4. **Group tables** ([`tables`]): assigns concrete blocks to each
//!    group's bitmaps and inode table by scanning the block bitmap.

pub mod layout;
pub mod tables;

pub use layout::{FsLayout, GroupLocation, group_has_full_backup, reserve_super_and_bgd};
pub use tables::{allocate_group_table, allocate_tables};

use ffs_error::{FfsError, Result};
use tracing::warn;

// ── Bit helpers ─────────────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

// ── Bitmap ──────────────────────────────────────────────────────────────────

/// Owned bitmap over the unit numbers `[start, end]`.
///
/// Storage covers `[start, real_end]`; the bits past `end` exist only so
/// the last group's slice is full-sized. Accesses outside `[start, end]`
/// are logged and ignored (tests read as clear).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    description: &'static str,
    start: u32,
    end: u32,
    real_end: u32,
    bits: Vec<u8>,
}

impl Bitmap {
    pub fn new(description: &'static str, start: u32, end: u32, real_end: u32) -> Result<Self> {
        if end < start || real_end < end {
            return Err(FfsError::InvalidArgument(format!(
                "{description}: bad bitmap range start={start} end={end} real_end={real_end}"
            )));
        }
        let nbits = u64::from(real_end - start) + 1;
        let nbytes = usize::try_from(nbits.div_ceil(8))
            .map_err(|_| FfsError::InvalidArgument(format!("{description}: bitmap too large")))?;
        Ok(Self {
            description,
            start,
            end,
            real_end,
            bits: vec![0_u8; nbytes],
        })
    }

    #[must_use]
    pub fn start(&self) -> u32 {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> u32 {
        self.end
    }

    #[must_use]
    pub fn real_end(&self) -> u32 {
        self.real_end
    }

    fn index(&self, n: u32) -> Option<u32> {
        (self.start..=self.end).contains(&n).then(|| n - self.start)
    }

    /// Mark `n` in use.
    pub fn mark(&mut self, n: u32) {
        match self.index(n) {
            Some(idx) => bitmap_set(&mut self.bits, idx),
            None => warn!(bitmap = self.description, n, "mark out of range"),
        }
    }

    /// Mark `n` free.
    pub fn unmark(&mut self, n: u32) {
        match self.index(n) {
            Some(idx) => bitmap_clear(&mut self.bits, idx),
            None => warn!(bitmap = self.description, n, "unmark out of range"),
        }
    }

    #[must_use]
    pub fn test(&self, n: u32) -> bool {
        match self.index(n) {
            Some(idx) => bitmap_get(&self.bits, idx),
            None => {
                warn!(bitmap = self.description, n, "test out of range");
                false
            }
        }
    }

    pub fn mark_range(&mut self, first: u32, len: u32) {
        for n in (0..len).filter_map(|i| first.checked_add(i)) {
            self.mark(n);
        }
    }

    pub fn unmark_range(&mut self, first: u32, len: u32) {
        for n in (0..len).filter_map(|i| first.checked_add(i)) {
            self.unmark(n);
        }
    }

    /// True when every unit of `[first, first + len)` lies in range and is free.
    #[must_use]
    pub fn is_range_clear(&self, first: u32, len: u32) -> bool {
        if len == 0 || first < self.start {
            return false;
        }
        let last = u64::from(first) + u64::from(len) - 1;
        if last > u64::from(self.end) {
            return false;
        }
        (first..first + len).all(|n| !bitmap_get(&self.bits, n - self.start))
    }

    /// First free unit in `[from, to]`.
    #[must_use]
    pub fn find_first_zero(&self, from: u32, to: u32) -> Option<u32> {
        let from = from.max(self.start);
        let to = to.min(self.end);
        (from..=to).find(|&n| !bitmap_get(&self.bits, n - self.start))
    }

    /// First free unit at or after `goal`, wrapping to `wrap_to` past `end`.
    #[must_use]
    pub fn find_zero_wrapping(&self, goal: u32, wrap_to: u32) -> Option<u32> {
        if goal > self.end || goal < self.start {
            return self.find_first_zero(wrap_to, self.end);
        }
        self.find_first_zero(goal, self.end)
            .or_else(|| self.find_first_zero(wrap_to, goal.saturating_sub(1)))
    }

    /// Find `num` consecutive free units.
    ///
    /// Scans upward from `start` (the domain start if 0), wrapping to the
    /// domain start when the run would pass `end`, and gives up on reaching
    /// `finish` (which defaults to `start`). A `start == finish` scan covers
    /// the whole domain once.
    #[must_use]
    pub fn find_free_run(&self, start: u32, finish: u32, num: u32) -> Option<u32> {
        let num = num.max(1);
        let mut b = if start == 0 { self.start } else { start };
        let finish = if finish == 0 { b } else { finish };
        let span = u64::from(self.end - self.start) + 2;

        for _ in 0..span {
            if u64::from(b) + u64::from(num) - 1 > u64::from(self.end) || b < self.start {
                b = self.start;
            }
            if self.is_range_clear(b, num) {
                return Some(b);
            }
            b += 1;
            if b == finish {
                return None;
            }
        }
        None
    }

    /// Free units in `[from, to]`.
    #[must_use]
    pub fn count_zeros(&self, from: u32, to: u32) -> u32 {
        let from = from.max(self.start);
        let to = to.min(self.end);
        if from > to {
            return 0;
        }
        let used = (from..=to)
            .filter(|&n| bitmap_get(&self.bits, n - self.start))
            .count();
        to - from + 1 - u32::try_from(used).unwrap_or(u32::MAX)
    }

    /// Mark every storage bit past `end` in use.
    pub fn set_padding(&mut self) {
        for idx in (self.end - self.start + 1)..=(self.real_end - self.start) {
            bitmap_set(&mut self.bits, idx);
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// `len` bytes of storage starting at byte `offset`, clipped to storage.
    #[must_use]
    pub fn byte_slice(&self, offset: usize, len: usize) -> &[u8] {
        let start = offset.min(self.bits.len());
        let end = offset.saturating_add(len).min(self.bits.len());
        &self.bits[start..end]
    }

    /// Overwrite storage bytes starting at byte `offset`, clipped to storage.
    pub fn copy_in_bytes(&mut self, offset: usize, data: &[u8]) {
        let start = offset.min(self.bits.len());
        let end = offset.saturating_add(data.len()).min(self.bits.len());
        self.bits[start..end].copy_from_slice(&data[..end - start]);
    }
}
