#![forbid(unsafe_code)]
//! Shared newtypes, on-disk constants and little-endian byte helpers.
//!
//! ext2 stores every multi-byte field little-endian and sizes block and
//! inode numbers at 32 bits, so the canonical numeric types here are `u32`
//! wrappers. Decoding goes through [`read_le_u16`]/[`read_le_u32`] and
//! encoding through [`write_le_u16`]/[`write_le_u32`]; nothing reinterprets
//! a byte buffer in place.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const EXT2_SUPERBLOCK_OFFSET: usize = 1024;
pub const EXT2_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

pub const EXT2_MIN_BLOCK_LOG_SIZE: u32 = 10;
pub const EXT2_MAX_BLOCK_LOG_SIZE: u32 = 16;
pub const EXT2_MIN_BLOCK_SIZE: u32 = 1 << EXT2_MIN_BLOCK_LOG_SIZE;
pub const EXT2_MAX_BLOCK_SIZE: u32 = 1 << EXT2_MAX_BLOCK_LOG_SIZE;

/// Largest blocks-per-group a 16-bit free count can describe, rounded to 8.
pub const EXT2_MAX_BLOCKS_PER_GROUP: u32 = (1 << 16) - 8;
/// Floor for the initializer's shrink-by-8 retry.
pub const EXT2_MIN_BLOCKS_PER_GROUP: u32 = 256;
pub const EXT2_MAX_INODES_PER_GROUP: u32 = 1 << 16;

pub const EXT2_GROUP_DESC_SIZE: u32 = 32;

pub const EXT2_GOOD_OLD_REV: u32 = 0;
pub const EXT2_DYNAMIC_REV: u32 = 1;
pub const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;
pub const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;

pub const EXT2_DFL_MAX_MNT_COUNT: u16 = 20;
pub const EXT2_DFL_CHECKINTERVAL: u32 = 86_400 * 180;

// ── Superblock state / error policy / creator OS ────────────────────────────

pub const EXT2_VALID_FS: u16 = 0x0001;
pub const EXT2_ERROR_FS: u16 = 0x0002;

pub const EXT2_ERRORS_CONTINUE: u16 = 1;
pub const EXT2_ERRORS_RO: u16 = 2;
pub const EXT2_ERRORS_PANIC: u16 = 3;
pub const EXT2_ERRORS_DEFAULT: u16 = EXT2_ERRORS_CONTINUE;

pub const EXT2_OS_LINUX: u32 = 0;
pub const EXT2_OS_HURD: u32 = 1;
pub const EXT2_OS_MASIX: u32 = 2;
pub const EXT2_OS_FREEBSD: u32 = 3;
pub const EXT2_OS_LITES: u32 = 4;

pub const EXT2_HASH_LEGACY: u8 = 0;
pub const EXT2_HASH_HALF_MD4: u8 = 1;
pub const EXT2_HASH_TEA: u8 = 2;

// ── Group descriptor flags ──────────────────────────────────────────────────

/// Inode table and bitmap are not initialized.
pub const EXT2_BG_INODE_UNINIT: u16 = 0x0001;
/// Block bitmap is not initialized.
pub const EXT2_BG_BLOCK_UNINIT: u16 = 0x0002;

// ── Reserved inode numbers ──────────────────────────────────────────────────

pub const EXT2_BAD_INO: u32 = 1;
pub const EXT2_ROOT_INO: u32 = 2;
pub const EXT2_RESIZE_INO: u32 = 7;
pub const EXT2_JOURNAL_INO: u32 = 8;

// ── Inode block map ─────────────────────────────────────────────────────────

pub const EXT2_NDIR_BLOCKS: usize = 12;
pub const EXT2_IND_BLOCK: usize = EXT2_NDIR_BLOCKS;
pub const EXT2_DIND_BLOCK: usize = EXT2_IND_BLOCK + 1;
pub const EXT2_TIND_BLOCK: usize = EXT2_DIND_BLOCK + 1;
pub const EXT2_N_BLOCKS: usize = EXT2_TIND_BLOCK + 1;

/// Hash-indexed directory.
pub const EXT2_INDEX_FL: u32 = 0x0000_1000;

pub const EXT2_NAME_LEN: usize = 255;

// ── POSIX file mode constants ───────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
pub const S_IFIFO: u16 = 0o010_000;
pub const S_IFCHR: u16 = 0o020_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFBLK: u16 = 0o060_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFLNK: u16 = 0o120_000;
pub const S_IFSOCK: u16 = 0o140_000;

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Absolute block number on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

/// 1-indexed inode number. 0 never names an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

/// Block group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Validated block size (must be a power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1024, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(EXT2_MIN_BLOCK_SIZE..=EXT2_MAX_BLOCK_SIZE).contains(&value)
        {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    /// Build from the superblock's `s_log_block_size`.
    pub fn from_log(log_block_size: u32) -> Result<Self, ParseError> {
        let bytes = block_size_from_log(log_block_size).ok_or(ParseError::InvalidField {
            field: "log_block_size",
            reason: "shift overflow",
        })?;
        Self::new(bytes)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// `s_log_block_size` encoding of this size.
    #[must_use]
    pub fn log(self) -> u32 {
        self.0.trailing_zeros() - EXT2_MIN_BLOCK_LOG_SIZE
    }

    /// Number of 32-byte group descriptors per block.
    #[must_use]
    pub fn descs_per_block(self) -> u32 {
        self.0 / EXT2_GROUP_DESC_SIZE
    }

    /// Number of 32-bit block pointers per block.
    #[must_use]
    pub fn addr_per_block(self) -> u32 {
        self.0 / 4
    }

    /// Byte offset of a block, widened so it never overflows.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> u64 {
        u64::from(block.0) * u64::from(self.0)
    }
}

impl BlockNumber {
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    #[must_use]
    pub fn checked_sub(self, count: u32) -> Option<Self> {
        self.0.checked_sub(count).map(Self)
    }
}

impl InodeNumber {
    pub const BAD: Self = Self(EXT2_BAD_INO);
    pub const ROOT: Self = Self(EXT2_ROOT_INO);
    pub const RESIZE: Self = Self(EXT2_RESIZE_INO);
    pub const JOURNAL: Self = Self(EXT2_JOURNAL_INO);
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Byte helpers ────────────────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let available = data.len();
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > available {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: available.saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, value: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, value.len())?.copy_from_slice(value);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Copy `text` into a NUL-padded fixed field, truncating if it does not fit.
#[must_use]
pub fn nul_padded<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [0_u8; N];
    let len = text.len().min(N);
    out[..len].copy_from_slice(&text.as_bytes()[..len]);
    out
}

#[must_use]
pub fn block_size_from_log(log_block_size: u32) -> Option<u32> {
    let shift = EXT2_MIN_BLOCK_LOG_SIZE.checked_add(log_block_size)?;
    1_u32.checked_shl(shift)
}

// ── Group arithmetic ────────────────────────────────────────────────────────

/// Block group that contains `block`.
///
/// `first_data_block` is 1 for 1K blocks and 0 otherwise.
#[must_use]
pub fn block_to_group(block: BlockNumber, blocks_per_group: u32, first_data_block: u32) -> GroupNumber {
    GroupNumber(block.0.saturating_sub(first_data_block) / blocks_per_group)
}

/// First block of `group`, or `None` if it would not fit in 32 bits.
#[must_use]
pub fn group_first_block(
    group: GroupNumber,
    blocks_per_group: u32,
    first_data_block: u32,
) -> Option<BlockNumber> {
    group
        .0
        .checked_mul(blocks_per_group)?
        .checked_add(first_data_block)
        .map(BlockNumber)
}

/// Inode numbers are 1-indexed; group assignment uses `(ino - 1) / inodes_per_group`.
#[must_use]
pub fn inode_to_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    GroupNumber(ino.0.saturating_sub(1) / inodes_per_group)
}

#[must_use]
pub fn inode_index_in_group(ino: InodeNumber, inodes_per_group: u32) -> u32 {
    ino.0.saturating_sub(1) % inodes_per_group
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert!(matches!(
            read_le_u32(&bytes, 6),
            Err(ParseError::InsufficientData { needed: 4, offset: 6, actual: 2 })
        ));
    }

    #[test]
    fn test_write_helpers() {
        let mut bytes = [0_u8; 8];
        write_le_u16(&mut bytes, 0, 0xEF53).expect("u16");
        write_le_u32(&mut bytes, 4, 0x0102_0304).expect("u32");
        assert_eq!(bytes, [0x53, 0xEF, 0, 0, 0x04, 0x03, 0x02, 0x01]);
        assert!(write_le_u32(&mut bytes, 6, 1).is_err());
        assert!(write_bytes(&mut bytes, usize::MAX, b"x").is_err());
    }

    #[test]
    fn test_trim_nul_padded() {
        let raw = b"ffs\0\0\0\0";
        assert_eq!(trim_nul_padded(raw), "ffs");
        let padded: [u8; 4] = nul_padded("lost+found");
        assert_eq!(&padded, b"lost");
        let short: [u8; 6] = nul_padded("ab");
        assert_eq!(&short, b"ab\0\0\0\0");
    }

    #[test]
    fn test_block_size_from_log() {
        assert_eq!(block_size_from_log(0), Some(1024));
        assert_eq!(block_size_from_log(1), Some(2048));
        assert_eq!(block_size_from_log(2), Some(4096));
        assert_eq!(block_size_from_log(40), None);
        assert_eq!(BlockSize::from_log(2).unwrap().get(), 4096);
        assert!(BlockSize::from_log(7).is_err());
    }

    #[test]
    fn test_block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(1024).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert_eq!(BlockSize::new(4096).unwrap().log(), 2);

        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(512).is_err());
        assert!(BlockSize::new(131_072).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn test_block_size_derived_counts() {
        let bs = BlockSize::new(1024).unwrap();
        assert_eq!(bs.descs_per_block(), 32);
        assert_eq!(bs.addr_per_block(), 256);
        assert_eq!(bs.block_to_byte(BlockNumber(3)), 3072);
        let big = BlockSize::new(65536).unwrap();
        assert_eq!(big.block_to_byte(BlockNumber(u32::MAX)), u64::from(u32::MAX) * 65536);
    }

    #[test]
    fn test_inode_group_math() {
        assert_eq!(inode_to_group(InodeNumber(1), 2048), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(2048), 2048), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(2049), 2048), GroupNumber(1));

        assert_eq!(inode_index_in_group(InodeNumber(1), 2048), 0);
        assert_eq!(inode_index_in_group(InodeNumber(2), 2048), 1);
        assert_eq!(inode_index_in_group(InodeNumber(2049), 2048), 0);
    }

    #[test]
    fn test_block_group_math() {
        assert_eq!(block_to_group(BlockNumber(0), 32768, 0), GroupNumber(0));
        assert_eq!(block_to_group(BlockNumber(32768), 32768, 0), GroupNumber(1));
        assert_eq!(block_to_group(BlockNumber(1), 8192, 1), GroupNumber(0));
        assert_eq!(block_to_group(BlockNumber(8193), 8192, 1), GroupNumber(1));

        assert_eq!(
            group_first_block(GroupNumber(1), 8192, 1),
            Some(BlockNumber(8193))
        );
        assert_eq!(group_first_block(GroupNumber(u32::MAX), 8192, 1), None);
    }

    #[test]
    fn test_block_number_checked_ops() {
        assert_eq!(BlockNumber(10).checked_add(5), Some(BlockNumber(15)));
        assert_eq!(BlockNumber(u32::MAX).checked_add(1), None);
        assert_eq!(BlockNumber(0).checked_sub(1), None);
    }

    #[test]
    fn test_inode_constants() {
        assert_eq!(InodeNumber::ROOT, InodeNumber(2));
        assert_eq!(InodeNumber::BAD, InodeNumber(1));
        assert_eq!(InodeNumber::RESIZE.0, 7);
    }

    proptest::proptest! {
        #[test]
        fn block_lies_inside_its_group(
            block in 1_u32..2_000_000,
            bpg_eighths in 32_u32..=8192,
            first_data_block in 0_u32..=1,
        ) {
            let bpg = bpg_eighths * 8;
            let group = block_to_group(BlockNumber(block), bpg, first_data_block);
            let start = group_first_block(group, bpg, first_data_block).unwrap();
            proptest::prop_assert!(start.0 <= block);
            proptest::prop_assert!(block - start.0 < bpg);
        }
    }
}
