//! Directory record header decode/encode.
//!
//! A record is `{inode: u32, rec_len: u16, name_len: u8, file_type: u8,
//! name}`. Without the `filetype` feature the type byte is the high half of
//! a 16-bit name length; this library never writes names longer than 255,
//! so it always treats the high byte as the type.

use ffs_types::{ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK};
use ffs_types::{ensure_slice, read_le_u16, read_le_u32, write_bytes, write_le_u16, write_le_u32};
use serde::{Deserialize, Serialize};

/// Size of the fixed record header.
pub const DIR_ENTRY_HEADER_LEN: usize = 8;

/// Records are 4-byte aligned.
pub const DIR_ROUND: usize = 4;

/// File type byte stored in directory records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_raw(self) -> u8 {
        self as u8
    }
}

/// Minimal record length for a name of `name_len` bytes.
#[must_use]
pub fn rec_len_for(name_len: usize) -> usize {
    (name_len + DIR_ENTRY_HEADER_LEN + DIR_ROUND - 1) & !(DIR_ROUND - 1)
}

/// Decode an on-disk `rec_len`.
///
/// 64K blocks cannot express a block-spanning record in 16 bits; such a
/// record is stored as 0 or 65535 and the low two bits carry bits 16..17.
#[must_use]
pub fn rec_len_from_disk(raw: u16, block_size: usize) -> usize {
    let len = usize::from(raw);
    if block_size < 65536 {
        return len;
    }
    if raw == u16::MAX || raw == 0 {
        return block_size;
    }
    (len & 0xFFFC) | ((len & 0x3) << 16)
}

/// Encode a `rec_len` for the disk.
pub fn rec_len_to_disk(len: usize, block_size: usize) -> Result<u16, ParseError> {
    if len > block_size || len % DIR_ROUND != 0 {
        return Err(ParseError::InvalidField {
            field: "rec_len",
            reason: "must be 4-byte aligned and within the block",
        });
    }
    if len < 65536 {
        return u16::try_from(len).map_err(|_| ParseError::IntegerConversion { field: "rec_len" });
    }
    if len == block_size {
        return Ok(u16::MAX);
    }
    let low = u16::try_from(len & 0xFFFC).map_err(|_| ParseError::IntegerConversion { field: "rec_len" })?;
    let high = u16::try_from((len >> 16) & 0x3).map_err(|_| ParseError::IntegerConversion { field: "rec_len" })?;
    Ok(low | high)
}

/// Fixed header of one directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryHeader {
    pub inode: u32,
    pub rec_len: usize,
    pub name_len: u8,
    pub file_type: u8,
}

impl DirEntryHeader {
    /// Decode the header at `offset`. Performs no structural validation.
    pub fn decode(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        let inode = read_le_u32(block, offset)?;
        let raw_rec_len = read_le_u16(block, offset + 4)?;
        let name_word = read_le_u16(block, offset + 6)?;
        let [name_len, file_type] = name_word.to_le_bytes();
        Ok(Self {
            inode,
            rec_len: rec_len_from_disk(raw_rec_len, block.len()),
            name_len,
            file_type,
        })
    }

    pub fn encode(&self, block: &mut [u8], offset: usize) -> Result<(), ParseError> {
        let raw_rec_len = rec_len_to_disk(self.rec_len, block.len())?;
        write_le_u32(block, offset, self.inode)?;
        write_le_u16(block, offset + 4, raw_rec_len)?;
        write_le_u16(block, offset + 6, u16::from_le_bytes([self.name_len, self.file_type]))?;
        Ok(())
    }

    /// Bytes this record's name actually needs.
    #[must_use]
    pub fn min_rec_len(&self) -> usize {
        rec_len_for(usize::from(self.name_len))
    }
}

/// Name bytes of the record at `offset`.
pub fn entry_name<'a>(
    block: &'a [u8],
    offset: usize,
    header: &DirEntryHeader,
) -> Result<&'a [u8], ParseError> {
    ensure_slice(block, offset + DIR_ENTRY_HEADER_LEN, usize::from(header.name_len))
}

/// Write a full record (header plus name) at `offset`.
pub fn write_entry(
    block: &mut [u8],
    offset: usize,
    header: &DirEntryHeader,
    name: &[u8],
) -> Result<(), ParseError> {
    if name.len() != usize::from(header.name_len) {
        return Err(ParseError::InvalidField {
            field: "name_len",
            reason: "does not match name",
        });
    }
    header.encode(block, offset)?;
    write_bytes(block, offset + DIR_ENTRY_HEADER_LEN, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rec_len_for_rounds_to_four() {
        assert_eq!(rec_len_for(0), 8);
        assert_eq!(rec_len_for(1), 12);
        assert_eq!(rec_len_for(2), 12);
        assert_eq!(rec_len_for(4), 12);
        assert_eq!(rec_len_for(5), 16);
        assert_eq!(rec_len_for(255), 264);
    }

    #[test]
    fn header_decode_splits_name_word() {
        let mut block = vec![0_u8; 1024];
        block[0..4].copy_from_slice(&11_u32.to_le_bytes());
        block[4..6].copy_from_slice(&1024_u16.to_le_bytes());
        block[6] = 10;
        block[7] = 2;
        let header = DirEntryHeader::decode(&block, 0).unwrap();
        assert_eq!(header.inode, 11);
        assert_eq!(header.rec_len, 1024);
        assert_eq!(header.name_len, 10);
        assert_eq!(FileType::from_raw(header.file_type), FileType::Dir);
    }

    #[test]
    fn big_block_rec_len_encoding() {
        assert_eq!(rec_len_from_disk(u16::MAX, 65536), 65536);
        assert_eq!(rec_len_from_disk(0, 65536), 65536);
        assert_eq!(rec_len_from_disk(12, 65536), 12);
        assert_eq!(rec_len_to_disk(65536, 65536).unwrap(), u16::MAX);
        assert_eq!(rec_len_to_disk(4096, 4096).unwrap(), 4096);
        assert!(rec_len_to_disk(4097, 8192).is_err());
        assert!(rec_len_to_disk(8192, 4096).is_err());
    }

    #[test]
    fn write_entry_checks_name_length() {
        let mut block = vec![0_u8; 64];
        let header = DirEntryHeader {
            inode: 12,
            rec_len: 64,
            name_len: 2,
            file_type: FileType::RegFile.as_raw(),
        };
        write_entry(&mut block, 0, &header, b"ab").unwrap();
        assert_eq!(entry_name(&block, 0, &header).unwrap(), b"ab");
        assert!(write_entry(&mut block, 0, &header, b"abc").is_err());
    }

    #[test]
    fn file_type_from_mode() {
        assert_eq!(FileType::from_mode(S_IFDIR | 0o755), FileType::Dir);
        assert_eq!(FileType::from_mode(S_IFREG | 0o644), FileType::RegFile);
        assert_eq!(FileType::from_mode(0), FileType::Unknown);
    }
}
