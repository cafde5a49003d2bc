#![forbid(unsafe_code)]
//! Block I/O channel.
//!
//! Provides the `ByteDevice` trait (pread/pwrite style storage), the
//! `BlockDevice` trait the filesystem layer talks to, and an adapter between
//! them. All I/O is synchronous and blocking; a stuck device stalls the
//! caller.

use ffs_error::{FfsError, Result};
use ffs_types::BlockNumber;
use parking_lot::Mutex;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

fn checked_end(offset: u64, len: usize, what: &str) -> Result<u64> {
    let len = u64::try_from(len)
        .map_err(|_| FfsError::Format(format!("{what} length overflows u64")))?;
    offset
        .checked_add(len)
        .ok_or_else(|| FfsError::Format(format!("{what} range overflows u64")))
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only if the file is not writable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, writable)
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, false)
    }

    /// Create (or truncate) an image file of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Self::from_file(file, true)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len(), "read")?;
        if end > self.len {
            return Err(FfsError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FfsError::ReadOnly);
        }
        let end = checked_end(offset, buf.len(), "write")?;
        if end > self.len {
            return Err(FfsError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device. Clones share the same storage, so a test can keep
/// one handle to inspect what a filesystem wrote through another.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Overwrite bytes directly, bypassing any filesystem handle.
    pub fn poke(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        let end = (offset + data.len()).min(bytes.len());
        if offset < end {
            bytes[offset..end].copy_from_slice(&data[..end - offset]);
        }
    }

    fn range(&self, offset: u64, len: usize) -> Result<(usize, usize)> {
        let start =
            usize::try_from(offset).map_err(|_| FfsError::Format("offset overflow".into()))?;
        let end = start
            .checked_add(len)
            .ok_or_else(|| FfsError::Format("range overflow".into()))?;
        if end > self.bytes.lock().len() {
            return Err(FfsError::Format(format!(
                "memory device out of bounds: offset={offset} len={len}"
            )));
        }
        Ok((start, end))
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (start, end) = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes.lock()[start..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let (start, end) = self.range(offset, buf.len())?;
        self.bytes.lock()[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Block-addressed I/O channel.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Change the block size used for addressing.
    fn set_block_size(&mut self, block_size: u32) -> Result<()>;

    /// Total number of whole blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Byte-granular write. Channels without one return `Unsupported`.
    fn write_byte(&self, offset: u64, data: &[u8]) -> Result<()> {
        let _ = (offset, data);
        Err(FfsError::Unsupported("byte-granular write".to_owned()))
    }

    /// Read `count` consecutive blocks into one buffer.
    fn read_blocks(&self, start: BlockNumber, count: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(count as usize * self.block_size() as usize);
        for i in 0..count {
            let block = start
                .checked_add(i)
                .ok_or_else(|| FfsError::Format("block number overflow".to_owned()))?;
            out.extend_from_slice(self.read_block(block)?.as_slice());
        }
        Ok(out)
    }

    /// Write `data` (a whole number of blocks) starting at `start`.
    fn write_blocks(&self, start: BlockNumber, data: &[u8]) -> Result<()> {
        let bs = self.block_size() as usize;
        if data.len() % bs != 0 {
            return Err(FfsError::Format(format!(
                "write_blocks length {} is not a multiple of block size {bs}",
                data.len()
            )));
        }
        for (i, chunk) in data.chunks(bs).enumerate() {
            let i = u32::try_from(i).map_err(|_| FfsError::Format("block index overflow".to_owned()))?;
            let block = start
                .checked_add(i)
                .ok_or_else(|| FfsError::Format("block number overflow".to_owned()))?;
            self.write_block(block, chunk)?;
        }
        Ok(())
    }
}

/// Adapter from a `ByteDevice` to a `BlockDevice`.
///
/// A trailing partial block is not addressable.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
    byte_writes: bool,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        let mut dev = Self {
            inner,
            block_size: 0,
            block_count: 0,
            byte_writes: true,
        };
        dev.set_block_size(block_size)?;
        Ok(dev)
    }

    /// Disable the byte-granular write primitive.
    #[must_use]
    pub fn without_byte_writes(mut self) -> Self {
        self.byte_writes = false;
        self
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn block_offset(&self, block: BlockNumber) -> Result<u64> {
        if u64::from(block.0) >= self.block_count {
            return Err(FfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        Ok(u64::from(block.0) * u64::from(self.block_size))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.block_offset(block)?;
        let mut buf = vec![0_u8; self.block_size as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        trace!(block = block.0, "read_block");
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = self.block_size as usize;
        if data.len() != expected {
            return Err(FfsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.block_offset(block)?;
        self.inner.write_all_at(offset, data)?;
        trace!(block = block.0, "write_block");
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn set_block_size(&mut self, block_size: u32) -> Result<()> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(FfsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        self.block_size = block_size;
        self.block_count = self.inner.len_bytes() / u64::from(block_size);
        debug!(block_size, block_count = self.block_count, "io block size set");
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn write_byte(&self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.byte_writes {
            return Err(FfsError::Unsupported("byte-granular write".to_owned()));
        }
        self.inner.write_all_at(offset, data)
    }
}

/// Write zeroed blocks over `[start, start + count)` in bounded chunks.
pub fn zero_blocks(dev: &dyn BlockDevice, start: BlockNumber, count: u32) -> Result<()> {
    const CHUNK_BLOCKS: u32 = 64;
    let bs = dev.block_size() as usize;
    let mut done = 0_u32;
    while done < count {
        let n = CHUNK_BLOCKS.min(count - done);
        let zeros = vec![0_u8; n as usize * bs];
        let block = start
            .checked_add(done)
            .ok_or_else(|| FfsError::Format("block number overflow".to_owned()))?;
        dev.write_blocks(block, &zeros)?;
        done += n;
    }
    Ok(())
}

/// Read `len` bytes at an arbitrary byte offset through whole-block reads.
pub fn read_region(dev: &dyn BlockDevice, offset: u64, len: usize) -> Result<Vec<u8>> {
    let bs = u64::from(dev.block_size());
    let end = checked_end(offset, len, "region read")?;
    let first = offset / bs;
    let last = end.div_ceil(bs);
    let mut data = Vec::with_capacity(((last - first) * bs) as usize);
    for block in first..last {
        let block = u32::try_from(block)
            .map_err(|_| FfsError::Format("region beyond 32-bit block range".to_owned()))?;
        data.extend_from_slice(dev.read_block(BlockNumber(block))?.as_slice());
    }
    let skip = (offset - first * bs) as usize;
    Ok(data[skip..skip + len].to_vec())
}

/// Write `data` at an arbitrary byte offset by read-modify-write of the
/// covering blocks.
pub fn write_region(dev: &dyn BlockDevice, offset: u64, data: &[u8]) -> Result<()> {
    let bs = u64::from(dev.block_size());
    let end = checked_end(offset, data.len(), "region write")?;
    let first = offset / bs;
    let last = end.div_ceil(bs);
    let start = u32::try_from(first)
        .map_err(|_| FfsError::Format("region beyond 32-bit block range".to_owned()))?;
    let count = u32::try_from(last - first)
        .map_err(|_| FfsError::Format("region spans too many blocks".to_owned()))?;
    let mut buf = dev.read_blocks(BlockNumber(start), count)?;
    let skip = (offset - first * bs) as usize;
    buf[skip..skip + data.len()].copy_from_slice(data);
    dev.write_blocks(BlockNumber(start), &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_block_device_round_trips() {
        let mem = MemByteDevice::new(4096 * 4);
        let dev = ByteBlockDevice::new(mem, 4096).expect("device");
        assert_eq!(dev.block_count(), 4);

        let data = vec![0xAB_u8; 4096];
        dev.write_block(BlockNumber(2), &data).expect("write");
        let read = dev.read_block(BlockNumber(2)).expect("read");
        assert_eq!(read.as_slice(), &data[..]);
    }

    #[test]
    fn out_of_range_and_size_mismatch_are_rejected() {
        let dev = ByteBlockDevice::new(MemByteDevice::new(4096), 1024).expect("device");
        assert!(dev.read_block(BlockNumber(4)).is_err());
        assert!(dev.write_block(BlockNumber(0), &[0_u8; 512]).is_err());
        assert!(ByteBlockDevice::new(MemByteDevice::new(4096), 1000).is_err());
    }

    #[test]
    fn trailing_partial_block_is_not_addressable() {
        let dev = ByteBlockDevice::new(MemByteDevice::new(4096 + 100), 1024).expect("device");
        assert_eq!(dev.block_count(), 4);
    }

    #[test]
    fn set_block_size_rescales_addressing() {
        let mem = MemByteDevice::new(8192);
        let mut dev = ByteBlockDevice::new(mem.clone(), 1024).expect("device");
        dev.write_block(BlockNumber(5), &[7_u8; 1024]).expect("write");
        dev.set_block_size(4096).expect("resize");
        assert_eq!(dev.block_count(), 2);
        let block = dev.read_block(BlockNumber(1)).expect("read");
        assert_eq!(&block.as_slice()[1024..2048], &[7_u8; 1024][..]);
        assert!(dev.set_block_size(3000).is_err());
    }

    #[test]
    fn byte_writes_can_be_disabled() {
        let mem = MemByteDevice::new(4096);
        let dev = ByteBlockDevice::new(mem.clone(), 1024).expect("device");
        dev.write_byte(1030, &[1, 2]).expect("byte write");
        assert_eq!(&mem.snapshot()[1030..1032], &[1, 2]);

        let dev = dev.without_byte_writes();
        let err = dev.write_byte(0, &[1]).unwrap_err();
        assert!(matches!(err, FfsError::Unsupported(_)));
    }

    #[test]
    fn multi_block_helpers() {
        let mem = MemByteDevice::new(1024 * 8);
        let dev = ByteBlockDevice::new(mem.clone(), 1024).expect("device");
        let data: Vec<u8> = (0..2048_u32).map(|i| (i % 251) as u8).collect();
        dev.write_blocks(BlockNumber(3), &data).expect("write");
        assert_eq!(dev.read_blocks(BlockNumber(3), 2).expect("read"), data);
        assert!(dev.write_blocks(BlockNumber(0), &data[..100]).is_err());

        let region = read_region(&dev, 3 * 1024 + 1000, 100).expect("region");
        assert_eq!(region, data[1000..1100].to_vec());

        write_region(&dev, 3 * 1024 + 1020, &[9_u8; 8]).expect("write region");
        let mut want = data[1018..1030].to_vec();
        want[2..10].fill(9);
        assert_eq!(&mem.snapshot()[3 * 1024 + 1018..3 * 1024 + 1030], &want[..]);

        zero_blocks(&dev, BlockNumber(3), 2).expect("zero");
        assert!(mem.snapshot()[3072..5120].iter().all(|b| *b == 0));
    }

    #[test]
    fn file_device_respects_read_only() {
        let tmp = tempfile::NamedTempFile::new().expect("tmp");
        let dev = FileByteDevice::create(tmp.path(), 8192).expect("create");
        assert!(dev.is_writable());
        dev.write_all_at(1024, b"ext2").expect("write");
        let mut buf = [0_u8; 4];
        dev.read_exact_at(1024, &mut buf).expect("read");
        assert_eq!(&buf, b"ext2");
        assert!(dev.read_exact_at(8190, &mut buf).is_err());

        let ro = FileByteDevice::open_read_only(tmp.path()).expect("open");
        assert!(matches!(ro.write_all_at(0, b"x"), Err(FfsError::ReadOnly)));
    }
}
