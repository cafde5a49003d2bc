#![forbid(unsafe_code)]
//! ext2 metadata core.
//!
//! Re-exports the filesystem handle from `ffs-core` along with the on-disk
//! types, device adapters and mkfs pipeline it is driven with. Downstream
//! tools depend on this crate rather than on the individual layers.
//!
//! ```
//! use ffs::{ByteBlockDevice, Filesystem, InodeNumber, MemByteDevice, MkfsOptions, MkfsProfile};
//!
//! let mem = MemByteDevice::new(4 << 20);
//! let dev = ByteBlockDevice::new(mem.clone(), 1024)?;
//! let report = ffs::mkfs("doc", Box::new(dev), &MkfsOptions::default(), &MkfsProfile::default())?;
//! assert_eq!(report.blocks_count, 4096);
//!
//! let dev = ByteBlockDevice::new(mem, 1024)?;
//! let fs = Filesystem::open("doc", Box::new(dev), &ffs::OpenOptions::default())?;
//! assert!(fs.lookup(InodeNumber::ROOT, b"lost+found").is_ok());
//! # Ok::<(), ffs::FfsError>(())
//! ```

pub use ffs_core::*;
