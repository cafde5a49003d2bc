#![forbid(unsafe_code)]
//! On-disk format parsing for ext2 structures.
//!
//! Pure decode/encode crate: no I/O, no side effects. Every structure is
//! decoded field by field from a byte slice and encoded back the same way,
//! so nothing depends on host alignment or endianness.

pub mod dirent;
pub mod ext2;
pub mod feature;

pub use dirent::{DirEntryHeader, FileType, rec_len_for};
pub use ext2::{
    Ext2GroupDesc, Ext2Inode, Ext2Superblock, encode_group_desc_table, parse_group_desc_table,
};
pub use feature::{
    CompatFeatures, FeatureError, FeatureKind, FeatureSet, IncompatFeatures, RoCompatFeatures,
    edit_features,
};
