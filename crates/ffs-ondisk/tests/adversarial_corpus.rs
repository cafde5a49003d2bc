#![forbid(unsafe_code)]

use ffs_ondisk::{
    DirEntryHeader, Ext2GroupDesc, Ext2Inode, Ext2Superblock, FeatureSet, edit_features,
    parse_group_desc_table,
};
use ffs_types::{EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_SIZE, ParseError};
use proptest::prelude::*;

#[derive(Debug, Default)]
struct ErrorCoverage {
    insufficient_data: u32,
    invalid_magic: u32,
    invalid_field: u32,
    integer_conversion: u32,
}

impl ErrorCoverage {
    fn observe(&mut self, err: &ParseError) {
        match err {
            ParseError::InsufficientData { .. } => self.insufficient_data += 1,
            ParseError::InvalidMagic { .. } => self.invalid_magic += 1,
            ParseError::InvalidField { .. } => self.invalid_field += 1,
            ParseError::IntegerConversion { .. } => self.integer_conversion += 1,
        }
    }
}

fn minimal_valid_superblock() -> Vec<u8> {
    let sb = Ext2Superblock {
        magic: EXT2_SUPER_MAGIC,
        blocks_count: 64,
        inodes_count: 16,
        blocks_per_group: 8192,
        inodes_per_group: 16,
        first_data_block: 1,
        ..Ext2Superblock::default()
    };
    sb.to_region().expect("encode").to_vec()
}

fn handcrafted_samples() -> Vec<(&'static str, Vec<u8>)> {
    let valid = minimal_valid_superblock();
    let mut bad_magic = valid.clone();
    bad_magic[0x38] ^= 0xFF;
    let mut bad_log = valid.clone();
    bad_log[0x18] = 0x20;

    vec![
        ("empty", Vec::new()),
        ("truncated_superblock", valid[..100].to_vec()),
        ("bad_magic", bad_magic),
        ("bad_log_block_size", bad_log),
        ("valid", valid),
        ("short_desc", vec![0xFF; 31]),
        ("short_inode", vec![0xAA; 127]),
    ]
}

#[test]
fn adversarial_samples_are_panic_free_and_exercise_parse_errors() {
    let mut coverage = ErrorCoverage::default();

    for (name, sample) in handcrafted_samples() {
        match Ext2Superblock::parse_superblock_region(&sample) {
            Ok(sb) => {
                if let Err(err) = sb.block_size() {
                    coverage.observe(&err);
                }
            }
            Err(err) => coverage.observe(&err),
        }
        if let Err(err) = Ext2GroupDesc::parse_from_bytes(&sample) {
            coverage.observe(&err);
        }
        if let Err(err) = Ext2Inode::parse_from_bytes(&sample) {
            coverage.observe(&err);
        }
        if let Err(err) = DirEntryHeader::decode(&sample, 0) {
            coverage.observe(&err);
        }
        let _ = name;
    }

    let mut one = [0_u8; 8];
    let header = DirEntryHeader {
        inode: 1,
        rec_len: 6,
        name_len: 0,
        file_type: 0,
    };
    if let Err(err) = header.encode(&mut one, 0) {
        coverage.observe(&err);
    }

    assert!(coverage.insufficient_data > 0, "{coverage:?}");
    assert!(coverage.invalid_magic > 0, "{coverage:?}");
    assert!(coverage.invalid_field > 0, "{coverage:?}");
}

#[test]
fn superblock_region_size_is_fixed() {
    let region = minimal_valid_superblock();
    assert_eq!(region.len(), EXT2_SUPERBLOCK_SIZE);
    let sb = Ext2Superblock::parse_superblock_region(&region).unwrap();
    assert_eq!(sb.blocks_count, 64);
}

proptest! {
    #[test]
    fn parsers_never_panic_on_random_bytes(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let _ = Ext2Superblock::parse_superblock_region(&data);
        let _ = Ext2GroupDesc::parse_from_bytes(&data);
        let _ = Ext2Inode::parse_from_bytes(&data);
        let _ = parse_group_desc_table(&data, 8);
        for offset in (0..data.len()).step_by(4) {
            let _ = DirEntryHeader::decode(&data, offset);
        }
    }

    #[test]
    fn feature_edit_never_panics(list in "[-+^a-zA-Z_0-9, ]{0,64}") {
        let mut set = FeatureSet::default();
        let _ = edit_features(&list, &mut set, Some(&FeatureSet::LIB_SUPPORTED));
    }
}
