//! ext2 feature flags and the feature-name table used by mkfs-style tools.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Feature newtypes ────────────────────────────────────────────────────────

/// Compatible feature flags (`s_feature_compat`).
///
/// Advisory; unknown bits are safe to ignore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompatFeatures(pub u32);

impl CompatFeatures {
    pub const DIR_PREALLOC: Self = Self(0x0001);
    pub const IMAGIC_INODES: Self = Self(0x0002);
    pub const HAS_JOURNAL: Self = Self(0x0004);
    pub const EXT_ATTR: Self = Self(0x0008);
    pub const RESIZE_INODE: Self = Self(0x0010);
    pub const DIR_INDEX: Self = Self(0x0020);
    pub const LAZY_BG: Self = Self(0x0040);

    /// Bits this library knows how to lay out.
    pub const SUPPORTED: Self = Self(
        Self::DIR_PREALLOC.0
            | Self::IMAGIC_INODES.0
            | Self::HAS_JOURNAL.0
            | Self::EXT_ATTR.0
            | Self::RESIZE_INODE.0
            | Self::DIR_INDEX.0
            | Self::LAZY_BG.0,
    );

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "dir_prealloc"),
        (0x0002, "imagic_inodes"),
        (0x0004, "has_journal"),
        (0x0008, "ext_attr"),
        (0x0010, "resize_inode"),
        (0x0020, "dir_index"),
        (0x0040, "lazy_bg"),
    ];
}

/// Incompatible feature flags (`s_feature_incompat`).
///
/// Unknown bits MUST refuse the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncompatFeatures(pub u32);

impl IncompatFeatures {
    pub const COMPRESSION: Self = Self(0x0001);
    pub const FILETYPE: Self = Self(0x0002);
    pub const RECOVER: Self = Self(0x0004);
    pub const JOURNAL_DEV: Self = Self(0x0008);
    pub const META_BG: Self = Self(0x0010);
    pub const EXTENTS: Self = Self(0x0040);

    pub const SUPPORTED: Self = Self(
        Self::FILETYPE.0 | Self::RECOVER.0 | Self::JOURNAL_DEV.0 | Self::META_BG.0,
    );

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "compression"),
        (0x0002, "filetype"),
        (0x0004, "needs_recovery"),
        (0x0008, "journal_dev"),
        (0x0010, "meta_bg"),
        (0x0040, "extents"),
    ];
}

/// Read-only-compatible feature flags (`s_feature_ro_compat`).
///
/// Unknown bits permit read-only access only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoCompatFeatures(pub u32);

impl RoCompatFeatures {
    pub const SPARSE_SUPER: Self = Self(0x0001);
    pub const LARGE_FILE: Self = Self(0x0002);
    pub const BTREE_DIR: Self = Self(0x0004);

    pub const SUPPORTED: Self = Self(Self::SPARSE_SUPER.0 | Self::LARGE_FILE.0);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "sparse_super"),
        (0x0002, "large_file"),
        (0x0004, "btree_dir"),
    ];
}

macro_rules! feature_flag_impls {
    ($ty:ident, $kind:expr) => {
        impl $ty {
            #[must_use]
            pub fn bits(self) -> u32 {
                self.0
            }

            #[must_use]
            pub fn contains(self, flag: Self) -> bool {
                (self.0 & flag.0) == flag.0 && flag.0 != 0
            }

            pub fn insert(&mut self, flag: Self) {
                self.0 |= flag.0;
            }

            pub fn remove(&mut self, flag: Self) {
                self.0 &= !flag.0;
            }

            /// Bits outside `allowed`.
            #[must_use]
            pub fn outside(self, allowed: Self) -> Self {
                Self(self.0 & !allowed.0)
            }

            /// Names of all set flags; unknown bits are omitted.
            #[must_use]
            pub fn describe(self) -> Vec<&'static str> {
                Self::KNOWN
                    .iter()
                    .filter(|(bit, _)| self.0 & bit != 0)
                    .map(|(_, name)| *name)
                    .collect()
            }

            /// Bits not covered by any named constant.
            #[must_use]
            pub fn unknown_bits(self) -> u32 {
                let known_mask: u32 = Self::KNOWN.iter().map(|(bit, _)| bit).fold(0, |a, b| a | b);
                self.0 & !known_mask
            }
        }

        impl std::ops::BitOr for $ty {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                format_flags(f, self.0, Self::KNOWN, $kind)
            }
        }
    };
}

feature_flag_impls!(CompatFeatures, FeatureKind::Compat);
feature_flag_impls!(IncompatFeatures, FeatureKind::Incompat);
feature_flag_impls!(RoCompatFeatures, FeatureKind::RoCompat);

/// Format a bitmask as a space-separated list of feature names.
///
/// Unknown bits print as `FEATURE_<kind><bit>` so they parse back.
fn format_flags(
    f: &mut std::fmt::Formatter<'_>,
    bits: u32,
    known: &[(u32, &'static str)],
    kind: FeatureKind,
) -> std::fmt::Result {
    if bits == 0 {
        return f.write_str("(none)");
    }
    let mut first = true;
    for bit in 0..32 {
        let mask = 1_u32 << bit;
        if bits & mask == 0 {
            continue;
        }
        if !first {
            f.write_str(" ")?;
        }
        first = false;
        match known.iter().find(|(known_bit, _)| *known_bit == mask) {
            Some((_, name)) => f.write_str(name)?,
            None => write!(f, "FEATURE_{}{bit}", kind.letter())?,
        }
    }
    Ok(())
}

// ── Feature sets and list editing ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    Compat,
    Incompat,
    RoCompat,
}

impl FeatureKind {
    fn letter(self) -> char {
        match self {
            Self::Compat => 'C',
            Self::Incompat => 'I',
            Self::RoCompat => 'R',
        }
    }
}

/// All three feature words together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureSet {
    pub compat: CompatFeatures,
    pub incompat: IncompatFeatures,
    pub ro_compat: RoCompatFeatures,
}

impl FeatureSet {
    pub const NONE: Self = Self {
        compat: CompatFeatures(0),
        incompat: IncompatFeatures(0),
        ro_compat: RoCompatFeatures(0),
    };

    /// Everything this library can lay out.
    pub const LIB_SUPPORTED: Self = Self {
        compat: CompatFeatures::SUPPORTED,
        incompat: IncompatFeatures::SUPPORTED,
        ro_compat: RoCompatFeatures::SUPPORTED,
    };

    fn word_mut(&mut self, kind: FeatureKind) -> &mut u32 {
        match kind {
            FeatureKind::Compat => &mut self.compat.0,
            FeatureKind::Incompat => &mut self.incompat.0,
            FeatureKind::RoCompat => &mut self.ro_compat.0,
        }
    }

    fn word(&self, kind: FeatureKind) -> u32 {
        match kind {
            FeatureKind::Compat => self.compat.0,
            FeatureKind::Incompat => self.incompat.0,
            FeatureKind::RoCompat => self.ro_compat.0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compat.0 == 0 && self.incompat.0 == 0 && self.ro_compat.0 == 0
    }
}

impl std::fmt::Display for FeatureSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        for text in [
            self.compat.to_string(),
            self.incompat.to_string(),
            self.ro_compat.to_string(),
        ] {
            if text != "(none)" {
                parts.push(text);
            }
        }
        if parts.is_empty() {
            f.write_str("(none)")
        } else {
            f.write_str(&parts.join(" "))
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeatureError {
    #[error("unknown feature: {0}")]
    Unknown(String),
    #[error("feature not allowed here: {0}")]
    NotAllowed(String),
}

/// Resolve a feature name (case-insensitive) or a `FEATURE_{C,I,R}<bit>` token.
pub fn feature_by_name(name: &str) -> Option<(FeatureKind, u32)> {
    let tables = [
        (FeatureKind::Compat, CompatFeatures::KNOWN),
        (FeatureKind::Incompat, IncompatFeatures::KNOWN),
        (FeatureKind::RoCompat, RoCompatFeatures::KNOWN),
    ];
    for (kind, table) in tables {
        if let Some((bit, _)) = table.iter().find(|(_, known)| known.eq_ignore_ascii_case(name)) {
            return Some((kind, *bit));
        }
    }

    let upper = name.to_ascii_uppercase();
    let rest = upper.strip_prefix("FEATURE_")?;
    let mut chars = rest.chars();
    let kind = match chars.next()? {
        'C' => FeatureKind::Compat,
        'I' => FeatureKind::Incompat,
        'R' => FeatureKind::RoCompat,
        _ => return None,
    };
    let bit: u32 = chars.as_str().parse().ok()?;
    if bit >= 32 {
        return None;
    }
    Some((kind, 1 << bit))
}

/// Name of a single feature bit, or the `FEATURE_<kind><bit>` spelling.
#[must_use]
pub fn feature_name(kind: FeatureKind, mask: u32) -> String {
    let table = match kind {
        FeatureKind::Compat => CompatFeatures::KNOWN,
        FeatureKind::Incompat => IncompatFeatures::KNOWN,
        FeatureKind::RoCompat => RoCompatFeatures::KNOWN,
    };
    table
        .iter()
        .find(|(bit, _)| *bit == mask)
        .map_or_else(
            || format!("FEATURE_{}{}", kind.letter(), mask.trailing_zeros()),
            |(_, name)| (*name).to_owned(),
        )
}

/// Apply a feature edit list such as `"^resize_inode,+dir_index lazy_bg"`.
///
/// Tokens are separated by commas or whitespace. A `-` or `^` prefix clears
/// the feature, `+` or no prefix sets it, and `none`/`clear` resets all
/// three words. When `allowed` is given, touching a feature outside it is
/// an error.
pub fn edit_features(
    list: &str,
    set: &mut FeatureSet,
    allowed: Option<&FeatureSet>,
) -> Result<(), FeatureError> {
    for token in list
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
    {
        if token.eq_ignore_ascii_case("none") || token.eq_ignore_ascii_case("clear") {
            *set = FeatureSet::NONE;
            continue;
        }

        let (clear, name) = match token.as_bytes()[0] {
            b'-' | b'^' => (true, &token[1..]),
            b'+' => (false, &token[1..]),
            _ => (false, token),
        };

        let (kind, mask) =
            feature_by_name(name).ok_or_else(|| FeatureError::Unknown(name.to_owned()))?;
        if let Some(allowed) = allowed {
            if allowed.word(kind) & mask == 0 {
                return Err(FeatureError::NotAllowed(name.to_owned()));
            }
        }

        let word = set.word_mut(kind);
        if clear {
            *word &= !mask;
        } else {
            *word |= mask;
        }
    }
    Ok(())
}
