use serde::{Deserialize, Serialize};

/// Document number within a databank. Assigned monotonically starting at 1;
/// 0 is the sentinel and never names a stored document.
pub type DocNr = u32;

/// Lexicon token id. 0 is the end-of-sequence / stop-word gap sentinel.
pub type TokenId = u32;

/// Maximum length in bytes of an index key or attribute value.
pub const MAX_KEY_LENGTH: usize = 255;

/// Weight range of a weighted posting entry is [1, MAX_WEIGHT]; 0 is reserved.
pub const MAX_WEIGHT: u8 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexKind {
    /// key -> doc-nr, keys unique
    Unique,
    /// key -> posting list of ascending doc-nrs
    Multi,
    /// key -> posting list of (doc-nr, weight)
    Weighted,
    /// key -> posting list plus per-doc position arrays in a companion file
    MultiIdl,
    /// keys compare as integers
    Number,
    /// keys compare as floats
    Float,
}

impl IndexKind {
    pub fn has_idl(self) -> bool {
        matches!(self, IndexKind::MultiIdl)
    }
}

/// Comparison operators accepted by the term-query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equals,
    LessThan,
    LessOrEqual,
    GreaterOrEqual,
    GreaterThan,
}
