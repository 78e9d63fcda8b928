//! Core types for the claim dictionary.

use crate::{
    bits,
    constant::{KEY_BITS, WINDOW_BITS, WINDOW_BYTES},
};
use alloy_primitives::{B256, U256};
use derive_more::{Deref, DerefMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or persisting the dictionary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DictError {
    /// A numeric operation exceeded the width of its representation.
    #[error("precision boundary: {len} bits do not fit a {width}-bit representation")]
    PrecisionBoundary { len: u16, width: u16 },

    /// A bit range fell outside its source.
    #[error("bit range out of bounds: start {start}, count {count}, width {width}")]
    BitRange { start: u32, count: u32, width: u32 },

    /// The dataset or an intermediate working set violated a structural
    /// invariant of the trie.
    #[error("structural inconsistency: {0}")]
    StructuralInconsistency(&'static str),

    /// A cluster reached the builder with no members.
    #[error("empty cluster at prefix length {len}")]
    EmptyCluster { len: u16 },

    /// A serialized or parsed cell did not follow the canonical layout.
    #[error("malformed cell: {0}")]
    MalformedCell(&'static str),

    /// A cell write exceeded the data or reference capacity.
    #[error("cell capacity exceeded: {bits} bits, {refs} refs")]
    CellOverflow { bits: u32, refs: usize },

    /// The storage backend failed.
    #[error("storage failure: {0}")]
    Storage(String),

    /// The build session file could not be read or written.
    #[error("session failure: {0}")]
    Session(String),
}

/// A full 256-bit claim key.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deref,
    DerefMut,
    Serialize,
    Deserialize,
)]
pub struct ClaimKey(pub B256);

impl ClaimKey {
    /// The key as a wide integer, bit 0 of the key in the most significant
    /// position.
    pub fn to_wide(self) -> U256 {
        U256::from_be_bytes(self.0 .0)
    }

    pub fn from_wide(value: U256) -> Self {
        Self(B256::from(value.to_be_bytes::<32>()))
    }

    /// Bit at `index`, 0 = most significant.
    pub fn bit(&self, index: u16) -> bool {
        debug_assert!(index < KEY_BITS);
        (self.0[index as usize / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// The key's prefix of `len` bits.
    pub fn prefix(&self, len: u16) -> Prefix {
        Prefix::new(self.to_wide() >> (KEY_BITS - len) as usize, len)
    }
}

impl From<B256> for ClaimKey {
    fn from(value: B256) -> Self {
        Self(value)
    }
}

/// A key prefix of up to 256 bits.
///
/// The representation is chosen purely by bit length: prefixes of at most
/// [`WINDOW_BITS`] bits stay in a machine word, longer ones carry a wide
/// integer. Every operation is uniform across the two variants; equality,
/// ordering and hashing go through the canonical wide value.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum Prefix {
    Short(u64),
    Wide(U256),
}

impl Prefix {
    pub const ZERO: Self = Prefix::Short(0);

    /// Whether a prefix of `len` bits fits the short representation.
    pub const fn fits_short(len: u16) -> bool {
        len <= WINDOW_BITS
    }

    pub fn new(value: U256, len: u16) -> Self {
        if Self::fits_short(len) {
            Prefix::Short(value.to::<u64>())
        } else {
            Prefix::Wide(value)
        }
    }

    pub fn to_wide(self) -> U256 {
        match self {
            Prefix::Short(v) => U256::from(v),
            Prefix::Wide(v) => v,
        }
    }

    /// Appends `count` bits (in the low bits of `bits`) to the low end.
    /// `new_len` is the resulting length and selects the representation.
    pub fn push(self, bits: U256, count: u16, new_len: u16) -> Result<Self, DictError> {
        if new_len > KEY_BITS || count > new_len {
            return Err(DictError::PrecisionBoundary {
                len: new_len,
                width: KEY_BITS,
            });
        }
        let joined = (self.to_wide() << count as usize) | bits;
        Ok(Self::new(joined, new_len))
    }

    pub fn push_bit(self, bit: bool, new_len: u16) -> Result<Self, DictError> {
        self.push(U256::from(bit as u8), 1, new_len)
    }

    /// Drops the `count` lowest bits.
    pub fn shr(self, count: u16, new_len: u16) -> Self {
        Self::new(self.to_wide() >> count as usize, new_len)
    }

    /// The prefix differing only in the lowest bit.
    pub fn sibling(self) -> Self {
        match self {
            Prefix::Short(v) => Prefix::Short(v ^ 1),
            Prefix::Wide(v) => Prefix::Wide(v ^ U256::from(1u8)),
        }
    }

    /// Whether the lowest bit is set, i.e. the prefix names a right child.
    pub fn is_right(self) -> bool {
        match self {
            Prefix::Short(v) => v & 1 == 1,
            Prefix::Wide(v) => v.bit(0),
        }
    }
}

impl PartialEq for Prefix {
    fn eq(&self, other: &Self) -> bool {
        self.to_wide() == other.to_wide()
    }
}

impl Eq for Prefix {}

impl PartialOrd for Prefix {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prefix {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_wide().cmp(&other.to_wide())
    }
}

impl std::hash::Hash for Prefix {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_wide().hash(state)
    }
}

/// One member of a prefix cluster during construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterEntry {
    /// Current window word. Key bits already consumed by the cluster
    /// prefix are cleared.
    pub window: u64,
    /// Key bytes after the window's word.
    pub suffix: Vec<u8>,
    /// Claim amount in elementary units.
    pub amount: u128,
    /// Fork levels below the frontier accumulated while descending.
    pub path: Vec<u16>,
}

impl ClusterEntry {
    /// Key bytes from the window's word boundary on.
    fn stream(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WINDOW_BYTES + self.suffix.len());
        out.extend_from_slice(&self.window.to_be_bytes());
        out.extend_from_slice(&self.suffix);
        out
    }

    /// Consumes `label_len` bits past the in-word offset `word_off`,
    /// returning the branch bit that follows the label and the entry
    /// repositioned after it. Crossing a word boundary refills the window
    /// from the suffix.
    pub fn advance(
        &self,
        word_off: u16,
        label_len: u16,
    ) -> Result<(bool, ClusterEntry), DictError> {
        let stream = self.stream();
        let fork_idx = (word_off + label_len) as usize;
        let width = stream.len() * 8;
        if fork_idx >= width {
            return Err(DictError::BitRange {
                start: fork_idx as u32,
                count: 1,
                width: width as u32,
            });
        }
        let bit = (stream[fork_idx / 8] >> (7 - fork_idx % 8)) & 1 == 1;
        let pos = fork_idx + 1;
        if pos == width {
            // the branch bit was the last key bit; nothing remains
            return Ok((
                bit,
                ClusterEntry {
                    window: 0,
                    suffix: Vec::new(),
                    amount: self.amount,
                    path: self.path.clone(),
                },
            ));
        }
        let skip = pos / WINDOW_BITS as usize * WINDOW_BYTES;
        let rest = &stream[skip..];
        if rest.len() < WINDOW_BYTES {
            return Err(DictError::BitRange {
                start: pos as u32,
                count: WINDOW_BITS as u32,
                width: width as u32,
            });
        }
        let mut word = [0u8; WINDOW_BYTES];
        word.copy_from_slice(&rest[..WINDOW_BYTES]);
        let window = bits::clear_high_bits(u64::from_be_bytes(word), (pos % 64) as u16);
        Ok((
            bit,
            ClusterEntry {
                window,
                suffix: rest[WINDOW_BYTES..].to_vec(),
                amount: self.amount,
                path: self.path.clone(),
            },
        ))
    }

    /// Reconstructs the full key from the owning cluster's prefix.
    pub fn full_key(&self, prefix: Prefix, prefix_len: u16) -> ClaimKey {
        let stream = bits::wide_from_bytes(&self.stream());
        let key = (prefix.to_wide() << (KEY_BITS - prefix_len) as usize) | stream;
        ClaimKey::from_wide(key)
    }
}

/// Entries sharing a key prefix, the unit of work for construction.
#[derive(Clone, Debug)]
pub struct PrefixCluster {
    pub prefix: Prefix,
    pub prefix_len: u16,
    /// Members in key order.
    pub entries: Vec<ClusterEntry>,
}

/// Hash and depth of a committed node at or above the frontier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BranchRecord {
    pub depth: u16,
    pub hash: B256,
}

/// A serialized subtree rooted just above the frontier, together with the
/// fork path shared by all of its member keys.
#[derive(Clone, Debug)]
pub struct TopRecord {
    pub prefix: Prefix,
    pub prefix_len: u16,
    /// Fork levels from the root fork down to this subtree's root,
    /// ascending. Completed by the scheduler once the reduce finishes.
    pub path: Vec<u16>,
    /// The subtree in canonical cell bytes, fully materialized.
    pub subtree: Vec<u8>,
}

/// Everything needed to assemble one key's inclusion proof.
#[derive(Clone, Debug)]
pub struct ForkPath {
    pub path: Vec<u16>,
    pub top_len: u16,
    pub top: Vec<u8>,
}
