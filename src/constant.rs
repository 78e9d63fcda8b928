//! This module defines constants that determine the shape of the claim dictionary.

/// Number of bits in a full claim key.
pub const KEY_BITS: u16 = 256;
/// Number of bits in a cluster entry's working window. Keys are consumed
/// one window-sized word at a time.
pub const WINDOW_BITS: u16 = 64;
/// Number of bytes in a window word.
pub const WINDOW_BYTES: usize = (WINDOW_BITS / 8) as usize;

/// Bit pattern of the dictionary root label: a 3-bit schema tag (`100`)
/// followed by an 8-bit zero workchain.
pub const ROOT_LABEL_BITS: u64 = 0b100 << 8;
/// Length of the root label in bits.
pub const ROOT_LABEL_LEN: u16 = 11;
/// Keyspace seen by the root cell: the root label plus the key bits.
pub const FULL_KEY_BITS: u16 = ROOT_LABEL_LEN + KEY_BITS;

/// Default frontier depth D. Nodes shallower than D are committed as branch
/// records; subtrees crossing D are serialized whole as top records.
pub const DEFAULT_STORE_DEPTH: u16 = 16;
/// Default number of prefix bits left for each worker to resolve, which
/// sets the cluster partition length to `effective_bits - this`.
pub const DEFAULT_PER_WORKER_BITS: u16 = 10;

/// Number of buffered branch records that triggers a write-back flush.
pub const BRANCH_FLUSH_THRESHOLD: usize = 1024;

/// Width of the claim window timestamps in a leaf payload.
pub const CLAIM_TIME_BITS: u16 = 48;
/// Width of the byte-length prefix of a coin amount (VarUInteger).
pub const COIN_LEN_BITS: u16 = 4;
/// Largest coin amount representable: `COIN_LEN_BITS` encodes up to 15
/// payload bytes.
pub const MAX_COIN_BYTES: usize = (1 << COIN_LEN_BITS) - 1;
