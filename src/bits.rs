//! Bit-level helpers shared by the label codec and the cluster builder.
//!
//! Keys are treated as big-endian bit strings: bit 0 is the most
//! significant bit of the first byte. All range-taking operations are
//! checked and fail with [`DictError::BitRange`] instead of truncating.

use crate::{constant::WINDOW_BITS, types::DictError};
use alloy_primitives::U256;

/// Clears the `count` most significant bits of `value`.
pub fn clear_high_bits(value: u64, count: u16) -> u64 {
    if count >= WINDOW_BITS {
        0
    } else {
        value & (u64::MAX >> count)
    }
}

/// Clears the `count` least significant bits of `value`.
pub fn clear_low_bits(value: u64, count: u16) -> u64 {
    if count >= WINDOW_BITS {
        0
    } else {
        value & (u64::MAX << count)
    }
}

/// Extracts `count` bits of `value` starting at bit `start` (0 = MSB).
pub fn extract_bits(value: u64, start: u16, count: u16) -> Result<u64, DictError> {
    if start + count > WINDOW_BITS {
        return Err(DictError::BitRange {
            start: start as u32,
            count: count as u32,
            width: WINDOW_BITS as u32,
        });
    }
    if count == 0 {
        return Ok(0);
    }
    Ok((value << start) >> (WINDOW_BITS - count))
}

/// Extracts `count` bits from a byte buffer starting at bit `start`,
/// returned as a wide integer in the low `count` bits.
pub fn extract_bits_wide(bytes: &[u8], start: usize, count: usize) -> Result<U256, DictError> {
    let width = bytes.len() * 8;
    if start + count > width || count > 256 {
        return Err(DictError::BitRange {
            start: start as u32,
            count: count as u32,
            width: width as u32,
        });
    }
    let mut acc = U256::ZERO;
    for i in start..start + count {
        let bit = (bytes[i / 8] >> (7 - i % 8)) & 1;
        acc = (acc << 1) | U256::from(bit);
    }
    Ok(acc)
}

/// A wide integer whose low `len` bits are ones.
pub fn wide_ones(len: usize) -> U256 {
    if len == 0 {
        U256::ZERO
    } else {
        U256::MAX >> (256 - len)
    }
}

/// Bits `[start, start + count)` of a full 256-bit key, in the low bits of
/// the result.
pub fn key_bits(key: U256, start: u16, count: u16) -> U256 {
    if count == 0 {
        return U256::ZERO;
    }
    (key << start as usize) >> (256 - count as usize)
}

/// Length of the common prefix of two window words, capped at the window
/// width.
pub fn common_prefix_len(a: u64, b: u64) -> u16 {
    (a ^ b).leading_zeros() as u16
}

/// Shortest pairwise common prefix among consecutive windows. Windows must
/// be in key order so that consecutive comparisons bound the whole set.
/// Returns the window width when fewer than two windows are given.
pub fn common_run(windows: impl IntoIterator<Item = u64>) -> u16 {
    let mut min = WINDOW_BITS;
    let mut prev: Option<u64> = None;
    for w in windows {
        if let Some(p) = prev {
            let m = common_prefix_len(p, w);
            if m < min {
                min = m;
                if min == 0 {
                    break;
                }
            }
        }
        prev = Some(w);
    }
    min
}

/// Length of the common prefix of two byte buffers in bits, scanning at
/// most `limit` bits.
pub fn common_prefix_bytes(a: &[u8], b: &[u8], limit: usize) -> usize {
    let max = limit.min(a.len() * 8).min(b.len() * 8);
    let whole = max / 8;
    for i in 0..whole {
        if a[i] != b[i] {
            let lz = (a[i] ^ b[i]).leading_zeros() as usize;
            return (i * 8 + lz).min(max);
        }
    }
    for i in whole * 8..max {
        let bit_a = (a[i / 8] >> (7 - i % 8)) & 1;
        let bit_b = (b[i / 8] >> (7 - i % 8)) & 1;
        if bit_a != bit_b {
            return i;
        }
    }
    max
}

/// Shortest pairwise common prefix among consecutive byte buffers, capped
/// at `limit` bits. Buffers must be in key order.
pub fn common_run_bytes<'a>(bufs: impl IntoIterator<Item = &'a [u8]>, limit: usize) -> usize {
    let mut min = limit;
    let mut prev: Option<&[u8]> = None;
    for b in bufs {
        if let Some(p) = prev {
            let m = common_prefix_bytes(p, b, min);
            if m < min {
                min = m;
                if min == 0 {
                    break;
                }
            }
        }
        prev = Some(b);
    }
    min
}

/// Interprets a byte buffer (at most 32 bytes) as a big-endian integer.
pub fn wide_from_bytes(bytes: &[u8]) -> U256 {
    U256::from_be_slice(bytes)
}
