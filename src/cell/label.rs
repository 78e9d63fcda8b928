//! Three-form prefix-coded edge labels.
//!
//! A label of `len` bits inside a remaining keyspace of `key_len` bits can
//! be written three ways (`k = len_bits(key_len)`):
//!
//! - short: `0`, `len` ones, `0`, the raw bits — `2 + 2*len` bits;
//! - long:  `10`, `len` in `k` bits, the raw bits — `2 + k + len` bits;
//! - same:  `11`, one value bit, `len` in `k` bits — `3 + k` bits, valid
//!   only when every label bit is equal.
//!
//! The encoder picks the cheapest valid form with ties broken toward
//! short, so any given label has exactly one encoding and node hashes are
//! canonical.

use super::{CellBuilder, CellSlice};
use crate::{bits::wide_ones, types::DictError};
use alloy_primitives::U256;

/// Number of bits needed to express a length in `0..=key_len`.
pub const fn len_bits(key_len: u16) -> u16 {
    (u16::BITS - key_len.leading_zeros()) as u16
}

/// An edge label: `len` key bits, most significant first, held in the low
/// bits of `bits`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label {
    pub bits: U256,
    pub len: u16,
}

impl Label {
    pub fn new(bits: U256, len: u16) -> Self {
        debug_assert!(len == 256 || bits >> len as usize == U256::ZERO);
        Self { bits, len }
    }

    pub fn from_word(bits: u64, len: u16) -> Self {
        Self::new(U256::from(bits), len)
    }

    pub const EMPTY: Self = Self {
        bits: U256::ZERO,
        len: 0,
    };

    /// The common value of the label bits, if they are all equal.
    fn uniform_bit(&self) -> Option<bool> {
        if self.bits == U256::ZERO {
            Some(false)
        } else if self.bits == wide_ones(self.len as usize) {
            Some(true)
        } else {
            None
        }
    }
}

enum LabelForm {
    Short,
    Long,
    Same(bool),
}

/// Cost-minimal form selection; ties prefer short.
fn choose_form(label: &Label, key_len: u16) -> LabelForm {
    let k = len_bits(key_len) as u32;
    let len = label.len as u32;
    let short_cost = 2 + 2 * len;
    let long_cost = 2 + k + len;
    let same_cost = 3 + k;
    if let Some(bit) = label.uniform_bit() {
        if label.len > 1 && same_cost < short_cost && same_cost < long_cost {
            return LabelForm::Same(bit);
        }
    }
    if long_cost < short_cost {
        LabelForm::Long
    } else {
        LabelForm::Short
    }
}

pub fn store_label(b: &mut CellBuilder, label: &Label, key_len: u16) -> Result<(), DictError> {
    if label.len > key_len {
        return Err(DictError::BitRange {
            start: 0,
            count: label.len as u32,
            width: key_len as u32,
        });
    }
    let k = len_bits(key_len);
    match choose_form(label, key_len) {
        LabelForm::Same(bit) => {
            b.store_uint(0b11, 2)?;
            b.store_bit(bit)?;
            b.store_uint(label.len as u64, k)?;
        }
        LabelForm::Long => {
            b.store_uint(0b10, 2)?;
            b.store_uint(label.len as u64, k)?;
            b.store_uint_wide(label.bits, label.len)?;
        }
        LabelForm::Short => {
            b.store_bit(false)?;
            for _ in 0..label.len {
                b.store_bit(true)?;
            }
            b.store_bit(false)?;
            b.store_uint_wide(label.bits, label.len)?;
        }
    }
    Ok(())
}

pub fn read_label(s: &mut CellSlice<'_>, key_len: u16) -> Result<Label, DictError> {
    let k = len_bits(key_len);
    let label = if !s.load_bit()? {
        // short: unary length, then the bits
        let mut len = 0u16;
        while s.load_bit()? {
            len += 1;
        }
        Label::new(s.load_uint_wide(len)?, len)
    } else if !s.load_bit()? {
        // long
        let len = s.load_uint(k)? as u16;
        Label::new(s.load_uint_wide(len)?, len)
    } else {
        // same
        let bit = s.load_bit()?;
        let len = s.load_uint(k)? as u16;
        let bits = if bit { wide_ones(len as usize) } else { U256::ZERO };
        Label::new(bits, len)
    };
    if label.len > key_len {
        return Err(DictError::MalformedCell("label longer than keyspace"));
    }
    Ok(label)
}
