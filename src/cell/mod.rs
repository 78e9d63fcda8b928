//! Canonical dictionary cells.
//!
//! A [`Cell`] is an immutable node of the dictionary: up to 1023 data bits
//! and up to four references, hashed with SHA-256 over a canonical
//! encoding at construction time. Three kinds exist: ordinary cells carry
//! labels, payloads and children; pruned branches stand in for a discarded
//! subtree while reporting its original hash and depth; merkle-proof cells
//! wrap a pruned-down tree for transport.
//!
//! Because the canonical encoding covers each child's reported hash and
//! depth, replacing a subtree with its pruned branch leaves every ancestor
//! hash unchanged.

pub mod label;

use crate::{
    constant::{FULL_KEY_BITS, ROOT_LABEL_BITS, ROOT_LABEL_LEN},
    types::{DictError, Prefix},
};
use alloy_primitives::{B256, U256};
use label::{len_bits, read_label, store_label, Label};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Maximum number of data bits in a cell.
pub const MAX_CELL_BITS: u16 = 1023;
/// Maximum number of references in a cell.
pub const MAX_CELL_REFS: usize = 4;

const PRUNED_MARKER: u8 = 0x01;
const PROOF_MARKER: u8 = 0x03;
/// Marker byte, 32-byte hash, 16-bit depth.
const PRUNED_BITS: u16 = 8 + 8 + 256 + 16;
const PROOF_BITS: u16 = 8 + 256 + 16;

/// The flavor of a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellKind {
    Ordinary,
    PrunedBranch,
    MerkleProof,
}

impl CellKind {
    pub const fn is_exotic(self) -> bool {
        !matches!(self, CellKind::Ordinary)
    }
}

/// An immutable dictionary node, hash- and depth-finalized at construction.
#[derive(Debug)]
pub struct Cell {
    kind: CellKind,
    data: Vec<u8>,
    bit_len: u16,
    refs: Vec<Arc<Cell>>,
    hash: B256,
    depth: u16,
}

impl Cell {
    /// SHA-256 over the canonical encoding: descriptor bytes, data with a
    /// completion tag, then each child's depth and hash.
    fn repr_hash(kind: CellKind, data: &[u8], bit_len: u16, refs: &[Arc<Cell>]) -> B256 {
        let mut hasher = Sha256::new();
        let d1 = refs.len() as u8 + if kind.is_exotic() { 8 } else { 0 };
        let d2 = (bit_len / 8) as u8 + (bit_len.div_ceil(8)) as u8;
        hasher.update([d1, d2]);
        let full = (bit_len / 8) as usize;
        hasher.update(&data[..full]);
        if bit_len % 8 != 0 {
            // completion tag: a 1 bit right after the data bits
            hasher.update([data[full] | (0x80 >> (bit_len % 8))]);
        }
        for r in refs {
            hasher.update(r.depth().to_be_bytes());
        }
        for r in refs {
            hasher.update(r.hash());
        }
        B256::from_slice(&hasher.finalize())
    }

    fn finalize(
        kind: CellKind,
        data: Vec<u8>,
        bit_len: u16,
        refs: Vec<Arc<Cell>>,
    ) -> Result<Arc<Cell>, DictError> {
        if bit_len > MAX_CELL_BITS || refs.len() > MAX_CELL_REFS {
            return Err(DictError::CellOverflow {
                bits: bit_len as u32,
                refs: refs.len(),
            });
        }
        let (hash, depth) = match kind {
            CellKind::PrunedBranch => {
                if bit_len != PRUNED_BITS || data[0] != PRUNED_MARKER || data[1] != PRUNED_MARKER {
                    return Err(DictError::MalformedCell("bad pruned branch layout"));
                }
                if !refs.is_empty() {
                    return Err(DictError::MalformedCell("pruned branch with references"));
                }
                let hash = B256::from_slice(&data[2..34]);
                let depth = u16::from_be_bytes([data[34], data[35]]);
                (hash, depth)
            }
            CellKind::MerkleProof => {
                if bit_len != PROOF_BITS || data[0] != PROOF_MARKER || refs.len() != 1 {
                    return Err(DictError::MalformedCell("bad merkle proof layout"));
                }
                let hash = Self::repr_hash(kind, &data, bit_len, &refs);
                (hash, 1 + refs[0].depth())
            }
            CellKind::Ordinary => {
                let hash = Self::repr_hash(kind, &data, bit_len, &refs);
                let depth = refs.iter().map(|r| r.depth() + 1).max().unwrap_or(0);
                (hash, depth)
            }
        };
        Ok(Arc::new(Cell {
            kind,
            data,
            bit_len,
            refs,
            hash,
            depth,
        }))
    }

    /// A pruned branch standing in for a subtree with the given hash and
    /// depth. Ancestors hash identically whether they reference the pruned
    /// branch or the subtree itself.
    pub fn pruned(hash: B256, depth: u16) -> Arc<Cell> {
        let mut data = Vec::with_capacity(36);
        data.extend_from_slice(&[PRUNED_MARKER, PRUNED_MARKER]);
        data.extend_from_slice(hash.as_slice());
        data.extend_from_slice(&depth.to_be_bytes());
        Arc::new(Cell {
            kind: CellKind::PrunedBranch,
            data,
            bit_len: PRUNED_BITS,
            refs: Vec::new(),
            hash,
            depth,
        })
    }

    /// The pruned stand-in for an existing cell.
    pub fn pruned_of(cell: &Cell) -> Arc<Cell> {
        Self::pruned(cell.hash(), cell.depth())
    }

    /// Wraps a tree in a merkle-proof cell carrying the tree's hash and
    /// depth.
    pub fn wrap_proof(inner: Arc<Cell>) -> Result<Arc<Cell>, DictError> {
        let mut data = Vec::with_capacity(35);
        data.push(PROOF_MARKER);
        data.extend_from_slice(inner.hash().as_slice());
        data.extend_from_slice(&inner.depth().to_be_bytes());
        Self::finalize(CellKind::MerkleProof, data, PROOF_BITS, vec![inner])
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn bit_len(&self) -> u16 {
        self.bit_len
    }

    pub fn refs(&self) -> &[Arc<Cell>] {
        &self.refs
    }

    pub fn reference(&self, index: usize) -> Result<&Arc<Cell>, DictError> {
        self.refs
            .get(index)
            .ok_or(DictError::MalformedCell("reference index out of bounds"))
    }

    /// The cell's reported hash: computed for ordinary and proof cells,
    /// embedded for pruned branches.
    pub fn hash(&self) -> B256 {
        self.hash
    }

    /// The cell's reported depth: 0 for childless ordinary cells, one more
    /// than the deepest child otherwise, embedded for pruned branches.
    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == CellKind::Ordinary && self.refs.is_empty()
    }

    pub fn begin_parse(&self) -> CellSlice<'_> {
        CellSlice { cell: self, pos: 0 }
    }

    /// Deterministic recursive serialization.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut Vec<u8>) {
        out.push(match self.kind {
            CellKind::Ordinary => 0,
            CellKind::PrunedBranch => PRUNED_MARKER,
            CellKind::MerkleProof => PROOF_MARKER,
        });
        out.extend_from_slice(&self.bit_len.to_be_bytes());
        out.extend_from_slice(&self.data[..self.bit_len.div_ceil(8) as usize]);
        out.push(self.refs.len() as u8);
        for r in &self.refs {
            r.write_into(out);
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Arc<Cell>, DictError> {
        let (cell, used) = Self::read_from(bytes)?;
        if used != bytes.len() {
            return Err(DictError::MalformedCell("trailing bytes"));
        }
        Ok(cell)
    }

    fn read_from(bytes: &[u8]) -> Result<(Arc<Cell>, usize), DictError> {
        let truncated = DictError::MalformedCell("truncated serialization");
        if bytes.len() < 3 {
            return Err(truncated);
        }
        let kind = match bytes[0] {
            0 => CellKind::Ordinary,
            PRUNED_MARKER => CellKind::PrunedBranch,
            PROOF_MARKER => CellKind::MerkleProof,
            _ => return Err(DictError::MalformedCell("unknown cell kind")),
        };
        let bit_len = u16::from_be_bytes([bytes[1], bytes[2]]);
        if bit_len > MAX_CELL_BITS {
            return Err(DictError::MalformedCell("bit length out of range"));
        }
        let data_len = bit_len.div_ceil(8) as usize;
        let mut pos = 3;
        if bytes.len() < pos + data_len + 1 {
            return Err(truncated);
        }
        let data = bytes[pos..pos + data_len].to_vec();
        pos += data_len;
        let ref_count = bytes[pos] as usize;
        pos += 1;
        if ref_count > MAX_CELL_REFS {
            return Err(DictError::MalformedCell("too many references"));
        }
        let mut refs = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            let (child, used) = Self::read_from(&bytes[pos..])?;
            refs.push(child);
            pos += used;
        }
        Ok((Self::finalize(kind, data, bit_len, refs)?, pos))
    }
}

/// Bit-level writer producing an ordinary cell.
#[derive(Clone, Debug, Default)]
pub struct CellBuilder {
    data: Vec<u8>,
    bit_len: u16,
    refs: Vec<Arc<Cell>>,
}

impl CellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bit_len(&self) -> u16 {
        self.bit_len
    }

    pub fn store_bit(&mut self, bit: bool) -> Result<&mut Self, DictError> {
        if self.bit_len >= MAX_CELL_BITS {
            return Err(DictError::CellOverflow {
                bits: self.bit_len as u32 + 1,
                refs: self.refs.len(),
            });
        }
        let byte = (self.bit_len / 8) as usize;
        if byte == self.data.len() {
            self.data.push(0);
        }
        if bit {
            self.data[byte] |= 0x80 >> (self.bit_len % 8);
        }
        self.bit_len += 1;
        Ok(self)
    }

    /// Stores `bits` bits of `value`, most significant first. The value
    /// must fit the width.
    pub fn store_uint(&mut self, value: u64, bits: u16) -> Result<&mut Self, DictError> {
        if bits > 64 || (bits < 64 && value >> bits != 0) {
            return Err(DictError::BitRange {
                start: 0,
                count: bits as u32,
                width: 64,
            });
        }
        for i in 0..bits {
            self.store_bit(value >> (bits - 1 - i) & 1 == 1)?;
        }
        Ok(self)
    }

    /// Stores up to 256 bits of a wide value, most significant first.
    pub fn store_uint_wide(&mut self, value: U256, bits: u16) -> Result<&mut Self, DictError> {
        if bits > 256 || (bits < 256 && value >> bits as usize != U256::ZERO) {
            return Err(DictError::BitRange {
                start: 0,
                count: bits as u32,
                width: 256,
            });
        }
        for i in 0..bits {
            self.store_bit(value.bit((bits - 1 - i) as usize))?;
        }
        Ok(self)
    }

    /// Stores a coin amount as a VarUInteger: a 4-bit byte count followed
    /// by that many big-endian bytes.
    pub fn store_coins(&mut self, amount: u128) -> Result<&mut Self, DictError> {
        let byte_len = ((128 - amount.leading_zeros()) as usize).div_ceil(8);
        if byte_len > crate::constant::MAX_COIN_BYTES {
            return Err(DictError::BitRange {
                start: 0,
                count: byte_len as u32 * 8,
                width: crate::constant::MAX_COIN_BYTES as u32 * 8,
            });
        }
        self.store_uint(byte_len as u64, crate::constant::COIN_LEN_BITS)?;
        let bytes = amount.to_be_bytes();
        for b in &bytes[16 - byte_len..] {
            self.store_uint(*b as u64, 8)?;
        }
        Ok(self)
    }

    /// Copies the remaining bits of a slice.
    pub fn store_remaining(&mut self, slice: &mut CellSlice<'_>) -> Result<&mut Self, DictError> {
        while slice.remaining_bits() > 0 {
            let bit = slice.load_bit()?;
            self.store_bit(bit)?;
        }
        Ok(self)
    }

    pub fn store_ref(&mut self, cell: Arc<Cell>) -> Result<&mut Self, DictError> {
        if self.refs.len() >= MAX_CELL_REFS {
            return Err(DictError::CellOverflow {
                bits: self.bit_len as u32,
                refs: self.refs.len() + 1,
            });
        }
        self.refs.push(cell);
        Ok(self)
    }

    pub fn finish(self) -> Result<Arc<Cell>, DictError> {
        Cell::finalize(CellKind::Ordinary, self.data, self.bit_len, self.refs)
    }
}

/// Bit-level reader over a cell's data.
#[derive(Debug)]
pub struct CellSlice<'a> {
    cell: &'a Cell,
    pos: u16,
}

impl CellSlice<'_> {
    pub fn remaining_bits(&self) -> u16 {
        self.cell.bit_len - self.pos
    }

    pub fn load_bit(&mut self) -> Result<bool, DictError> {
        if self.pos >= self.cell.bit_len {
            return Err(DictError::MalformedCell("read past end of cell data"));
        }
        let bit = (self.cell.data[self.pos as usize / 8] >> (7 - self.pos % 8)) & 1 == 1;
        self.pos += 1;
        Ok(bit)
    }

    pub fn load_uint(&mut self, bits: u16) -> Result<u64, DictError> {
        if bits > 64 {
            return Err(DictError::BitRange {
                start: self.pos as u32,
                count: bits as u32,
                width: 64,
            });
        }
        let mut acc = 0u64;
        for _ in 0..bits {
            acc = (acc << 1) | self.load_bit()? as u64;
        }
        Ok(acc)
    }

    pub fn load_uint_wide(&mut self, bits: u16) -> Result<U256, DictError> {
        if bits > 256 {
            return Err(DictError::BitRange {
                start: self.pos as u32,
                count: bits as u32,
                width: 256,
            });
        }
        let mut acc = U256::ZERO;
        for _ in 0..bits {
            acc = (acc << 1) | U256::from(self.load_bit()? as u8);
        }
        Ok(acc)
    }

    pub fn load_coins(&mut self) -> Result<u128, DictError> {
        let byte_len = self.load_uint(crate::constant::COIN_LEN_BITS)?;
        let mut acc = 0u128;
        for _ in 0..byte_len {
            acc = (acc << 8) | self.load_uint(8)? as u128;
        }
        Ok(acc)
    }

    pub fn refs(&self) -> &[Arc<Cell>] {
        &self.cell.refs
    }
}

/// Builds a fork cell: an edge label followed by left and right children.
/// `key_len` is the keyspace remaining at the fork's own position.
pub fn make_fork(
    label: &Label,
    key_len: u16,
    left: Arc<Cell>,
    right: Arc<Cell>,
) -> Result<Arc<Cell>, DictError> {
    let mut b = CellBuilder::new();
    store_label(&mut b, label, key_len)?;
    b.store_ref(left)?;
    b.store_ref(right)?;
    b.finish()
}

/// Builds the dictionary root fork. Its label is the schema bits followed
/// by the `shared_len` key bits common to the whole dataset, spanning the
/// extended keyspace. Root labels are never uniform and always longer than
/// their length field, so the long encoding is the minimal one.
pub fn make_root_fork(
    shared: U256,
    shared_len: u16,
    left: Arc<Cell>,
    right: Arc<Cell>,
) -> Result<Arc<Cell>, DictError> {
    let mut b = CellBuilder::new();
    store_root_label(&mut b, shared, shared_len)?;
    b.store_ref(left)?;
    b.store_ref(right)?;
    b.finish()
}

/// Long-form label of `ROOT_LABEL_LEN + shared_len` bits over the extended
/// keyspace. Written directly because the joined bit string can exceed a
/// wide integer.
fn store_root_label(b: &mut CellBuilder, shared: U256, shared_len: u16) -> Result<(), DictError> {
    let len = ROOT_LABEL_LEN + shared_len;
    b.store_uint(0b10, 2)?;
    b.store_uint(len as u64, len_bits(FULL_KEY_BITS))?;
    b.store_uint(ROOT_LABEL_BITS, ROOT_LABEL_LEN)?;
    b.store_uint_wide(shared, shared_len)?;
    Ok(())
}

/// Appends the claim payload: the amount as coins, then the claim window.
pub fn store_claim(
    b: &mut CellBuilder,
    amount: u128,
    start: u64,
    end: u64,
) -> Result<(), DictError> {
    b.store_coins(amount)?;
    b.store_uint(start, crate::constant::CLAIM_TIME_BITS)?;
    b.store_uint(end, crate::constant::CLAIM_TIME_BITS)?;
    Ok(())
}

/// Rewrites a node rooted at `prefix` into the dictionary root cell: the
/// schema label and the node's own prefix are prepended to its label, and
/// its payload bits and references are carried over. Used when the whole
/// dataset lives under a single node.
pub fn extend_to_root(
    cell: &Cell,
    prefix: Prefix,
    prefix_len: u16,
) -> Result<Arc<Cell>, DictError> {
    if cell.kind() != CellKind::Ordinary {
        return Err(DictError::MalformedCell("cannot extend a pruned node"));
    }
    let mut s = cell.begin_parse();
    let inner = read_label(&mut s, crate::constant::KEY_BITS - prefix_len)?;
    let joined = (prefix.to_wide() << inner.len as usize) | inner.bits;
    let mut b = CellBuilder::new();
    store_root_label(&mut b, joined, prefix_len + inner.len)?;
    b.store_remaining(&mut s)?;
    for r in cell.refs() {
        b.store_ref(r.clone())?;
    }
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(payload: u64) -> Arc<Cell> {
        let mut b = CellBuilder::new();
        b.store_uint(payload, 32).unwrap();
        b.finish().unwrap()
    }

    #[test]
    fn builder_slice_round_trip() {
        let mut b = CellBuilder::new();
        b.store_bit(true).unwrap();
        b.store_uint(0xDEAD, 16).unwrap();
        b.store_uint_wide(U256::from(0xBEEFu32), 20).unwrap();
        b.store_coins(1_000_000).unwrap();
        let cell = b.finish().unwrap();

        let mut s = cell.begin_parse();
        assert!(s.load_bit().unwrap());
        assert_eq!(s.load_uint(16).unwrap(), 0xDEAD);
        assert_eq!(s.load_uint_wide(20).unwrap(), U256::from(0xBEEFu32));
        assert_eq!(s.load_coins().unwrap(), 1_000_000);
        assert_eq!(s.remaining_bits(), 0);
        assert!(s.load_bit().is_err());
    }

    #[test]
    fn store_uint_rejects_oversized_values() {
        let mut b = CellBuilder::new();
        assert!(b.store_uint(4, 2).is_err());
        assert!(b.store_uint(3, 2).is_ok());
    }

    #[test]
    fn zero_coins_take_only_the_length_field() {
        let mut b = CellBuilder::new();
        b.store_coins(0).unwrap();
        let cell = b.finish().unwrap();
        assert_eq!(cell.bit_len(), 4);
        assert_eq!(cell.begin_parse().load_coins().unwrap(), 0);
    }

    /// Depth is 0 for childless cells and one more than the deepest child.
    #[test]
    fn depth_tracks_children() {
        let l = leaf(1);
        assert_eq!(l.depth(), 0);
        let mut b = CellBuilder::new();
        b.store_ref(l.clone()).unwrap();
        let mid = b.finish().unwrap();
        assert_eq!(mid.depth(), 1);
        let mut b = CellBuilder::new();
        b.store_ref(l).unwrap();
        b.store_ref(mid).unwrap();
        assert_eq!(b.finish().unwrap().depth(), 2);
    }

    /// Replacing a child with its pruned branch must not change the parent
    /// hash, and expanding it back must reproduce the original.
    #[test]
    fn pruning_preserves_ancestor_hashes() {
        let l = leaf(1);
        let r = leaf(2);
        let mut b = CellBuilder::new();
        b.store_uint(0b101, 3).unwrap();
        b.store_ref(l.clone()).unwrap();
        b.store_ref(r.clone()).unwrap();
        let parent = b.finish().unwrap();

        let mut b = CellBuilder::new();
        b.store_uint(0b101, 3).unwrap();
        b.store_ref(Cell::pruned_of(&l)).unwrap();
        b.store_ref(Cell::pruned_of(&r)).unwrap();
        let pruned_parent = b.finish().unwrap();

        assert_eq!(parent.hash(), pruned_parent.hash());
        assert_eq!(parent.depth(), pruned_parent.depth());
    }

    #[test]
    fn pruned_branch_reports_embedded_values() {
        let l = leaf(9);
        let p = Cell::pruned_of(&l);
        assert_eq!(p.kind(), CellKind::PrunedBranch);
        assert_eq!(p.hash(), l.hash());
        assert_eq!(p.depth(), l.depth());
        // but its own canonical bytes differ from the leaf's
        assert_ne!(p.to_bytes(), l.to_bytes());
    }

    #[test]
    fn completion_tag_distinguishes_bit_lengths() {
        let mut b = CellBuilder::new();
        b.store_uint(0, 3).unwrap();
        let three = b.finish().unwrap();
        let mut b = CellBuilder::new();
        b.store_uint(0, 4).unwrap();
        let four = b.finish().unwrap();
        assert_ne!(three.hash(), four.hash());
    }

    #[test]
    fn proof_wrapper_carries_inner_hash() {
        let inner = leaf(3);
        let wrapped = Cell::wrap_proof(inner.clone()).unwrap();
        assert_eq!(wrapped.kind(), CellKind::MerkleProof);
        assert_eq!(wrapped.reference(0).unwrap().hash(), inner.hash());
        assert_eq!(wrapped.depth(), 1);
    }

    #[test]
    fn serialization_round_trip() {
        let l = leaf(1);
        let mut b = CellBuilder::new();
        b.store_uint(0xAB, 11).unwrap();
        b.store_ref(l.clone()).unwrap();
        b.store_ref(Cell::pruned_of(&l)).unwrap();
        let cell = b.finish().unwrap();

        let restored = Cell::from_bytes(&cell.to_bytes()).unwrap();
        assert_eq!(restored.hash(), cell.hash());
        assert_eq!(restored.depth(), cell.depth());
        assert_eq!(restored.refs().len(), 2);
        assert_eq!(restored.refs()[1].kind(), CellKind::PrunedBranch);
    }

    #[test]
    fn from_bytes_rejects_garbage() {
        assert!(Cell::from_bytes(&[]).is_err());
        assert!(Cell::from_bytes(&[9, 0, 0, 0]).is_err());
        let cell = leaf(4);
        let mut bytes = cell.to_bytes();
        bytes.push(0);
        assert!(matches!(
            Cell::from_bytes(&bytes),
            Err(DictError::MalformedCell("trailing bytes"))
        ));
    }
}
