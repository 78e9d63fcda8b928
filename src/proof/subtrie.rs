//! Walkers over materialized subtrees: leaf-key enumeration and
//! restriction of a subtree to a target key set.

use super::ProofError;
use crate::{
    bits::key_bits,
    cell::{label::read_label, label::store_label, Cell, CellBuilder, CellKind},
    constant::KEY_BITS,
    types::{ClaimKey, Prefix},
};
use alloy_primitives::U256;
use std::sync::Arc;

/// Enumerates the full keys of every leaf under a subtree rooted at
/// `prefix`. Pruned children are skipped.
pub fn collect_leaf_keys(
    cell: &Arc<Cell>,
    prefix: Prefix,
    prefix_len: u16,
) -> Result<Vec<ClaimKey>, ProofError> {
    let mut out = Vec::new();
    collect(cell, prefix.to_wide(), prefix_len, &mut out)?;
    Ok(out)
}

fn collect(
    cell: &Arc<Cell>,
    prefix: U256,
    prefix_len: u16,
    out: &mut Vec<ClaimKey>,
) -> Result<(), ProofError> {
    if cell.kind() != CellKind::Ordinary {
        return Ok(());
    }
    let mut s = cell.begin_parse();
    let label = read_label(&mut s, KEY_BITS - prefix_len)?;
    let prefix = (prefix << label.len as usize) | label.bits;
    let prefix_len = prefix_len + label.len;
    if prefix_len == KEY_BITS {
        out.push(ClaimKey::from_wide(prefix));
        return Ok(());
    }
    for (i, child) in cell.refs().iter().enumerate() {
        collect(
            child,
            (prefix << 1) | U256::from(i as u8),
            prefix_len + 1,
            out,
        )?;
    }
    Ok(())
}

/// Restricts a materialized subtree to `targets` (full key values): every
/// branch not on a target's path is replaced by its pruned commitment,
/// leaving hashes intact. Fails with [`ProofError::KeyMismatch`] when a
/// target cannot be located.
pub fn build_proof_from_subtree(
    cell: &Arc<Cell>,
    prefix: U256,
    prefix_len: u16,
    targets: &[U256],
) -> Result<Arc<Cell>, ProofError> {
    if targets.is_empty() {
        return Ok(Cell::pruned_of(cell));
    }
    if cell.kind() != CellKind::Ordinary {
        // a target leads into a region this subtree does not materialize
        return Err(ProofError::KeyMismatch);
    }
    let mut s = cell.begin_parse();
    let label = read_label(&mut s, KEY_BITS - prefix_len)?;
    for t in targets {
        if key_bits(*t, prefix_len, label.len) != label.bits {
            return Err(ProofError::KeyMismatch);
        }
    }
    let prefix = (prefix << label.len as usize) | label.bits;
    let prefix_len = prefix_len + label.len;

    if prefix_len == KEY_BITS {
        if targets.iter().any(|t| *t != prefix) {
            return Err(ProofError::KeyMismatch);
        }
        return Ok(cell.clone());
    }

    let (left_targets, right_targets): (Vec<U256>, Vec<U256>) = targets
        .iter()
        .partition(|t| !t.bit((KEY_BITS - 1 - prefix_len) as usize));
    if cell.refs().len() != 2 {
        return Err(ProofError::KeyMismatch);
    }

    let mut b = CellBuilder::new();
    store_label(&mut b, &label, KEY_BITS - (prefix_len - label.len))?;
    b.store_ref(build_proof_from_subtree(
        &cell.refs()[0],
        prefix << 1,
        prefix_len + 1,
        &left_targets,
    )?)?;
    b.store_ref(build_proof_from_subtree(
        &cell.refs()[1],
        (prefix << 1) | U256::from(1u8),
        prefix_len + 1,
        &right_targets,
    )?)?;
    Ok(b.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{label::Label, make_fork, store_claim};

    /// Two leaves under one fork at prefix length 1.
    fn tiny_subtree() -> (Arc<Cell>, ClaimKey, ClaimKey) {
        // keys 0b0... and 0b1... with all remaining bits zero except the
        // second bit of the right key
        let left_key = ClaimKey::from_wide(U256::ZERO);
        let right_key = ClaimKey::from_wide(U256::from(3u8) << 254);

        let mut b = CellBuilder::new();
        store_label(&mut b, &Label::new(U256::ZERO, 255), KEY_BITS - 1).unwrap();
        store_claim(&mut b, 10, 0, 0).unwrap();
        let left = b.finish().unwrap();

        let mut b = CellBuilder::new();
        store_label(
            &mut b,
            &Label::new((U256::from(1u8) << 254) | U256::ZERO, 255),
            KEY_BITS - 1,
        )
        .unwrap();
        store_claim(&mut b, 20, 0, 0).unwrap();
        let right = b.finish().unwrap();

        let fork = make_fork(&Label::EMPTY, KEY_BITS, left, right).unwrap();
        (fork, left_key, right_key)
    }

    #[test]
    fn collects_all_leaf_keys() {
        let (fork, lk, rk) = tiny_subtree();
        let keys = collect_leaf_keys(&fork, Prefix::ZERO, 0).unwrap();
        assert_eq!(keys, vec![lk, rk]);
    }

    #[test]
    fn pruned_children_are_skipped() {
        let (fork, _, rk) = tiny_subtree();
        let restricted = build_proof_from_subtree(&fork, U256::ZERO, 0, &[rk.to_wide()]).unwrap();
        let keys = collect_leaf_keys(&restricted, Prefix::ZERO, 0).unwrap();
        assert_eq!(keys, vec![rk]);
    }

    /// Restriction preserves the subtree hash while dropping the other
    /// side's materialization.
    #[test]
    fn restriction_keeps_hash() {
        let (fork, lk, _) = tiny_subtree();
        let restricted = build_proof_from_subtree(&fork, U256::ZERO, 0, &[lk.to_wide()]).unwrap();
        assert_eq!(restricted.hash(), fork.hash());
        assert_eq!(restricted.refs()[1].kind(), CellKind::PrunedBranch);
        assert_eq!(restricted.refs()[0].kind(), CellKind::Ordinary);
    }

    #[test]
    fn absent_target_is_a_mismatch() {
        let (fork, _, _) = tiny_subtree();
        let absent = U256::from(1u8) << 254; // 0b01... never inserted
        assert!(matches!(
            build_proof_from_subtree(&fork, U256::ZERO, 0, &[absent]),
            Err(ProofError::KeyMismatch)
        ));
    }
}
