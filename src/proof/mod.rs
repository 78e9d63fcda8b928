//! Inclusion proof assembly and verification against a published root.

pub mod subtrie;

use crate::{
    bits::key_bits,
    cell::{label::Label, make_fork, make_root_fork, Cell},
    constant::KEY_BITS,
    traits::CommitmentStore,
    types::{BranchRecord, ClaimKey, DictError, TopRecord},
};
use alloy_primitives::{B256, U256};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::{fmt::Debug, sync::Arc};
use subtrie::build_proof_from_subtree;
use thiserror::Error;

/// Errors raised while assembling or verifying proofs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
    /// A requested key is not part of the committed dataset: either it has
    /// no recorded fork path at all, or it could not be located while
    /// descending a subtree.
    #[error("key doesn't match any leaf in the dictionary")]
    KeyMismatch,

    /// The assembled proof does not reproduce the published root hash.
    #[error("proof root {actual} does not match the published root {expected}")]
    ProofIntegrity { expected: B256, actual: B256 },

    /// A fork-path sibling has no branch commitment.
    #[error("no branch commitment for prefix {prefix:#x} at length {len}")]
    MissingBranch { prefix: U256, len: u16 },

    #[error("prove failed: {0}")]
    ProveFailed(String),
}

impl From<DictError> for ProofError {
    fn from(e: DictError) -> Self {
        ProofError::ProveFailed(e.to_string())
    }
}

fn store_err<E: Debug>(e: E) -> ProofError {
    ProofError::ProveFailed(format!("{e:?}"))
}

/// Assembles inclusion proofs from persisted top subtrees and branch
/// commitments, verifying each against the published root hash.
#[derive(Debug)]
pub struct ProofGenerator<'a, S> {
    store: &'a S,
    root_hash: B256,
    branches: FxHashMap<(u16, U256), BranchRecord>,
}

impl<'a, S: CommitmentStore> ProofGenerator<'a, S> {
    /// Loads the branch commitment cache up front; lookups during
    /// assembly never touch storage again.
    pub fn new(store: &'a S, root_hash: B256) -> Result<Self, ProofError> {
        let branches = store.branches().map_err(store_err)?;
        Ok(Self {
            store,
            root_hash,
            branches,
        })
    }

    /// Builds and verifies the proof for a single key.
    pub fn prove(&self, key: ClaimKey) -> Result<Arc<Cell>, ProofError> {
        let record = self
            .store
            .fork_path(key)
            .map_err(store_err)?
            .ok_or(ProofError::KeyMismatch)?;
        let top = Cell::from_bytes(&record.top)?;
        self.assemble(key, &record.path, record.top_len, &top)
    }

    /// Builds and verifies proofs for every member key of one top
    /// subtree, sharing the branch lookups above the frontier.
    pub fn prove_top(&self, record: &TopRecord) -> Result<Vec<(ClaimKey, Arc<Cell>)>, ProofError> {
        let top = Cell::from_bytes(&record.subtree)?;
        let keys = subtrie::collect_leaf_keys(&top, record.prefix, record.prefix_len)?;
        keys.into_iter()
            .map(|key| {
                let proof = self.assemble(key, &record.path, record.prefix_len, &top)?;
                Ok((key, proof))
            })
            .collect()
    }

    /// Batch variant of [`Self::prove_top`] over many top records.
    pub fn prove_batch(
        &self,
        records: &[TopRecord],
    ) -> Result<Vec<(ClaimKey, Arc<Cell>)>, ProofError> {
        let per_top: Vec<Vec<(ClaimKey, Arc<Cell>)>> = records
            .par_iter()
            .map(|r| self.prove_top(r))
            .collect::<Result<_, _>>()?;
        Ok(per_top.into_iter().flatten().collect())
    }

    /// The pruned commitment of the branch at `(prefix, len)`.
    fn sibling(&self, prefix: U256, len: u16) -> Result<Arc<Cell>, ProofError> {
        let record = self
            .branches
            .get(&(len, prefix))
            .ok_or(ProofError::MissingBranch { prefix, len })?;
        Ok(Cell::pruned(record.hash, record.depth))
    }

    /// Walks the fork path bottom-up: the restricted top is paired with
    /// its sibling at each recorded level and wrapped in the fork cell
    /// whose label spans the key bits between levels, finishing with the
    /// schema-labeled root fork and the merkle-proof wrapper.
    fn assemble(
        &self,
        key: ClaimKey,
        path: &[u16],
        top_len: u16,
        top: &Arc<Cell>,
    ) -> Result<Arc<Cell>, ProofError> {
        let k = key.to_wide();
        let root = if path.is_empty() {
            // the whole dataset sits under one aligned top; restrict it
            // to the requested key before re-labeling it as the root
            let restricted =
                build_proof_from_subtree(top, k >> (KEY_BITS - top_len) as usize, top_len, &[k])?;
            crate::cell::extend_to_root(&restricted, key.prefix(top_len), top_len)?
        } else {
            let deepest = path[path.len() - 1];
            let mut child_len = deepest;
            let mut cur =
                build_proof_from_subtree(top, k >> (KEY_BITS - deepest) as usize, deepest, &[k])?;
            for i in (0..path.len() - 1).rev() {
                let node_len = path[i];
                let (l, r) = self.pair(k, child_len, cur)?;
                let label_len = child_len - node_len - 1;
                let label = Label::new(key_bits(k, node_len, label_len), label_len);
                cur = make_fork(&label, KEY_BITS - node_len, l, r)?;
                child_len = node_len;
            }
            let (l, r) = self.pair(k, child_len, cur)?;
            make_root_fork(key_bits(k, 0, child_len - 1), child_len - 1, l, r)?
        };
        let proof = Cell::wrap_proof(root)?;
        let actual = proof.reference(0)?.hash();
        if actual != self.root_hash {
            return Err(ProofError::ProofIntegrity {
                expected: self.root_hash,
                actual,
            });
        }
        Ok(proof)
    }

    /// Orders the current cell and its sibling at `len` into left/right
    /// position by the key's branch bit.
    fn pair(
        &self,
        key: U256,
        len: u16,
        cur: Arc<Cell>,
    ) -> Result<(Arc<Cell>, Arc<Cell>), ProofError> {
        let prefix = key >> (KEY_BITS - len) as usize;
        let sibling = self.sibling(prefix ^ U256::from(1u8), len)?;
        if prefix.bit(0) {
            Ok((sibling, cur))
        } else {
            Ok((cur, sibling))
        }
    }
}
