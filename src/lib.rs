#![doc = include_str!("../README.md")]

pub mod bits;
pub mod cell;
pub mod constant;
pub mod mem_store;
pub mod proof;
pub mod session;
pub mod traits;
pub mod trie;
pub mod types;

pub use cell::{Cell, CellBuilder, CellKind, CellSlice};
pub use mem_store::MemStore;
pub use proof::{ProofError, ProofGenerator};
pub use session::Session;
pub use traits::{ClusterSource, CommitmentStore};
pub use trie::{
    builder::{BuildConfig, BuildEvent, BuildSink, ClusterProcessor, SubtreeRoot},
    scheduler::{BuildOutcome, BuildParams, BuildScheduler},
};
pub use types::{
    BranchRecord, ClaimKey, ClusterEntry, DictError, ForkPath, Prefix, PrefixCluster, TopRecord,
};

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{B256, U256};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn materialized_leaves(cell: &Cell) -> usize {
        if cell.kind() == CellKind::Ordinary && cell.refs().is_empty() {
            return 1;
        }
        cell.refs().iter().map(|c| materialized_leaves(c)).sum()
    }

    fn seeded_store(n: usize, seed: u64) -> (MemStore, Vec<ClaimKey>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let store = MemStore::new();
        let mut keys = Vec::with_capacity(n);
        for _ in 0..n {
            let bytes: [u8; 32] = rng.gen();
            let key = ClaimKey(B256::from(bytes));
            store.insert_claim(key, rng.gen_range(1..1u128 << 64));
            keys.push(key);
        }
        (store, keys)
    }

    fn params() -> BuildParams {
        BuildParams {
            claim_start: 1_700_000_000,
            claim_end: 1_800_000_000,
            per_worker_bits: 3,
            workers: 4,
            page_size: 7,
            ..Default::default()
        }
    }

    /// Full pipeline: build the dictionary over a random dataset, confirm
    /// the root is schedule-independent, then prove and verify every key.
    #[test]
    fn build_prove_verify_round_trip() {
        let (store, keys) = seeded_store(200, 42);
        let outcome = BuildScheduler::new(&store, params()).run().unwrap();

        let serial = BuildScheduler::new(
            &store,
            BuildParams {
                workers: 1,
                page_size: 1_000,
                ..params()
            },
        )
        .run()
        .unwrap();
        assert_eq!(outcome.root_hash, serial.root_hash);

        let prover = ProofGenerator::new(&store, outcome.root_hash).unwrap();
        for key in &keys {
            let proof = prover.prove(*key).unwrap();
            assert_eq!(proof.kind(), CellKind::MerkleProof);
            assert_eq!(proof.reference(0).unwrap().hash(), outcome.root_hash);
        }

        let absent = ClaimKey(B256::repeat_byte(0xEE));
        assert!(matches!(
            prover.prove(absent),
            Err(ProofError::KeyMismatch)
        ));

        let tampered = ProofGenerator::new(&store, B256::repeat_byte(1)).unwrap();
        assert!(matches!(
            tampered.prove(keys[0]),
            Err(ProofError::ProofIntegrity { .. })
        ));
    }

    /// When every key lives under one aligned top, a proof must still be
    /// restricted to the requested key instead of shipping every leaf.
    #[test]
    fn aligned_dataset_proofs_stay_minimal() {
        let store = MemStore::new();
        let keys: Vec<ClaimKey> = (0u8..4)
            .map(|i| ClaimKey::from_wide(U256::from(0xA0u8 | (i << 2)) << 248))
            .collect();
        for (i, key) in keys.iter().enumerate() {
            store.insert_claim(*key, (i + 1) as u128);
        }
        let outcome = BuildScheduler::new(&store, params()).run().unwrap();
        let prover = ProofGenerator::new(&store, outcome.root_hash).unwrap();
        for key in &keys {
            let proof = prover.prove(*key).unwrap();
            assert_eq!(proof.reference(0).unwrap().hash(), outcome.root_hash);
            assert_eq!(materialized_leaves(&proof), 1);
        }
    }

    /// Batch proving over the stored tops covers exactly the dataset.
    #[test]
    fn batch_proofs_cover_every_key() {
        let (store, mut keys) = seeded_store(50, 9);
        let outcome = BuildScheduler::new(&store, params()).run().unwrap();
        let prover = ProofGenerator::new(&store, outcome.root_hash).unwrap();

        let tops = store.tops(0, u64::MAX).unwrap();
        let proofs = prover.prove_batch(&tops).unwrap();

        let mut proved: Vec<ClaimKey> = proofs.iter().map(|(k, _)| *k).collect();
        proved.sort();
        keys.sort();
        keys.dedup();
        assert_eq!(proved, keys);
        for (_, proof) in &proofs {
            assert_eq!(proof.reference(0).unwrap().hash(), outcome.root_hash);
        }
    }
}
