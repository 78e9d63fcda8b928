//! Canonical subtree construction for prefix clusters.
//!
//! A construction worker feeds prefix clusters to a [`ClusterProcessor`]
//! and collects the resulting subtree roots plus the side-channel
//! [`BuildEvent`]s. The processor never touches storage: the coordinator
//! applies events after the round, which keeps workers stateless and
//! persistence single-writer.

use crate::{
    bits,
    cell::{
        label::{store_label, Label},
        make_fork, store_claim, Cell, CellBuilder,
    },
    constant::{KEY_BITS, WINDOW_BITS},
    types::{
        BranchRecord, ClaimKey, ClusterEntry, DictError, Prefix, PrefixCluster, TopRecord,
    },
};
use alloy_primitives::U256;
use std::sync::Arc;

/// Receiver for commitments produced while a subtree is built.
pub trait BuildSink {
    /// A node at or above the frontier, reported by hash and depth.
    fn commit_branch(&mut self, prefix: Prefix, prefix_len: u16, record: BranchRecord);
    /// A fully materialized subtree crossing the frontier, together with
    /// the fork path above it and its member keys.
    fn commit_top(&mut self, record: TopRecord, member_keys: Vec<ClaimKey>);
}

/// Build commitments collected by workers and applied to storage by the
/// coordinator.
#[derive(Clone, Debug)]
pub enum BuildEvent {
    Branch {
        prefix: Prefix,
        prefix_len: u16,
        record: BranchRecord,
    },
    Top {
        record: TopRecord,
        member_keys: Vec<ClaimKey>,
    },
}

impl BuildSink for Vec<BuildEvent> {
    fn commit_branch(&mut self, prefix: Prefix, prefix_len: u16, record: BranchRecord) {
        self.push(BuildEvent::Branch {
            prefix,
            prefix_len,
            record,
        });
    }

    fn commit_top(&mut self, record: TopRecord, member_keys: Vec<ClaimKey>) {
        self.push(BuildEvent::Top {
            record,
            member_keys,
        });
    }
}

/// Construction parameters shared by every worker.
#[derive(Clone, Copy, Debug)]
pub struct BuildConfig {
    /// Claim window start, baked into every leaf payload.
    pub claim_start: u64,
    /// Claim window end.
    pub claim_end: u64,
    /// Frontier depth D.
    pub store_depth: u16,
}

/// The root of a processed cluster. The cell is ordinary at its own
/// level; its subtree is materialized only when the cluster crossed the
/// frontier.
#[derive(Clone, Debug)]
pub struct SubtreeRoot {
    pub prefix: Prefix,
    pub prefix_len: u16,
    pub cell: Arc<Cell>,
}

/// Builds canonical subtrees for prefix clusters.
#[derive(Debug)]
pub struct ClusterProcessor<'a, S: BuildSink> {
    config: BuildConfig,
    sink: &'a mut S,
}

impl<'a, S: BuildSink> ClusterProcessor<'a, S> {
    pub fn new(config: BuildConfig, sink: &'a mut S) -> Self {
        Self { config, sink }
    }

    pub fn process(&mut self, cluster: PrefixCluster) -> Result<SubtreeRoot, DictError> {
        let PrefixCluster {
            prefix,
            prefix_len,
            entries,
        } = cluster;
        let cell = self.node(prefix, prefix_len, entries, false)?;
        Ok(SubtreeRoot {
            prefix,
            prefix_len,
            cell,
        })
    }

    /// The label below this node: the common run of the member windows,
    /// extended across the suffix buffers when the windows are exhausted.
    fn find_label(
        &self,
        prefix_len: u16,
        entries: &[ClusterEntry],
    ) -> Result<Label, DictError> {
        let word_off = prefix_len % WINDOW_BITS;
        let key_remaining = KEY_BITS - prefix_len;
        let run = if entries.len() > 1 {
            bits::common_run(entries.iter().map(|e| e.window))
        } else {
            WINDOW_BITS
        };
        if run < WINDOW_BITS {
            let value = if run == 0 {
                0
            } else {
                entries[0].window >> (WINDOW_BITS - run)
            };
            return Ok(Label::from_word(value, run - word_off));
        }
        // windows identical: the label spans the word remainder plus the
        // common run of the suffixes
        let window_rest = key_remaining.min(WINDOW_BITS - word_off);
        let suffix_bits = entries[0].suffix.len() * 8;
        let suffix_run = if entries.len() > 1 {
            bits::common_run_bytes(entries.iter().map(|e| e.suffix.as_slice()), suffix_bits)
        } else {
            suffix_bits
        };
        let suffix_value = bits::extract_bits_wide(&entries[0].suffix, 0, suffix_run)?;
        Ok(Label::new(
            (U256::from(entries[0].window) << suffix_run) | suffix_value,
            window_rest + suffix_run as u16,
        ))
    }

    /// Builds the node covering `entries` below `(prefix, prefix_len)`.
    /// The returned cell is always ordinary at its own level; children are
    /// replaced by their pruned commitments once reported, unless this
    /// node crosses the frontier and must materialize its whole subtree so
    /// it can be serialized as a top.
    fn node(
        &mut self,
        prefix: Prefix,
        prefix_len: u16,
        entries: Vec<ClusterEntry>,
        materialize: bool,
    ) -> Result<Arc<Cell>, DictError> {
        if entries.is_empty() {
            return Err(DictError::EmptyCluster { len: prefix_len });
        }
        let depth_limit = self.config.store_depth;
        let word_off = prefix_len % WINDOW_BITS;
        let key_remaining = KEY_BITS - prefix_len;
        let label = self.find_label(prefix_len, &entries)?;
        let next_len = prefix_len + label.len + 1;
        let is_fork = label.len < key_remaining;
        if !is_fork && entries.len() > 1 {
            return Err(DictError::StructuralInconsistency(
                "duplicate keys in cluster",
            ));
        }

        let expect_top = prefix_len < depth_limit && next_len >= depth_limit;
        let top_info = (prefix_len < depth_limit).then(|| {
            (
                entries[0].path.clone(),
                expect_top.then(|| {
                    entries
                        .iter()
                        .map(|e| e.full_key(prefix, prefix_len))
                        .collect::<Vec<_>>()
                }),
            )
        });

        let cell = if is_fork {
            let mut left = Vec::new();
            let mut right = Vec::new();
            for entry in &entries {
                let (bit, mut advanced) = entry.advance(word_off, label.len)?;
                if next_len < depth_limit {
                    advanced.path.push(next_len);
                }
                if bit {
                    right.push(advanced);
                } else {
                    left.push(advanced);
                }
            }
            if left.is_empty() || right.is_empty() {
                return Err(DictError::StructuralInconsistency(
                    "fork with a single child",
                ));
            }
            let base = prefix.push(label.bits, label.len, prefix_len + label.len)?;
            let child_materialize = materialize || expect_top;
            let left_cell =
                self.node(base.push_bit(false, next_len)?, next_len, left, child_materialize)?;
            let right_cell =
                self.node(base.push_bit(true, next_len)?, next_len, right, child_materialize)?;
            let (left_cell, right_cell) = if child_materialize {
                (left_cell, right_cell)
            } else {
                (Cell::pruned_of(&left_cell), Cell::pruned_of(&right_cell))
            };
            make_fork(&label, key_remaining, left_cell, right_cell)?
        } else {
            let mut b = CellBuilder::new();
            store_label(&mut b, &label, key_remaining)?;
            store_claim(
                &mut b,
                entries[0].amount,
                self.config.claim_start,
                self.config.claim_end,
            )?;
            b.finish()?
        };

        if let Some((path, member_keys)) = top_info {
            if let Some(member_keys) = member_keys {
                self.sink.commit_top(
                    TopRecord {
                        prefix,
                        prefix_len,
                        path,
                        subtree: cell.to_bytes(),
                    },
                    member_keys,
                );
            }
            self.sink.commit_branch(
                prefix,
                prefix_len,
                BranchRecord {
                    depth: cell.depth(),
                    hash: cell.hash(),
                },
            );
        }

        Ok(cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cell::CellKind,
        mem_store::MemStore,
        traits::ClusterSource,
    };

    fn config(store_depth: u16) -> BuildConfig {
        BuildConfig {
            claim_start: 1000,
            claim_end: 2000,
            store_depth,
        }
    }

    fn key(top: u8) -> ClaimKey {
        ClaimKey::from_wide(U256::from(top) << 248)
    }

    /// Loads the whole dataset as a single cluster at prefix length 1 per
    /// side by fetching from a MemStore.
    fn clusters_at(store: &MemStore, len: u16) -> Vec<PrefixCluster> {
        store.clusters(len, 0, u64::MAX).unwrap()
    }

    /// Four keys splitting at bits 0 and 1, frontier at depth 2: each
    /// cluster root crosses the frontier and becomes a two-member top.
    #[test]
    fn four_key_shape() {
        let store = MemStore::load([
            (key(0b0000_0000), 1),
            (key(0b0100_0000), 2),
            (key(0b1000_0000), 3),
            (key(0b1100_0000), 4),
        ]);
        let mut events = Vec::new();
        let mut processor = ClusterProcessor::new(config(2), &mut events);
        let roots: Vec<SubtreeRoot> = clusters_at(&store, 1)
            .into_iter()
            .map(|c| processor.process(c).unwrap())
            .collect();
        assert_eq!(roots.len(), 2);
        // both halves fork once more at bit 1 and cross the frontier
        let tops: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, BuildEvent::Top { .. }))
            .collect();
        assert_eq!(tops.len(), 2);
        for event in &events {
            if let BuildEvent::Top { record, member_keys } = event {
                assert_eq!(record.prefix_len, 1);
                assert_eq!(member_keys.len(), 2);
                assert!(record.path.is_empty());
                let top = Cell::from_bytes(&record.subtree).unwrap();
                assert_eq!(top.kind(), CellKind::Ordinary);
                assert_eq!(top.refs().len(), 2);
            }
        }
        // cluster roots are reported as branches at length 1
        let branches: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, BuildEvent::Branch { prefix_len: 1, .. }))
            .collect();
        assert_eq!(branches.len(), 2);
    }

    /// A singleton cluster builds one leaf whose label swallows the whole
    /// remaining keyspace.
    #[test]
    fn singleton_builds_a_leaf() {
        let store = MemStore::load([(key(0b1010_0000), 42)]);
        let mut events = Vec::new();
        let mut processor = ClusterProcessor::new(config(16), &mut events);
        let root = processor
            .process(clusters_at(&store, 1).remove(0))
            .unwrap();
        assert_eq!(root.prefix_len, 1);
        assert!(root.cell.is_leaf());
        let mut s = root.cell.begin_parse();
        let label = crate::cell::label::read_label(&mut s, KEY_BITS - 1).unwrap();
        assert_eq!(label.len, KEY_BITS - 1);
        assert_eq!(s.load_coins().unwrap(), 42);
        assert_eq!(s.load_uint(48).unwrap(), 1000);
        assert_eq!(s.load_uint(48).unwrap(), 2000);
    }

    /// The same cluster always yields the same root hash, and hashing is
    /// indifferent to pruning below the frontier.
    #[test]
    fn deterministic_roots_across_frontier_depths() {
        let store = MemStore::load([
            (key(0b0000_0000), 1),
            (key(0b0001_0000), 2),
            (key(0b0100_0000), 3),
            (key(0b0111_0000), 4),
        ]);
        let build = |store_depth: u16| {
            let mut events = Vec::new();
            let mut processor = ClusterProcessor::new(config(store_depth), &mut events);
            processor
                .process(clusters_at(&store, 1).remove(0))
                .unwrap()
                .cell
                .hash()
        };
        // depth 2 prunes aggressively, depth 200 materializes everything
        assert_eq!(build(2), build(200));
    }

    /// Duplicate keys cannot be represented and must fail loudly.
    #[test]
    fn duplicate_keys_are_inconsistent() {
        let entry = ClusterEntry {
            window: 0,
            suffix: vec![0; 24],
            amount: 1,
            path: vec![],
        };
        let cluster = PrefixCluster {
            prefix: Prefix::ZERO,
            prefix_len: 1,
            entries: vec![entry.clone(), entry],
        };
        let mut events = Vec::new();
        let mut processor = ClusterProcessor::new(config(16), &mut events);
        assert!(matches!(
            processor.process(cluster),
            Err(DictError::StructuralInconsistency(_))
        ));
    }

    #[test]
    fn empty_cluster_is_rejected() {
        let cluster = PrefixCluster {
            prefix: Prefix::ZERO,
            prefix_len: 1,
            entries: vec![],
        };
        let mut events = Vec::new();
        let mut processor = ClusterProcessor::new(config(16), &mut events);
        assert!(matches!(
            processor.process(cluster),
            Err(DictError::EmptyCluster { len: 1 })
        ));
    }
}
