//! In-memory storage backend for the claim dictionary.
//!
//! This module provides [`MemStore`], a simple in-memory backend that
//! implements the [`ClusterSource`] and [`CommitmentStore`] traits. It
//! holds the claim dataset and the trie commitments in [`BTreeMap`]
//! collections.
//!
//! `MemStore` is primarily intended for unit and integration testing and
//! as a reference implementation of the storage traits; production builds
//! over large datasets should use a database-backed implementation.
//!
//! All operations are thread-safe through [`RwLock`] interior mutability.
//! Branch writes go through a write-back buffer that drains into the
//! durable map when it grows past [`BRANCH_FLUSH_THRESHOLD`] or on an
//! explicit [`CommitmentStore::flush`].

use crate::{
    bits,
    constant::{BRANCH_FLUSH_THRESHOLD, KEY_BITS, WINDOW_BITS, WINDOW_BYTES},
    traits::{ClusterSource, CommitmentStore},
    types::{BranchRecord, ClaimKey, ClusterEntry, ForkPath, Prefix, PrefixCluster, TopRecord},
};
use alloy_primitives::{B256, U256};
use rustc_hash::FxHashMap;
use std::{collections::BTreeMap, sync::RwLock};

/// Groups the commitment tables together so related writes stay atomic.
#[derive(Debug, Default)]
struct CommitmentState {
    /// Durable branch commitments keyed by `(prefix_len, prefix)`.
    branches: BTreeMap<(u16, U256), BranchRecord>,
    /// Write-back buffer in front of `branches`.
    branch_buf: Vec<((u16, U256), BranchRecord)>,
    /// Top subtrees keyed by `(prefix_len, prefix)`.
    tops: BTreeMap<(u16, U256), TopRecord>,
    /// Member key to owning top.
    keys: BTreeMap<B256, (u16, U256)>,
}

impl CommitmentState {
    fn drain_buffer(&mut self) {
        for (key, record) in self.branch_buf.drain(..) {
            self.branches.insert(key, record);
        }
    }
}

/// In-memory claim dataset plus commitment storage.
#[derive(Debug, Default)]
pub struct MemStore {
    /// Claim records: key to amount.
    claims: RwLock<BTreeMap<B256, u128>>,
    /// Commitments produced by construction.
    trie: RwLock<CommitmentState>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-loaded with claim records.
    pub fn load(claims: impl IntoIterator<Item = (ClaimKey, u128)>) -> Self {
        let store = Self::new();
        for (key, amount) in claims {
            store.insert_claim(key, amount);
        }
        store
    }

    pub fn insert_claim(&self, key: ClaimKey, amount: u128) {
        self.claims.write().unwrap().insert(key.0, amount);
    }

    fn entry_for(key: &B256, amount: u128, prefix_len: u16) -> ClusterEntry {
        let word = prefix_len as usize / WINDOW_BITS as usize;
        let mut window = [0u8; WINDOW_BYTES];
        window.copy_from_slice(&key[word * WINDOW_BYTES..(word + 1) * WINDOW_BYTES]);
        ClusterEntry {
            window: bits::clear_high_bits(u64::from_be_bytes(window), prefix_len % WINDOW_BITS),
            suffix: key[(word + 1) * WINDOW_BYTES..].to_vec(),
            amount,
            path: Vec::new(),
        }
    }
}

impl ClusterSource for MemStore {
    /// Error type for dataset reads.
    ///
    /// Uses static string references for simplicity in this in-memory
    /// implementation.
    type Error = &'static str;

    fn total_records(&self) -> Result<u64, Self::Error> {
        Ok(self.claims.read().unwrap().len() as u64)
    }

    fn clusters(
        &self,
        prefix_len: u16,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<PrefixCluster>, Self::Error> {
        if prefix_len == 0 || prefix_len > WINDOW_BITS {
            return Err("cluster prefix length out of range");
        }
        let claims = self.claims.read().unwrap();
        let mut out: Vec<PrefixCluster> = Vec::new();
        let mut seen = 0u64;
        let mut current: Option<U256> = None;
        for (key, amount) in claims.iter() {
            let prefix = U256::from_be_bytes(key.0) >> (KEY_BITS - prefix_len) as usize;
            if current != Some(prefix) {
                if out.len() as u64 == limit && seen >= offset {
                    break;
                }
                current = Some(prefix);
                seen += 1;
                if seen <= offset {
                    continue;
                }
                out.push(PrefixCluster {
                    prefix: Prefix::new(prefix, prefix_len),
                    prefix_len,
                    entries: Vec::new(),
                });
            }
            if seen <= offset {
                continue;
            }
            if let Some(cluster) = out.last_mut() {
                cluster
                    .entries
                    .push(Self::entry_for(key, *amount, prefix_len));
            }
        }
        Ok(out)
    }

    fn member_count(&self, prefix: Prefix, prefix_len: u16) -> Result<u64, Self::Error> {
        if prefix_len == 0 || prefix_len > KEY_BITS {
            return Err("prefix length out of range");
        }
        let lo = prefix.to_wide() << (KEY_BITS - prefix_len) as usize;
        let hi = lo | bits::wide_ones((KEY_BITS - prefix_len) as usize);
        let lo = B256::from(lo.to_be_bytes::<32>());
        let hi = B256::from(hi.to_be_bytes::<32>());
        Ok(self.claims.read().unwrap().range(lo..=hi).count() as u64)
    }
}

impl CommitmentStore for MemStore {
    /// Error type for commitment reads and writes.
    type Error = &'static str;

    fn save_branch(
        &self,
        prefix: Prefix,
        prefix_len: u16,
        record: BranchRecord,
    ) -> Result<(), Self::Error> {
        let mut trie = self.trie.write().unwrap();
        trie.branch_buf.push(((prefix_len, prefix.to_wide()), record));
        if trie.branch_buf.len() >= BRANCH_FLUSH_THRESHOLD {
            trie.drain_buffer();
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), Self::Error> {
        self.trie.write().unwrap().drain_buffer();
        Ok(())
    }

    fn branches(&self) -> Result<FxHashMap<(u16, U256), BranchRecord>, Self::Error> {
        let mut trie = self.trie.write().unwrap();
        trie.drain_buffer();
        Ok(trie.branches.iter().map(|(k, v)| (*k, *v)).collect())
    }

    fn save_top(&self, record: TopRecord, member_keys: &[ClaimKey]) -> Result<(), Self::Error> {
        let mut trie = self.trie.write().unwrap();
        let id = (record.prefix_len, record.prefix.to_wide());
        for key in member_keys {
            trie.keys.insert(key.0, id);
        }
        trie.tops.insert(id, record);
        Ok(())
    }

    fn top(&self, prefix: Prefix, prefix_len: u16) -> Result<Option<TopRecord>, Self::Error> {
        Ok(self
            .trie
            .read()
            .unwrap()
            .tops
            .get(&(prefix_len, prefix.to_wide()))
            .cloned())
    }

    fn tops(&self, offset: u64, limit: u64) -> Result<Vec<TopRecord>, Self::Error> {
        Ok(self
            .trie
            .read()
            .unwrap()
            .tops
            .values()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn record_fork_path(
        &self,
        prefix: Prefix,
        prefix_len: u16,
        levels: &[u16],
    ) -> Result<(), Self::Error> {
        if levels.is_empty() {
            return Ok(());
        }
        let root = prefix.to_wide();
        let mut trie = self.trie.write().unwrap();
        for ((top_len, top_prefix), record) in trie.tops.iter_mut() {
            if *top_len >= prefix_len && *top_prefix >> (*top_len - prefix_len) as usize == root {
                let mut path = Vec::with_capacity(levels.len() + record.path.len());
                path.extend_from_slice(levels);
                path.append(&mut record.path);
                record.path = path;
            }
        }
        Ok(())
    }

    fn fork_path(&self, key: ClaimKey) -> Result<Option<ForkPath>, Self::Error> {
        let trie = self.trie.read().unwrap();
        let Some(id) = trie.keys.get(&key.0) else {
            return Ok(None);
        };
        let record = trie.tops.get(id).ok_or("dangling top reference")?;
        Ok(Some(ForkPath {
            path: record.path.clone(),
            top_len: id.0,
            top: record.subtree.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(top: u64) -> ClaimKey {
        ClaimKey::from_wide(U256::from(top) << 248)
    }

    /// Clusters group keys by their top bits, in prefix order, with
    /// cluster-granular pagination.
    #[test]
    fn cluster_grouping_and_pagination() {
        let store = MemStore::load([
            (key(0x00), 1),
            (key(0x01), 2),
            (key(0x40), 3),
            (key(0x41), 4),
            (key(0x80), 5),
        ]);
        let all = store.clusters(2, 0, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].prefix, Prefix::Short(0));
        assert_eq!(all[0].entries.len(), 2);
        assert_eq!(all[1].prefix, Prefix::Short(1));
        assert_eq!(all[2].prefix, Prefix::Short(2));
        assert_eq!(all[2].entries.len(), 1);

        let page = store.clusters(2, 1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].prefix, Prefix::Short(1));
        assert_eq!(page[0].entries[0].amount, 3);
    }

    #[test]
    fn member_counts_by_prefix() {
        let store = MemStore::load([(key(0x00), 1), (key(0x01), 2), (key(0x80), 3)]);
        assert_eq!(store.member_count(Prefix::Short(0), 1).unwrap(), 2);
        assert_eq!(store.member_count(Prefix::Short(1), 1).unwrap(), 1);
        assert_eq!(store.member_count(Prefix::Short(0), 2).unwrap(), 2);
        assert_eq!(store.member_count(Prefix::Short(1), 2).unwrap(), 0);
    }

    /// Buffered branches become visible after a flush, and `branches()`
    /// flushes implicitly.
    #[test]
    fn branch_write_back() {
        let store = MemStore::new();
        let record = BranchRecord {
            depth: 3,
            hash: B256::repeat_byte(7),
        };
        store.save_branch(Prefix::Short(5), 4, record).unwrap();
        assert_eq!(store.trie.read().unwrap().branches.len(), 0);
        let map = store.branches().unwrap();
        assert_eq!(map.get(&(4, U256::from(5u8))), Some(&record));
        assert!(store.trie.read().unwrap().branch_buf.is_empty());
    }

    #[test]
    fn fork_paths_extend_under_a_root() {
        let store = MemStore::new();
        let record = TopRecord {
            prefix: Prefix::Short(0b101),
            prefix_len: 3,
            path: vec![3],
            subtree: vec![1, 2, 3],
        };
        let member = key(0xA0);
        store.save_top(record, &[member]).unwrap();

        // levels recorded for the cluster root at (0b1, 1) reach this top
        store.record_fork_path(Prefix::Short(1), 1, &[1, 2]).unwrap();
        // an unrelated root does not
        store.record_fork_path(Prefix::Short(0), 1, &[9]).unwrap();

        let fp = store.fork_path(member).unwrap().unwrap();
        assert_eq!(fp.path, vec![1, 2, 3]);
        assert_eq!(fp.top_len, 3);
        assert!(store.fork_path(key(0xFF)).unwrap().is_none());
    }
}
