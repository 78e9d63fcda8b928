//! Define traits for streaming claim data and persisting trie commitments.

use crate::types::{BranchRecord, ClaimKey, ForkPath, Prefix, PrefixCluster, TopRecord};
use alloy_primitives::U256;
use rustc_hash::FxHashMap;
use std::fmt::Debug;

/// This trait provides the claim dataset as prefix clusters.
pub trait ClusterSource: Debug + Send + Sync {
    /// Custom trait's error type.
    type Error: Debug + Send;

    /// Total number of claim records.
    fn total_records(&self) -> Result<u64, Self::Error>;

    /// Streams clusters grouped by the top `prefix_len` key bits, in
    /// prefix order. `offset` and `limit` count clusters, not records;
    /// the grouping must be deterministic so that interrupted builds can
    /// resume by offset.
    fn clusters(
        &self,
        prefix_len: u16,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<PrefixCluster>, Self::Error>;

    /// Number of records whose key starts with `prefix`.
    fn member_count(&self, prefix: Prefix, prefix_len: u16) -> Result<u64, Self::Error>;
}

/// This trait persists the commitments produced by construction and serves
/// them back for proof assembly.
pub trait CommitmentStore: Debug + Send + Sync {
    /// Custom trait's error type.
    type Error: Debug + Send;

    /// Records a node commitment at or above the frontier. Writes may be
    /// buffered until [`Self::flush`].
    fn save_branch(
        &self,
        prefix: Prefix,
        prefix_len: u16,
        record: BranchRecord,
    ) -> Result<(), Self::Error>;

    /// Makes all buffered branch writes durable.
    fn flush(&self) -> Result<(), Self::Error>;

    /// The full branch commitment map, keyed by `(prefix_len, prefix)`.
    /// Flushes buffered writes first.
    fn branches(&self) -> Result<FxHashMap<(u16, U256), BranchRecord>, Self::Error>;

    /// Persists a serialized top subtree and associates each member key
    /// with it.
    fn save_top(&self, record: TopRecord, member_keys: &[ClaimKey]) -> Result<(), Self::Error>;

    /// The top record at `(prefix, prefix_len)`, if any.
    fn top(&self, prefix: Prefix, prefix_len: u16) -> Result<Option<TopRecord>, Self::Error>;

    /// Enumerates top records in prefix order.
    fn tops(&self, offset: u64, limit: u64) -> Result<Vec<TopRecord>, Self::Error>;

    /// Prepends reduce-time fork levels to the path of every top (and
    /// thereby every key) under the cluster root `(prefix, prefix_len)`.
    fn record_fork_path(
        &self,
        prefix: Prefix,
        prefix_len: u16,
        levels: &[u16],
    ) -> Result<(), Self::Error>;

    /// Everything needed to prove one key: its fork path and the
    /// serialized top subtree containing its leaf.
    fn fork_path(&self, key: ClaimKey) -> Result<Option<ForkPath>, Self::Error>;
}
