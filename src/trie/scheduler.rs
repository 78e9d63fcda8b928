//! Parallel dictionary construction.
//!
//! Construction runs in bulk-synchronous rounds over a partition of the
//! keyspace. The coordinator pages prefix clusters out of the dataset,
//! aligns each cluster to its branch root, and hands the page to a worker
//! pool. Workers build canonical subtrees and report commitments as
//! events; only the coordinator touches storage, which keeps every
//! backend single-writer. A final reduce folds the surviving roots
//! pairwise into the dictionary root.

use super::builder::{BuildConfig, BuildEvent, ClusterProcessor, SubtreeRoot};
use crate::{
    cell::{extend_to_root, label::Label, make_fork, make_root_fork, Cell},
    constant::{DEFAULT_PER_WORKER_BITS, DEFAULT_STORE_DEPTH, KEY_BITS, WINDOW_BITS},
    session::Session,
    traits::{ClusterSource, CommitmentStore},
    types::{BranchRecord, DictError, Prefix, PrefixCluster},
};
use alloy_primitives::B256;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{cmp::Reverse, fmt::Debug, path::Path, sync::Arc};
use tracing::{debug, info};

/// Construction parameters. Checkpointed alongside the build so a resumed
/// session cannot silently continue under different settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParams {
    /// Claim window start, baked into every leaf payload.
    pub claim_start: u64,
    /// Claim window end.
    pub claim_end: u64,
    /// Frontier depth: subtrees whose roots sit just above it are
    /// persisted whole for proof assembly. Clamped against the dataset
    /// size at run time.
    pub store_depth: u16,
    /// Key bits folded into each worker unit beyond the partition; larger
    /// values mean fewer, bigger clusters.
    pub per_worker_bits: u16,
    /// Worker chunks per round.
    pub workers: usize,
    /// Clusters fetched per round.
    pub page_size: u64,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            claim_start: 0,
            claim_end: 0,
            store_depth: DEFAULT_STORE_DEPTH,
            per_worker_bits: DEFAULT_PER_WORKER_BITS,
            workers: 4,
            page_size: 1024,
        }
    }
}

/// The finished dictionary.
#[derive(Debug)]
pub struct BuildOutcome {
    pub root: Arc<Cell>,
    pub root_hash: B256,
}

/// What one worker chunk hands back to the coordinator.
#[derive(Debug)]
struct WorkerReport {
    roots: Vec<SubtreeRoot>,
    events: Vec<BuildEvent>,
}

/// A cluster root being folded toward the dictionary root, with the
/// aligned roots it covers so their fork levels can be recorded.
#[derive(Debug)]
struct ReduceItem {
    prefix: Prefix,
    prefix_len: u16,
    cell: Arc<Cell>,
    origins: Vec<Origin>,
}

#[derive(Debug)]
struct Origin {
    prefix: Prefix,
    prefix_len: u16,
    /// Fold levels in descending order of occurrence.
    levels: Vec<u16>,
}

fn store_err<E: Debug>(e: E) -> DictError {
    DictError::Storage(format!("{e:?}"))
}

/// Smallest `b` with `total <= 1 << b`.
fn bit_width(total: u64) -> u16 {
    (u64::BITS - (total - 1).leading_zeros()) as u16
}

/// Drives a full dictionary build over a claim dataset.
#[derive(Debug)]
pub struct BuildScheduler<'a, S> {
    store: &'a S,
    params: BuildParams,
    session: Option<Session>,
}

impl<'a, S: ClusterSource + CommitmentStore> BuildScheduler<'a, S> {
    pub fn new(store: &'a S, params: BuildParams) -> Self {
        Self {
            store,
            params,
            session: None,
        }
    }

    /// Attaches a checkpoint file, resuming it when one exists. Resuming
    /// under different parameters is refused.
    pub fn with_session(mut self, path: impl AsRef<Path>) -> Result<Self, DictError> {
        let path = path.as_ref();
        let session = match Session::resume(path)? {
            Some(session) => {
                if session.params() != &self.params {
                    return Err(DictError::Session(
                        "checkpoint parameters do not match".into(),
                    ));
                }
                session
            }
            None => Session::create(path, self.params.clone())?,
        };
        self.session = Some(session);
        Ok(self)
    }

    pub fn run(&mut self) -> Result<BuildOutcome, DictError> {
        let total = self.store.total_records().map_err(store_err)?;
        if total == 0 {
            return Err(DictError::StructuralInconsistency("empty claim dataset"));
        }
        let effective_bits = bit_width(total);
        let partition_len = effective_bits
            .saturating_sub(self.params.per_worker_bits)
            .clamp(1, WINDOW_BITS - 1);
        // the frontier must sit below every cluster root so that tops
        // exist, and no deeper than the dataset can populate
        let store_depth = if self.params.store_depth > effective_bits {
            partition_len + 1
        } else {
            self.params.store_depth
        }
        .max(partition_len + 1);
        info!(total, partition_len, store_depth, "starting dictionary build");

        let config = BuildConfig {
            claim_start: self.params.claim_start,
            claim_end: self.params.claim_end,
            store_depth,
        };
        let mut offset = self.session.as_ref().map(Session::offset).unwrap_or(0);
        let mut working = match &self.session {
            Some(session) => {
                let roots = session.spooled_roots()?;
                if !roots.is_empty() {
                    info!(offset, roots = roots.len(), "resuming from checkpoint");
                }
                roots
            }
            None => Vec::new(),
        };

        loop {
            let page = self
                .store
                .clusters(partition_len, offset, self.params.page_size)
                .map_err(store_err)?;
            if page.is_empty() {
                break;
            }
            let fetched = page.len() as u64;
            let records: u64 = page.iter().map(|c| c.entries.len() as u64).sum();
            let page = self.align(page)?;

            let chunk = page.len().div_ceil(self.params.workers.max(1)).max(1);
            let reports = page
                .into_par_iter()
                .chunks(chunk)
                .map(|clusters| {
                    let mut events = Vec::new();
                    let mut processor = ClusterProcessor::new(config, &mut events);
                    let mut roots = Vec::with_capacity(clusters.len());
                    for cluster in clusters {
                        roots.push(processor.process(cluster)?);
                    }
                    Ok(WorkerReport { roots, events })
                })
                .collect::<Result<Vec<WorkerReport>, DictError>>()?;

            let mut roots = Vec::new();
            for report in reports {
                for event in report.events {
                    match event {
                        BuildEvent::Branch {
                            prefix,
                            prefix_len,
                            record,
                        } => self
                            .store
                            .save_branch(prefix, prefix_len, record)
                            .map_err(store_err)?,
                        BuildEvent::Top {
                            record,
                            member_keys,
                        } => self
                            .store
                            .save_top(record, &member_keys)
                            .map_err(store_err)?,
                    }
                }
                roots.extend(report.roots);
            }
            self.store.flush().map_err(store_err)?;

            offset += fetched;
            if let Some(session) = &mut self.session {
                session.append_roots(&roots)?;
                session.advance(fetched, records);
                session.save()?;
            }
            debug!(clusters = fetched, records, offset, "round complete");
            working.extend(roots);
        }
        if working.is_empty() {
            return Err(DictError::StructuralInconsistency(
                "no subtree roots produced",
            ));
        }

        let root = self.reduce(working, store_depth)?;
        self.store.flush().map_err(store_err)?;
        if let Some(session) = self.session.take() {
            session.finish()?;
        }
        let root_hash = root.hash();
        info!(%root_hash, "dictionary build finished");
        Ok(BuildOutcome { root, root_hash })
    }

    /// Aligns a cluster to its branch root: while the sibling region is
    /// empty the real branch sits higher, so the prefix shrinks and the
    /// freed bits are restored into the member windows. Length-1 clusters
    /// are always roots.
    fn align(&self, clusters: Vec<PrefixCluster>) -> Result<Vec<PrefixCluster>, DictError> {
        clusters
            .into_iter()
            .map(|mut cluster| {
                let orig_len = cluster.prefix_len;
                let orig = cluster.prefix.to_wide().to::<u64>();
                while cluster.prefix_len > 1 {
                    let empty = self
                        .store
                        .member_count(cluster.prefix.sibling(), cluster.prefix_len)
                        .map_err(store_err)?
                        == 0;
                    if !empty {
                        break;
                    }
                    cluster.prefix = cluster.prefix.shr(1, cluster.prefix_len - 1);
                    cluster.prefix_len -= 1;
                }
                let freed = orig_len - cluster.prefix_len;
                if freed > 0 {
                    let dropped = orig & !(u64::MAX << freed);
                    let restored = dropped << (WINDOW_BITS - orig_len);
                    for entry in &mut cluster.entries {
                        entry.window |= restored;
                    }
                }
                Ok(cluster)
            })
            .collect()
    }

    /// Folds the aligned roots pairwise into the dictionary root. Every
    /// fold joins two siblings under an empty-label fork; the root fork
    /// absorbs whatever prefix the final pair still shares. Fold levels
    /// are recorded per origin so that stored fork paths describe the full
    /// route from the root down to each top.
    fn reduce(&self, roots: Vec<SubtreeRoot>, store_depth: u16) -> Result<Arc<Cell>, DictError> {
        let mut items: Vec<ReduceItem> = roots
            .into_iter()
            .map(|r| ReduceItem {
                origins: vec![Origin {
                    prefix: r.prefix,
                    prefix_len: r.prefix_len,
                    levels: Vec::new(),
                }],
                prefix: r.prefix,
                prefix_len: r.prefix_len,
                cell: r.cell,
            })
            .collect();

        while items.len() > 2 {
            items.sort_by_key(|i| (Reverse(i.prefix_len), i.prefix));
            let mut next = Vec::with_capacity(items.len());
            let mut folded = false;
            let mut iter = items.into_iter().peekable();
            while let Some(item) = iter.next() {
                let paired = matches!(
                    iter.peek(),
                    Some(n) if n.prefix_len == item.prefix_len && n.prefix == item.prefix.sibling()
                );
                if paired {
                    let right = iter.next().ok_or(DictError::StructuralInconsistency(
                        "sibling vanished during fold",
                    ))?;
                    next.push(self.fold(item, right, store_depth)?);
                    folded = true;
                } else {
                    next.push(item);
                }
            }
            if !folded {
                return Err(DictError::StructuralInconsistency(
                    "unpairable subtree roots",
                ));
            }
            items = next;
        }

        match items.len() {
            2 => {
                items.sort_by_key(|i| (Reverse(i.prefix_len), i.prefix));
                let right = items.pop().ok_or(DictError::StructuralInconsistency(
                    "missing right survivor",
                ))?;
                let left = items.pop().ok_or(DictError::StructuralInconsistency(
                    "missing left survivor",
                ))?;
                if left.prefix_len != right.prefix_len || right.prefix != left.prefix.sibling() {
                    return Err(DictError::StructuralInconsistency(
                        "surviving roots are not siblings",
                    ));
                }
                let level = left.prefix_len;
                let shared = left.prefix.shr(1, level - 1).to_wide();
                let root = make_root_fork(shared, level - 1, left.cell, right.cell)?;
                for mut origin in left.origins.into_iter().chain(right.origins) {
                    origin.levels.push(level);
                    origin.levels.reverse();
                    self.store
                        .record_fork_path(origin.prefix, origin.prefix_len, &origin.levels)
                        .map_err(store_err)?;
                }
                Ok(root)
            }
            1 => {
                // the whole dataset sits under one aligned root; its node
                // becomes the dictionary root directly
                let item = items.pop().ok_or(DictError::StructuralInconsistency(
                    "missing lone survivor",
                ))?;
                extend_to_root(&item.cell, item.prefix, item.prefix_len)
            }
            _ => Err(DictError::StructuralInconsistency("no surviving roots")),
        }
    }

    /// Joins two sibling items under an empty-label fork and commits the
    /// parent so later pairings can resolve it as a proof sibling.
    fn fold(
        &self,
        left: ReduceItem,
        right: ReduceItem,
        store_depth: u16,
    ) -> Result<ReduceItem, DictError> {
        let child_len = left.prefix_len;
        let parent_len = child_len - 1;
        let cell = make_fork(&Label::EMPTY, KEY_BITS - parent_len, left.cell, right.cell)?;
        let prefix = left.prefix.shr(1, parent_len);
        if parent_len >= 1 && parent_len < store_depth {
            self.store
                .save_branch(
                    prefix,
                    parent_len,
                    BranchRecord {
                        depth: cell.depth(),
                        hash: cell.hash(),
                    },
                )
                .map_err(store_err)?;
        }
        let mut origins = left.origins;
        origins.extend(right.origins);
        for origin in &mut origins {
            origin.levels.push(child_len);
        }
        Ok(ReduceItem {
            prefix,
            prefix_len: parent_len,
            cell,
            origins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mem_store::MemStore, types::ClaimKey};
    use alloy_primitives::U256;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_store(n: usize, seed: u64) -> MemStore {
        let mut rng = StdRng::seed_from_u64(seed);
        let store = MemStore::new();
        for _ in 0..n {
            let bytes: [u8; 32] = rng.gen();
            store.insert_claim(ClaimKey(bytes.into()), rng.gen_range(1..1u128 << 64));
        }
        store
    }

    fn params(workers: usize, page_size: u64) -> BuildParams {
        BuildParams {
            claim_start: 100,
            claim_end: 200,
            per_worker_bits: 2,
            workers,
            page_size,
            ..Default::default()
        }
    }

    /// The canonical root depends only on the dataset, never on worker
    /// count or paging.
    #[test]
    fn root_is_deterministic_across_schedules() {
        let hash = |workers, page_size, seed| {
            let store = random_store(64, seed);
            BuildScheduler::new(&store, params(workers, page_size))
                .run()
                .unwrap()
                .root_hash
        };
        assert_eq!(hash(1, 1000, 7), hash(4, 3, 7));
        assert_eq!(hash(4, 3, 7), hash(8, 1, 7));
        assert_ne!(hash(1, 1000, 7), hash(1, 1000, 8));
    }

    #[test]
    fn single_key_dataset_builds_a_leaf_root() {
        let store = MemStore::load([(ClaimKey(alloy_primitives::B256::repeat_byte(0x5A)), 9)]);
        let outcome = BuildScheduler::new(&store, params(2, 10)).run().unwrap();
        assert!(outcome.root.is_leaf());
    }

    /// When every key shares leading bits, the shared run folds into the
    /// root fork's label instead of producing single-child nodes.
    #[test]
    fn shared_prefix_folds_into_the_root_label() {
        let store = MemStore::load([
            (ClaimKey::from_wide(U256::from(0b10u8) << 254), 1),
            (ClaimKey::from_wide(U256::from(0b11u8) << 254), 2),
        ]);
        let outcome = BuildScheduler::new(&store, params(2, 10)).run().unwrap();
        assert_eq!(outcome.root.refs().len(), 2);
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let store = MemStore::new();
        assert!(matches!(
            BuildScheduler::new(&store, params(1, 10)).run(),
            Err(DictError::StructuralInconsistency(_))
        ));
    }

    /// Every key ends up owned by a top whose recorded path reaches the
    /// root, and the branch map can resolve every recorded level.
    #[test]
    fn fork_paths_reach_the_root() {
        let store = random_store(48, 11);
        BuildScheduler::new(&store, params(3, 5)).run().unwrap();
        let branches = CommitmentStore::branches(&store).unwrap();
        for record in store.tops(0, u64::MAX).unwrap() {
            let path = &record.path;
            assert!(path.windows(2).all(|w| w[0] < w[1]), "path must ascend");
            assert_eq!(*path.last().unwrap(), record.prefix_len);
            // each level pairs with a committed sibling
            let key = record.prefix.to_wide() << (256 - record.prefix_len as usize);
            for level in path {
                let prefix = key >> (256 - *level as usize);
                assert!(branches.contains_key(&(*level, prefix ^ U256::from(1u8))));
            }
        }
    }

    /// Roots that never meet as siblings cannot fold to a single
    /// dictionary root; the reduce must fail instead of spinning.
    #[test]
    fn unpairable_roots_are_inconsistent() {
        fn root(prefix: u64, len: u16) -> SubtreeRoot {
            let mut b = crate::cell::CellBuilder::new();
            b.store_uint(prefix, 16).unwrap();
            SubtreeRoot {
                prefix: Prefix::Short(prefix),
                prefix_len: len,
                cell: b.finish().unwrap(),
            }
        }
        let store = MemStore::new();
        let scheduler = BuildScheduler::new(&store, params(1, 10));
        // 0b00 and 0b10 are not siblings, and 0b110 sits a level deeper
        let roots = vec![root(0b00, 2), root(0b10, 2), root(0b110, 3)];
        assert!(matches!(
            scheduler.reduce(roots, 4),
            Err(DictError::StructuralInconsistency("unpairable subtree roots"))
        ));
    }

    #[test]
    fn completed_run_cleans_up_its_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.json");
        let store = random_store(32, 3);
        let outcome = BuildScheduler::new(&store, params(2, 4))
            .with_session(&path)
            .unwrap()
            .run()
            .unwrap();
        assert!(!path.exists());
        let plain = BuildScheduler::new(&store, params(2, 4)).run().unwrap();
        assert_eq!(outcome.root_hash, plain.root_hash);
    }

    #[test]
    fn mismatched_checkpoint_parameters_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.json");
        Session::create(&path, params(1, 10)).unwrap();
        let store = random_store(8, 1);
        assert!(matches!(
            BuildScheduler::new(&store, params(2, 10)).with_session(&path),
            Err(DictError::Session(_))
        ));
    }
}
