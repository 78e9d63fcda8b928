//! Resumable build sessions.
//!
//! A session is a JSON checkpoint next to a spool of finished subtree
//! roots. The scheduler appends each round's roots to the spool before it
//! advances the checkpoint offset, so a crash between the two replays the
//! round instead of losing it; replayed spool entries deduplicate on load.

use crate::{
    cell::Cell,
    constant::KEY_BITS,
    trie::{builder::SubtreeRoot, scheduler::BuildParams},
    types::{DictError, Prefix},
};
use alloy_primitives::U256;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SessionState {
    started_at: u64,
    updated_at: u64,
    /// Clusters consumed so far; construction resumes here.
    offset: u64,
    /// Claim records covered by the spooled roots.
    processed: u64,
    params: BuildParams,
}

/// One spooled subtree root as a JSON line, cell bytes hex-encoded.
#[derive(Debug, Serialize, Deserialize)]
struct SpoolEntry {
    prefix: U256,
    len: u16,
    cell: String,
}

/// A build checkpoint on disk.
#[derive(Debug)]
pub struct Session {
    path: PathBuf,
    spool_path: PathBuf,
    state: SessionState,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn session_err(e: impl std::fmt::Display) -> DictError {
    DictError::Session(e.to_string())
}

impl Session {
    fn spool_path_for(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(".spool");
        PathBuf::from(os)
    }

    /// Starts a fresh session at `path`, truncating any previous spool.
    pub fn create(path: impl Into<PathBuf>, params: BuildParams) -> Result<Self, DictError> {
        let path = path.into();
        let spool_path = Self::spool_path_for(&path);
        let state = SessionState {
            started_at: now(),
            updated_at: now(),
            offset: 0,
            processed: 0,
            params,
        };
        let session = Self {
            path,
            spool_path,
            state,
        };
        File::create(&session.spool_path).map_err(session_err)?;
        session.save()?;
        Ok(session)
    }

    /// Loads the checkpoint at `path`, or `None` when there is none.
    pub fn resume(path: impl Into<PathBuf>) -> Result<Option<Self>, DictError> {
        let path = path.into();
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path).map_err(session_err)?;
        let state: SessionState = serde_json::from_reader(file).map_err(session_err)?;
        let spool_path = Self::spool_path_for(&path);
        Ok(Some(Self {
            path,
            spool_path,
            state,
        }))
    }

    pub fn params(&self) -> &BuildParams {
        &self.state.params
    }

    pub fn offset(&self) -> u64 {
        self.state.offset
    }

    pub fn processed(&self) -> u64 {
        self.state.processed
    }

    /// Marks another page of clusters as durable.
    pub fn advance(&mut self, clusters: u64, records: u64) {
        self.state.offset += clusters;
        self.state.processed += records;
        self.state.updated_at = now();
    }

    pub fn save(&self) -> Result<(), DictError> {
        let json = serde_json::to_vec_pretty(&self.state).map_err(session_err)?;
        std::fs::write(&self.path, json).map_err(session_err)
    }

    /// Appends finished roots to the spool. Called before the offset
    /// advances, so the spool never trails the checkpoint.
    pub fn append_roots(&self, roots: &[SubtreeRoot]) -> Result<(), DictError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.spool_path)
            .map_err(session_err)?;
        for root in roots {
            let entry = SpoolEntry {
                prefix: root.prefix.to_wide(),
                len: root.prefix_len,
                cell: hex::encode(root.cell.to_bytes()),
            };
            let mut line = serde_json::to_vec(&entry).map_err(session_err)?;
            line.push(b'\n');
            file.write_all(&line).map_err(session_err)?;
        }
        file.flush().map_err(session_err)
    }

    /// Reads back the spooled roots, dropping replayed duplicates.
    pub fn spooled_roots(&self) -> Result<Vec<SubtreeRoot>, DictError> {
        if !self.spool_path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.spool_path).map_err(session_err)?);
        let mut seen = FxHashSet::default();
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(session_err)?;
            if line.is_empty() {
                continue;
            }
            let entry: SpoolEntry = serde_json::from_str(&line).map_err(session_err)?;
            if entry.len > KEY_BITS
                || (entry.len < KEY_BITS && entry.prefix >> entry.len as usize != U256::ZERO)
            {
                return Err(DictError::Session(format!(
                    "spooled prefix {:#x} does not fit length {}",
                    entry.prefix, entry.len
                )));
            }
            if !seen.insert((entry.len, entry.prefix)) {
                continue;
            }
            let bytes = hex::decode(&entry.cell).map_err(session_err)?;
            out.push(SubtreeRoot {
                prefix: Prefix::new(entry.prefix, entry.len),
                prefix_len: entry.len,
                cell: Cell::from_bytes(&bytes)?,
            });
        }
        Ok(out)
    }

    /// Removes the checkpoint and spool once a build completes.
    pub fn finish(self) -> Result<(), DictError> {
        for p in [&self.path, &self.spool_path] {
            match std::fs::remove_file(p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(session_err(e)),
            }
        }
        Ok(())
    }
}
