//! Dictionary construction: per-cluster subtree building and the
//! parallel scheduler that drives it.

pub mod builder;
pub mod scheduler;
