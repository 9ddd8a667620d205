//! Membership sources feeding full service and endpoint snapshots to the sync loop.

pub mod file;
pub mod hash;
