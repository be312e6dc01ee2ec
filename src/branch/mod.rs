//! Copy-on-write branching above the extent engine.
//!
//! Branches form a forest rooted at `main`. Each branch owns an
//! [`crate::storage::ExtentStorage`] namespace (its own blob-key prefix
//! and scoped file ids); reads that miss a branch walk up the parent
//! chain, writes always land in the current branch.

pub mod manager;
pub mod types;

pub use manager::BranchManager;
pub use types::{Branch, Commit, CommitSnapshot, SnapshotFile};
