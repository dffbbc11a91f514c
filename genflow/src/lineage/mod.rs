//! Parent/child lineage of refinement jobs.

mod tracker;

pub use tracker::{LineageRecord, LineageTracker, ParentRef};
