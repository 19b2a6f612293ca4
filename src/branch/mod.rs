//! Two-tier branching: trunk → `feature/<spec>` → `feature/<spec>-wave-<n>`.
//!
//! Wave change-sets merge into the integration branch; only the integration
//! branch ever merges into trunk.

mod coordinator;
mod names;

pub use coordinator::{BranchCoordinator, CleanupReport, SetupReport};
pub use names::{BRANCH_PREFIX, BranchNames, normalize_spec_id};
