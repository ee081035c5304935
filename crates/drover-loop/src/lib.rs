//! Marker-driven autonomous build loop and issue-tracker live sync.
//!
//! The loop drives one session through repeated build iterations inside
//! the unit's worktree, advancing on per-item completion markers and
//! finishing on the all-complete marker. Terminal states are statuses,
//! not errors.

pub mod build_loop;
pub mod errors;
pub mod tracker;

pub use build_loop::*;
pub use errors::*;
pub use tracker::*;
