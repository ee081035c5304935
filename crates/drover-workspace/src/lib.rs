//! Worktree-per-unit workspace resolution.
//!
//! Each unit of work gets its own persistent git worktree next to the
//! main checkout, with config mirrored in and the unit's plan document
//! seeded, so concurrent units never touch each other's working copy.

pub mod errors;
pub mod git;
pub mod resolver;

pub use errors::*;
pub use git::*;
pub use resolver::*;
