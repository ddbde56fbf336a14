//! Conflict-aware merge protocols.

pub mod executor;
pub mod outcome;

pub use executor::{IntegrateRequest, MergeExecutor};
pub use outcome::{BackMerge, IntegrationOutcome, RebaseOutcome};
