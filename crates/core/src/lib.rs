//! svnmerge core library.
//!
//! Feature-branch reconciliation for Subversion: rebasing a branch onto its
//! upstream, integrating it back, recognising no-op integrations, tracing
//! integration commits to the builds that produced them, and serialising the
//! work per branch.

pub mod branch;
pub mod config;
pub mod db;
pub mod envelope;
pub mod errors;
pub mod merge;
pub mod models;
pub mod noop;
pub mod provenance;
pub mod reconcile;
pub mod scheduler;
pub mod svn;
pub mod task_log;

pub use config::AppConfig;
pub use db::Database;
pub use reconcile::{Reconciler, TaskRequest, TaskResult};
pub use scheduler::{ReconciliationScheduler, TaskHandle, TaskReport};
