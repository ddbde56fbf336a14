//! Subversion access for svnmerge: the backend capability trait, its CLI
//! implementation, output parsers, and location helpers.

pub mod backend;
pub mod client;
pub mod layout;
pub mod location;
pub mod parser;

pub use backend::{ConflictDetector, LogControl, LogHandler, MergeEventHandler, MergeRequest, VcsBackend};
pub use client::SvnClient;
pub use layout::{RepositoryLayout, RepositoryLayoutInfo};
pub use location::LocationResolver;
pub use parser::*;
