//! Change filtering ahead of an integration.
//!
//! Walks the branch log between the last integration source and the
//! candidate revision, skipping reconciliation commits, and stops at the
//! first commit made by a person.

use tracing::debug;

use crate::envelope;
use crate::errors::SvnError;
use crate::svn::{LogControl, SvnLogEntry, VcsBackend};

/// Result of scanning a branch for changes worth integrating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeScan {
    /// Only reconciliation commits (or nothing) since the last integration.
    NoOp { skipped: usize },
    /// The first revision in range carrying a genuine change.
    Changed { revision: i64 },
}

impl ChangeScan {
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp { .. })
    }
}

/// Scan `branch_url` over `(last_source, candidate]`.
///
/// With no previous integration the whole line of development of the branch
/// is scanned.
pub async fn scan_for_changes<B>(
    backend: &B,
    branch_url: &str,
    last_source: Option<i64>,
    candidate: i64,
) -> Result<ChangeScan, SvnError>
where
    B: VcsBackend + ?Sized,
{
    let from = match last_source {
        Some(last) if last >= candidate => {
            debug!(last, candidate, "branch has not moved since the last integration");
            return Ok(ChangeScan::NoOp { skipped: 0 });
        }
        Some(last) => last + 1,
        None => 0,
    };

    let mut skipped = 0usize;
    let mut changed: Option<i64> = None;
    backend
        .log(branch_url, from, Some(candidate), &mut |entry: &SvnLogEntry| {
            if entry.revision < from || entry.revision > candidate {
                return LogControl::Continue;
            }
            if envelope::is_reconciliation(&entry.message) {
                skipped += 1;
                LogControl::Continue
            } else {
                changed = Some(entry.revision);
                LogControl::Stop
            }
        })
        .await?;

    let scan = match changed {
        Some(revision) => ChangeScan::Changed { revision },
        None => ChangeScan::NoOp { skipped },
    };
    debug!(branch_url, from, candidate, ?scan, "scanned branch for changes");
    Ok(scan)
}
