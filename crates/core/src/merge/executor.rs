//! Drives one merge direction against one working copy.
//!
//! ## Rebase (upstream -> branch)
//!
//! 1. Update the working copy to the branch tip.
//! 2. Merge the upstream history up to the target revision.
//! 3. On conflict revert everything and report [`RebaseOutcome::Conflicted`].
//! 4. Otherwise commit with a `[REBASE] ` message.
//!
//! ## Integrate (branch -> upstream)
//!
//! 1. Capture where the working copy points, then check whether the branch
//!    has any change since the last integration source. Stop with a no-op if
//!    not.
//! 2. Switch to the upstream tip and reintegrate the branch.
//! 3. Revert on conflict, otherwise commit with the integration message.
//! 4. Switch back to where the working copy was.
//! 5. After a mainline commit `M`, record `M` as merged on the branch so it
//!    never comes back in a later rebase.
//!
//! Reverting a failed merge also deletes the paths that merge added.
//! Unversioned files that were there before it stay untouched.
//!
//! Backend faults propagate as errors and leave the working copy wherever
//! the fault happened.

use std::path::Path;

use tracing::{debug, info, instrument, warn};

use super::outcome::{BackMerge, IntegrationOutcome, RebaseOutcome};
use crate::envelope;
use crate::errors::SvnError;
use crate::noop::{scan_for_changes, ChangeScan};
use crate::svn::{ConflictDetector, MergeRequest, VcsBackend};
use crate::task_log::TaskLog;

/// Parameters of one integrate attempt.
#[derive(Debug, Clone)]
pub struct IntegrateRequest {
    pub upstream_url: String,
    /// Branch URL to merge from. Defaults to the working copy URL.
    pub branch_url: Option<String>,
    /// Branch revision to merge. Defaults to the working copy revision.
    pub branch_revision: Option<i64>,
    /// Full commit message, envelope included.
    pub message: String,
    /// Integration source of the previous attempt, if any.
    pub last_integration_source: Option<i64>,
}

pub struct MergeExecutor<'a, B: VcsBackend + ?Sized> {
    backend: &'a B,
    log: &'a TaskLog,
}

impl<'a, B: VcsBackend + ?Sized> MergeExecutor<'a, B> {
    pub fn new(backend: &'a B, log: &'a TaskLog) -> Self {
        Self { backend, log }
    }

    /// Merge upstream changes up to `target` (HEAD when `None`) into the
    /// branch working copy at `wc`.
    #[instrument(skip(self, wc), fields(wc = %wc.display()))]
    pub async fn rebase(
        &self,
        wc: &Path,
        upstream_url: &str,
        target: Option<i64>,
    ) -> Result<RebaseOutcome, SvnError> {
        self.log.line("Updating workspace to the latest revision");
        let rev = self.backend.update(wc).await?;
        self.log.line(format!("  Updated to rev.{}", rev));

        match target {
            Some(t) => self
                .log
                .line(format!("Merging change from the upstream {}@{}", upstream_url, t)),
            None => self
                .log
                .line(format!("Merging change from the upstream {}", upstream_url)),
        }
        let request = MergeRequest::Range {
            source: upstream_url.to_string(),
            from: 0,
            to: target,
        };
        let mut detector = ConflictDetector::new();
        self.backend.merge(wc, &request, &mut detector).await?;

        if detector.found_conflict() {
            self.log.line("Found conflict. Reverting this failed merge");
            self.log_conflicts(&detector);
            self.discard_merge(wc, &detector).await?;
            warn!(upstream_url, "rebase conflicted");
            return Ok(RebaseOutcome::Conflicted);
        }

        self.log.line("Committing changes");
        let committed = self
            .backend
            .commit(wc, &envelope::rebase_message(upstream_url))
            .await?;
        if committed < 0 {
            self.log.line("  No changes since the last integration");
            Ok(RebaseOutcome::NothingToCommit)
        } else {
            self.log.line(format!("  committed revision {}", committed));
            info!(revision = committed, "rebase committed");
            Ok(RebaseOutcome::Committed {
                revision: committed,
            })
        }
    }

    /// Merge the branch into the upstream through the working copy at `wc`.
    #[instrument(skip(self, wc, request), fields(wc = %wc.display(), upstream = %request.upstream_url))]
    pub async fn integrate(
        &self,
        wc: &Path,
        request: &IntegrateRequest,
    ) -> Result<IntegrationOutcome, SvnError> {
        let ws_state = self.backend.info(&wc.to_string_lossy()).await?;
        let merge_url = request
            .branch_url
            .clone()
            .unwrap_or_else(|| ws_state.url.clone());
        let merge_rev = request
            .branch_revision
            .filter(|r| *r >= 0)
            .unwrap_or(ws_state.revision);

        let scan = scan_for_changes(
            self.backend,
            &merge_url,
            request.last_integration_source,
            merge_rev,
        )
        .await?;
        if let ChangeScan::NoOp { skipped } = scan {
            self.log.line(format!(
                "No changes on {} since the last integration (skipped {} reconciliation commits)",
                merge_url, skipped
            ));
            return Ok(IntegrationOutcome::noop(merge_rev));
        }

        self.log
            .line(format!("Switching to the upstream ({})", request.upstream_url));
        self.backend.switch(wc, &request.upstream_url, None).await?;

        self.log.line(format!(
            "Merging {} (rev.{}) to the upstream",
            merge_url, merge_rev
        ));
        let reintegrate = MergeRequest::Reintegrate {
            source: merge_url.clone(),
            revision: merge_rev,
        };
        let mut detector = ConflictDetector::new();
        self.backend.merge(wc, &reintegrate, &mut detector).await?;

        let trunk_commit = if detector.found_conflict() {
            self.log
                .line("Found conflict with the upstream. Reverting this failed merge");
            self.log_conflicts(&detector);
            self.discard_merge(wc, &detector).await?;
            None
        } else {
            self.log.line("Committing changes to the upstream");
            let rev = self.backend.commit(wc, &request.message).await?;
            if rev < 0 {
                self.log.line("  No changes since the last integration");
            } else {
                self.log.line(format!("  committed revision {}", rev));
            }
            Some(rev)
        };

        self.log.line(format!(
            "Switching back to the branch ({}@{})",
            ws_state.url, ws_state.revision
        ));
        self.backend
            .switch(wc, &ws_state.url, Some(ws_state.revision))
            .await?;

        let Some(trunk_commit) = trunk_commit else {
            self.log
                .line("Conflict found. Please sync with the upstream to resolve this error.");
            return Ok(IntegrationOutcome {
                merge_commit: -1,
                integration_source: merge_rev,
                back_merge: BackMerge::Skipped,
            });
        };

        let back_merge = if trunk_commit >= 0 {
            self.back_merge(wc, &request.upstream_url, trunk_commit)
                .await?
        } else {
            BackMerge::Skipped
        };

        let outcome = IntegrationOutcome {
            merge_commit: trunk_commit.max(0),
            integration_source: merge_rev,
            back_merge,
        };
        info!(?outcome, "integration finished");
        Ok(outcome)
    }

    /// Record mainline revision `merge_commit` as merged on the branch.
    async fn back_merge(
        &self,
        wc: &Path,
        upstream_url: &str,
        merge_commit: i64,
    ) -> Result<BackMerge, SvnError> {
        let message = envelope::back_merge_message(merge_commit);
        self.log.line(message.trim_start_matches(envelope::REBASE_PREFIX));
        self.backend.update(wc).await?;

        let request = MergeRequest::RecordOnly {
            source: upstream_url.to_string(),
            revision: merge_commit,
        };
        let mut detector = ConflictDetector::new();
        self.backend.merge(wc, &request, &mut detector).await?;
        if detector.found_conflict() {
            self.log_conflicts(&detector);
            self.discard_merge(wc, &detector).await?;
            self.log
                .line("Conflict found. Please sync with the upstream to resolve this error.");
            warn!(merge_commit, "back-merge conflicted");
            return Ok(BackMerge::Conflicted);
        }

        let rev = self.backend.commit(wc, &message).await?;
        if rev < 0 {
            self.log.line("  No changes since the last integration");
            Ok(BackMerge::NothingToCommit)
        } else {
            self.log.line(format!("  committed revision {}", rev));
            Ok(BackMerge::Committed { revision: rev })
        }
    }

    /// Revert `wc` and delete what the failed merge added.
    async fn discard_merge(&self, wc: &Path, detector: &ConflictDetector) -> Result<(), SvnError> {
        self.backend.revert(wc).await?;
        for added in detector.added_paths() {
            let path = Path::new(added);
            // svn prints paths under the working copy argument it was given.
            let path = if path.is_absolute() || path.starts_with(wc) {
                path.to_path_buf()
            } else {
                wc.join(path)
            };
            if path == wc || !path.starts_with(wc) {
                continue;
            }
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match removed {
                Ok(()) => debug!(path = %path.display(), "removed path added by the reverted merge"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn log_conflicts(&self, detector: &ConflictDetector) {
        for path in detector.conflicted_paths() {
            self.log.line(format!("  C {}", path));
        }
    }
}
