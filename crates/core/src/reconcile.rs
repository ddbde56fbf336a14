//! The reconciliation service: resolves projects, branch links and working
//! copies, runs the merge protocols and records their outcome.
//!
//! Every task kind goes through [`Reconciler::run`], which the scheduler
//! calls once it has granted the branch its working copy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::branch;
use crate::config::AppConfig;
use crate::db::Database;
use crate::envelope;
use crate::errors::{CoreError, DatabaseError, MergeError, SvnError};
use crate::merge::{IntegrateRequest, IntegrationOutcome, MergeExecutor, RebaseOutcome};
use crate::models::{
    AuditEntry, BuildRecord, BuildRef, BuildResult, IntegrationRecord, Project, RebaseTarget,
    TaskKind,
};
use crate::provenance;
use crate::svn::{LocationResolver, LogControl, SvnLogEntry, VcsBackend};
use crate::task_log::TaskLog;

/// One unit of reconciliation work for a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskRequest {
    Rebase {
        target: RebaseTarget,
    },
    Integrate {
        /// Branch build to integrate. Defaults to the last successful build.
        build: Option<i64>,
        /// Run with post-build semantics: only successful builds are
        /// integrated, and a failed integration fails the build.
        post_build: bool,
    },
}

impl TaskRequest {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Rebase { .. } => TaskKind::Rebase,
            Self::Integrate { .. } => TaskKind::Integrate,
        }
    }
}

/// Tagged result of a finished task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskResult {
    Rebased {
        outcome: RebaseOutcome,
    },
    Integrated {
        record: IntegrationRecord,
        outcome: IntegrationOutcome,
    },
    /// Nothing was attempted.
    Skipped {
        reason: String,
    },
    Cancelled,
}

impl TaskResult {
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Rebased { outcome } => outcome.is_conflict(),
            Self::Integrated { outcome, .. } => outcome.is_conflict(),
            _ => false,
        }
    }

    /// Short human-readable summary.
    pub fn summary(&self) -> String {
        match self {
            Self::Rebased { outcome } => match outcome {
                RebaseOutcome::Committed { revision } => format!("rebased at r{}", revision),
                RebaseOutcome::NothingToCommit => "rebase: nothing to commit".into(),
                RebaseOutcome::Conflicted => "rebase conflicted".into(),
                RebaseOutcome::NoMatchingBuild => "rebase: no matching upstream build".into(),
            },
            Self::Integrated { outcome, .. } => match outcome.merge_commit {
                0 => format!("no-op (source r{})", outcome.integration_source),
                -1 => format!("integration conflicted (source r{})", outcome.integration_source),
                rev => format!(
                    "integrated r{} as upstream r{}",
                    outcome.integration_source, rev
                ),
            },
            Self::Skipped { reason } => format!("skipped: {}", reason),
            Self::Cancelled => "cancelled".into(),
        }
    }
}

/// Integration state of one branch.
#[derive(Debug, Clone, Serialize)]
pub struct BranchStatus {
    pub project: Project,
    pub upstream: Option<String>,
    pub last_record: Option<IntegrationRecord>,
    pub last_integrated_build: Option<BuildRecord>,
    /// First upstream build containing the last integration, -1 if unknown.
    pub upstream_build: i64,
}

/// A mainline log entry together with the branch build that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedEntry {
    pub entry: SvnLogEntry,
    pub origin: Option<BuildRef>,
    pub origin_project: Option<String>,
}

pub struct Reconciler<B: VcsBackend + ?Sized> {
    db: Arc<Database>,
    backend: Arc<B>,
    resolver: LocationResolver,
    workspace_dir: PathBuf,
    log_dir: PathBuf,
}

impl<B: VcsBackend + ?Sized> Reconciler<B> {
    pub fn new(db: Arc<Database>, backend: Arc<B>, config: &AppConfig) -> Self {
        Self {
            db,
            backend,
            resolver: LocationResolver::new(config.environment.clone()),
            workspace_dir: config.daemon.workspace_dir(),
            log_dir: config.daemon.task_log_dir(),
        }
    }

    /// A reconciler with explicit directories and resolver.
    pub fn with_dirs(
        db: Arc<Database>,
        backend: Arc<B>,
        resolver: LocationResolver,
        workspace_dir: PathBuf,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            backend,
            resolver,
            workspace_dir,
            log_dir,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn resolver(&self) -> &LocationResolver {
        &self.resolver
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    pub fn project(&self, name: &str) -> Result<Project, DatabaseError> {
        self.db
            .get_project_by_name(name)?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "project".into(),
                id: name.to_string(),
            })
    }

    /// The expanded svn URL of a project.
    pub fn project_url(&self, project: &Project) -> Result<String, MergeError> {
        self.resolver
            .resolve(project)
            .ok_or_else(|| MergeError::NoLocation {
                project: project.name.clone(),
                location: project.location.clone(),
            })
    }

    pub fn working_copy_path(&self, project: &Project) -> PathBuf {
        project
            .working_copy
            .clone()
            .unwrap_or_else(|| self.workspace_dir.join(&project.id))
    }

    /// Check out the branch unless its working copy already exists.
    async fn ensure_working_copy(&self, project: &Project, url: &str) -> Result<PathBuf, MergeError> {
        let wc = self.working_copy_path(project);
        if wc.join(".svn").is_dir() {
            return Ok(wc);
        }
        if let Some(parent) = wc.parent() {
            std::fs::create_dir_all(parent).map_err(SvnError::from)?;
        }
        let rev = self.backend.checkout(url, None, &wc).await?;
        info!(project = %project.name, wc = %wc.display(), rev, "checked out working copy");
        Ok(wc)
    }

    // -----------------------------------------------------------------------
    // Task dispatch
    // -----------------------------------------------------------------------

    /// Run one task against the branch working copy, logging progress to
    /// `log`.
    pub async fn run(
        &self,
        project: &Project,
        request: &TaskRequest,
        log: &TaskLog,
    ) -> Result<TaskResult, CoreError> {
        match request {
            TaskRequest::Rebase { target } => {
                let outcome = self.rebase(project, *target, log).await?;
                Ok(TaskResult::Rebased { outcome })
            }
            TaskRequest::Integrate {
                build,
                post_build: true,
            } => self.publish(project, *build, log).await,
            TaskRequest::Integrate {
                build,
                post_build: false,
            } => {
                let (record, outcome) = self.integrate(project, *build, log).await?;
                Ok(TaskResult::Integrated { record, outcome })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Rebase
    // -----------------------------------------------------------------------

    pub async fn rebase(
        &self,
        project: &Project,
        target: RebaseTarget,
        log: &TaskLog,
    ) -> Result<RebaseOutcome, MergeError> {
        let upstream = branch::resolve_upstream(&self.db, project)?;
        let upstream_url = self.project_url(&upstream)?;
        let branch_url = self.project_url(project)?;

        let revision = match target {
            RebaseTarget::Head => None,
            RebaseTarget::Revision(rev) => Some(rev),
            RebaseTarget::Permalink(permalink) => {
                let Some(build) = self.db.resolve_permalink(&upstream.id, permalink)? else {
                    log.line(format!(
                        "No build that matches {}. Rebase is no-nop.",
                        permalink.display_name()
                    ));
                    return Ok(RebaseOutcome::NoMatchingBuild);
                };
                let rev = build.svn_revision.ok_or_else(|| MergeError::MissingBuildInfo {
                    project: upstream.name.clone(),
                    build: build.number,
                    detail: "Unable to determine the Subversion revision number".into(),
                })?;
                Some(rev)
            }
        };

        let wc = self.ensure_working_copy(project, &branch_url).await?;
        let outcome = MergeExecutor::new(self.backend.as_ref(), log)
            .rebase(&wc, &upstream_url, revision)
            .await?;

        if outcome.is_conflict() {
            self.mark_unstable(project, &upstream, log)?;
        }
        let entry = if outcome.is_conflict() {
            AuditEntry::failure("rebase", &format!("conflict rebasing from {}", upstream.name))
        } else {
            AuditEntry::success(
                "rebase",
                &format!("from {} ({}): r{}", upstream.name, target, outcome.as_revision()),
            )
        };
        self.db.insert_audit_entry(&entry.for_project(&project.id))?;
        Ok(outcome)
    }

    /// A conflicted rebase marks the branch's last build unstable. Worse
    /// results are kept.
    fn mark_unstable(&self, project: &Project, upstream: &Project, log: &TaskLog) -> Result<(), MergeError> {
        log.line(format!(
            "Rebase from {} conflicted. The branch needs a manual merge.",
            upstream.name
        ));
        let Some(build) = self.db.last_build(&project.id)? else {
            return Ok(());
        };
        if build.result.is_worse_than(BuildResult::Unstable) {
            return Ok(());
        }
        self.db
            .set_build_result(&project.id, build.number, BuildResult::Unstable)?;
        log.line(format!("Marked build #{} unstable", build.number));
        warn!(project = %project.name, build = build.number, "rebase conflicted, build marked unstable");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Integrate
    // -----------------------------------------------------------------------

    /// Integrate branch build `build` (the last successful build by default)
    /// into the upstream and record the outcome.
    pub async fn integrate(
        &self,
        project: &Project,
        build: Option<i64>,
        log: &TaskLog,
    ) -> Result<(IntegrationRecord, IntegrationOutcome), MergeError> {
        let upstream = branch::resolve_upstream(&self.db, project)?;
        let upstream_url = self.project_url(&upstream)?;
        let build = self.integration_build(project, build)?;
        let branch_revision = build.svn_revision.ok_or_else(|| MergeError::MissingBuildInfo {
            project: project.name.clone(),
            build: build.number,
            detail: "build has no recorded svn revision".into(),
        })?;
        let branch_url = match build.svn_url.clone() {
            Some(url) => url,
            None => self.project_url(project)?,
        };

        let head = envelope::integration_head(&format!("{} #{}", project.name, build.number));
        let request = IntegrateRequest {
            upstream_url,
            message: envelope::integration_message(&head, &branch_url, branch_revision),
            branch_url: Some(branch_url.clone()),
            branch_revision: Some(branch_revision),
            last_integration_source: self
                .db
                .last_settled_integration_record(&project.id)?
                .map(|r| r.integration_source),
        };

        let wc = self.ensure_working_copy(project, &self.project_url(project)?).await?;
        let outcome = MergeExecutor::new(self.backend.as_ref(), log)
            .integrate(&wc, &request)
            .await?;
        if outcome.integration_source < 0 {
            return Err(MergeError::InvalidIntegrationSource(
                outcome.integration_source,
            ));
        }

        let record = self.db.insert_integration_record(
            &project.id,
            build.number,
            &head,
            outcome.merge_commit,
            outcome.integration_source,
            outcome.back_merge.revision(),
        )?;
        provenance::record_fingerprint(
            self.db.as_ref(),
            &build.build_ref(),
            &head,
            outcome.merge_commit,
        )?;

        let details = format!(
            "{} #{} -> {}: merge_commit={} source={}",
            project.name, build.number, upstream.name, outcome.merge_commit, outcome.integration_source
        );
        let entry = if outcome.is_conflict() {
            AuditEntry::failure("integrate", &details)
        } else {
            AuditEntry::success("integrate", &details)
        };
        self.db.insert_audit_entry(&entry.for_project(&project.id))?;
        info!(project = %project.name, build = build.number, ?outcome, "integration recorded");
        Ok((record, outcome))
    }

    fn integration_build(&self, project: &Project, number: Option<i64>) -> Result<BuildRecord, MergeError> {
        let build = match number {
            Some(n) => self.db.get_build(&project.id, n)?,
            None => self.db.last_successful_build(&project.id)?,
        };
        build.ok_or_else(|| MergeError::MissingBuildInfo {
            project: project.name.clone(),
            build: number.unwrap_or(-1),
            detail: "no such build".into(),
        })
    }

    /// Post-build integration of `build`.
    pub async fn publish(
        &self,
        project: &Project,
        build: Option<i64>,
        log: &TaskLog,
    ) -> Result<TaskResult, CoreError> {
        let record = match build {
            Some(n) => self.db.get_build(&project.id, n)?,
            None => self.db.last_build(&project.id)?,
        };
        let Some(record) = record else {
            return Err(MergeError::MissingBuildInfo {
                project: project.name.clone(),
                build: build.unwrap_or(-1),
                detail: "no such build".into(),
            }
            .into());
        };
        if record.result.is_worse_than(BuildResult::Success) {
            return Ok(TaskResult::Skipped {
                reason: format!("build #{} is {}", record.number, record.result),
            });
        }
        if self.db.get_branch_link(&project.id)?.is_none() {
            log.line("Upstream Subversion URL is not specified. Configuration problem?");
            self.fail_build(project, record.number);
            return Err(MergeError::NotABranch(project.name.clone()).into());
        }

        let (integration, outcome) = match self.integrate(project, Some(record.number), log).await {
            Ok(integrated) => integrated,
            Err(e) => {
                log.line(format!("Integration failed: {}", e));
                self.fail_build(project, record.number);
                return Err(e.into());
            }
        };
        if outcome.merge_commit < 0 {
            self.db
                .set_build_result(&project.id, record.number, BuildResult::Failure)?;
        }
        Ok(TaskResult::Integrated {
            record: integration,
            outcome,
        })
    }

    /// Mark a build failed while an error is propagating.
    fn fail_build(&self, project: &Project, number: i64) {
        if let Err(e) = self
            .db
            .set_build_result(&project.id, number, BuildResult::Failure)
        {
            warn!(project = %project.name, build = number, error = %e, "could not mark build failed");
        }
    }

    // -----------------------------------------------------------------------
    // Builds and provenance
    // -----------------------------------------------------------------------

    /// Build-completed callback. Mainline builds register themselves as
    /// consumers of the integrations in their change log.
    pub async fn record_build(
        &self,
        project: &Project,
        svn_url: Option<&str>,
        svn_revision: Option<i64>,
        result: BuildResult,
    ) -> Result<BuildRecord, CoreError> {
        let build = self.db.record_build(&project.id, svn_url, svn_revision, result)?;
        if !project.integratable {
            return Ok(build);
        }
        let (Some(url), Some(to)) = (svn_url, svn_revision) else {
            return Ok(build);
        };
        let from = self
            .db
            .previous_build(&project.id, build.number)?
            .and_then(|b| b.svn_revision)
            .map(|r| r + 1);
        let Some(from) = from.filter(|f| *f <= to) else {
            debug!(project = %project.name, "no change log for this build");
            return Ok(build);
        };

        match self.change_log(url, from, to).await {
            Ok(entries) => {
                provenance::register_mainline_build(self.db.as_ref(), &build.build_ref(), &entries)?;
            }
            Err(e) => {
                warn!(project = %project.name, error = %e, "could not read change log of mainline build");
            }
        }
        Ok(build)
    }

    async fn change_log(&self, url: &str, from: i64, to: i64) -> Result<Vec<SvnLogEntry>, CoreError> {
        let mut entries = Vec::new();
        self.backend
            .log(url, from, Some(to), &mut |entry: &SvnLogEntry| {
                entries.push(entry.clone());
                LogControl::Continue
            })
            .await?;
        Ok(entries)
    }

    /// Log of `project` over `[from, to]` with every integration commit
    /// annotated with the branch build that produced it.
    pub async fn annotated_change_log(
        &self,
        project: &Project,
        from: i64,
        to: Option<i64>,
    ) -> Result<Vec<AnnotatedEntry>, CoreError> {
        let url = self.project_url(project)?;
        let to = match to {
            Some(t) => t,
            None => self.backend.info(&url).await?.revision,
        };
        let mut annotated = Vec::new();
        for entry in self.change_log(&url, from, to).await? {
            let origin = provenance::annotate(self.db.as_ref(), &entry)?;
            let origin_project = match &origin {
                Some(o) => self.db.get_project(&o.project_id)?.map(|p| p.name),
                None => None,
            };
            annotated.push(AnnotatedEntry {
                entry,
                origin,
                origin_project,
            });
        }
        Ok(annotated)
    }

    /// Integration state of a branch project.
    pub fn status(&self, project: &Project) -> Result<BranchStatus, CoreError> {
        let link = self.db.get_branch_link(&project.id)?;
        let upstream_id = match &link {
            Some(l) => self.db.get_project_by_name(&l.upstream)?.map(|p| p.id),
            None => None,
        };
        let last_record = self.db.last_integration_record(&project.id)?;
        let last_integrated_build = self.db.last_integrated_build(&project.id)?;

        let upstream_build = match &last_integrated_build {
            Some(b) => match self.db.integration_record_for_build(&project.id, b.number)? {
                Some(r) => provenance::upstream_build_number(
                    self.db.as_ref(),
                    &r,
                    upstream_id.as_deref(),
                ),
                None => -1,
            },
            None => -1,
        };

        Ok(BranchStatus {
            project: project.clone(),
            upstream: link.map(|l| l.upstream),
            last_record,
            last_integrated_build,
            upstream_build,
        })
    }

    /// Upstream build number for one branch build, -1 when unknown.
    pub fn upstream_build_number(&self, project: &Project, build: i64) -> Result<i64, CoreError> {
        let Some(record) = self.db.integration_record_for_build(&project.id, build)? else {
            return Ok(-1);
        };
        let upstream_id = match self.db.get_branch_link(&project.id)? {
            Some(l) => self.db.get_project_by_name(&l.upstream)?.map(|p| p.id),
            None => None,
        };
        Ok(provenance::upstream_build_number(
            self.db.as_ref(),
            &record,
            upstream_id.as_deref(),
        ))
    }
}
