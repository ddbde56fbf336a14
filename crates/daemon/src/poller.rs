//! Poll loop standing in for the build system.
//!
//! Each cycle records a build for every project whose location moved since
//! its last build, then submits integrate tasks for auto-integrate branches
//! with an unintegrated build and rebase tasks for auto-rebase branches whose
//! upstream produced a build they have not been rebased onto.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};

use svnmerge_core::branch;
use svnmerge_core::errors::{CoreError, SchedulerError};
use svnmerge_core::models::{BuildRecord, BuildResult, Project, RebaseTarget, TaskState};
use svnmerge_core::svn::VcsBackend;
use svnmerge_core::{ReconciliationScheduler, TaskRequest};

/// Aggregate statistics across poll cycles.
#[derive(Debug, Default)]
pub struct PollerStats {
    pub total_cycles: AtomicU64,
    pub builds_recorded: AtomicU64,
    pub tasks_submitted: AtomicU64,
    pub tasks_rejected: AtomicU64,
    pub total_errors: AtomicU64,
    pub consecutive_errors: AtomicU64,
}

#[derive(Debug, Default)]
pub struct CycleSummary {
    pub builds: usize,
    pub submitted: usize,
    pub project_errors: usize,
}

fn rebased_key(project_id: &str) -> String {
    format!("rebased_upstream_build:{}", project_id)
}

pub struct Poller<B: VcsBackend + ?Sized + 'static> {
    scheduler: ReconciliationScheduler<B>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    stats: Arc<PollerStats>,
}

impl<B: VcsBackend + ?Sized + 'static> Poller<B> {
    pub fn new(scheduler: ReconciliationScheduler<B>, poll_interval: Duration) -> Self {
        Self {
            scheduler,
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(PollerStats::default()),
        }
    }

    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }

    /// Run until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "poller started"
        );

        // The first tick fires immediately: catch up right after startup.
        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.maybe_run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("poller stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Run one cycle unless the previous one is still in progress.
    async fn maybe_run_cycle(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("skipping poll cycle: previous cycle still running");
            return;
        }

        let cycle = self.stats.total_cycles.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(cycle, "starting poll cycle");

        match self.poll_once().await {
            Ok(summary) => {
                self.stats.consecutive_errors.store(0, Ordering::SeqCst);
                if summary.builds > 0 || summary.submitted > 0 || summary.project_errors > 0 {
                    info!(
                        cycle,
                        builds = summary.builds,
                        submitted = summary.submitted,
                        project_errors = summary.project_errors,
                        "poll cycle completed"
                    );
                }
            }
            Err(e) => {
                let errors = self.stats.total_errors.fetch_add(1, Ordering::SeqCst) + 1;
                let consecutive = self.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    cycle,
                    error = %e,
                    total_errors = errors,
                    consecutive_errors = consecutive,
                    "poll cycle failed"
                );
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// One pass over the project registry.
    pub async fn poll_once(&self) -> Result<CycleSummary, CoreError> {
        let reconciler = self.scheduler.reconciler();
        let db = reconciler.db();
        let projects = db.list_projects()?;
        let mut summary = CycleSummary::default();

        for project in &projects {
            match self.poll_project(project).await {
                Ok(Some(_)) => summary.builds += 1,
                Ok(None) => {}
                Err(e) => {
                    summary.project_errors += 1;
                    warn!(project = %project.name, error = %e, "could not poll project");
                }
            }
        }

        // A branch whose link cannot be followed only disables itself.
        for project in &projects {
            match self.schedule_project(project) {
                Ok(submitted) => summary.submitted += submitted,
                Err(e) => {
                    summary.project_errors += 1;
                    warn!(project = %project.name, error = %e, "could not schedule reconciliation");
                }
            }
        }
        Ok(summary)
    }

    /// Submit the automatic tasks a branch project is due. Returns how many
    /// were queued.
    fn schedule_project(&self, project: &Project) -> Result<usize, CoreError> {
        let db = self.scheduler.reconciler().db();
        if db.get_branch_link(&project.id)?.is_none() {
            return Ok(0);
        }
        let mut submitted = 0;
        if project.auto_integrate && self.wants_integration(project)? {
            let build = db.last_build(&project.id)?.map(|b| b.number);
            let request = TaskRequest::Integrate {
                build,
                post_build: true,
            };
            if self.submit(project, request, None) {
                submitted += 1;
            }
        }
        if project.auto_rebase {
            if let Some(upstream_build) = self.pending_rebase(project)? {
                let request = TaskRequest::Rebase {
                    target: RebaseTarget::Head,
                };
                if self.submit(project, request, Some(upstream_build)) {
                    submitted += 1;
                }
            }
        }
        Ok(submitted)
    }

    /// Record a build when the project location changed since its last one.
    async fn poll_project(&self, project: &Project) -> Result<Option<BuildRecord>, CoreError> {
        let reconciler = self.scheduler.reconciler();
        let Some(url) = reconciler.resolver().resolve(project) else {
            debug!(project = %project.name, location = %project.location, "location does not resolve, skipping");
            return Ok(None);
        };
        let info = reconciler.backend().info(&url).await?;
        let last = reconciler.db().last_build(&project.id)?;
        if last.and_then(|b| b.svn_revision) == Some(info.last_changed_rev) {
            return Ok(None);
        }

        let build = reconciler
            .record_build(project, Some(&url), Some(info.last_changed_rev), BuildResult::Success)
            .await?;
        self.stats.builds_recorded.fetch_add(1, Ordering::SeqCst);
        info!(project = %project.name, build = build.number, revision = info.last_changed_rev, "recorded build");
        Ok(Some(build))
    }

    /// True when the last build is successful and has never been integrated.
    fn wants_integration(&self, project: &Project) -> Result<bool, CoreError> {
        let db = self.scheduler.reconciler().db();
        let Some(build) = db.last_build(&project.id)? else {
            return Ok(false);
        };
        if build.result.is_worse_than(BuildResult::Success) {
            return Ok(false);
        }
        Ok(db.integration_record_for_build(&project.id, build.number)?.is_none())
    }

    /// The upstream build number to rebase onto, if the branch has not been
    /// rebased onto it yet.
    fn pending_rebase(&self, project: &Project) -> Result<Option<i64>, CoreError> {
        let db = self.scheduler.reconciler().db();
        let upstream = branch::resolve_upstream(db, project)?;
        let Some(build) = db.last_build(&upstream.id)? else {
            return Ok(None);
        };
        let done = db.get_state(&rebased_key(&project.id))?;
        if done.as_deref() == Some(build.number.to_string().as_str()) {
            return Ok(None);
        }
        Ok(Some(build.number))
    }

    /// Submit a task and follow it in the background. Returns whether a new
    /// task was queued.
    fn submit(&self, project: &Project, request: TaskRequest, rebased_onto: Option<i64>) -> bool {
        let kind = request.kind();
        let handle = match self.scheduler.submit(&project.name, request) {
            Ok(handle) => handle,
            Err(SchedulerError::Busy { pending, .. }) => {
                self.stats.tasks_rejected.fetch_add(1, Ordering::SeqCst);
                debug!(project = %project.name, %kind, %pending, "branch busy, retrying next cycle");
                return false;
            }
            Err(e) => {
                warn!(project = %project.name, %kind, error = %e, "could not submit task");
                return false;
            }
        };
        if handle.is_coalesced() {
            return false;
        }
        self.stats.tasks_submitted.fetch_add(1, Ordering::SeqCst);

        let reconciler = Arc::clone(self.scheduler.reconciler());
        let project_id = project.id.clone();
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(report) => {
                    info!(project = %report.project_name, kind = %report.kind, state = %report.state, "task finished");
                    if report.state == TaskState::Conflicted {
                        warn!(
                            project = %report.project_name,
                            kind = %report.kind,
                            "reconciliation conflicted, the branch needs a manual merge"
                        );
                    }
                    let settled = matches!(report.state, TaskState::Succeeded | TaskState::Conflicted);
                    if let (true, Some(number)) = (settled, rebased_onto) {
                        if let Err(e) = reconciler
                            .db()
                            .set_state(&rebased_key(&project_id), &number.to_string())
                        {
                            warn!(error = %e, "could not remember rebase point");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "task failed"),
            }
        });
        true
    }
}
