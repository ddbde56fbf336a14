//! Per-branch reconciliation task scheduler.
//!
//! A branch owns exactly one working copy, so at most one task per branch is
//! admitted at a time. A second request of the same kind joins the pending
//! task; a request of the other kind is rejected until the branch is idle.
//! Unrelated branches run in parallel, bounded by a shared pool of executor
//! slots.
//!
//! ```text
//! submit -> Queued -> Running -> Succeeded | Conflicted | Failed
//!              \-> Cancelled
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::errors::{DatabaseError, SchedulerError};
use crate::models::{Project, TaskKind, TaskRun, TaskState};
use crate::reconcile::{Reconciler, TaskRequest, TaskResult};
use crate::svn::VcsBackend;
use crate::task_log::TaskLog;

/// Aggregate counters across all branches.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub submitted: AtomicU64,
    pub coalesced: AtomicU64,
    pub rejected: AtomicU64,
    pub succeeded: AtomicU64,
    pub conflicted: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
}

impl SchedulerStats {
    fn count(&self, state: TaskState) {
        let counter = match state {
            TaskState::Succeeded => &self.succeeded,
            TaskState::Conflicted => &self.conflicted,
            TaskState::Failed => &self.failed,
            TaskState::Cancelled => &self.cancelled,
            TaskState::Queued | TaskState::Running => return,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Final report of a task run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub run_id: String,
    pub project_id: String,
    pub project_name: String,
    pub kind: TaskKind,
    pub state: TaskState,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub log: Vec<String>,
}

type Published = Option<Arc<TaskReport>>;

struct Pending {
    run_id: String,
    kind: TaskKind,
    state: TaskState,
    rx: watch::Receiver<Published>,
    cancel: Option<oneshot::Sender<()>>,
}

/// Waits for the completion of a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    run_id: String,
    project_name: String,
    kind: TaskKind,
    coalesced: bool,
    rx: watch::Receiver<Published>,
}

impl TaskHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// True when this request joined a task that was already pending.
    pub fn is_coalesced(&self) -> bool {
        self.coalesced
    }

    /// Resolve once the task finished. Conflicts and cancellations resolve
    /// normally; backend faults and configuration errors are returned as
    /// [`SchedulerError::TaskFailed`].
    pub async fn wait(mut self) -> Result<TaskReport, SchedulerError> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(report) = current {
                return finish(&report);
            }
            if self.rx.changed().await.is_err() {
                let last = self.rx.borrow().clone();
                return match last {
                    Some(report) => finish(&report),
                    None => Err(SchedulerError::WorkerLost(self.project_name)),
                };
            }
        }
    }
}

fn finish(report: &TaskReport) -> Result<TaskReport, SchedulerError> {
    if report.state == TaskState::Failed {
        return Err(SchedulerError::TaskFailed {
            branch: report.project_name.clone(),
            kind: report.kind.to_string(),
            detail: report.error.clone().unwrap_or_default(),
        });
    }
    Ok(report.clone())
}

/// Snapshot of a pending task.
#[derive(Debug, Clone, Serialize)]
pub struct PendingTask {
    pub project_id: String,
    pub run_id: String,
    pub kind: TaskKind,
    pub state: TaskState,
}

pub struct ReconciliationScheduler<B: VcsBackend + ?Sized + 'static> {
    reconciler: Arc<Reconciler<B>>,
    slots: Arc<Semaphore>,
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    stats: Arc<SchedulerStats>,
}

impl<B: VcsBackend + ?Sized + 'static> Clone for ReconciliationScheduler<B> {
    fn clone(&self) -> Self {
        Self {
            reconciler: Arc::clone(&self.reconciler),
            slots: Arc::clone(&self.slots),
            pending: Arc::clone(&self.pending),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<B: VcsBackend + ?Sized + 'static> ReconciliationScheduler<B> {
    /// `max_concurrent` executor slots are shared by all branches.
    pub fn new(reconciler: Arc<Reconciler<B>>, max_concurrent: usize) -> Self {
        info!(max_concurrent, "reconciliation scheduler created");
        Self {
            reconciler,
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<B>> {
        &self.reconciler
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn pending(&self) -> Vec<PendingTask> {
        let mut tasks: Vec<PendingTask> = lock(&self.pending)
            .iter()
            .map(|(project_id, p)| PendingTask {
                project_id: project_id.clone(),
                run_id: p.run_id.clone(),
                kind: p.kind,
                state: p.state,
            })
            .collect();
        tasks.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        tasks
    }

    /// True when a task for the project is queued or running.
    pub fn is_busy(&self, project_id: &str) -> bool {
        lock(&self.pending).contains_key(project_id)
    }

    /// Submit a task for the project named `project_name`. Must be called
    /// from within a tokio runtime.
    pub fn submit(
        &self,
        project_name: &str,
        request: TaskRequest,
    ) -> Result<TaskHandle, SchedulerError> {
        let project = self
            .reconciler
            .db()
            .get_project_by_name(project_name)?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "project".into(),
                id: project_name.to_string(),
            })?;
        let kind = request.kind();
        self.stats.submitted.fetch_add(1, Ordering::SeqCst);

        let mut pending = lock(&self.pending);
        if let Some(existing) = pending.get(&project.id) {
            if existing.kind == kind {
                self.stats.coalesced.fetch_add(1, Ordering::SeqCst);
                info!(project = %project.name, %kind, run_id = %existing.run_id, "joined pending task");
                return Ok(TaskHandle {
                    run_id: existing.run_id.clone(),
                    project_name: project.name.clone(),
                    kind,
                    coalesced: true,
                    rx: existing.rx.clone(),
                });
            }
            self.stats.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(SchedulerError::Busy {
                branch: project.name.clone(),
                pending: existing.kind.to_string(),
            });
        }

        let run = TaskRun {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            kind,
            state: TaskState::Queued,
            detail: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.reconciler.db().insert_task_run(&run)?;

        let (tx, rx) = watch::channel::<Published>(None);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        pending.insert(
            project.id.clone(),
            Pending {
                run_id: run.id.clone(),
                kind,
                state: TaskState::Queued,
                rx: rx.clone(),
                cancel: Some(cancel_tx),
            },
        );
        drop(pending);

        info!(project = %project.name, %kind, run_id = %run.id, "queued reconciliation task");
        let handle = TaskHandle {
            run_id: run.id.clone(),
            project_name: project.name.clone(),
            kind,
            coalesced: false,
            rx,
        };
        let worker = self.clone();
        tokio::spawn(async move {
            worker.execute(project, request, run.id, tx, cancel_rx).await;
        });
        Ok(handle)
    }

    /// Withdraw the queued task of a project. Running tasks are never
    /// interrupted; returns whether a task was withdrawn.
    pub fn cancel_queued(&self, project_name: &str) -> Result<bool, SchedulerError> {
        let Some(project) = self.reconciler.db().get_project_by_name(project_name)? else {
            return Ok(false);
        };
        let mut pending = lock(&self.pending);
        let Some(entry) = pending.get_mut(&project.id) else {
            return Ok(false);
        };
        if entry.state != TaskState::Queued {
            return Ok(false);
        }
        entry.state = TaskState::Cancelled;
        if let Some(cancel) = entry.cancel.take() {
            let _ = cancel.send(());
        }
        info!(project = %project.name, run_id = %entry.run_id, "cancelled queued task");
        Ok(true)
    }

    async fn execute(
        self,
        project: Project,
        request: TaskRequest,
        run_id: String,
        tx: watch::Sender<Published>,
        cancel_rx: oneshot::Receiver<()>,
    ) {
        let kind = request.kind();
        let permit = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => permit.ok(),
            _ = cancel_rx => None,
        };

        let admitted = {
            let mut pending = lock(&self.pending);
            match pending.get_mut(&project.id) {
                Some(entry) if permit.is_some() && entry.state == TaskState::Queued => {
                    entry.state = TaskState::Running;
                    entry.cancel = None;
                    true
                }
                _ => false,
            }
        };
        if !admitted {
            self.complete(&project, kind, &run_id, TaskState::Cancelled, Some(TaskResult::Cancelled), None, Vec::new(), &tx);
            return;
        }

        if let Err(e) = self
            .reconciler
            .db()
            .update_task_run(&run_id, TaskState::Running, None)
        {
            warn!(error = %e, %run_id, "could not mark task running");
        }

        let log = Arc::new(match TaskLog::open(self.reconciler.log_dir(), &project.id, kind) {
            Ok(log) => log,
            Err(e) => {
                warn!(error = %e, project = %project.name, "task log unavailable, keeping it in memory");
                TaskLog::memory()
            }
        });
        info!(project = %project.name, %kind, %run_id, "running reconciliation task");
        // Run on its own task so a panic still completes the run and frees
        // the branch.
        let run = tokio::spawn({
            let reconciler = Arc::clone(&self.reconciler);
            let project = project.clone();
            let log = Arc::clone(&log);
            async move { reconciler.run(&project, &request, &log).await }
        });
        let result = run.await;
        drop(permit);

        let (state, result, failure) = match result {
            Ok(Ok(r)) if r.is_conflict() => (TaskState::Conflicted, Some(r), None),
            Ok(Ok(r)) => (TaskState::Succeeded, Some(r), None),
            Ok(Err(e)) => {
                log.line(format!("ERROR: {}", e));
                error!(project = %project.name, %kind, error = %e, "reconciliation task failed");
                (TaskState::Failed, None, Some(e.to_string()))
            }
            Err(join) => {
                let message = panic_message(join);
                log.line(format!("ERROR: task aborted: {}", message));
                error!(project = %project.name, %kind, error = %message, "reconciliation task aborted");
                (TaskState::Failed, None, Some(format!("task aborted: {}", message)))
            }
        };
        self.complete(&project, kind, &run_id, state, result, failure, log.lines(), &tx);
    }

    #[allow(clippy::too_many_arguments)]
    fn complete(
        &self,
        project: &Project,
        kind: TaskKind,
        run_id: &str,
        state: TaskState,
        result: Option<TaskResult>,
        failure: Option<String>,
        log: Vec<String>,
        tx: &watch::Sender<Published>,
    ) {
        let detail = failure
            .clone()
            .or_else(|| result.as_ref().map(TaskResult::summary));
        if let Err(e) = self
            .reconciler
            .db()
            .update_task_run(run_id, state, detail.as_deref())
        {
            warn!(error = %e, %run_id, "could not record task result");
        }

        {
            let mut pending = lock(&self.pending);
            if pending.get(&project.id).map(|p| p.run_id.as_str()) == Some(run_id) {
                pending.remove(&project.id);
            }
        }
        self.stats.count(state);
        info!(project = %project.name, %kind, %state, ?detail, "reconciliation task finished");

        let report = TaskReport {
            run_id: run_id.to_string(),
            project_id: project.id.clone(),
            project_name: project.name.clone(),
            kind,
            state,
            result,
            error: failure,
            log,
        };
        tx.send_replace(Some(Arc::new(report)));
    }
}

fn panic_message(join: JoinError) -> String {
    if !join.is_panic() {
        return join.to_string();
    }
    let payload = join.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("scheduler mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}
