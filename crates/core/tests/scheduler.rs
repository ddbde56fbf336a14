//! Tests for per-branch task admission and the shared executor slots.

mod common;

use std::sync::Arc;
use std::time::Duration;

use svnmerge_core::branch::{self, NewBranch};
use svnmerge_core::errors::SchedulerError;
use svnmerge_core::models::{BuildResult, RebaseTarget, TaskKind, TaskState};
use svnmerge_core::task_log::read_task_log;
use svnmerge_core::{ReconciliationScheduler, TaskRequest, TaskResult};

use common::{fixture, url, Fixture};

fn rebase() -> TaskRequest {
    TaskRequest::Rebase {
        target: RebaseTarget::Head,
    }
}

fn integrate() -> TaskRequest {
    TaskRequest::Integrate {
        build: None,
        post_build: false,
    }
}

async fn second_branch(f: &Fixture) {
    branch::new_branch(
        &f.db,
        f.svn.as_ref(),
        f.reconciler.resolver(),
        &f.trunk,
        &NewBranch {
            name: "b2",
            attach: false,
            commit_message: Some("second branch"),
            default_message: "unused",
            auto_integrate: false,
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_task_runs_to_completion_and_is_persisted() {
    let f = fixture().await;
    let rev = f.svn.edit("branches/b1", &[("b", "bravo\n")], "add b");
    f.reconciler
        .record_build(&f.branch, Some(&url("branches/b1")), Some(rev), BuildResult::Success)
        .await
        .unwrap();
    let scheduler = ReconciliationScheduler::new(Arc::clone(&f.reconciler), 2);

    let handle = scheduler.submit("trunk-b1", integrate()).unwrap();
    assert_eq!(handle.kind(), TaskKind::Integrate);
    assert!(!handle.is_coalesced());
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, TaskState::Succeeded);
    assert!(matches!(report.result, Some(TaskResult::Integrated { .. })));
    assert!(report.log.iter().any(|l| l.contains("Switching to the upstream")));
    assert!(!scheduler.is_busy(&f.branch.id));

    let runs = f.db.list_task_runs(Some(&f.branch.id), 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, report.run_id);
    assert_eq!(runs[0].state, TaskState::Succeeded);
    assert!(runs[0].finished_at.is_some());

    let persisted = read_task_log(f.reconciler.log_dir(), &f.branch.id, TaskKind::Integrate).unwrap();
    assert!(persisted.contains("Switching back to the branch"));
}

#[tokio::test]
async fn test_same_kind_joins_pending_task() {
    let f = fixture().await;
    f.svn.set_merge_delay(Duration::from_millis(100));
    f.svn.edit("trunk", &[("a", "alpha2\n")], "trunk work");
    let scheduler = ReconciliationScheduler::new(Arc::clone(&f.reconciler), 2);

    let first = scheduler.submit("trunk-b1", rebase()).unwrap();
    let second = scheduler.submit("trunk-b1", rebase()).unwrap();
    assert!(second.is_coalesced());
    assert_eq!(first.run_id(), second.run_id());

    let a = first.wait().await.unwrap();
    let b = second.wait().await.unwrap();
    assert_eq!(a.run_id, b.run_id);
    assert_eq!(f.svn.merge_count(), 1);
    assert_eq!(scheduler.stats().coalesced.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_other_kind_is_rejected_while_pending() {
    let f = fixture().await;
    f.svn.set_merge_delay(Duration::from_millis(100));
    let scheduler = ReconciliationScheduler::new(Arc::clone(&f.reconciler), 2);

    let running = scheduler.submit("trunk-b1", rebase()).unwrap();
    let err = scheduler.submit("trunk-b1", integrate()).unwrap_err();
    match err {
        SchedulerError::Busy { branch, pending } => {
            assert_eq!(branch, "trunk-b1");
            assert_eq!(pending, "rebase");
        }
        other => panic!("expected Busy, got {:?}", other),
    }

    running.wait().await.unwrap();
    // Idle again: the integrate is admitted, and fails for lack of a build.
    let late = scheduler.submit("trunk-b1", integrate()).unwrap();
    assert!(matches!(
        late.wait().await,
        Err(SchedulerError::TaskFailed { .. })
    ));
}

#[tokio::test]
async fn test_conflict_is_a_normal_completion() {
    let f = fixture().await;
    f.svn.edit("branches/b1", &[("d", "created in branch\n")], "branch adds d");
    f.svn.edit("trunk", &[("d", "created in trunk\n")], "trunk adds d");
    let scheduler = ReconciliationScheduler::new(Arc::clone(&f.reconciler), 1);

    let report = scheduler.submit("trunk-b1", rebase()).unwrap().wait().await.unwrap();
    assert_eq!(report.state, TaskState::Conflicted);
    let runs = f.db.list_task_runs(Some(&f.branch.id), 1).unwrap();
    assert_eq!(runs[0].state, TaskState::Conflicted);
}

#[tokio::test]
async fn test_backend_fault_fails_task() {
    let f = fixture().await;
    f.svn.fail_merges(true);
    let scheduler = ReconciliationScheduler::new(Arc::clone(&f.reconciler), 1);

    let err = scheduler
        .submit("trunk-b1", rebase())
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    match err {
        SchedulerError::TaskFailed { branch, kind, detail } => {
            assert_eq!(branch, "trunk-b1");
            assert_eq!(kind, "rebase");
            assert!(detail.contains("scripted merge failure"));
        }
        other => panic!("expected TaskFailed, got {:?}", other),
    }
    let runs = f.db.list_task_runs(Some(&f.branch.id), 1).unwrap();
    assert_eq!(runs[0].state, TaskState::Failed);
}

#[tokio::test]
async fn test_panicking_task_fails_and_frees_branch() {
    let f = fixture().await;
    f.svn.panic_on_merge(true);
    let scheduler = ReconciliationScheduler::new(Arc::clone(&f.reconciler), 1);

    let err = scheduler
        .submit("trunk-b1", rebase())
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    match err {
        SchedulerError::TaskFailed { detail, .. } => {
            assert!(detail.contains("scripted merge panic"), "{}", detail)
        }
        other => panic!("expected TaskFailed, got {:?}", other),
    }
    assert!(!scheduler.is_busy(&f.branch.id));
    let runs = f.db.list_task_runs(Some(&f.branch.id), 1).unwrap();
    assert_eq!(runs[0].state, TaskState::Failed);

    f.svn.panic_on_merge(false);
    let report = scheduler
        .submit("trunk-b1", rebase())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.state, TaskState::Succeeded);
}

#[tokio::test]
async fn test_unknown_project_is_rejected() {
    let f = fixture().await;
    let scheduler = ReconciliationScheduler::new(Arc::clone(&f.reconciler), 1);
    assert!(matches!(
        scheduler.submit("nope", rebase()),
        Err(SchedulerError::DatabaseError(_))
    ));
}

#[tokio::test]
async fn test_queued_task_can_be_cancelled() {
    let f = fixture().await;
    second_branch(&f).await;
    f.svn.set_merge_delay(Duration::from_millis(100));
    let scheduler = ReconciliationScheduler::new(Arc::clone(&f.reconciler), 1);

    let first = scheduler.submit("trunk-b1", rebase()).unwrap();
    let queued = scheduler.submit("trunk-b2", rebase()).unwrap();
    assert!(scheduler.cancel_queued("trunk-b2").unwrap());
    assert!(!scheduler.cancel_queued("trunk-b2").unwrap());

    let report = queued.wait().await.unwrap();
    assert_eq!(report.state, TaskState::Cancelled);
    assert!(matches!(report.result, Some(TaskResult::Cancelled)));
    assert_eq!(first.wait().await.unwrap().state, TaskState::Succeeded);
    assert_eq!(f.svn.merge_count(), 1);
}

#[tokio::test]
async fn test_slots_bound_parallel_branches() {
    let f = fixture().await;
    second_branch(&f).await;
    f.svn.set_merge_delay(Duration::from_millis(50));
    f.svn.edit("trunk", &[("a", "alpha2\n")], "trunk work");
    let scheduler = ReconciliationScheduler::new(Arc::clone(&f.reconciler), 1);

    let b1 = scheduler.submit("trunk-b1", rebase()).unwrap();
    let b2 = scheduler.submit("trunk-b2", rebase()).unwrap();
    assert_eq!(scheduler.pending().len(), 2);

    assert_eq!(b1.wait().await.unwrap().state, TaskState::Succeeded);
    assert_eq!(b2.wait().await.unwrap().state, TaskState::Succeeded);
    assert_eq!(f.svn.max_concurrent_merges(), 1);
    assert_eq!(f.svn.file("branches/b2", "a").as_deref(), Some("alpha2\n"));
}
