//! Rebase, integrate, build records and the read-only reports built on them.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use tracing::debug;

use svnmerge_core::config::AppConfig;
use svnmerge_core::db::Database;
use svnmerge_core::models::{BuildResult, Permalink, RebaseTarget, TaskKind, TaskState};
use svnmerge_core::reconcile::BranchStatus;
use svnmerge_core::svn::{SvnClient, VcsBackend};
use svnmerge_core::task_log::read_task_log;
use svnmerge_core::{Reconciler, ReconciliationScheduler, TaskReport, TaskRequest};

use crate::project::find;
use crate::{style, truncate};

type SvnReconciler = Reconciler<SvnClient>;

#[derive(Subcommand, Debug)]
pub enum BuildAction {
    /// Record a completed build of a project.
    Record {
        project: String,

        /// Built revision (the project's last changed revision by default).
        #[arg(long)]
        revision: Option<i64>,

        /// Built URL (the project location by default).
        #[arg(long)]
        url: Option<String>,

        #[arg(
            long,
            default_value = "success",
            value_parser = ["success", "unstable", "failure", "aborted"]
        )]
        result: String,
    },

    /// List recent builds of a project.
    List {
        project: String,

        #[arg(short, long, default_value = "10")]
        limit: u32,
    },
}

fn reconciler(config: &AppConfig, db: Database) -> Arc<SvnReconciler> {
    let svn = Arc::new(SvnClient::from_config(&config.svn));
    Arc::new(Reconciler::new(Arc::new(db), svn, config))
}

// ---------------------------------------------------------------------------
// build
// ---------------------------------------------------------------------------

pub async fn run_build(config: &AppConfig, db: Database, action: BuildAction) -> Result<()> {
    match action {
        BuildAction::Record {
            project,
            revision,
            url,
            result,
        } => {
            let reconciler = reconciler(config, db);
            let project = reconciler.project(&project)?;
            let url = match url {
                Some(u) => u,
                None => reconciler.project_url(&project)?,
            };
            let revision = match revision {
                Some(r) => r,
                None => {
                    reconciler
                        .backend()
                        .info(&url)
                        .await
                        .with_context(|| format!("failed to query {}", url))?
                        .last_changed_rev
                }
            };
            let build = reconciler
                .record_build(
                    &project,
                    Some(&url),
                    Some(revision),
                    BuildResult::from_str_val(&result),
                )
                .await?;
            println!(
                "{}",
                style::success(&format!(
                    "Recorded {} #{} at r{} ({})",
                    project.name, build.number, revision, build.result
                ))
            );
            Ok(())
        }
        BuildAction::List { project, limit } => {
            let project = find(&db, &project)?;
            let builds = db.list_builds(&project.id, limit)?;
            if builds.is_empty() {
                println!("No builds recorded for '{}'.", project.name);
                return Ok(());
            }
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "Revision", "Result", "Integrated", "Recorded"]);
            for build in &builds {
                let integrated = db
                    .integration_record_for_build(&project.id, build.number)?
                    .map(|r| style::revision(Some(r.merge_commit)))
                    .unwrap_or_default();
                table.add_row(vec![
                    build.number.to_string(),
                    style::revision(build.svn_revision),
                    style::state(&build.result.to_string()),
                    integrated,
                    build.recorded_at.format("%Y-%m-%d %H:%M").to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// rebase / integrate
// ---------------------------------------------------------------------------

pub async fn cmd_rebase(
    config: &AppConfig,
    db: Database,
    project: &str,
    revision: Option<i64>,
    permalink: Option<&str>,
) -> Result<()> {
    let target = match (revision, permalink) {
        (Some(rev), _) => RebaseTarget::Revision(rev),
        (None, Some(id)) => RebaseTarget::Permalink(
            Permalink::from_id(id).ok_or_else(|| anyhow::anyhow!("unknown permalink '{}'", id))?,
        ),
        (None, None) => RebaseTarget::Head,
    };
    println!("Rebasing {} to {}...", project, target);
    let report = submit_and_wait(config, db, project, TaskRequest::Rebase { target }).await?;
    finish(report)
}

pub async fn cmd_integrate(
    config: &AppConfig,
    db: Database,
    project: &str,
    build: Option<i64>,
) -> Result<()> {
    match build {
        Some(n) => println!("Integrating {} #{}...", project, n),
        None => println!("Integrating the last successful build of {}...", project),
    }
    let request = TaskRequest::Integrate {
        build,
        post_build: false,
    };
    let report = submit_and_wait(config, db, project, request).await?;
    finish(report)
}

/// Run one task through a single-slot scheduler so it is recorded in the
/// task history like a daemon-run task.
async fn submit_and_wait(
    config: &AppConfig,
    db: Database,
    project: &str,
    request: TaskRequest,
) -> Result<TaskReport> {
    let scheduler = ReconciliationScheduler::new(reconciler(config, db), 1);
    let handle = scheduler.submit(project, request)?;
    debug!(run_id = handle.run_id(), kind = %handle.kind(), "task submitted");
    Ok(handle.wait().await?)
}

fn finish(report: TaskReport) -> Result<()> {
    for line in &report.log {
        println!("  {}", style::dim(line));
    }
    let summary = report
        .result
        .as_ref()
        .map(|r| r.summary())
        .unwrap_or_else(|| report.state.to_string());
    match report.state {
        TaskState::Succeeded => {
            println!("{}", style::success(&summary));
            Ok(())
        }
        TaskState::Conflicted => {
            println!("{}", style::warn(&summary));
            anyhow::bail!("{} of {} conflicted", report.kind, report.project_name)
        }
        state => anyhow::bail!(
            "{} of {} ended {}: {}",
            report.kind,
            report.project_name,
            state,
            report.error.unwrap_or(summary)
        ),
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

pub fn cmd_status(config: &AppConfig, db: Database, project: Option<&str>, json: bool) -> Result<()> {
    let reconciler = reconciler(config, db);
    let db = reconciler.db();

    let projects = match project {
        Some(name) => vec![reconciler.project(name)?],
        None => {
            let mut branches = Vec::new();
            for p in db.list_projects()? {
                if db.get_branch_link(&p.id)?.is_some() {
                    branches.push(p);
                }
            }
            branches
        }
    };

    let statuses = projects
        .iter()
        .map(|p| reconciler.status(p))
        .collect::<Result<Vec<_>, _>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }
    if statuses.is_empty() {
        println!("No feature branches registered.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Branch",
            "Upstream",
            "Last integration",
            "Integrated build",
            "Upstream build",
            "Last task",
        ]);

    for status in &statuses {
        let last_task = db
            .list_task_runs(Some(&status.project.id), 1)?
            .into_iter()
            .next()
            .map(|run| format!("{} {}", run.kind, style::state(&run.state.to_string())))
            .unwrap_or_default();
        table.add_row(vec![
            status.project.name.clone(),
            status.upstream.clone().unwrap_or_default(),
            last_integration(status),
            status
                .last_integrated_build
                .as_ref()
                .map(|b| format!("#{}", b.number))
                .unwrap_or_default(),
            upstream_build_label(status.upstream_build),
            last_task,
        ]);
    }

    println!("{table}");
    Ok(())
}

fn last_integration(status: &BranchStatus) -> String {
    match &status.last_record {
        None => String::new(),
        Some(r) if r.is_noop() => format!("#{} no changes", r.build_number),
        Some(r) if r.is_conflict() => format!("#{} conflicted", r.build_number),
        Some(r) => format!("#{} as r{}", r.build_number, r.merge_commit),
    }
}

fn upstream_build_label(number: i64) -> String {
    if number < 0 {
        "not yet built".to_string()
    } else {
        format!("#{}", number)
    }
}

// ---------------------------------------------------------------------------
// provenance
// ---------------------------------------------------------------------------

pub async fn cmd_changelog(
    config: &AppConfig,
    db: Database,
    project: &str,
    from: i64,
    to: Option<i64>,
    json: bool,
) -> Result<()> {
    let reconciler = reconciler(config, db);
    let project = reconciler.project(project)?;
    let entries = reconciler.annotated_change_log(&project, from, to).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No changes.");
        return Ok(());
    }

    for annotated in &entries {
        let entry = &annotated.entry;
        let subject = entry.message.lines().next().unwrap_or("");
        println!(
            "{:<7} {:<12} {}",
            style::revision(Some(entry.revision)),
            truncate(&entry.author, 12),
            subject
        );
        if let Some(origin) = &annotated.origin {
            let name = annotated
                .origin_project
                .as_deref()
                .unwrap_or(origin.project_id.as_str());
            println!("        {}", style::dim(&format!("from {} #{}", name, origin.number)));
        }
    }
    Ok(())
}

pub fn cmd_provenance(config: &AppConfig, db: Database, project: &str, build: i64) -> Result<()> {
    let reconciler = reconciler(config, db);
    let project = reconciler.project(project)?;
    let record = reconciler
        .db()
        .integration_record_for_build(&project.id, build)?
        .ok_or_else(|| anyhow::anyhow!("{} #{} was never integrated", project.name, build))?;

    println!("{}", style::header(&format!("{} #{}", project.name, build)));
    println!("  Message        : {}", record.message);
    println!("  Merge commit   : {}", style::revision(Some(record.merge_commit)));
    println!(
        "  Source         : {}",
        style::revision(Some(record.integration_source))
    );
    println!("  Back-merge     : {}", style::revision(record.back_merge));
    println!(
        "  Upstream build : {}",
        upstream_build_label(reconciler.upstream_build_number(&project, build)?)
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// log
// ---------------------------------------------------------------------------

pub fn cmd_log(config: &AppConfig, db: &Database, project: &str, kind: &str) -> Result<()> {
    let kind = match kind {
        "rebase" => TaskKind::Rebase,
        "integrate" => TaskKind::Integrate,
        other => anyhow::bail!("unknown task kind '{}', expected rebase or integrate", other),
    };
    let project = find(db, project)?;
    let text = read_task_log(&config.daemon.task_log_dir(), &project.id, kind)
        .context("failed to read task log")?;
    if text.is_empty() {
        println!("No {} log for '{}'.", kind, project.name);
    } else {
        print!("{}", text);
    }
    Ok(())
}
