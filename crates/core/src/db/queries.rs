//! Typed query helpers for every table in the svnmerge database.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{
    AuditEntry, BranchLink, BuildRecord, BuildRef, BuildResult, Fingerprint, IntegrationRecord,
    Permalink, Project, TaskKind, TaskRun, TaskState,
};

// ---------------------------------------------------------------------------
// Row structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub project_id: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

const PROJECT_COLUMNS: &str = "id, name, location, parameters, integratable, working_copy, \
                               auto_integrate, auto_rebase, created_at";

const BUILD_COLUMNS: &str = "project_id, number, svn_url, svn_revision, result, recorded_at";

const INTEGRATION_COLUMNS: &str = "id, project_id, build_number, message, merge_commit, \
                                   integration_source, back_merge, recorded_at";

const TASK_RUN_COLUMNS: &str =
    "id, project_id, kind, state, detail, queued_at, started_at, finished_at";

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- projects -----------------------------------------------------------

    /// Register a new project.
    pub fn insert_project(&self, project: &Project) -> Result<(), DatabaseError> {
        let parameters = serde_json::to_string(&project.parameters).map_err(|e| {
            DatabaseError::Corrupt {
                entity: "project".into(),
                detail: e.to_string(),
            }
        })?;
        let working_copy = project
            .working_copy
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO projects (id, name, location, parameters, integratable, working_copy,
                                   auto_integrate, auto_rebase, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                project.id,
                project.name,
                project.location,
                parameters,
                project.integratable,
                working_copy,
                project.auto_integrate,
                project.auto_rebase,
                project.created_at.to_rfc3339(),
            ],
        )?;
        debug!(id = %project.id, name = %project.name, "inserted project");
        Ok(())
    }

    /// Look up a project by its stable id.
    pub fn get_project(&self, id: &str) -> Result<Option<Project>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM projects WHERE id = ?1",
            PROJECT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![id], project_from_row)?;
        first(rows)
    }

    /// Look up a project by its current name.
    pub fn get_project_by_name(&self, name: &str) -> Result<Option<Project>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM projects WHERE name = ?1",
            PROJECT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![name], project_from_row)?;
        first(rows)
    }

    /// All projects, ordered by name.
    pub fn list_projects(&self) -> Result<Vec<Project>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM projects ORDER BY name",
            PROJECT_COLUMNS
        ))?;
        let projects = stmt
            .query_map([], project_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    /// Change a project's name. The id, and therefore every record keyed by
    /// it, is unaffected.
    pub fn rename_project(&self, id: &str, new_name: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE projects SET name = ?2 WHERE id = ?1",
            params![id, new_name],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "project".into(),
                id: id.to_string(),
            });
        }
        debug!(id, new_name, "renamed project");
        Ok(())
    }

    /// Update the automation flags of a project.
    pub fn set_project_automation(
        &self,
        id: &str,
        auto_integrate: bool,
        auto_rebase: bool,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE projects SET auto_integrate = ?2, auto_rebase = ?3 WHERE id = ?1",
            params![id, auto_integrate, auto_rebase],
        )?;
        Ok(())
    }

    /// Delete a project. Its branch link, builds and integration records are
    /// removed by cascade.
    pub fn delete_project(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        debug!(id, changed, "deleted project");
        Ok(changed > 0)
    }

    // -- branch_links -------------------------------------------------------

    /// Attach a project to an upstream (upsert).
    pub fn set_branch_link(&self, project_id: &str, upstream: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO branch_links (project_id, upstream, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id) DO UPDATE SET upstream = excluded.upstream,
                                                   updated_at = excluded.updated_at",
            params![project_id, upstream, now],
        )?;
        debug!(project_id, upstream, "set branch link");
        Ok(())
    }

    pub fn get_branch_link(&self, project_id: &str) -> Result<Option<BranchLink>, DatabaseError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT project_id, upstream FROM branch_links WHERE project_id = ?1")?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok(BranchLink {
                project_id: row.get(0)?,
                upstream: row.get(1)?,
            })
        })?;
        first(rows)
    }

    /// Every branch link whose upstream identifier equals `upstream`.
    pub fn list_branch_links_for(&self, upstream: &str) -> Result<Vec<BranchLink>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT project_id, upstream FROM branch_links WHERE upstream = ?1 ORDER BY project_id",
        )?;
        let links = stmt
            .query_map(params![upstream], |row| {
                Ok(BranchLink {
                    project_id: row.get(0)?,
                    upstream: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }

    pub fn remove_branch_link(&self, project_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "DELETE FROM branch_links WHERE project_id = ?1",
            params![project_id],
        )?;
        Ok(changed > 0)
    }

    // -- builds -------------------------------------------------------------

    /// Record a completed build, assigning the next build number.
    pub fn record_build(
        &self,
        project_id: &str,
        svn_url: Option<&str>,
        svn_revision: Option<i64>,
        result: BuildResult,
    ) -> Result<BuildRecord, DatabaseError> {
        let now = Utc::now();
        let number = self.transaction(|conn| {
            let number: i64 = conn.query_row(
                "SELECT COALESCE(MAX(number), 0) + 1 FROM builds WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO builds (project_id, number, svn_url, svn_revision, result, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    project_id,
                    number,
                    svn_url,
                    svn_revision,
                    result.to_string(),
                    now.to_rfc3339()
                ],
            )?;
            Ok(number)
        })?;
        debug!(project_id, number, ?svn_revision, %result, "recorded build");
        Ok(BuildRecord {
            project_id: project_id.to_string(),
            number,
            svn_url: svn_url.map(str::to_string),
            svn_revision,
            result,
            recorded_at: now,
        })
    }

    pub fn get_build(&self, project_id: &str, number: i64) -> Result<Option<BuildRecord>, DatabaseError> {
        self.query_one_build(
            &format!(
                "SELECT {} FROM builds WHERE project_id = ?1 AND number = ?2",
                BUILD_COLUMNS
            ),
            params![project_id, number],
        )
    }

    pub fn last_build(&self, project_id: &str) -> Result<Option<BuildRecord>, DatabaseError> {
        self.query_one_build(
            &format!(
                "SELECT {} FROM builds WHERE project_id = ?1 ORDER BY number DESC LIMIT 1",
                BUILD_COLUMNS
            ),
            params![project_id],
        )
    }

    /// Latest build that is at least unstable.
    pub fn last_successful_build(&self, project_id: &str) -> Result<Option<BuildRecord>, DatabaseError> {
        self.query_one_build(
            &format!(
                "SELECT {} FROM builds WHERE project_id = ?1 AND result IN ('success', 'unstable')
                 ORDER BY number DESC LIMIT 1",
                BUILD_COLUMNS
            ),
            params![project_id],
        )
    }

    /// Latest build whose integration produced a mainline commit.
    pub fn last_integrated_build(&self, project_id: &str) -> Result<Option<BuildRecord>, DatabaseError> {
        self.query_one_build(
            "SELECT b.project_id, b.number, b.svn_url, b.svn_revision, b.result, b.recorded_at
             FROM builds b
             JOIN integration_records r
               ON r.project_id = b.project_id AND r.build_number = b.number
             WHERE b.project_id = ?1 AND r.merge_commit > 0
             ORDER BY b.number DESC LIMIT 1",
            params![project_id],
        )
    }

    /// The build immediately preceding `number`.
    pub fn previous_build(&self, project_id: &str, number: i64) -> Result<Option<BuildRecord>, DatabaseError> {
        self.query_one_build(
            &format!(
                "SELECT {} FROM builds WHERE project_id = ?1 AND number < ?2
                 ORDER BY number DESC LIMIT 1",
                BUILD_COLUMNS
            ),
            params![project_id, number],
        )
    }

    /// Most recent builds first.
    pub fn list_builds(&self, project_id: &str, limit: u32) -> Result<Vec<BuildRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM builds WHERE project_id = ?1 ORDER BY number DESC LIMIT ?2",
            BUILD_COLUMNS
        ))?;
        let builds = stmt
            .query_map(params![project_id, limit], build_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(builds)
    }

    /// Overwrite the result of a build, e.g. when its integration failed.
    pub fn set_build_result(
        &self,
        project_id: &str,
        number: i64,
        result: BuildResult,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE builds SET result = ?3 WHERE project_id = ?1 AND number = ?2",
            params![project_id, number, result.to_string()],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "build".into(),
                id: format!("{} #{}", project_id, number),
            });
        }
        debug!(project_id, number, %result, "updated build result");
        Ok(())
    }

    /// The build a permalink currently points at.
    pub fn resolve_permalink(
        &self,
        project_id: &str,
        permalink: Permalink,
    ) -> Result<Option<BuildRecord>, DatabaseError> {
        match permalink {
            Permalink::LastBuild => self.last_build(project_id),
            Permalink::LastSuccessfulBuild => self.last_successful_build(project_id),
            Permalink::LastIntegratedBuild => self.last_integrated_build(project_id),
        }
    }

    fn query_one_build(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<BuildRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, build_from_row)?;
        first(rows)
    }

    // -- integration_records ------------------------------------------------

    /// Append a reconciliation record. Records are never updated.
    pub fn insert_integration_record(
        &self,
        project_id: &str,
        build_number: i64,
        message: &str,
        merge_commit: i64,
        integration_source: i64,
        back_merge: Option<i64>,
    ) -> Result<IntegrationRecord, DatabaseError> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO integration_records
                 (project_id, build_number, message, merge_commit, integration_source, back_merge, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                project_id,
                build_number,
                message,
                merge_commit,
                integration_source,
                back_merge,
                now.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, project_id, merge_commit, integration_source, "inserted integration record");
        Ok(IntegrationRecord {
            id,
            project_id: project_id.to_string(),
            build_number,
            message: message.to_string(),
            merge_commit,
            integration_source,
            back_merge,
            recorded_at: now,
        })
    }

    /// The most recent integration attempt of a project, whatever its outcome.
    pub fn last_integration_record(
        &self,
        project_id: &str,
    ) -> Result<Option<IntegrationRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM integration_records WHERE project_id = ?1 ORDER BY id DESC LIMIT 1",
            INTEGRATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![project_id], integration_from_row)?;
        first(rows)
    }

    /// The most recent integration that did not conflict. Its source revision
    /// is the watermark of the next no-op scan.
    pub fn last_settled_integration_record(
        &self,
        project_id: &str,
    ) -> Result<Option<IntegrationRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM integration_records
             WHERE project_id = ?1 AND merge_commit >= 0
             ORDER BY id DESC LIMIT 1",
            INTEGRATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![project_id], integration_from_row)?;
        first(rows)
    }

    /// The latest integration attempt recorded against a given build.
    pub fn integration_record_for_build(
        &self,
        project_id: &str,
        build_number: i64,
    ) -> Result<Option<IntegrationRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM integration_records WHERE project_id = ?1 AND build_number = ?2
             ORDER BY id DESC LIMIT 1",
            INTEGRATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![project_id, build_number], integration_from_row)?;
        first(rows)
    }

    pub fn list_integration_records(
        &self,
        project_id: &str,
        limit: u32,
    ) -> Result<Vec<IntegrationRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM integration_records WHERE project_id = ?1 ORDER BY id DESC LIMIT ?2",
            INTEGRATION_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![project_id, limit], integration_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // -- fingerprints -------------------------------------------------------

    /// Create the fingerprint `key` owned by `original` unless it already
    /// exists, register `original` as a usage, and return the stored record.
    pub fn fingerprint_get_or_create(
        &self,
        key: &str,
        original: &BuildRef,
    ) -> Result<Fingerprint, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.transaction(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO fingerprints (key, original_project, original_build, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, original.project_id, original.number, now],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO fingerprint_usages (key, project_id, build) VALUES (?1, ?2, ?3)",
                params![key, original.project_id, original.number],
            )?;
            Ok(())
        })?;
        self.get_fingerprint(key)?.ok_or_else(|| DatabaseError::NotFound {
            entity: "fingerprint".into(),
            id: key.to_string(),
        })
    }

    pub fn get_fingerprint(&self, key: &str) -> Result<Option<Fingerprint>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT key, original_project, original_build, created_at FROM fingerprints WHERE key = ?1",
        )?;
        let rows = stmt.query_map(params![key], |row| {
            let created_at: String = row.get(3)?;
            Ok(Fingerprint {
                key: row.get(0)?,
                original: BuildRef {
                    project_id: row.get(1)?,
                    number: row.get(2)?,
                },
                usages: Vec::new(),
                created_at: parse_datetime(&created_at),
            })
        })?;
        let Some(mut fingerprint) = first(rows)? else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT project_id, build FROM fingerprint_usages WHERE key = ?1 ORDER BY project_id, build",
        )?;
        fingerprint.usages = stmt
            .query_map(params![key], |row| {
                Ok(BuildRef {
                    project_id: row.get(0)?,
                    number: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(fingerprint))
    }

    /// Register `usage` against an existing fingerprint. Idempotent.
    pub fn add_fingerprint_usage(&self, key: &str, usage: &BuildRef) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO fingerprint_usages (key, project_id, build)
             SELECT key, ?2, ?3 FROM fingerprints WHERE key = ?1",
            params![key, usage.project_id, usage.number],
        )?;
        debug!(key, usage = %usage, changed, "added fingerprint usage");
        Ok(())
    }

    /// Drop fingerprints created before `cutoff`. Returns the number removed.
    pub fn prune_fingerprints(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM fingerprints WHERE created_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        debug!(removed, "pruned fingerprints");
        Ok(removed)
    }

    // -- task_runs ----------------------------------------------------------

    pub fn insert_task_run(&self, run: &TaskRun) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO task_runs (id, project_id, kind, state, detail, queued_at, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.id,
                run.project_id,
                run.kind.to_string(),
                run.state.to_string(),
                run.detail,
                run.queued_at.to_rfc3339(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Move a task run to `state`, stamping the start or finish time.
    pub fn update_task_run(
        &self,
        id: &str,
        state: TaskState,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "UPDATE task_runs
             SET state = ?2,
                 detail = COALESCE(?3, detail),
                 started_at = CASE WHEN ?2 = 'running' THEN ?4 ELSE started_at END,
                 finished_at = CASE WHEN ?5 THEN ?4 ELSE finished_at END
             WHERE id = ?1",
            params![id, state.to_string(), detail, now, state.is_terminal()],
        )?;
        debug!(id, %state, "updated task run");
        Ok(())
    }

    /// Most recent task runs first, optionally restricted to one project.
    pub fn list_task_runs(
        &self,
        project_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<TaskRun>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM task_runs WHERE (?1 IS NULL OR project_id = ?1)
             ORDER BY queued_at DESC LIMIT ?2",
            TASK_RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(params![project_id, limit], task_run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Mark queued or running tasks left behind by a previous process as
    /// failed.
    pub fn fail_interrupted_task_runs(&self) -> Result<usize, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE task_runs SET state = 'failed', detail = 'interrupted by restart', finished_at = ?1
             WHERE state IN ('queued', 'running')",
            params![now],
        )?;
        Ok(changed)
    }

    // -- audit_log ----------------------------------------------------------

    /// Insert an audit entry from a model struct.
    pub fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, project_id, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.action,
                entry.project_id,
                entry.details,
                entry.success,
                entry.timestamp.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action = %entry.action, "inserted audit_log entry");
        Ok(id)
    }

    /// List recent audit-log entries.
    pub fn list_audit_log(
        &self,
        project_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, project_id, details, success, created_at
             FROM audit_log WHERE (?1 IS NULL OR project_id = ?1)
             ORDER BY id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![project_id, limit], |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    project_id: row.get(2)?,
                    details: row.get(3)?,
                    success: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- kv_state -----------------------------------------------------------

    /// Get a key-value state entry.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT value FROM kv_state WHERE key = ?1")?;
        let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        first(rows)
    }

    /// Set a key-value state entry (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        debug!(key, value, "set kv_state");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn first<T>(
    mut rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Option<T>, DatabaseError> {
    match rows.next() {
        Some(Ok(value)) => Ok(Some(value)),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let parameters: String = row.get(3)?;
    let parameters: BTreeMap<String, String> = serde_json::from_str(&parameters).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let working_copy: Option<String> = row.get(5)?;
    let created_at: String = row.get(8)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        location: row.get(2)?,
        parameters,
        integratable: row.get(4)?,
        working_copy: working_copy.map(PathBuf::from),
        auto_integrate: row.get(6)?,
        auto_rebase: row.get(7)?,
        created_at: parse_datetime(&created_at),
    })
}

fn build_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BuildRecord> {
    let result: String = row.get(4)?;
    let recorded_at: String = row.get(5)?;
    Ok(BuildRecord {
        project_id: row.get(0)?,
        number: row.get(1)?,
        svn_url: row.get(2)?,
        svn_revision: row.get(3)?,
        result: BuildResult::from_str_val(&result),
        recorded_at: parse_datetime(&recorded_at),
    })
}

fn integration_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IntegrationRecord> {
    let recorded_at: String = row.get(7)?;
    Ok(IntegrationRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        build_number: row.get(2)?,
        message: row.get(3)?,
        merge_commit: row.get(4)?,
        integration_source: row.get(5)?,
        back_merge: row.get(6)?,
        recorded_at: parse_datetime(&recorded_at),
    })
}

fn task_run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRun> {
    let kind: String = row.get(2)?;
    let state: String = row.get(3)?;
    let queued_at: String = row.get(5)?;
    let started_at: Option<String> = row.get(6)?;
    let finished_at: Option<String> = row.get(7)?;
    Ok(TaskRun {
        id: row.get(0)?,
        project_id: row.get(1)?,
        kind: TaskKind::from_str_val(&kind),
        state: TaskState::from_str_val(&state),
        detail: row.get(4)?,
        queued_at: parse_datetime(&queued_at),
        started_at: started_at.as_deref().map(parse_datetime),
        finished_at: finished_at.as_deref().map(parse_datetime),
    })
}

/// Parse a datetime string, returning Utc::now() as a fallback if parsing fails.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn add_project(db: &Database, name: &str) -> Project {
        let mut project = Project::new(name, &format!("file:///repo/{}", name));
        project.parameters.insert("REPO".into(), "a".into());
        db.insert_project(&project).unwrap();
        project
    }

    #[test]
    fn test_project_crud() {
        let db = setup_db();
        let p = add_project(&db, "trunk");

        let loaded = db.get_project_by_name("trunk").unwrap().unwrap();
        assert_eq!(loaded.id, p.id);
        assert_eq!(loaded.parameters.get("REPO").map(String::as_str), Some("a"));

        db.rename_project(&p.id, "mainline").unwrap();
        assert!(db.get_project_by_name("trunk").unwrap().is_none());
        assert_eq!(db.get_project(&p.id).unwrap().unwrap().name, "mainline");

        assert!(db.delete_project(&p.id).unwrap());
        assert!(db.list_projects().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_project_name_rejected() {
        let db = setup_db();
        add_project(&db, "trunk");
        let dup = Project::new("trunk", "file:///elsewhere");
        assert!(db.insert_project(&dup).is_err());
    }

    #[test]
    fn test_rename_missing_project() {
        let db = setup_db();
        assert!(matches!(
            db.rename_project("nope", "x"),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn test_branch_links() {
        let db = setup_db();
        let b1 = add_project(&db, "b1");
        let b2 = add_project(&db, "b2");
        db.set_branch_link(&b1.id, "trunk").unwrap();
        db.set_branch_link(&b2.id, "trunk").unwrap();
        db.set_branch_link(&b2.id, "release").unwrap();

        assert_eq!(db.list_branch_links_for("trunk").unwrap().len(), 1);
        assert_eq!(db.get_branch_link(&b2.id).unwrap().unwrap().upstream, "release");

        db.delete_project(&b1.id).unwrap();
        assert!(db.get_branch_link(&b1.id).unwrap().is_none());
    }

    #[test]
    fn test_build_numbers_and_permalinks() {
        let db = setup_db();
        let p = add_project(&db, "b1");
        let first_build = db
            .record_build(&p.id, Some("file:///repo/b1"), Some(10), BuildResult::Success)
            .unwrap();
        let second = db
            .record_build(&p.id, Some("file:///repo/b1"), Some(11), BuildResult::Failure)
            .unwrap();
        assert_eq!(first_build.number, 1);
        assert_eq!(second.number, 2);

        assert_eq!(db.last_build(&p.id).unwrap().unwrap().number, 2);
        assert_eq!(db.last_successful_build(&p.id).unwrap().unwrap().number, 1);
        assert!(db.last_integrated_build(&p.id).unwrap().is_none());
        assert_eq!(db.previous_build(&p.id, 2).unwrap().unwrap().number, 1);

        db.insert_integration_record(&p.id, 1, "Integrated b1 #1 (from Jenkins)", 101, 10, Some(102))
            .unwrap();
        db.insert_integration_record(&p.id, 2, "Integrated b1 #2 (from Jenkins)", 0, 11, None)
            .unwrap();
        assert_eq!(db.last_integrated_build(&p.id).unwrap().unwrap().number, 1);
        assert_eq!(
            db.last_integration_record(&p.id).unwrap().unwrap().integration_source,
            11
        );

        db.insert_integration_record(&p.id, 2, "Integrated b1 #2 (from Jenkins)", -1, 12, None)
            .unwrap();
        assert_eq!(
            db.last_integration_record(&p.id).unwrap().unwrap().merge_commit,
            -1
        );
        let settled = db.last_settled_integration_record(&p.id).unwrap().unwrap();
        assert_eq!((settled.merge_commit, settled.integration_source), (0, 11));

        assert_eq!(
            db.resolve_permalink(&p.id, Permalink::LastBuild).unwrap().unwrap().number,
            2
        );
        assert_eq!(
            db.resolve_permalink(&p.id, Permalink::LastIntegratedBuild)
                .unwrap()
                .unwrap()
                .number,
            1
        );
        db.set_build_result(&p.id, 1, BuildResult::Failure).unwrap();
        assert!(db.last_successful_build(&p.id).unwrap().is_none());
        assert!(db.set_build_result(&p.id, 9, BuildResult::Failure).is_err());
    }

    #[test]
    fn test_fingerprint_index() {
        let db = setup_db();
        let original = BuildRef::new("branch-id", 7);
        let fp = db.fingerprint_get_or_create("abc", &original).unwrap();
        assert_eq!(fp.original, original);
        assert_eq!(fp.usages, vec![original.clone()]);

        // A second creation keeps the first owner.
        let again = db
            .fingerprint_get_or_create("abc", &BuildRef::new("other", 1))
            .unwrap();
        assert_eq!(again.original, original);

        db.add_fingerprint_usage("abc", &BuildRef::new("trunk-id", 12)).unwrap();
        db.add_fingerprint_usage("abc", &BuildRef::new("trunk-id", 12)).unwrap();
        db.add_fingerprint_usage("missing", &BuildRef::new("trunk-id", 1)).unwrap();
        let fp = db.get_fingerprint("abc").unwrap().unwrap();
        assert_eq!(fp.usages_of("trunk-id"), vec![12]);
        assert!(db.get_fingerprint("missing").unwrap().is_none());

        let removed = db
            .prune_fingerprints(Utc::now() + chrono::Duration::seconds(5))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(db.get_fingerprint("abc").unwrap().is_none());
    }

    #[test]
    fn test_task_run_lifecycle() {
        let db = setup_db();
        let run = TaskRun {
            id: "t1".into(),
            project_id: "p".into(),
            kind: TaskKind::Integrate,
            state: TaskState::Queued,
            detail: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        db.insert_task_run(&run).unwrap();
        db.update_task_run("t1", TaskState::Running, None).unwrap();
        db.update_task_run("t1", TaskState::Conflicted, Some("merge conflict"))
            .unwrap();

        let runs = db.list_task_runs(Some("p"), 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, TaskState::Conflicted);
        assert!(runs[0].started_at.is_some());
        assert!(runs[0].finished_at.is_some());
        assert_eq!(runs[0].detail.as_deref(), Some("merge conflict"));
    }

    #[test]
    fn test_interrupted_runs_are_failed() {
        let db = setup_db();
        let run = TaskRun {
            id: "t2".into(),
            project_id: "p".into(),
            kind: TaskKind::Rebase,
            state: TaskState::Queued,
            detail: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        db.insert_task_run(&run).unwrap();
        assert_eq!(db.fail_interrupted_task_runs().unwrap(), 1);
        assert_eq!(db.list_task_runs(None, 10).unwrap()[0].state, TaskState::Failed);
    }

    #[test]
    fn test_audit_log() {
        let db = setup_db();
        db.insert_audit_entry(&AuditEntry::success("integrate", "r101").for_project("p"))
            .unwrap();
        db.insert_audit_entry(&AuditEntry::failure("rebase", "conflict"))
            .unwrap();
        assert_eq!(db.list_audit_log(None, 10).unwrap().len(), 2);
        let for_p = db.list_audit_log(Some("p"), 10).unwrap();
        assert_eq!(for_p.len(), 1);
        assert!(for_p[0].success);
    }

    #[test]
    fn test_kv_state() {
        let db = setup_db();
        assert!(db.get_state("foo").unwrap().is_none());
        db.set_state("foo", "bar").unwrap();
        assert_eq!(db.get_state("foo").unwrap().as_deref(), Some("bar"));
        db.set_state("foo", "baz").unwrap();
        assert_eq!(db.get_state("foo").unwrap().as_deref(), Some("baz"));
    }
}
