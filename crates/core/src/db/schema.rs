//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `schema_version`
//! user-version pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL UNIQUE,
            location        TEXT NOT NULL,
            parameters      TEXT NOT NULL DEFAULT '{}',
            integratable    INTEGER NOT NULL DEFAULT 0,
            working_copy    TEXT,
            auto_integrate  INTEGER NOT NULL DEFAULT 0,
            auto_rebase     INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS branch_links (
            project_id  TEXT PRIMARY KEY REFERENCES projects (id) ON DELETE CASCADE,
            upstream    TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_branch_links_upstream ON branch_links (upstream);

        CREATE TABLE IF NOT EXISTS builds (
            project_id    TEXT    NOT NULL REFERENCES projects (id) ON DELETE CASCADE,
            number        INTEGER NOT NULL,
            svn_url       TEXT,
            svn_revision  INTEGER,
            result        TEXT    NOT NULL CHECK (result IN ('success', 'unstable', 'failure', 'aborted')),
            recorded_at   TEXT    NOT NULL,
            PRIMARY KEY (project_id, number)
        );

        CREATE TABLE IF NOT EXISTS integration_records (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id          TEXT    NOT NULL REFERENCES projects (id) ON DELETE CASCADE,
            build_number        INTEGER NOT NULL,
            message             TEXT    NOT NULL DEFAULT '',
            merge_commit        INTEGER NOT NULL,
            integration_source  INTEGER NOT NULL CHECK (integration_source >= 0),
            back_merge          INTEGER,
            recorded_at         TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_integration_records_project
            ON integration_records (project_id, id);

        CREATE TABLE IF NOT EXISTS fingerprints (
            key               TEXT PRIMARY KEY,
            original_project  TEXT    NOT NULL,
            original_build    INTEGER NOT NULL,
            created_at        TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS fingerprint_usages (
            key         TEXT    NOT NULL REFERENCES fingerprints (key) ON DELETE CASCADE,
            project_id  TEXT    NOT NULL,
            build       INTEGER NOT NULL,
            PRIMARY KEY (key, project_id, build)
        );

        CREATE TABLE IF NOT EXISTS task_runs (
            id           TEXT PRIMARY KEY,
            project_id   TEXT NOT NULL,
            kind         TEXT NOT NULL CHECK (kind IN ('rebase', 'integrate')),
            state        TEXT NOT NULL,
            detail       TEXT,
            queued_at    TEXT NOT NULL,
            started_at   TEXT,
            finished_at  TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_task_runs_project ON task_runs (project_id, queued_at);

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT    NOT NULL,
            project_id  TEXT,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created ON audit_log (created_at);

        CREATE TABLE IF NOT EXISTS kv_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version <= current_version {
            continue;
        }
        info!(version, description, "applying migration");
        conn.execute_batch(sql)
            .map_err(|e| DatabaseError::MigrationFailed {
                version,
                detail: e.to_string(),
            })?;
        set_schema_version(conn, version)?;
        debug!(version, "migration applied");
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
pub fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
