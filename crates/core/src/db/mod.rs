//! SQLite persistence layer for svnmerge.
//!
//! Holds the project registry, branch links, build records, reconciliation
//! records, the provenance index and the task history. File databases run in
//! WAL mode so the CLI can read while the daemon writes.

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

const FILE_PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Shared database handle. `Send + Sync`, meant to live in an `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file at `path` without migrating it.
    /// Missing parent directories are created.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)?,
            _ => {}
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(FILE_PRAGMAS)?;
        debug!("database opened in WAL mode");
        Ok(Self::wrap(conn))
    }

    /// Open the database at `path` and bring its schema up to date.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let db = Self::new(path)?;
        db.initialize()?;
        Ok(db)
    }

    /// Unmigrated in-memory database for tests.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self::wrap(conn))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn initialize(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!(
            version = schema::get_schema_version(&conn)?,
            "database schema is up to date"
        );
        Ok(())
    }

    /// Lock the connection. A poisoned lock is recovered: every write goes
    /// through SQLite, so a panicking holder cannot leave Rust-side state
    /// half-updated.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` in a transaction, committed only when `f` returns `Ok`.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BuildResult, Project};

    fn migrated() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_open_creates_data_dir_and_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("svnmerge.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        assert!(db.list_projects().unwrap().is_empty());

        // Reopening an up-to-date file is a no-op migration.
        drop(db);
        Database::open(&path).unwrap();
    }

    #[test]
    fn test_failed_transaction_leaves_no_rows() {
        let db = migrated();
        let project = Project::new("trunk", "file:///repo/trunk");

        let result: Result<(), DatabaseError> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
                rusqlite::params!["rebased_upstream_build:x", "3", "2026-01-01T00:00:00Z"],
            )?;
            Err(DatabaseError::NotFound {
                entity: "project".into(),
                id: project.name.clone(),
            })
        });
        assert!(result.is_err());
        assert!(db.get_state("rebased_upstream_build:x").unwrap().is_none());
    }

    #[test]
    fn test_deleting_project_cascades() {
        let db = migrated();
        let trunk = Project::new("trunk", "file:///repo/trunk").integratable();
        let branch = Project::new("trunk-b1", "file:///repo/branches/b1");
        db.insert_project(&trunk).unwrap();
        db.insert_project(&branch).unwrap();
        db.set_branch_link(&branch.id, "trunk").unwrap();
        db.record_build(&branch.id, None, Some(3), BuildResult::Success)
            .unwrap();

        assert!(db.delete_project(&branch.id).unwrap());
        assert!(db.get_branch_link(&branch.id).unwrap().is_none());
        assert!(db.last_build(&branch.id).unwrap().is_none());
        assert!(db.list_branch_links_for("trunk").unwrap().is_empty());
    }
}
