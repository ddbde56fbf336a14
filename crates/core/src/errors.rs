//! Error types for the svnmerge core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! Merge conflicts and no-op integrations are *not* errors. They are
//! reported as outcome values by the merge executor.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Svn(#[from] SvnError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Branch(#[from] BranchError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl CoreError {
    /// True for errors that mean "reconciliation is not applicable to this
    /// project" rather than a fault while running it.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Merge(e) if e.is_configuration()) || matches!(self, Self::Config(_))
    }
}

// ---------------------------------------------------------------------------
// SVN errors
// ---------------------------------------------------------------------------

/// Errors from SVN CLI operations.
#[derive(Debug, Error)]
pub enum SvnError {
    /// The `svn` binary was not found on `$PATH`.
    #[error("svn binary not found: {0}")]
    BinaryNotFound(String),

    /// An `svn` command exited with a non-zero status.
    #[error("svn command failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        exit_code: i32,
        stderr: String,
    },

    /// Could not parse the output produced by `svn`.
    #[error("failed to parse svn output: {0}")]
    XmlParseError(String),

    /// A working-copy operation failed.
    #[error("svn working copy error at '{path}': {detail}")]
    WorkingCopyError {
        path: String,
        detail: String,
    },

    /// Generic I/O wrapper.
    #[error("svn I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SvnError {
    /// True when the failure means the target path does not exist in the
    /// repository.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::CommandFailed { stderr, .. } => {
                stderr.contains("E170000")
                    || stderr.contains("W170000")
                    || stderr.contains("E160013")
                    || stderr.contains("E200009")
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from the rebase / integrate protocols.
///
/// Everything except [`MergeError::MergeFailed`] is a configuration problem:
/// it is surfaced immediately and never retried.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The project has no branch link.
    #[error("project '{0}' is not attached to an upstream")]
    NotABranch(String),

    /// The branch link names an upstream that does not exist.
    #[error("upstream '{upstream}' of project '{project}' could not be resolved")]
    UpstreamUnresolved {
        project: String,
        upstream: String,
    },

    /// The project location could not be turned into an svn URL.
    #[error("project '{project}' has no usable svn location ('{location}')")]
    NoLocation {
        project: String,
        location: String,
    },

    /// The requested build does not exist or carries no svn revision.
    #[error("build information missing for {project} #{build}: {detail}")]
    MissingBuildInfo {
        project: String,
        build: i64,
        detail: String,
    },

    /// An integration produced an invalid integration source.
    #[error("integration source must be a valid revision, got {0}")]
    InvalidIntegrationSource(i64),

    /// A backend fault aborted the protocol. The working copy is not
    /// guaranteed to be clean afterwards.
    #[error("merge failed: {0}")]
    MergeFailed(#[from] SvnError),

    /// Persisting the outcome failed.
    #[error("merge database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

impl MergeError {
    pub fn is_configuration(&self) -> bool {
        !matches!(self, Self::MergeFailed(_) | Self::DatabaseError(_))
    }
}

// ---------------------------------------------------------------------------
// Branch errors
// ---------------------------------------------------------------------------

/// Errors from feature branch creation and linking.
#[derive(Debug, Error)]
pub enum BranchError {
    #[error("Name is required")]
    NameRequired,

    #[error("Unable to infer the new branch name from {0}")]
    CannotInferBranchUrl(String),

    /// The branch directory already exists; the caller may attach instead.
    #[error("{0} already exists as a directory; attach to it instead")]
    AlreadyExistsAttach(String),

    #[error("{0} already exists.")]
    AlreadyExists(String),

    #[error("project '{0}' already exists")]
    ProjectExists(String),

    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("project '{0}' is not integratable")]
    NotIntegratable(String),

    #[error("branch svn error: {0}")]
    SvnError(#[from] SvnError),

    #[error("branch database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Scheduler errors
// ---------------------------------------------------------------------------

/// Errors from the reconciliation task scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A task of a different kind already owns the branch working copy.
    #[error("branch '{branch}' is busy with a pending {pending} task")]
    Busy {
        branch: String,
        pending: String,
    },

    /// The task hit a backend fault or a configuration error.
    #[error("{kind} task for '{branch}' failed: {detail}")]
    TaskFailed {
        branch: String,
        kind: String,
        detail: String,
    },

    /// The worker went away without reporting a result.
    #[error("worker for branch '{0}' stopped without reporting a result")]
    WorkerLost(String),

    #[error("scheduler database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing {
        var: String,
        field: String,
    },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed {
        version: u32,
        detail: String,
    },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    /// A stored value could not be decoded.
    #[error("corrupt {entity} record: {detail}")]
    Corrupt {
        entity: String,
        detail: String,
    },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = BranchError::CannotInferBranchUrl("https://svn/repo/x".into());
        assert_eq!(
            err.to_string(),
            "Unable to infer the new branch name from https://svn/repo/x"
        );

        let err = MergeError::UpstreamUnresolved {
            project: "b1".into(),
            upstream: "trunk".into(),
        };
        assert!(err.to_string().contains("'trunk'"));

        let err = ConfigError::EnvVarMissing {
            var: "SVN_PASSWORD".into(),
            field: "svn.password_env".into(),
        };
        assert!(err.to_string().contains("SVN_PASSWORD"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let core_err: CoreError = SvnError::BinaryNotFound("svn".into()).into();
        assert!(matches!(core_err, CoreError::Svn(_)));

        let core_err: CoreError = MergeError::NotABranch("trunk".into()).into();
        assert!(core_err.is_configuration());

        let fault = MergeError::MergeFailed(SvnError::CommandFailed {
            exit_code: 1,
            stderr: "E170013: Unable to connect".into(),
        });
        assert!(!CoreError::from(fault).is_configuration());
    }

    #[test]
    fn test_not_found_detection() {
        let err = SvnError::CommandFailed {
            exit_code: 1,
            stderr: "svn: warning: W170000: URL 'file:///r/branches/x' non-existent in revision 3"
                .into(),
        };
        assert!(err.is_not_found());
        assert!(!SvnError::BinaryNotFound("svn".into()).is_not_found());
    }
}
