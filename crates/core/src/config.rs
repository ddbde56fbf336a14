//! TOML-based configuration for svnmerge.
//!
//! Sensitive values are stored as `_env` fields that reference environment
//! variable names. The actual secrets are resolved at runtime via
//! [`AppConfig::resolve_env_vars`].
//!
//! Projects and branch links are *not* part of this file. They live in the
//! database so that renames and branch creation persist.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / polling settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// SVN credentials and binary.
    #[serde(default)]
    pub svn: SvnConfig,

    /// Task scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Merge / branch creation behaviour.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Variables available to `${NAME}` references in project locations.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between polling cycles (default 60).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (database, working copies, task logs).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Optional directory for daily-rolling daemon log files.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_poll_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/svnmerge")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            log_dir: None,
        }
    }
}

impl DaemonConfig {
    /// Path of the SQLite database inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("svnmerge.db")
    }

    /// Root directory of the per-branch task logs.
    pub fn task_log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Root directory of the managed working copies.
    pub fn workspace_dir(&self) -> PathBuf {
        self.data_dir.join("workspaces")
    }
}

// ---------------------------------------------------------------------------
// SVN
// ---------------------------------------------------------------------------

/// SVN credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvnConfig {
    /// Path or name of the `svn` executable.
    #[serde(default = "default_svn_binary")]
    pub binary: String,

    /// SVN username. Omit for anonymous / file:// access.
    #[serde(default)]
    pub username: Option<String>,

    /// Environment variable holding the SVN password.
    #[serde(default)]
    pub password_env: Option<String>,

    /// Resolved password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub password: Option<String>,
}

fn default_svn_binary() -> String {
    "svn".into()
}

impl Default for SvnConfig {
    fn default() -> Self {
        Self {
            binary: default_svn_binary(),
            username: None,
            password_env: None,
            password: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Executor slots shared by all branches. Tasks wait in the queue for a
    /// free slot; a branch never holds more than one.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
}

fn default_max_concurrent() -> usize {
    2
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
        }
    }
}

// ---------------------------------------------------------------------------
// Merge behaviour
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Commit message used when creating a feature branch without an
    /// explicit message.
    #[serde(default = "default_new_branch_message")]
    pub new_branch_message: String,

    /// Whether branches created through `new_branch` integrate every
    /// successful build automatically.
    #[serde(default)]
    pub auto_integrate: bool,
}

fn default_new_branch_message() -> String {
    "Created a feature branch from svnmerge".into()
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            new_branch_message: default_new_branch_message(),
            auto_integrate: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// A password variable that is named but unset is an error: silently
    /// running anonymously against a protected server fails much later and
    /// much less clearly.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        if let Some(ref env_name) = self.svn.password_env {
            match resolve_optional_env(env_name, "svn.password_env") {
                Some(pw) => self.svn.password = Some(pw),
                None => {
                    return Err(ConfigError::EnvVarMissing {
                        var: env_name.clone(),
                        field: "svn.password_env".into(),
                    })
                }
            }
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.poll_interval_secs".into(),
                detail: "poll interval must be > 0".into(),
            });
        }
        if self.scheduler.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.max_concurrent_tasks".into(),
                detail: "at least one executor slot is required".into(),
            });
        }
        if self.svn.binary.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "svn.binary".into(),
                detail: "svn binary must not be empty".into(),
            });
        }
        if self.svn.password_env.is_some() && self.svn.username.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "svn.username".into(),
                detail: "a password was configured without a username".into(),
            });
        }
        if self.merge.new_branch_message.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "merge.new_branch_message".into(),
                detail: "default branch commit message must not be empty".into(),
            });
        }
        for name in self.environment.keys() {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ConfigError::InvalidValue {
                    field: format!("environment.{}", name),
                    detail: "variable names may only contain letters, digits and '_'".into(),
                });
            }
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
