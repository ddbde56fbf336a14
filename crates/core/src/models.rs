//! Domain model types used throughout svnmerge.
//!
//! These types bridge the reconciliation engine, the scheduler, and the
//! database layer.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

/// A project known to svnmerge: either a mainline (integratable) or a feature
/// branch carrying a [`BranchLink`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Stable identifier. Survives renames.
    pub id: String,
    pub name: String,
    /// svn location, possibly containing `${VAR}` references.
    pub location: String,
    /// Project-level values for `${VAR}` references.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Mainline projects accept integrations from feature branches.
    pub integratable: bool,
    /// Explicit working copy directory. Defaults to a directory under the
    /// data dir keyed by project id.
    pub working_copy: Option<PathBuf>,
    pub auto_integrate: bool,
    pub auto_rebase: bool,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Create a new project record with defaults.
    pub fn new(name: &str, location: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            location: location.to_string(),
            parameters: BTreeMap::new(),
            integratable: false,
            working_copy: None,
            auto_integrate: false,
            auto_rebase: false,
            created_at: Utc::now(),
        }
    }

    pub fn integratable(mut self) -> Self {
        self.integratable = true;
        self
    }
}

/// Association between a feature branch project and its upstream.
///
/// The owner is referenced by id only; the upstream is referenced by name and
/// resolved against the project registry on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchLink {
    pub project_id: String,
    pub upstream: String,
}

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

/// Outcome of a build, ordered from best to worst.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    Success,
    Unstable,
    Failure,
    Aborted,
}

impl BuildResult {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "unstable" => Self::Unstable,
            "aborted" => Self::Aborted,
            _ => Self::Failure,
        }
    }

    /// True when `self` is strictly worse than `other`.
    pub fn is_worse_than(self, other: Self) -> bool {
        self > other
    }
}

impl std::fmt::Display for BuildResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Unstable => write!(f, "unstable"),
            Self::Failure => write!(f, "failure"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// A build delivered by the build-completed callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub project_id: String,
    pub number: i64,
    pub svn_url: Option<String>,
    pub svn_revision: Option<i64>,
    pub result: BuildResult,
    pub recorded_at: DateTime<Utc>,
}

impl BuildRecord {
    pub fn build_ref(&self) -> BuildRef {
        BuildRef {
            project_id: self.project_id.clone(),
            number: self.number,
        }
    }
}

/// Reference to one build of one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildRef {
    pub project_id: String,
    pub number: i64,
}

impl BuildRef {
    pub fn new(project_id: &str, number: i64) -> Self {
        Self {
            project_id: project_id.to_string(),
            number,
        }
    }
}

impl std::fmt::Display for BuildRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} #{}", self.project_id, self.number)
    }
}

/// Named checkpoints on a project's build history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Permalink {
    LastBuild,
    LastSuccessfulBuild,
    LastIntegratedBuild,
}

impl Permalink {
    pub const ALL: [Permalink; 3] = [
        Self::LastBuild,
        Self::LastSuccessfulBuild,
        Self::LastIntegratedBuild,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::LastBuild => "lastBuild",
            Self::LastSuccessfulBuild => "lastSuccessfulBuild",
            Self::LastIntegratedBuild => "lastIntegratedBuild",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::LastBuild => "Last build",
            Self::LastSuccessfulBuild => "Last successful build",
            Self::LastIntegratedBuild => "Last integrated build",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }
}

impl std::fmt::Display for Permalink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// The mainline revision a rebase merges from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebaseTarget {
    Head,
    Revision(i64),
    Permalink(Permalink),
}

impl std::fmt::Display for RebaseTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Head => write!(f, "HEAD"),
            Self::Revision(rev) => write!(f, "r{}", rev),
            Self::Permalink(p) => write!(f, "{}", p),
        }
    }
}

/// Persisted outcome of one integrate attempt.
///
/// `merge_commit` is 0 for a no-op, -1 for a handled conflict and the
/// mainline revision otherwise. `integration_source` is always a valid
/// branch revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationRecord {
    pub id: i64,
    pub project_id: String,
    pub build_number: i64,
    /// First line of the integration commit message, the input of the
    /// provenance fingerprint.
    pub message: String,
    pub merge_commit: i64,
    pub integration_source: i64,
    pub back_merge: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}

impl IntegrationRecord {
    pub fn is_noop(&self) -> bool {
        self.merge_commit == 0
    }

    pub fn is_conflict(&self) -> bool {
        self.merge_commit < 0
    }
}

/// Kind of a reconciliation task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Rebase,
    Integrate,
}

impl TaskKind {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "integrate" => Self::Integrate,
            _ => Self::Rebase,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rebase => write!(f, "rebase"),
            Self::Integrate => write!(f, "integrate"),
        }
    }
}

/// Lifecycle state of a reconciliation task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Conflicted,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "conflicted" => Self::Conflicted,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Conflicted => write!(f, "conflicted"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Durable history entry of a scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: String,
    pub project_id: String,
    pub kind: TaskKind,
    pub state: TaskState,
    pub detail: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// A provenance fingerprint: the branch build that produced a reconciliation
/// commit, and the builds that have since consumed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fingerprint {
    pub key: String,
    pub original: BuildRef,
    pub usages: Vec<BuildRef>,
    pub created_at: DateTime<Utc>,
}

impl Fingerprint {
    /// Usages belonging to `project_id`, sorted by build number.
    pub fn usages_of(&self, project_id: &str) -> Vec<i64> {
        let mut numbers: Vec<i64> = self
            .usages
            .iter()
            .filter(|u| u.project_id == project_id)
            .map(|u| u.number)
            .collect();
        numbers.sort_unstable();
        numbers
    }
}

// ---------------------------------------------------------------------------
// Audit Entry
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub project_id: Option<String>,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            project_id: None,
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            project_id: None,
            details: details.to_string(),
            success: false,
            timestamp: Utc::now(),
        }
    }

    pub fn for_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }
}
