//! Outcome values of the rebase and integrate protocols.
//!
//! Conflicts and "nothing to commit" are ordinary results, not errors.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RebaseOutcome {
    Committed { revision: i64 },
    NothingToCommit,
    /// The merge conflicted and the working copy was reverted.
    Conflicted,
    /// The requested upstream checkpoint resolved to no build.
    NoMatchingBuild,
}

impl RebaseOutcome {
    /// Numeric form used in logs and task details: the new revision, 0 when
    /// nothing changed, -1 when nothing was rebased.
    pub fn as_revision(&self) -> i64 {
        match self {
            Self::Committed { revision } => *revision,
            Self::NothingToCommit => 0,
            Self::Conflicted | Self::NoMatchingBuild => -1,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflicted)
    }
}

/// What happened to the record-only merge that follows a successful
/// mainline commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackMerge {
    Committed { revision: i64 },
    NothingToCommit,
    Conflicted,
    /// No mainline commit was made.
    Skipped,
}

impl BackMerge {
    pub fn revision(&self) -> Option<i64> {
        match self {
            Self::Committed { revision } => Some(*revision),
            _ => None,
        }
    }
}

/// Result of one integrate attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationOutcome {
    /// Mainline revision, 0 for a no-op, -1 for a conflict.
    pub merge_commit: i64,
    /// Branch revision that was (or would have been) merged.
    pub integration_source: i64,
    pub back_merge: BackMerge,
}

impl IntegrationOutcome {
    pub fn noop(integration_source: i64) -> Self {
        Self {
            merge_commit: 0,
            integration_source,
            back_merge: BackMerge::Skipped,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.merge_commit == 0
    }

    /// True when either the mainline merge or the back-merge conflicted.
    pub fn is_conflict(&self) -> bool {
        self.merge_commit < 0 || self.back_merge == BackMerge::Conflicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebase_outcome_numbers() {
        assert_eq!(RebaseOutcome::Committed { revision: 12 }.as_revision(), 12);
        assert_eq!(RebaseOutcome::NothingToCommit.as_revision(), 0);
        assert_eq!(RebaseOutcome::Conflicted.as_revision(), -1);
        assert_eq!(RebaseOutcome::NoMatchingBuild.as_revision(), -1);
        assert!(!RebaseOutcome::NoMatchingBuild.is_conflict());
    }

    #[test]
    fn test_back_merge_conflict_marks_outcome_conflicted() {
        let outcome = IntegrationOutcome {
            merge_commit: 101,
            integration_source: 42,
            back_merge: BackMerge::Conflicted,
        };
        assert!(outcome.is_conflict());
        assert!(!outcome.is_noop());
        assert!(IntegrationOutcome::noop(42).is_noop());
        assert_eq!(BackMerge::Committed { revision: 102 }.revision(), Some(102));
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_string(&RebaseOutcome::Committed { revision: 7 }).unwrap();
        assert_eq!(json, r#"{"outcome":"committed","revision":7}"#);
    }
}
