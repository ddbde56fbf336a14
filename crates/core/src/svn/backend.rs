//! The capability surface the reconciliation engine needs from Subversion.
//!
//! [`SvnClient`](super::SvnClient) implements it on top of the `svn` CLI;
//! tests substitute an in-memory double.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::parser::{MergeEvent, SvnInfo, SvnLogEntry};
use crate::errors::SvnError;

/// A merge to apply onto a working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MergeRequest {
    /// Ordinary forward merge of `source` history `(from, to]`. A `from` of 0
    /// means the whole history, `to` of `None` means HEAD.
    Range {
        source: String,
        from: i64,
        to: Option<i64>,
    },
    /// Final merge back to the origin, accounting for the full ancestry of
    /// `source` at `revision`.
    Reintegrate { source: String, revision: i64 },
    /// Record change `revision` of `source` as merged without applying it.
    RecordOnly { source: String, revision: i64 },
}

impl MergeRequest {
    pub fn source(&self) -> &str {
        match self {
            Self::Range { source, .. }
            | Self::Reintegrate { source, .. }
            | Self::RecordOnly { source, .. } => source,
        }
    }
}

/// Receives one notification per path touched by a merge.
pub trait MergeEventHandler: Send {
    fn handle(&mut self, event: &MergeEvent);
}

/// Flags a merge as conflicted as soon as any path reports a conflict.
#[derive(Debug, Default)]
pub struct ConflictDetector {
    conflicts: Vec<String>,
    added: Vec<String>,
    touched: usize,
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn found_conflict(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn conflicted_paths(&self) -> &[String] {
        &self.conflicts
    }

    /// Paths the merge scheduled for addition.
    pub fn added_paths(&self) -> &[String] {
        &self.added
    }

    pub fn touched(&self) -> usize {
        self.touched
    }
}

impl MergeEventHandler for ConflictDetector {
    fn handle(&mut self, event: &MergeEvent) {
        self.touched += 1;
        if event.is_conflicted() {
            self.conflicts.push(event.path.clone());
        } else if event.content == 'A' {
            self.added.push(event.path.clone());
        }
    }
}

/// Whether a log walk should continue after the current entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogControl {
    Continue,
    Stop,
}

pub type LogHandler<'a> = dyn FnMut(&SvnLogEntry) -> LogControl + Send + 'a;

#[async_trait]
pub trait VcsBackend: Send + Sync {
    /// `svn info` on a URL or a working copy path.
    async fn info(&self, target: &str) -> Result<SvnInfo, SvnError>;

    /// Like [`info`](Self::info) but maps "path does not exist" to `None`.
    async fn exists(&self, url: &str) -> Result<Option<SvnInfo>, SvnError> {
        match self.info(url).await {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Check out `url` into `wc`. Returns the checked-out revision.
    async fn checkout(&self, url: &str, revision: Option<i64>, wc: &Path) -> Result<i64, SvnError>;

    /// Update `wc` to HEAD. Returns the new working copy revision.
    async fn update(&self, wc: &Path) -> Result<i64, SvnError>;

    /// Repoint `wc` at `url` (HEAD when `revision` is `None`), full depth.
    async fn switch(&self, wc: &Path, url: &str, revision: Option<i64>) -> Result<i64, SvnError>;

    /// Apply `request` onto `wc`, reporting every touched path to `events`.
    async fn merge(
        &self,
        wc: &Path,
        request: &MergeRequest,
        events: &mut dyn MergeEventHandler,
    ) -> Result<(), SvnError>;

    /// Commit all modifications in `wc`. Returns -1 when there was nothing to
    /// commit.
    async fn commit(&self, wc: &Path, message: &str) -> Result<i64, SvnError>;

    /// Discard every local modification in `wc`. Paths a merge added stay
    /// on disk as unversioned files.
    async fn revert(&self, wc: &Path) -> Result<(), SvnError>;

    /// Walk the log of `url` from `from` to `to` (HEAD when `None`) in
    /// ascending order, following only its own line of development.
    async fn log(
        &self,
        url: &str,
        from: i64,
        to: Option<i64>,
        handler: &mut LogHandler<'_>,
    ) -> Result<(), SvnError>;

    /// Server-side copy of `source` HEAD to `destination`. Returns the new
    /// revision.
    async fn copy(&self, source: &str, destination: &str, message: &str) -> Result<i64, SvnError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(path: &str, status: &str) -> MergeEvent {
        let c: Vec<char> = status.chars().collect();
        MergeEvent {
            path: path.into(),
            content: c[0],
            props: c[1],
            tree: c[3],
        }
    }

    #[test]
    fn test_conflict_detector() {
        let mut detector = ConflictDetector::new();
        detector.handle(&event("a", "U   "));
        assert!(!detector.found_conflict());
        detector.handle(&event("d", "   C"));
        detector.handle(&event("b", " C  "));
        assert!(detector.found_conflict());
        assert_eq!(detector.conflicted_paths(), &["d".to_string(), "b".to_string()]);
        assert_eq!(detector.touched(), 3);
        assert!(detector.added_paths().is_empty());
    }

    #[test]
    fn test_detector_collects_added_paths() {
        let mut detector = ConflictDetector::new();
        detector.handle(&event("/wc/n", "A   "));
        detector.handle(&event("/wc/a", "U   "));
        detector.handle(&event("/wc/d", "   C"));
        assert_eq!(detector.added_paths(), &["/wc/n".to_string()]);
        assert_eq!(detector.conflicted_paths(), &["/wc/d".to_string()]);
    }

    #[test]
    fn test_merge_request_source() {
        let req = MergeRequest::RecordOnly {
            source: "file:///r/trunk".into(),
            revision: 101,
        };
        assert_eq!(req.source(), "file:///r/trunk");
    }
}
