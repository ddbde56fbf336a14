//! Per-branch task logs.
//!
//! Each reconciliation run appends human-readable progress lines to
//! `<data_dir>/logs/<project-id>/<kind>.log`. Lines are flushed as they are
//! written so the file can be tailed while a task is running. Every line is
//! also mirrored to `tracing` and kept in memory for the task report.

use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{info, warn};

use crate::models::TaskKind;

/// Location of the log file of `kind` runs for `project_id`.
pub fn task_log_path(log_dir: &Path, project_id: &str, kind: TaskKind) -> PathBuf {
    log_dir.join(project_id).join(format!("{}.log", kind))
}

/// Read the whole log file of `kind` runs for `project_id`. A missing file
/// reads as empty.
pub fn read_task_log(log_dir: &Path, project_id: &str, kind: TaskKind) -> std::io::Result<String> {
    match std::fs::read_to_string(task_log_path(log_dir, project_id, kind)) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Append-only progress log of one task run.
pub struct TaskLog {
    path: Option<PathBuf>,
    file: Option<Mutex<LineWriter<File>>>,
    lines: Mutex<Vec<String>>,
}

impl TaskLog {
    /// Open (creating as needed) the log file for a run and write a header
    /// line marking the start of the run.
    pub fn open(log_dir: &Path, project_id: &str, kind: TaskKind) -> std::io::Result<Self> {
        let path = task_log_path(log_dir, project_id, kind);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = LineWriter::new(file);
        writeln!(writer, "=== {} started at {}", kind, Utc::now().to_rfc3339())?;
        Ok(Self {
            path: Some(path),
            file: Some(Mutex::new(writer)),
            lines: Mutex::new(Vec::new()),
        })
    }

    /// A log that only keeps lines in memory.
    pub fn memory() -> Self {
        Self {
            path: None,
            file: None,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one line.
    pub fn line(&self, text: impl Into<String>) {
        let text = text.into();
        info!(target: "svnmerge::task", "{}", text);
        if let Some(file) = &self.file {
            let mut writer = file.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = writeln!(writer, "{}", text) {
                warn!(error = %e, path = ?self.path, "failed to append to task log");
            }
        }
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(text);
    }

    /// Lines written so far by this run.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|l| l.contains(needle))
    }
}

impl std::fmt::Debug for TaskLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLog").field("path", &self.path).finish()
    }
}
