//! Asynchronous SVN CLI client.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::backend::{LogControl, LogHandler, MergeEventHandler, MergeRequest, VcsBackend};
use super::parser::{
    parse_committed_revision, parse_merge_output, parse_svn_info, parse_svn_log,
    parse_update_revision, SvnInfo,
};
use crate::config::SvnConfig;
use crate::errors::SvnError;

/// [`VcsBackend`] implementation that shells out to the `svn` binary.
#[derive(Debug, Clone)]
pub struct SvnClient {
    binary: String,
    username: Option<String>,
    password: Option<String>,
}

impl SvnClient {
    /// Create a client running `binary` with optional credentials.
    pub fn new(
        binary: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        let client = Self {
            binary: binary.into(),
            username,
            password,
        };
        info!(binary = %client.binary, username = ?client.username, "created SvnClient");
        client
    }

    pub fn from_config(config: &SvnConfig) -> Self {
        Self::new(
            config.binary.clone(),
            config.username.clone(),
            config.password.clone(),
        )
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// `svn --version --quiet`, used by `validate` to check the installation.
    pub async fn version(&self) -> Result<String, SvnError> {
        let output = self.run_svn(None, &["--version", "--quiet"]).await?;
        Ok(output.trim().to_string())
    }

    async fn run_svn(&self, dir: Option<&Path>, args: &[&str]) -> Result<String, SvnError> {
        let output = self.spawn(dir, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(exit_code, %stderr, "svn command failed");
            return Err(SvnError::CommandFailed { exit_code, stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn spawn(
        &self,
        dir: Option<&Path>,
        args: &[&str],
    ) -> Result<std::process::Output, SvnError> {
        let mut cmd = Command::new(&self.binary);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        cmd.args(args).arg("--non-interactive").arg("--no-auth-cache");
        if let Some(ref username) = self.username {
            cmd.arg("--username").arg(username);
        }
        if let Some(ref password) = self.password {
            cmd.arg("--password").arg(password);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!(cmd = %format!("{} {}", self.binary, args.join(" ")), "running svn command");
        cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SvnError::BinaryNotFound(self.binary.clone())
            } else {
                SvnError::IoError(e)
            }
        })
    }
}

fn with_peg(url: &str, revision: Option<i64>) -> String {
    match revision {
        Some(rev) if rev >= 0 => format!("{}@{}", url, rev),
        _ => format!("{}@HEAD", url),
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[async_trait]
impl VcsBackend for SvnClient {
    #[instrument(skip(self))]
    async fn info(&self, target: &str) -> Result<SvnInfo, SvnError> {
        let output = self.run_svn(None, &["info", "--xml", target]).await?;
        parse_svn_info(&output)
    }

    #[instrument(skip(self, wc), fields(wc = %wc.display()))]
    async fn checkout(&self, url: &str, revision: Option<i64>, wc: &Path) -> Result<i64, SvnError> {
        let target = with_peg(url, revision);
        let wc_str = path_arg(wc);
        let output = self.run_svn(None, &["checkout", &target, &wc_str]).await?;
        let rev = parse_update_revision(&output).unwrap_or(-1);
        info!(rev, "svn checkout completed");
        Ok(rev)
    }

    #[instrument(skip(self, wc), fields(wc = %wc.display()))]
    async fn update(&self, wc: &Path) -> Result<i64, SvnError> {
        let wc_str = path_arg(wc);
        let output = self.run_svn(None, &["update", &wc_str]).await?;
        parse_update_revision(&output).ok_or_else(|| SvnError::WorkingCopyError {
            path: wc_str,
            detail: format!("could not parse updated revision from: {}", output.trim()),
        })
    }

    #[instrument(skip(self, wc), fields(wc = %wc.display()))]
    async fn switch(&self, wc: &Path, url: &str, revision: Option<i64>) -> Result<i64, SvnError> {
        let target = with_peg(url, revision);
        let wc_str = path_arg(wc);
        let output = self
            .run_svn(None, &["switch", "--ignore-ancestry", &target, &wc_str])
            .await?;
        parse_update_revision(&output).ok_or_else(|| SvnError::WorkingCopyError {
            path: wc_str,
            detail: format!("could not parse switched revision from: {}", output.trim()),
        })
    }

    #[instrument(skip(self, wc, events), fields(wc = %wc.display()))]
    async fn merge(
        &self,
        wc: &Path,
        request: &MergeRequest,
        events: &mut dyn MergeEventHandler,
    ) -> Result<(), SvnError> {
        let wc_str = path_arg(wc);
        let mut args: Vec<String> = vec!["merge".into(), "--accept".into(), "postpone".into()];
        match request {
            MergeRequest::Range { source, from, to } if *from <= 0 => {
                args.push(with_peg(source, *to));
            }
            MergeRequest::Range { source, from, to } => {
                let end = to.map(|r| r.to_string()).unwrap_or_else(|| "HEAD".into());
                args.push("-r".into());
                args.push(format!("{}:{}", from, end));
                args.push(with_peg(source, *to));
            }
            // An automatic merge performs the reintegrate-style merge when
            // the source's ancestry says so.
            MergeRequest::Reintegrate { source, revision } => {
                args.push(with_peg(source, Some(*revision)));
            }
            MergeRequest::RecordOnly { source, revision } => {
                args.push("--record-only".into());
                args.push("-c".into());
                args.push(revision.to_string());
                args.push(with_peg(source, None));
            }
        }
        args.push(wc_str);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.spawn(None, &arg_refs).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let notifications = parse_merge_output(&stdout);
        for event in &notifications {
            events.handle(event);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            // Some svn versions exit non-zero after postponing conflicts.
            if notifications.iter().any(|e| e.is_conflicted()) {
                warn!(%stderr, "svn merge exited with conflicts");
                return Ok(());
            }
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(exit_code, %stderr, "svn merge failed");
            return Err(SvnError::CommandFailed { exit_code, stderr });
        }
        debug!(paths = notifications.len(), "svn merge completed");
        Ok(())
    }

    #[instrument(skip(self, wc, message), fields(wc = %wc.display()))]
    async fn commit(&self, wc: &Path, message: &str) -> Result<i64, SvnError> {
        let wc_str = path_arg(wc);
        let output = self.run_svn(None, &["commit", "-m", message, &wc_str]).await?;
        match parse_committed_revision(&output) {
            Some(rev) => {
                info!(rev, "svn commit succeeded");
                Ok(rev)
            }
            None => {
                debug!("nothing to commit");
                Ok(-1)
            }
        }
    }

    #[instrument(skip(self, wc), fields(wc = %wc.display()))]
    async fn revert(&self, wc: &Path) -> Result<(), SvnError> {
        let wc_str = path_arg(wc);
        self.run_svn(None, &["revert", "-R", &wc_str]).await?;
        debug!("svn revert completed");
        Ok(())
    }

    #[instrument(skip(self, handler))]
    async fn log(
        &self,
        url: &str,
        from: i64,
        to: Option<i64>,
        handler: &mut LogHandler<'_>,
    ) -> Result<(), SvnError> {
        let end = to.map(|r| r.to_string()).unwrap_or_else(|| "HEAD".into());
        let range = format!("{}:{}", from.max(0), end);
        let target = with_peg(url, to);
        let output = self
            .run_svn(
                None,
                &["log", "--xml", "--verbose", "--stop-on-copy", "-r", &range, &target],
            )
            .await?;
        for entry in parse_svn_log(&output)? {
            if handler(&entry) == LogControl::Stop {
                break;
            }
        }
        Ok(())
    }

    #[instrument(skip(self, message))]
    async fn copy(&self, source: &str, destination: &str, message: &str) -> Result<i64, SvnError> {
        let output = self
            .run_svn(
                None,
                &["copy", "--parents", "-m", message, &with_peg(source, None), destination],
            )
            .await?;
        let rev = parse_committed_revision(&output).unwrap_or(-1);
        info!(rev, destination, "svn copy committed");
        Ok(rev)
    }
}
