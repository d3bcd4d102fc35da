//! Git adapter for the commit and push stages.
//!
//! The gate commits deterministically, so we keep a small, explicit wrapper
//! around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::types::StageOutcome;
use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::stage_runner::{CommitSummary, GitOps};

static SHORTSTAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) files? changed(?:, (\d+) insertions?\(\+\))?(?:, (\d+) deletions?\(-\))?")
        .expect("valid shortstat regex")
});

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
///
/// Clones share one index lock, so sessions reconciled concurrently in the same
/// worktree take turns at staging, committing and pushing.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    remote: String,
    timeout: Duration,
    output_limit_bytes: usize,
    index: Arc<Mutex<()>>,
}

impl Git {
    /// `timeout` bounds every command that can run hooks or reach the network.
    pub fn new(workdir: impl Into<PathBuf>, remote: &str, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            remote: remote.to_string(),
            timeout,
            output_limit_bytes: 100_000,
            index: Arc::new(Mutex::new(())),
        }
    }

    /// Return the current HEAD short SHA, or `None` before the first commit.
    pub fn head_short_sha(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--short=12", "HEAD"])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    fn lock_index(&self) -> MutexGuard<'_, ()> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_bounded(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("git {}", args.join(" ")))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl GitOps for Git {
    /// Stage all changes outside `.gate/` (respects .gitignore).
    #[instrument(skip_all)]
    fn stage_all(&self) -> Result<StageOutcome> {
        let _index = self.lock_index();
        let out = self.run_bounded(&["add", "-A", "--", ".", GATE_EXCLUDE])?;
        if !out.success() {
            return Ok(StageOutcome::failure(out.summary("git add", self.timeout)));
        }
        Ok(StageOutcome::success("worktree staged"))
    }

    /// Commit staged changes. Nothing staged is a success without a new commit.
    #[instrument(skip_all)]
    fn commit(&self, message: &str) -> Result<StageOutcome> {
        let _index = self.lock_index();
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(StageOutcome::success("nothing to commit"));
        }
        debug!("committing staged changes");
        let out = self.run_bounded(&["commit", "-m", message])?;
        if !out.success() {
            warn!(timed_out = out.timed_out, "git commit failed");
            return Ok(StageOutcome::failure(out.summary("git commit", self.timeout)));
        }
        let sha = self.head_short_sha()?.unwrap_or_default();
        Ok(StageOutcome::success(format!("committed {sha}")))
    }

    #[instrument(skip_all, fields(remote = %self.remote))]
    fn push(&self) -> Result<StageOutcome> {
        let _index = self.lock_index();
        let out = self.run_bounded(&["push", &self.remote, "HEAD"])?;
        if out.success() {
            return Ok(StageOutcome::success(format!("pushed HEAD to {}", self.remote)));
        }
        warn!(timed_out = out.timed_out, "git push failed");
        Ok(StageOutcome::failure(out.summary("git push", self.timeout)))
    }

    /// Uncommitted entries, leaving out the gate's own bookkeeping.
    fn pending_changes(&self) -> Result<Vec<String>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| !is_gate_path(&entry.path))
            .map(|entry| format!("{} {}", entry.code.trim(), entry.path))
            .collect())
    }

    fn head_summary(&self) -> Result<Option<CommitSummary>> {
        let Some(sha) = self.head_short_sha()? else {
            return Ok(None);
        };
        let out = self.run_capture(&["show", "--shortstat", "--format=", "HEAD"])?;
        let (files_changed, insertions, deletions) = parse_shortstat(&out);
        Ok(Some(CommitSummary {
            sha,
            files_changed,
            insertions,
            deletions,
        }))
    }
}

/// Pathspec keeping `.gate/` out of session commits.
const GATE_EXCLUDE: &str = ":(exclude).gate";

fn is_gate_path(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|component| component.as_os_str() == ".gate")
}

/// Parse `N files changed, I insertions(+), D deletions(-)`; absent counts are zero.
pub fn parse_shortstat(text: &str) -> (u32, u32, u32) {
    let Some(caps) = SHORTSTAT_RE.captures(text) else {
        return (0, 0, 0);
    };
    let num = |idx: usize| {
        caps.get(idx)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(0)
    };
    (num(1), num(2), num(3))
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
