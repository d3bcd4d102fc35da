//! Reconciliation collaborators: external stage runners and git operations.
//!
//! [`StageRunner`] drives `scripts`, `container`, `deploy` and `tests`;
//! [`GitOps`] drives `git_commit` and `git_push`. An `Err` from either trait
//! means the runner itself crashed (spawn failure, I/O error). A stage that ran
//! and failed is an `Ok` outcome with failure status.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::core::types::{Stage, StageOutcome};
use crate::io::config::StagesConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

pub trait StageRunner {
    fn run(&self, stage: Stage) -> Result<StageOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub sha: String,
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

pub trait GitOps {
    fn stage_all(&self) -> Result<StageOutcome>;
    fn commit(&self, message: &str) -> Result<StageOutcome>;
    fn push(&self) -> Result<StageOutcome>;
    /// Worktree entries that are not committed (`XY path`).
    fn pending_changes(&self) -> Result<Vec<String>>;
    fn head_summary(&self) -> Result<Option<CommitSummary>>;
}

/// Runs the configured command for each stage in the workspace root.
#[derive(Debug, Clone)]
pub struct CommandStageRunner {
    workdir: PathBuf,
    stages: StagesConfig,
    session_id: String,
}

impl CommandStageRunner {
    pub fn new(workdir: impl Into<PathBuf>, stages: &StagesConfig, session_id: &str) -> Self {
        Self {
            workdir: workdir.into(),
            stages: stages.clone(),
            session_id: session_id.to_string(),
        }
    }
}

impl StageRunner for CommandStageRunner {
    fn run(&self, stage: Stage) -> Result<StageOutcome> {
        let argv = self
            .stages
            .command(stage)
            .ok_or_else(|| anyhow!("stage {stage} is not run by a command"))?;
        let mut cmd = command_from_argv(argv, &self.workdir)
            .with_context(|| format!("stages.{stage} command"))?;
        cmd.env("SESSIONGATE_STAGE", stage.as_str())
            .env("SESSIONGATE_SESSION", &self.session_id);

        let timeout = Duration::from_secs(self.stages.timeout_secs);
        debug!(stage = %stage, argv = ?argv, "running stage command");
        let out = run_command_with_timeout(cmd, timeout, self.stages.output_limit_bytes)
            .with_context(|| format!("stage {stage} runner"))?;
        let summary = out.summary(stage.as_str(), timeout);
        info!(stage = %stage, success = out.success(), "stage command finished");
        if out.success() {
            Ok(StageOutcome::success(summary))
        } else {
            Ok(StageOutcome::failure(summary))
        }
    }
}
