//! Shared deterministic types for session gate core logic.
//!
//! These types define the stable serialized vocabulary of the gate. Variant
//! spellings are part of the on-disk contract and must not change.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step of the fixed delivery pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scripts,
    Container,
    Deploy,
    Tests,
    GitCommit,
    GitPush,
}

impl Stage {
    /// The pipeline order. Nothing else in the crate defines stage ordering.
    pub const PIPELINE: [Stage; 6] = [
        Stage::Scripts,
        Stage::Container,
        Stage::Deploy,
        Stage::Tests,
        Stage::GitCommit,
        Stage::GitPush,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Scripts => "scripts",
            Stage::Container => "container",
            Stage::Deploy => "deploy",
            Stage::Tests => "tests",
            Stage::GitCommit => "git_commit",
            Stage::GitPush => "git_push",
        }
    }

    /// Zero-based position in [`Stage::PIPELINE`].
    pub fn index(self) -> usize {
        Stage::PIPELINE
            .iter()
            .position(|stage| *stage == self)
            .unwrap_or(Stage::PIPELINE.len())
    }

    /// Stages that must be completed before this one may complete.
    pub fn predecessors(self) -> &'static [Stage] {
        &Stage::PIPELINE[..self.index()]
    }

    /// Pipeline position reached once this stage completes.
    pub fn completed_position(self) -> PipelinePosition {
        match self {
            Stage::Scripts => PipelinePosition::Scripts,
            Stage::Container => PipelinePosition::Container,
            Stage::Deploy => PipelinePosition::Deploy,
            Stage::Tests => PipelinePosition::Tests,
            Stage::GitCommit => PipelinePosition::GitCommitted,
            Stage::GitPush => PipelinePosition::GitPushed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Furthest point the session has durably reached.
///
/// `GitStaged` sits between `Tests` and `GitCommitted`: the commit stage has
/// staged the worktree but the commit itself has not landed yet.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePosition {
    #[default]
    None,
    Scripts,
    Container,
    Deploy,
    Tests,
    GitStaged,
    GitCommitted,
    GitPushed,
}

/// Per-stage status recorded in session state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    /// The stage was running when its invocation died without a terminal artifact.
    Interrupted,
}

/// Outcome of one external collaborator call (`run()` or `check()`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub status: OutcomeStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

impl StageOutcome {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            detail: detail.into(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            detail: detail.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Result of a protected-service health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub detail: String,
}

impl HealthReport {
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            detail: detail.into(),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
        }
    }
}

/// Terminal verdict of one reconciliation invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcileVerdict {
    ReconciledExitReady,
    ReconciliationBlocked,
    FailedTests,
}

impl ReconcileVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconcileVerdict::ReconciledExitReady => "RECONCILED_EXIT_READY",
            ReconcileVerdict::ReconciliationBlocked => "RECONCILIATION_BLOCKED",
            ReconcileVerdict::FailedTests => "FAILED_TESTS",
        }
    }

    /// Verdict for a pipeline halted at `stage`.
    pub fn for_halt(stage: Stage) -> Self {
        if stage == Stage::Tests {
            ReconcileVerdict::FailedTests
        } else {
            ReconcileVerdict::ReconciliationBlocked
        }
    }
}

impl fmt::Display for ReconcileVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of an exit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitVerdict {
    CleanExit,
    ExitBlocked,
    DirtyExit,
}

impl ExitVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitVerdict::CleanExit => "CLEAN_EXIT",
            ExitVerdict::ExitBlocked => "EXIT_BLOCKED",
            ExitVerdict::DirtyExit => "DIRTY_EXIT",
        }
    }
}

impl fmt::Display for ExitVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
