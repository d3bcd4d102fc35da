//! Persisted artifact records (SR, SessionPin, HK, exit).
//!
//! Each record is written once to an append-only store and never rewritten.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::tiers::{ResourceSnapshot, Tier2Action};
use crate::core::types::{ExitVerdict, HealthReport, ReconcileVerdict, Stage, StageStatus};

/// Pointer to a stored artifact, with the digest of the bytes that were read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    pub detail: String,
}

/// Terminal record of one reconciliation invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationArtifact {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub invocation: u64,
    /// Version of the session state this artifact describes (0 if none was written).
    pub state_version: u64,
    /// Stage the invocation resumed at, `None` when nothing was left to run.
    pub resumed_from: Option<Stage>,
    /// Stages whose runner was invoked during this invocation.
    pub executed: Vec<Stage>,
    pub stages: BTreeMap<Stage, StageRecord>,
    pub verdict: ReconcileVerdict,
    pub exit_ready: bool,
    pub blocking_reason: Option<String>,
    /// True when the invocation ended fatally and this artifact documents the abort.
    #[serde(default)]
    pub aborted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSummary {
    pub commits: Vec<String>,
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
    /// Passed test count when the test runner reported one.
    pub tests_passed: Option<u32>,
    /// Detail reported by the test stage.
    pub tests_detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextSessionContext {
    pub pending_work: Vec<String>,
    pub blockers: Vec<String>,
}

/// Summary of a successfully reconciled session, read by the next session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPin {
    pub id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub reconciliation: ArtifactRef,
    pub work_summary: WorkSummary,
    pub next_session_context: NextSessionContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub name: String,
    pub healthy: bool,
    pub detail: String,
}

impl ServiceHealth {
    pub fn from_report(name: &str, report: HealthReport) -> Self {
        Self {
            name: name.to_string(),
            healthy: report.healthy,
            detail: report.detail,
        }
    }

    /// `name: detail`, as cited in exit reasons.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.name, self.detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Executed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: String,
    pub tier: u8,
    pub status: ActionStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier2Record {
    pub requested: Vec<Tier2Action>,
    pub approved: Vec<Tier2Action>,
    pub executed: Vec<ActionRecord>,
    pub skipped: Vec<Tier2Action>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HousekeepingOutcome {
    /// Scan and cleanup ran; services stayed healthy.
    Completed,
    /// A protected service was unhealthy before cleanup; nothing ran.
    PreconditionFailed,
    /// The tier-0 scan failed or timed out; nothing ran.
    ScanAborted,
    /// A service that was healthy before cleanup is unhealthy after it.
    Degraded,
}

impl HousekeepingOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            HousekeepingOutcome::Completed => "completed",
            HousekeepingOutcome::PreconditionFailed => "precondition_failed",
            HousekeepingOutcome::ScanAborted => "scan_aborted",
            HousekeepingOutcome::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HousekeepingResult {
    pub services_protected: bool,
    pub success: bool,
    pub outcome: HousekeepingOutcome,
    pub reason: Option<String>,
}

/// Terminal record of one housekeeping invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HousekeepingArtifact {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub snapshot: Option<ResourceSnapshot>,
    pub health_pre: Vec<ServiceHealth>,
    pub health_post: Vec<ServiceHealth>,
    pub tier1: Vec<ActionRecord>,
    pub tier2: Tier2Record,
    pub result: HousekeepingResult,
}

/// Record of one exit attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitArtifact {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub verdict: ExitVerdict,
    pub forced: bool,
    pub sr_reference: Option<ArtifactRef>,
    pub hk_reference: Option<ArtifactRef>,
    pub hk_max_age_hours: u64,
    pub health: Vec<ServiceHealth>,
    pub reasons: Vec<String>,
}
