//! Test-only helpers for building gate workspaces and driving the engines.

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::core::domain::{HousekeepingCommand, SessionId, WorkCommand};
use crate::core::records::{
    ArtifactRef, HousekeepingArtifact, HousekeepingOutcome, HousekeepingResult, Tier2Record,
};
use crate::core::tiers::ApprovalToken;
use crate::exit_gate::{ExitGate, ExitReport, ExitRequest};
use crate::housekeep::{HousekeepReport, HousekeepingEngine};
use crate::io::artifact_store::{ArtifactStore, next_artifact_id};
use crate::io::config::GateConfig;
use crate::io::init::{GatePaths, InitOptions, init_gate};
use crate::io::probes::HealthCheck;
use crate::io::stage_runner::{GitOps, StageRunner};
use crate::io::state_store::SessionStateStore;
use crate::reconcile::{ReconcileReport, ReconciliationEngine};
use crate::scripted::{ScriptedCleanup, ScriptedGit, ScriptedProbe, ScriptedStageRunner};

/// Initialized gate workspace in a temp dir. Keep the `TempDir` alive.
pub fn workspace() -> (TempDir, GatePaths) {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_gate(temp.path(), &InitOptions { force: false }).expect("init gate");
    (temp, paths)
}

pub fn session(id: &str) -> SessionId {
    SessionId::parse(id).expect("valid session id")
}

pub fn reconcile(
    paths: &GatePaths,
    runner: &ScriptedStageRunner,
    git: &ScriptedGit,
    session_id: &SessionId,
) -> anyhow::Result<ReconcileReport> {
    reconcile_with(paths, runner, git, session_id)
}

/// Reconcile with arbitrary collaborators and the default config.
pub fn reconcile_with(
    paths: &GatePaths,
    runner: &dyn StageRunner,
    git: &dyn GitOps,
    session_id: &SessionId,
) -> anyhow::Result<ReconcileReport> {
    let config = GateConfig::default();
    let store = SessionStateStore::new(paths, config.lock_stale_secs);
    ReconciliationEngine::new(paths, store, runner, git, &config.git.commit_message).run(
        WorkCommand::Reconcile {
            session_id: session_id.clone(),
        },
    )
}

pub fn housekeep(
    paths: &GatePaths,
    probe: &ScriptedProbe,
    checks: Vec<&dyn HealthCheck>,
    cleanup: &ScriptedCleanup,
    approval: Option<ApprovalToken>,
) -> HousekeepReport {
    HousekeepingEngine::new(paths, &GateConfig::default().housekeeping, probe, checks, cleanup)
        .run(HousekeepingCommand::Housekeep { approval })
        .expect("housekeep")
}

/// Append a completed HK artifact stamped at `timestamp`.
pub fn write_hk_at(paths: &GatePaths, timestamp: DateTime<Utc>) -> ArtifactRef {
    let artifact = HousekeepingArtifact {
        id: next_artifact_id("hk"),
        timestamp,
        snapshot: None,
        health_pre: Vec::new(),
        health_post: Vec::new(),
        tier1: Vec::new(),
        tier2: Tier2Record::default(),
        result: HousekeepingResult {
            services_protected: true,
            success: true,
            outcome: HousekeepingOutcome::Completed,
            reason: None,
        },
    };
    ArtifactStore::new(paths.housekeeping_dir())
        .append(timestamp, &artifact.id, &artifact)
        .expect("append hk artifact")
}

pub fn exit(
    paths: &GatePaths,
    session_id: &SessionId,
    forced: bool,
    checks: Vec<&dyn HealthCheck>,
    now: DateTime<Utc>,
) -> anyhow::Result<ExitReport> {
    let view = SessionStateStore::new(paths, GateConfig::default().lock_stale_secs).view();
    ExitGate::new(paths, view, checks).evaluate(
        &ExitRequest {
            session_id: session_id.clone(),
            forced,
            max_age_hours: GateConfig::default().hk_max_age_hours,
        },
        now,
    )
}
