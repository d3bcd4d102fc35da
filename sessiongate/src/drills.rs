//! Adversarial scenario drills.
//!
//! Each drill builds a throwaway gate workspace, drives the real engines with
//! scripted collaborators and returns the invariant violations it observed.
//! An empty list means the scenario was survived.

use std::fs;
use std::panic::{self, AssertUnwindSafe};

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{info, info_span};

use crate::core::domain::{HousekeepingCommand, SessionId, WorkCommand};
use crate::core::records::{HousekeepingOutcome, ReconciliationArtifact};
use crate::core::scenario::{ScenarioId, ScenarioRun};
use crate::core::types::{ExitVerdict, ReconcileVerdict, Stage};
use crate::exit_gate::{ExitGate, ExitReport, ExitRequest};
use crate::housekeep::{HousekeepReport, HousekeepingEngine};
use crate::io::artifact_store::{ArtifactStore, next_artifact_id};
use crate::io::config::GateConfig;
use crate::io::init::{GatePaths, InitOptions, init_gate};
use crate::io::probes::HealthCheck;
use crate::io::state_store::SessionStateStore;
use crate::reconcile::{ReconcileReport, ReconciliationEngine};
use crate::scenario::ScenarioAuthority;
use crate::scripted::{
    Scripted, ScriptedCleanup, ScriptedGit, ScriptedHealthCheck, ScriptedProbe,
    ScriptedStageRunner, SimulatedInterrupt,
};

/// Run one drill in a fresh temporary workspace.
pub fn run_drill(id: ScenarioId) -> Result<Vec<String>> {
    let _span = info_span!("drill", scenario = %id).entered();
    let temp = tempfile::tempdir()?;
    let paths = init_gate(temp.path(), &InitOptions { force: false })?;
    let drill = Drill {
        paths,
        config: GateConfig::default(),
        violations: Vec::new(),
    };
    let violations = match id {
        ScenarioId::InterruptedReconciliation => drill.interrupted_reconciliation()?,
        ScenarioId::ForcedExit => drill.forced_exit()?,
        ScenarioId::PostCleanupUnhealthy => drill.post_cleanup_unhealthy()?,
    };
    info!(violations = violations.len(), "drill finished");
    Ok(violations)
}

/// Run a drill and record its outcome with the authority.
pub fn drill_and_record(authority: &ScenarioAuthority, id: ScenarioId) -> Result<ScenarioRun> {
    let violations = run_drill(id)?;
    let run = ScenarioRun::from_violations(id, next_artifact_id("drill"), violations, Utc::now());
    authority.record(&run)?;
    Ok(run)
}

struct Drill {
    paths: GatePaths,
    config: GateConfig,
    violations: Vec<String>,
}

impl Drill {
    fn check(&mut self, holds: bool, violation: impl FnOnce() -> String) {
        if !holds {
            self.violations.push(violation());
        }
    }

    fn reconcile(
        &self,
        session: &SessionId,
        runner: &ScriptedStageRunner,
        git: &ScriptedGit,
    ) -> Result<ReconcileReport> {
        let store = SessionStateStore::new(&self.paths, self.config.lock_stale_secs);
        ReconciliationEngine::new(&self.paths, store, runner, git, &self.config.git.commit_message)
            .run(WorkCommand::Reconcile {
                session_id: session.clone(),
            })
    }

    fn housekeep(&self, checks: Vec<&dyn HealthCheck>, cleanup: &ScriptedCleanup) -> Result<HousekeepReport> {
        let probe = ScriptedProbe::healthy();
        HousekeepingEngine::new(&self.paths, &self.config.housekeeping, &probe, checks, cleanup)
            .run(HousekeepingCommand::Housekeep { approval: None })
    }

    fn exit(&self, session: &SessionId, forced: bool, checks: Vec<&dyn HealthCheck>) -> Result<ExitReport> {
        let view = SessionStateStore::new(&self.paths, self.config.lock_stale_secs).view();
        ExitGate::new(&self.paths, view, checks).evaluate(
            &ExitRequest {
                session_id: session.clone(),
                forced,
                max_age_hours: self.config.hk_max_age_hours,
            },
            Utc::now(),
        )
    }

    /// Process death mid-`container`, then resume.
    fn interrupted_reconciliation(mut self) -> Result<Vec<String>> {
        let session = drill_session("drill-interrupted")?;
        let runner = ScriptedStageRunner::new();
        runner.push(Stage::Container, Scripted::Interrupt);
        let git = ScriptedGit::new();
        let service = ScriptedHealthCheck::new("api", &[true]);
        self.housekeep(vec![&service], &ScriptedCleanup::new())?;

        let first = panic::catch_unwind(AssertUnwindSafe(|| self.reconcile(&session, &runner, &git)));
        match first {
            Err(payload) if payload.is::<SimulatedInterrupt>() => {}
            Err(payload) => panic::resume_unwind(payload),
            Ok(_) => self.violations.push("first invocation was not interrupted".to_string()),
        }

        let view = SessionStateStore::new(&self.paths, self.config.lock_stale_secs).view();
        let in_flight = view
            .load(&session)?
            .and_then(|state| state.in_flight)
            .map(|marker| marker.stage);
        self.check(in_flight == Some(Stage::Container), || {
            format!("in-flight marker after death is {in_flight:?}, expected container")
        });
        let srs = ArtifactStore::new(self.paths.reconciliation_dir(&session)).keys()?;
        self.check(srs.is_empty(), || {
            format!("interrupted invocation left {} SR artifact(s)", srs.len())
        });
        let lock_left = self.paths.state_lock_path(&session).exists();
        self.check(!lock_left, || "state lock left behind by dead invocation".to_string());
        let lease_left = self.paths.invocation_lease_path(&session).exists();
        self.check(!lease_left, || "invocation lease left behind by dead invocation".to_string());

        let blocked = self.exit(&session, false, vec![&service])?;
        self.check(blocked.verdict() == ExitVerdict::ExitBlocked, || {
            format!("exit during interruption was {}", blocked.verdict())
        });
        self.check(
            blocked
                .artifact
                .reasons
                .iter()
                .any(|reason| reason.contains("no terminal artifact")),
            || format!("exit reasons do not cite the missing SR: {:?}", blocked.artifact.reasons),
        );

        let resumed = self.reconcile(&session, &runner, &git)?;
        self.check(resumed.verdict() == ReconcileVerdict::ReconciledExitReady, || {
            format!("resumed invocation ended {}", resumed.verdict())
        });
        self.check(resumed.interrupted == Some(Stage::Container), || {
            format!("resume did not report the interruption: {:?}", resumed.interrupted)
        });
        let calls = runner.calls();
        let expected = [
            Stage::Scripts,
            Stage::Container,
            Stage::Container,
            Stage::Deploy,
            Stage::Tests,
        ];
        self.check(calls == expected, || {
            format!("stage runner saw {calls:?}, expected {expected:?}")
        });

        let clean = self.exit(&session, false, vec![&service])?;
        self.check(clean.verdict() == ExitVerdict::CleanExit, || {
            format!("exit after resume was {}: {:?}", clean.verdict(), clean.artifact.reasons)
        });
        Ok(self.violations)
    }

    /// Forcing overrides every precondition but is always classified dirty.
    fn forced_exit(mut self) -> Result<Vec<String>> {
        let session = drill_session("drill-forced")?;
        let runner = ScriptedStageRunner::new();
        runner.push(Stage::Tests, Scripted::Fail("2 failed, 10 passed".to_string()));
        let git = ScriptedGit::new();
        let service = ScriptedHealthCheck::new("api", &[true]);
        self.housekeep(vec![&service], &ScriptedCleanup::new())?;

        let failed = self.reconcile(&session, &runner, &git)?;
        self.check(failed.verdict() == ReconcileVerdict::FailedTests, || {
            format!("failing tests ended {}", failed.verdict())
        });

        let forced = self.exit(&session, true, vec![&service])?;
        self.check(forced.verdict() == ExitVerdict::DirtyExit, || {
            format!("forced exit over failed tests was {}", forced.verdict())
        });
        self.check(forced.artifact.forced, || "forced exit artifact not marked forced".to_string());
        self.check(
            forced.artifact.reasons.iter().any(|r| r.contains("FAILED_TESTS")),
            || format!("forced exit hides the unmet precondition: {:?}", forced.artifact.reasons),
        );

        let refused = self.exit(&session, false, vec![&service])?;
        self.check(refused.verdict() == ExitVerdict::ExitBlocked, || {
            format!("unforced exit over failed tests was {}", refused.verdict())
        });

        let green = self.reconcile(&session, &runner, &git)?;
        self.check(green.verdict() == ReconcileVerdict::ReconciledExitReady, || {
            format!("second reconcile ended {}", green.verdict())
        });
        let forced_green = self.exit(&session, true, vec![&service])?;
        self.check(forced_green.verdict() == ExitVerdict::DirtyExit, || {
            format!("forced exit with everything green was {}", forced_green.verdict())
        });

        let attempts = ArtifactStore::new(self.paths.exit_dir(&session)).keys()?.len();
        self.check(attempts == 3, || format!("{attempts} exit artifacts recorded, expected 3"));
        Ok(self.violations)
    }

    /// Cleanup that takes a protected service down is an incident, never a success.
    fn post_cleanup_unhealthy(mut self) -> Result<Vec<String>> {
        let session = drill_session("drill-unhealthy")?;
        let service = ScriptedHealthCheck::new("api", &[true, false]);
        let cleanup = ScriptedCleanup::new();
        let degraded = self.housekeep(vec![&service], &cleanup)?;
        self.check(degraded.outcome() == HousekeepingOutcome::Degraded, || {
            format!("housekeeping outcome was {}", degraded.outcome().as_str())
        });
        let result = &degraded.artifact.result;
        self.check(!result.services_protected && !result.success, || {
            format!(
                "degraded run reported services_protected={} success={}",
                result.services_protected, result.success
            )
        });
        self.check(!cleanup.executed().is_empty(), || "no tier-1 action ran".to_string());
        let sessions_touched = fs::read_dir(&self.paths.sessions_dir)?.count();
        self.check(sessions_touched == 0, || {
            format!("housekeeping wrote {sessions_touched} session entries")
        });

        let runner = ScriptedStageRunner::new();
        let git = ScriptedGit::new();
        let ready = self.reconcile(&session, &runner, &git)?;
        self.check(ready.verdict() == ReconcileVerdict::ReconciledExitReady, || {
            format!("reconcile ended {}", ready.verdict())
        });
        let sr_written = ArtifactStore::new(self.paths.reconciliation_dir(&session))
            .latest::<ReconciliationArtifact>()?
            .is_some();
        self.check(sr_written, || "no SR artifact after reconcile".to_string());

        let exit = self.exit(&session, false, vec![&service])?;
        self.check(exit.verdict() == ExitVerdict::ExitBlocked, || {
            format!("exit with a degraded service was {}", exit.verdict())
        });
        self.check(
            exit.artifact
                .reasons
                .iter()
                .any(|reason| reason.contains("protected service unhealthy: api")),
            || format!("exit reasons do not cite the service: {:?}", exit.artifact.reasons),
        );

        let down = ScriptedHealthCheck::new("db", &[false]);
        let untouched = ScriptedCleanup::new();
        let refused = self.housekeep(vec![&down], &untouched)?;
        self.check(refused.outcome() == HousekeepingOutcome::PreconditionFailed, || {
            format!("unhealthy precondition outcome was {}", refused.outcome().as_str())
        });
        self.check(untouched.executed().is_empty(), || {
            format!("cleanup ran despite failed precondition: {:?}", untouched.executed())
        });
        Ok(self.violations)
    }
}

fn drill_session(raw: &str) -> Result<SessionId> {
    SessionId::parse(raw).map_err(|err| anyhow!(err))
}
