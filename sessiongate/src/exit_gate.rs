//! Orchestration for one `gate exit` attempt.
//!
//! Reads the latest SR and HK artifacts plus live service health, applies the
//! exit decision table and records the attempt. The gate never retries and
//! never writes session state.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, info_span, warn};

use crate::core::domain::SessionId;
use crate::core::exit_decision::{
    ExitInputs, HousekeepingEvidence, ReconcileEvidence, decide_exit,
};
use crate::core::freshness::evaluate;
use crate::core::records::{
    ArtifactRef, ExitArtifact, HousekeepingArtifact, ReconciliationArtifact, ServiceHealth,
};
use crate::core::session::SessionState;
use crate::core::types::ExitVerdict;
use crate::io::artifact_store::{ArtifactStore, StoredArtifact, next_artifact_id};
use crate::io::init::GatePaths;
use crate::io::probes::{HealthCheck, check_all};
use crate::io::state_store::SessionStateView;

#[derive(Debug, Clone)]
pub struct ExitRequest {
    pub session_id: SessionId,
    pub forced: bool,
    pub max_age_hours: u64,
}

#[derive(Debug, Clone)]
pub struct ExitReport {
    pub artifact: ExitArtifact,
    pub reference: ArtifactRef,
}

impl ExitReport {
    pub fn verdict(&self) -> ExitVerdict {
        self.artifact.verdict
    }
}

pub struct ExitGate<'a> {
    paths: GatePaths,
    view: SessionStateView,
    checks: Vec<&'a dyn HealthCheck>,
}

impl<'a> ExitGate<'a> {
    pub fn new(paths: &GatePaths, view: SessionStateView, checks: Vec<&'a dyn HealthCheck>) -> Self {
        Self {
            paths: paths.clone(),
            view,
            checks,
        }
    }

    /// Classify and record one exit attempt.
    ///
    /// Unreadable evidence is refused unless the exit is forced, in which case
    /// the attempt is still recorded as `DIRTY_EXIT` with the read failure cited.
    pub fn evaluate(&self, request: &ExitRequest, now: DateTime<Utc>) -> Result<ExitReport> {
        let _span = info_span!("exit", session_id = %request.session_id, forced = request.forced)
            .entered();
        let threshold = hk_threshold(request.max_age_hours)?;
        let mut unreadable = Vec::new();

        let state = tolerate(
            self.view.load(&request.session_id),
            request.forced,
            "session state",
            &mut unreadable,
        )?
        .flatten();
        let sr_store = ArtifactStore::new(self.paths.reconciliation_dir(&request.session_id));
        let sr = tolerate(
            terminal_sr(&sr_store, state.as_ref()),
            request.forced,
            "reconciliation artifact",
            &mut unreadable,
        )?
        .flatten();
        let hk = tolerate(
            ArtifactStore::new(self.paths.housekeeping_dir()).latest::<HousekeepingArtifact>(),
            request.forced,
            "housekeeping artifact",
            &mut unreadable,
        )?
        .flatten();

        let housekeeping = match &hk {
            Some(stored) => {
                HousekeepingEvidence::Present(evaluate(now, stored.record.timestamp, threshold))
            }
            None => HousekeepingEvidence::Missing,
        };

        let health: Vec<ServiceHealth> = check_all(&self.checks)
            .into_iter()
            .map(|(name, report)| ServiceHealth::from_report(&name, report))
            .collect();
        let unhealthy_services = health
            .iter()
            .filter(|service| !service.healthy)
            .map(ServiceHealth::describe)
            .collect();

        let inputs = ExitInputs {
            forced: request.forced,
            reconcile: reconcile_evidence(state.as_ref(), sr.as_ref()),
            housekeeping,
            unhealthy_services,
        };
        let mut decision = decide_exit(&inputs);
        decision.reasons.extend(unreadable);

        let artifact = ExitArtifact {
            id: next_artifact_id("exit"),
            session_id: request.session_id.to_string(),
            timestamp: now,
            verdict: decision.verdict,
            forced: request.forced,
            sr_reference: sr.map(|stored| stored.reference),
            hk_reference: hk.map(|stored| stored.reference),
            hk_max_age_hours: request.max_age_hours,
            health,
            reasons: decision.reasons,
        };
        let reference = ArtifactStore::new(self.paths.exit_dir(&request.session_id))
            .append(now, &artifact.id, &artifact)
            .context("write exit artifact")?;
        info!(verdict = %artifact.verdict, reasons = ?artifact.reasons, "exit attempt recorded");
        Ok(ExitReport {
            artifact,
            reference,
        })
    }
}

fn hk_threshold(hours: u64) -> Result<Duration> {
    i64::try_from(hours)
        .ok()
        .and_then(Duration::try_hours)
        .ok_or_else(|| anyhow!("housekeeping max age of {hours}h is out of range"))
}

/// The SR written for the state's last terminal invocation.
///
/// Without a terminal invocation the newest SR is returned for reference only.
fn terminal_sr(
    store: &ArtifactStore,
    state: Option<&SessionState>,
) -> Result<Option<StoredArtifact<ReconciliationArtifact>>> {
    let Some(invocation) = state.and_then(|state| state.last_terminal_invocation) else {
        return store.latest();
    };
    Ok(store
        .all::<ReconciliationArtifact>()?
        .into_iter()
        .rev()
        .find(|stored| stored.record.invocation == invocation))
}

/// Pass read errors through, except on a forced exit where they become reasons.
fn tolerate<T>(
    result: Result<T>,
    forced: bool,
    what: &str,
    unreadable: &mut Vec<String>,
) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if forced => {
            warn!(what, err = %format!("{err:#}"), "unreadable input on forced exit");
            unreadable.push(format!("{what} unreadable: {err:#}"));
            Ok(None)
        }
        Err(err) => Err(err).with_context(|| format!("read {what} for exit")),
    }
}

/// The SR only counts if it terminates the session's latest invocation.
fn reconcile_evidence(
    state: Option<&SessionState>,
    sr: Option<&StoredArtifact<ReconciliationArtifact>>,
) -> ReconcileEvidence {
    let Some(state) = state else {
        return ReconcileEvidence::Missing;
    };
    if state.awaiting_terminal() {
        return ReconcileEvidence::Pending {
            invocation: state.invocations,
        };
    }
    match sr {
        None => ReconcileEvidence::Missing,
        Some(stored) if state.last_terminal_invocation != Some(stored.record.invocation) => {
            ReconcileEvidence::Pending {
                invocation: state.invocations,
            }
        }
        Some(stored) => ReconcileEvidence::Terminal {
            verdict: stored.record.verdict,
            blocking_reason: stored.record.blocking_reason.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ReconcileVerdict;

    fn sr(invocation: u64, verdict: ReconcileVerdict) -> StoredArtifact<ReconciliationArtifact> {
        StoredArtifact {
            reference: ArtifactRef {
                key: "k".to_string(),
                sha256: "s".to_string(),
            },
            record: ReconciliationArtifact {
                id: "sr".to_string(),
                session_id: "s-1".to_string(),
                timestamp: Utc::now(),
                invocation,
                state_version: 1,
                resumed_from: None,
                executed: Vec::new(),
                stages: Default::default(),
                verdict,
                exit_ready: verdict == ReconcileVerdict::ReconciledExitReady,
                blocking_reason: None,
                aborted: false,
            },
        }
    }

    fn state(invocations: u64, last_terminal: Option<u64>) -> SessionState {
        let mut state = SessionState::fresh("s-1", Utc::now());
        state.version = 3;
        state.invocations = invocations;
        state.last_terminal_invocation = last_terminal;
        state
    }

    #[test]
    fn sr_of_latest_invocation_is_terminal() {
        let evidence = reconcile_evidence(
            Some(&state(2, Some(2))),
            Some(&sr(2, ReconcileVerdict::ReconciledExitReady)),
        );
        assert!(matches!(
            evidence,
            ReconcileEvidence::Terminal {
                verdict: ReconcileVerdict::ReconciledExitReady,
                ..
            }
        ));
    }

    #[test]
    fn older_sr_does_not_count_after_interruption() {
        let evidence = reconcile_evidence(
            Some(&state(3, Some(2))),
            Some(&sr(2, ReconcileVerdict::ReconciledExitReady)),
        );
        assert_eq!(evidence, ReconcileEvidence::Pending { invocation: 3 });
    }

    #[test]
    fn out_of_range_threshold_is_an_error() {
        assert_eq!(hk_threshold(24).expect("in range"), Duration::hours(24));
        assert!(hk_threshold(3_000_000_000_000).is_err());
        assert!(hk_threshold(u64::MAX).is_err());
    }

    #[test]
    fn huge_max_age_is_refused_without_recording() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = GatePaths::new(temp.path());
        let id = SessionId::parse("s-1").expect("id");
        let gate = ExitGate::new(&paths, SessionStateView::new(&paths), Vec::new());
        let err = gate
            .evaluate(
                &ExitRequest {
                    session_id: id.clone(),
                    forced: true,
                    max_age_hours: 3_000_000_000_000,
                },
                Utc::now(),
            )
            .expect_err("out of range");
        assert!(err.to_string().contains("out of range"));
        assert!(ArtifactStore::new(paths.exit_dir(&id)).keys().expect("keys").is_empty());
    }

    #[test]
    fn terminal_sr_ignores_newer_artifacts_of_other_invocations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(temp.path());
        let now = Utc::now();
        let ready = sr(2, ReconcileVerdict::ReconciledExitReady).record;
        store.append(now, &ready.id, &ready).expect("ready");
        let mut stray = sr(1, ReconcileVerdict::ReconciliationBlocked).record;
        stray.id = "sr-stray".to_string();
        stray.aborted = true;
        store
            .append(now + Duration::seconds(1), &stray.id, &stray)
            .expect("stray");

        let found = terminal_sr(&store, Some(&state(2, Some(2))))
            .expect("read")
            .expect("present");
        assert_eq!(found.record.invocation, 2);
        assert_eq!(found.record.verdict, ReconcileVerdict::ReconciledExitReady);
        let newest = terminal_sr(&store, None).expect("read").expect("present");
        assert!(newest.record.aborted);
    }

    #[test]
    fn no_state_means_nothing_reconciled() {
        let evidence = reconcile_evidence(None, Some(&sr(1, ReconcileVerdict::ReconciledExitReady)));
        assert_eq!(evidence, ReconcileEvidence::Missing);
    }
}
