//! Scenario authority: gates multi-agent operation on recorded scenario evidence.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::core::scenario::{
    Authorization, ScenarioId, ScenarioResult, ScenarioRun, ScenarioSummary, authorize, summarize,
};
use crate::error::GateError;
use crate::io::init::GatePaths;
use crate::io::scenario_ledger::{FailureAudit, ScenarioLedger};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioStatus {
    pub summaries: BTreeMap<ScenarioId, ScenarioSummary>,
    pub authorization: Authorization,
}

#[derive(Debug, Clone)]
pub struct ScenarioAuthority {
    ledger: ScenarioLedger,
    required: Vec<ScenarioId>,
}

impl ScenarioAuthority {
    pub fn new(paths: &GatePaths, required: &[ScenarioId]) -> Self {
        Self {
            ledger: ScenarioLedger::new(paths),
            required: required.to_vec(),
        }
    }

    /// Append a run. Failures are also written to the audit log; they never
    /// revoke an earlier pass.
    pub fn record(&self, run: &ScenarioRun) -> Result<()> {
        let previously_passed = self.ledger.runs()?.iter().any(|prior| {
            prior.scenario_id == run.scenario_id && prior.result == ScenarioResult::Passed
        });
        self.ledger.append_run(run)?;
        if run.result == ScenarioResult::Failed {
            warn!(
                scenario = %run.scenario_id,
                run_id = %run.run_id,
                violations = run.violations_count,
                previously_passed,
                "scenario run failed"
            );
            self.ledger.append_audit(&FailureAudit {
                recorded_at: Utc::now(),
                scenario_id: run.scenario_id,
                run_id: run.run_id.clone(),
                violations_count: run.violations_count,
                violations: run.violations.clone(),
                previously_passed,
            })?;
        } else {
            info!(scenario = %run.scenario_id, run_id = %run.run_id, "scenario run passed");
        }
        Ok(())
    }

    pub fn status(&self) -> Result<ScenarioStatus> {
        let runs = self.ledger.runs()?;
        Ok(ScenarioStatus {
            summaries: summarize(&runs),
            authorization: authorize(&self.required, &runs),
        })
    }

    /// Refuse concurrent dispatch unless every required scenario has passed once.
    pub fn ensure_concurrency_authorized(&self) -> Result<()> {
        let authorization = self.status()?.authorization;
        if authorization.authorized {
            return Ok(());
        }
        Err(GateError::ConcurrencyNotAuthorized {
            missing: authorization
                .missing
                .iter()
                .map(|id| id.as_str().to_string())
                .collect(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorClass, classify};

    fn run(id: ScenarioId, run_id: &str, violations: &[&str]) -> ScenarioRun {
        ScenarioRun::from_violations(
            id,
            run_id,
            violations.iter().map(|v| v.to_string()).collect(),
            Utc::now(),
        )
    }

    #[test]
    fn authorization_requires_every_scenario() {
        let temp = tempfile::tempdir().expect("tempdir");
        let authority = ScenarioAuthority::new(&GatePaths::new(temp.path()), &ScenarioId::ALL);
        let err = authority.ensure_concurrency_authorized().unwrap_err();
        assert_eq!(classify(&err), ErrorClass::Blocked);

        authority
            .record(&run(ScenarioId::InterruptedReconciliation, "r1", &[]))
            .expect("record");
        authority
            .record(&run(ScenarioId::ForcedExit, "r2", &[]))
            .expect("record");
        let err = authority.ensure_concurrency_authorized().unwrap_err();
        assert!(err.to_string().contains("post-cleanup-unhealthy"));

        authority
            .record(&run(ScenarioId::PostCleanupUnhealthy, "r3", &[]))
            .expect("record");
        authority.ensure_concurrency_authorized().expect("authorized");
    }

    #[test]
    fn later_failure_is_audited_but_does_not_revoke() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = GatePaths::new(temp.path());
        let authority = ScenarioAuthority::new(&paths, &[ScenarioId::ForcedExit]);
        authority
            .record(&run(ScenarioId::ForcedExit, "r1", &[]))
            .expect("record");
        authority
            .record(&run(ScenarioId::ForcedExit, "r2", &["no exit artifact"]))
            .expect("record");

        let status = authority.status().expect("status");
        assert!(status.authorization.authorized);
        let summary = &status.summaries[&ScenarioId::ForcedExit];
        assert_eq!((summary.passed, summary.failed), (1, 1));
        assert_eq!(summary.last_result, Some(ScenarioResult::Failed));

        let audits = ScenarioLedger::new(&paths).audits().expect("audits");
        assert_eq!(audits.len(), 1);
        assert!(audits[0].previously_passed);
        assert_eq!(audits[0].run_id, "r2");
    }
}
