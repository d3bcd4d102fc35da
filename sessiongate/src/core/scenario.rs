//! Scenario evidence and the multi-agent authorization predicate.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Adversarial scenario that must be survived before concurrent operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioId {
    InterruptedReconciliation,
    ForcedExit,
    PostCleanupUnhealthy,
}

impl ScenarioId {
    pub const ALL: [ScenarioId; 3] = [
        ScenarioId::InterruptedReconciliation,
        ScenarioId::ForcedExit,
        ScenarioId::PostCleanupUnhealthy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScenarioId::InterruptedReconciliation => "interrupted-reconciliation",
            ScenarioId::ForcedExit => "forced-exit",
            ScenarioId::PostCleanupUnhealthy => "post-cleanup-unhealthy",
        }
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScenarioId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = ScenarioId::ALL.iter().map(|id| id.as_str()).collect();
                format!("unknown scenario '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioResult {
    Passed,
    Failed,
}

impl ScenarioResult {
    pub fn as_str(self) -> &'static str {
        match self {
            ScenarioResult::Passed => "PASSED",
            ScenarioResult::Failed => "FAILED",
        }
    }
}

/// One evidence record in the scenario ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioRun {
    pub scenario_id: ScenarioId,
    pub run_id: String,
    pub result: ScenarioResult,
    pub violations_count: u32,
    #[serde(default)]
    pub violations: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ScenarioRun {
    /// Build a run whose result follows from its violations.
    pub fn from_violations(
        scenario_id: ScenarioId,
        run_id: impl Into<String>,
        violations: Vec<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let result = if violations.is_empty() {
            ScenarioResult::Passed
        } else {
            ScenarioResult::Failed
        };
        Self {
            scenario_id,
            run_id: run_id.into(),
            result,
            violations_count: u32::try_from(violations.len()).unwrap_or(u32::MAX),
            violations,
            recorded_at,
        }
    }
}

/// Per-scenario tally over the whole ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioSummary {
    pub passed: u32,
    pub failed: u32,
    pub last_result: Option<ScenarioResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub authorized: bool,
    /// Required scenarios with no `PASSED` run on record.
    pub missing: Vec<ScenarioId>,
}

/// Summarize runs per scenario, in ledger order.
pub fn summarize(runs: &[ScenarioRun]) -> BTreeMap<ScenarioId, ScenarioSummary> {
    let mut summaries: BTreeMap<ScenarioId, ScenarioSummary> = BTreeMap::new();
    for run in runs {
        let entry = summaries.entry(run.scenario_id).or_default();
        match run.result {
            ScenarioResult::Passed => entry.passed += 1,
            ScenarioResult::Failed => entry.failed += 1,
        }
        entry.last_result = Some(run.result);
    }
    summaries
}

/// True iff every required scenario has at least one `PASSED` run.
///
/// A failure recorded after a pass does not revoke authorization.
pub fn authorize(required: &[ScenarioId], runs: &[ScenarioRun]) -> Authorization {
    let summaries = summarize(runs);
    let mut missing: Vec<ScenarioId> = required
        .iter()
        .copied()
        .filter(|id| summaries.get(id).is_none_or(|summary| summary.passed == 0))
        .collect();
    missing.sort();
    missing.dedup();
    Authorization {
        authorized: missing.is_empty(),
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: ScenarioId, result: ScenarioResult) -> ScenarioRun {
        ScenarioRun {
            scenario_id: id,
            run_id: format!("{id}-run"),
            result,
            violations_count: u32::from(result == ScenarioResult::Failed),
            violations: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn empty_ledger_is_not_authorized() {
        let auth = authorize(&ScenarioId::ALL, &[]);
        assert!(!auth.authorized);
        assert_eq!(auth.missing, ScenarioId::ALL.to_vec());
    }

    #[test]
    fn one_pass_per_scenario_authorizes() {
        let runs = vec![
            run(ScenarioId::InterruptedReconciliation, ScenarioResult::Failed),
            run(ScenarioId::InterruptedReconciliation, ScenarioResult::Passed),
            run(ScenarioId::ForcedExit, ScenarioResult::Passed),
            run(ScenarioId::PostCleanupUnhealthy, ScenarioResult::Passed),
        ];
        assert!(authorize(&ScenarioId::ALL, &runs).authorized);
    }

    #[test]
    fn later_failure_does_not_revoke() {
        let runs = vec![
            run(ScenarioId::InterruptedReconciliation, ScenarioResult::Passed),
            run(ScenarioId::ForcedExit, ScenarioResult::Passed),
            run(ScenarioId::PostCleanupUnhealthy, ScenarioResult::Passed),
            run(ScenarioId::ForcedExit, ScenarioResult::Failed),
        ];
        let auth = authorize(&ScenarioId::ALL, &runs);
        assert!(auth.authorized);
        let summary = &summarize(&runs)[&ScenarioId::ForcedExit];
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.last_result, Some(ScenarioResult::Failed));
    }

    #[test]
    fn only_failures_leave_scenario_missing() {
        let runs = vec![run(ScenarioId::ForcedExit, ScenarioResult::Failed)];
        let auth = authorize(&[ScenarioId::ForcedExit], &runs);
        assert_eq!(auth.missing, vec![ScenarioId::ForcedExit]);
    }

    #[test]
    fn parses_scenario_ids() {
        assert_eq!(
            "post-cleanup-unhealthy".parse::<ScenarioId>(),
            Ok(ScenarioId::PostCleanupUnhealthy)
        );
        assert!("nope".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn result_follows_violations() {
        let passed = ScenarioRun::from_violations(ScenarioId::ForcedExit, "r1", Vec::new(), Utc::now());
        assert_eq!(passed.result, ScenarioResult::Passed);
        let failed = ScenarioRun::from_violations(
            ScenarioId::ForcedExit,
            "r2",
            vec!["verdict was CLEAN_EXIT".to_string()],
            Utc::now(),
        );
        assert_eq!(failed.result, ScenarioResult::Failed);
        assert_eq!(failed.violations_count, 1);
    }
}
