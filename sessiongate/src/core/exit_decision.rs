//! Exit decision table.
//!
//! Rules, evaluated in order:
//! 1. forced → `DIRTY_EXIT`
//! 2. reconciliation not `RECONCILED_EXIT_READY` → `EXIT_BLOCKED`
//! 3. housekeeping artifact missing or stale → `EXIT_BLOCKED`
//! 4. any protected service unhealthy → `EXIT_BLOCKED`
//! 5. otherwise `CLEAN_EXIT`
//!
//! `reasons` lists every unmet precondition; the first entry is the one that
//! decided the verdict (for a forced exit, the first entry is the forcing).

use crate::core::freshness::Freshness;
use crate::core::types::{ExitVerdict, ReconcileVerdict};

/// What the exit gate knows about the session's reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvidence {
    /// No SR artifact exists for the session.
    Missing,
    /// The latest invocation has no terminal SR artifact (running or interrupted).
    Pending { invocation: u64 },
    Terminal {
        verdict: ReconcileVerdict,
        blocking_reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HousekeepingEvidence {
    Missing,
    Present(Freshness),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInputs {
    pub forced: bool,
    pub reconcile: ReconcileEvidence,
    pub housekeeping: HousekeepingEvidence,
    /// `name: detail` of every protected service that is currently unhealthy.
    pub unhealthy_services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitDecision {
    pub verdict: ExitVerdict,
    pub reasons: Vec<String>,
}

pub fn decide_exit(inputs: &ExitInputs) -> ExitDecision {
    let mut unmet = Vec::new();

    match &inputs.reconcile {
        ReconcileEvidence::Missing => {
            unmet.push("no reconciliation artifact for session (run reconcile)".to_string());
        }
        ReconcileEvidence::Pending { invocation } => unmet.push(format!(
            "reconciliation invocation {invocation} has no terminal artifact (re-run reconcile)"
        )),
        ReconcileEvidence::Terminal { verdict, .. }
            if *verdict == ReconcileVerdict::ReconciledExitReady => {}
        ReconcileEvidence::Terminal {
            verdict,
            blocking_reason,
        } => {
            let mut msg = format!("reconciliation verdict {verdict}");
            if let Some(reason) = blocking_reason {
                msg.push_str(&format!(": {reason}"));
            }
            unmet.push(msg);
        }
    }

    match &inputs.housekeeping {
        HousekeepingEvidence::Missing => {
            unmet.push("HK artifact missing (run housekeep)".to_string());
        }
        HousekeepingEvidence::Present(freshness) if !freshness.fresh => {
            unmet.push(format!("HK artifact stale, {}", freshness.describe()));
        }
        HousekeepingEvidence::Present(_) => {}
    }

    for service in &inputs.unhealthy_services {
        unmet.push(format!("protected service unhealthy: {service}"));
    }

    if inputs.forced {
        let mut reasons = vec!["exit forced".to_string()];
        reasons.extend(unmet);
        return ExitDecision {
            verdict: ExitVerdict::DirtyExit,
            reasons,
        };
    }

    let verdict = if unmet.is_empty() {
        ExitVerdict::CleanExit
    } else {
        ExitVerdict::ExitBlocked
    };
    ExitDecision {
        verdict,
        reasons: unmet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::freshness::evaluate;
    use chrono::{Duration, Utc};

    fn hk(age_hours: i64) -> HousekeepingEvidence {
        let now = Utc::now();
        HousekeepingEvidence::Present(evaluate(
            now,
            now - Duration::hours(age_hours),
            Duration::hours(24),
        ))
    }

    fn ready() -> ReconcileEvidence {
        ReconcileEvidence::Terminal {
            verdict: ReconcileVerdict::ReconciledExitReady,
            blocking_reason: None,
        }
    }

    #[test]
    fn decision_table_is_total_and_forced_always_dirty() {
        let reconciles = vec![
            ReconcileEvidence::Missing,
            ReconcileEvidence::Pending { invocation: 2 },
            ready(),
            ReconcileEvidence::Terminal {
                verdict: ReconcileVerdict::ReconciliationBlocked,
                blocking_reason: Some("deploy: exit 1".to_string()),
            },
            ReconcileEvidence::Terminal {
                verdict: ReconcileVerdict::FailedTests,
                blocking_reason: None,
            },
        ];
        let hks = vec![HousekeepingEvidence::Missing, hk(1), hk(25)];
        let healths = vec![Vec::new(), vec!["db: connection refused".to_string()]];

        for forced in [false, true] {
            for reconcile in &reconciles {
                for housekeeping in &hks {
                    for unhealthy in &healths {
                        let inputs = ExitInputs {
                            forced,
                            reconcile: reconcile.clone(),
                            housekeeping: housekeeping.clone(),
                            unhealthy_services: unhealthy.clone(),
                        };
                        let decision = decide_exit(&inputs);
                        let all_green = *reconcile == ready()
                            && *housekeeping == hk(1)
                            && unhealthy.is_empty();
                        let expected = if forced {
                            ExitVerdict::DirtyExit
                        } else if all_green {
                            ExitVerdict::CleanExit
                        } else {
                            ExitVerdict::ExitBlocked
                        };
                        assert_eq!(decision.verdict, expected, "inputs: {inputs:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn stale_hk_cites_age_and_threshold() {
        let decision = decide_exit(&ExitInputs {
            forced: false,
            reconcile: ready(),
            housekeeping: hk(25),
            unhealthy_services: Vec::new(),
        });
        assert_eq!(decision.verdict, ExitVerdict::ExitBlocked);
        assert_eq!(
            decision.reasons,
            vec!["HK artifact stale, age 25h > 24h threshold".to_string()]
        );
    }

    #[test]
    fn reconciliation_reason_comes_first() {
        let decision = decide_exit(&ExitInputs {
            forced: false,
            reconcile: ReconcileEvidence::Pending { invocation: 3 },
            housekeeping: HousekeepingEvidence::Missing,
            unhealthy_services: Vec::new(),
        });
        assert_eq!(decision.verdict, ExitVerdict::ExitBlocked);
        assert!(decision.reasons[0].contains("invocation 3 has no terminal artifact"));
        assert!(decision.reasons[1].contains("HK artifact missing"));
    }

    #[test]
    fn forced_exit_with_everything_green_is_still_dirty() {
        let decision = decide_exit(&ExitInputs {
            forced: true,
            reconcile: ready(),
            housekeeping: hk(0),
            unhealthy_services: Vec::new(),
        });
        assert_eq!(decision.verdict, ExitVerdict::DirtyExit);
        assert_eq!(decision.reasons, vec!["exit forced".to_string()]);
    }
}
