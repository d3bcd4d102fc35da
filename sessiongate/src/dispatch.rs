//! Dispatch of reconciliation across one or more sessions.
//!
//! A single session always runs inline. Several sessions run on scoped threads,
//! and only once the scenario authority has seen every required scenario pass.

use std::collections::BTreeSet;
use std::thread;

use anyhow::{Result, anyhow};
use tracing::info;

use crate::core::domain::SessionId;
use crate::reconcile::ReconcileReport;
use crate::scenario::ScenarioAuthority;

/// Outcome of one session within a dispatch.
#[derive(Debug)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub result: Result<ReconcileReport>,
}

/// Run `reconcile` once per session, in the given order for the results.
///
/// Errors from individual sessions are returned per session; the outer error is
/// reserved for refusals that stop the whole dispatch.
pub fn dispatch_reconcile<F>(
    authority: &ScenarioAuthority,
    sessions: &[SessionId],
    reconcile: F,
) -> Result<Vec<SessionOutcome>>
where
    F: Fn(&SessionId) -> Result<ReconcileReport> + Sync,
{
    let mut seen = BTreeSet::new();
    if let Some(dup) = sessions.iter().find(|id| !seen.insert(*id)) {
        return Err(anyhow!("session {dup} listed more than once"));
    }

    match sessions {
        [] => Ok(Vec::new()),
        [only] => Ok(vec![SessionOutcome {
            session_id: only.clone(),
            result: reconcile(only),
        }]),
        _ => {
            authority.ensure_concurrency_authorized()?;
            info!(sessions = sessions.len(), "dispatching concurrent reconciliation");
            let reconcile = &reconcile;
            let outcomes: Vec<SessionOutcome> = thread::scope(|scope| {
                let handles: Vec<_> = sessions
                    .iter()
                    .map(|id| (id, scope.spawn(move || reconcile(id))))
                    .collect();
                handles
                    .into_iter()
                    .map(|(id, handle)| SessionOutcome {
                        session_id: id.clone(),
                        result: handle
                            .join()
                            .unwrap_or_else(|_| Err(anyhow!("reconcile thread for {id} panicked"))),
                    })
                    .collect()
            });
            Ok(outcomes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scenario::{ScenarioId, ScenarioRun};
    use crate::error::{ErrorClass, classify};
    use crate::io::init::GatePaths;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ids(raw: &[&str]) -> Vec<SessionId> {
        raw.iter()
            .map(|id| SessionId::parse(id).expect("session id"))
            .collect()
    }

    #[test]
    fn concurrent_dispatch_refused_without_scenarios() {
        let temp = tempfile::tempdir().expect("tempdir");
        let authority = ScenarioAuthority::new(&GatePaths::new(temp.path()), &ScenarioId::ALL);
        let calls = AtomicUsize::new(0);
        let err = dispatch_reconcile(&authority, &ids(&["a", "b"]), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("unreachable"))
        })
        .unwrap_err();
        assert_eq!(classify(&err), ErrorClass::Blocked);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn single_session_skips_authority() {
        let temp = tempfile::tempdir().expect("tempdir");
        let authority = ScenarioAuthority::new(&GatePaths::new(temp.path()), &ScenarioId::ALL);
        let outcomes = dispatch_reconcile(&authority, &ids(&["a"]), |_| Err(anyhow!("stage failed")))
            .expect("dispatch");
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_err());
    }

    #[test]
    fn authorized_dispatch_runs_every_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let authority = ScenarioAuthority::new(&GatePaths::new(temp.path()), &ScenarioId::ALL);
        for (n, id) in ScenarioId::ALL.iter().enumerate() {
            authority
                .record(&ScenarioRun::from_violations(*id, format!("r{n}"), Vec::new(), Utc::now()))
                .expect("record");
        }
        let calls = AtomicUsize::new(0);
        let outcomes = dispatch_reconcile(&authority, &ids(&["a", "b", "c"]), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("no runner"))
        })
        .expect("dispatch");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let order: Vec<&str> = outcomes.iter().map(|o| o.session_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicate_sessions_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let authority = ScenarioAuthority::new(&GatePaths::new(temp.path()), &ScenarioId::ALL);
        let err = dispatch_reconcile(&authority, &ids(&["a", "a"]), |_| Err(anyhow!("x")))
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
