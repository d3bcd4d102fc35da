//! Engine-owned state transitions for session pipelines.
//!
//! Every transition enforces the fixed pipeline order: a stage may only start
//! or complete once all of its predecessors are completed. Callers persist the
//! mutated state through compare-and-swap.

use chrono::{DateTime, Utc};

use crate::core::session::{InFlight, SessionState};
use crate::core::types::{PipelinePosition, Stage, StageStatus};

/// Bookkeeping produced when a reconciliation invocation begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationStart {
    pub invocation: u64,
    /// The in-flight marker left by a previous invocation that never finished.
    pub interrupted: Option<InFlight>,
}

/// Start a new invocation, converting a dangling in-flight marker into `interrupted`.
pub fn begin_invocation(state: &mut SessionState, now: DateTime<Utc>) -> InvocationStart {
    let interrupted = state.in_flight.take();
    if let Some(marker) = &interrupted
        && state.status(marker.stage) != StageStatus::Completed
    {
        state
            .stage_status
            .insert(marker.stage, StageStatus::Interrupted);
        state.stage_detail.insert(
            marker.stage,
            format!(
                "interrupted during invocation {} (started {})",
                marker.invocation,
                marker.started_at.to_rfc3339()
            ),
        );
    }
    state.invocations += 1;
    state.updated_at = now;
    InvocationStart {
        invocation: state.invocations,
        interrupted,
    }
}

/// Mark `stage` as running for the current invocation.
pub fn begin_stage(
    state: &mut SessionState,
    stage: Stage,
    now: DateTime<Utc>,
) -> Result<(), String> {
    ensure_predecessors_completed(state, stage)?;
    if state.status(stage) == StageStatus::Completed {
        return Err(format!("stage {stage} already completed"));
    }
    state.in_flight = Some(InFlight {
        invocation: state.invocations,
        stage,
        started_at: now,
    });
    state.updated_at = now;
    Ok(())
}

/// Record that the commit stage has staged the worktree.
pub fn mark_staged(state: &mut SessionState, now: DateTime<Utc>) -> Result<(), String> {
    ensure_predecessors_completed(state, Stage::GitCommit)?;
    if state.status(Stage::GitCommit) == StageStatus::Completed {
        return Err("stage git_commit already completed".to_string());
    }
    state.pipeline_stage = PipelinePosition::GitStaged;
    state.updated_at = now;
    Ok(())
}

pub fn complete_stage(
    state: &mut SessionState,
    stage: Stage,
    detail: &str,
    now: DateTime<Utc>,
) -> Result<(), String> {
    ensure_predecessors_completed(state, stage)?;
    state.stage_status.insert(stage, StageStatus::Completed);
    state.stage_detail.insert(stage, detail.to_string());
    state.pipeline_stage = stage.completed_position();
    clear_in_flight(state, stage);
    state.updated_at = now;
    Ok(())
}

pub fn fail_stage(state: &mut SessionState, stage: Stage, detail: &str, now: DateTime<Utc>) {
    state.stage_status.insert(stage, StageStatus::Failed);
    state.stage_detail.insert(stage, detail.to_string());
    clear_in_flight(state, stage);
    state.updated_at = now;
}

/// Mark the invocation terminal; called right before its SR artifact is written.
pub fn finish_invocation(state: &mut SessionState, invocation: u64, now: DateTime<Utc>) {
    state.in_flight = None;
    state.last_terminal_invocation = Some(invocation);
    state.updated_at = now;
}

fn clear_in_flight(state: &mut SessionState, stage: Stage) {
    if state
        .in_flight
        .as_ref()
        .is_some_and(|marker| marker.stage == stage)
    {
        state.in_flight = None;
    }
}

fn ensure_predecessors_completed(state: &SessionState, stage: Stage) -> Result<(), String> {
    let blocking: Vec<&str> = stage
        .predecessors()
        .iter()
        .filter(|prev| state.status(**prev) != StageStatus::Completed)
        .map(|prev| prev.as_str())
        .collect();
    if blocking.is_empty() {
        return Ok(());
    }
    Err(format!(
        "stage {stage} requires completed predecessors (incomplete: {})",
        blocking.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn complete_in_order_advances_position() {
        let mut state = SessionState::fresh("s", now());
        begin_invocation(&mut state, now());
        for stage in [Stage::Scripts, Stage::Container, Stage::Deploy, Stage::Tests] {
            begin_stage(&mut state, stage, now()).expect("begin");
            complete_stage(&mut state, stage, "ok", now()).expect("complete");
        }
        assert_eq!(state.pipeline_stage, PipelinePosition::Tests);
        mark_staged(&mut state, now()).expect("stage");
        assert_eq!(state.pipeline_stage, PipelinePosition::GitStaged);
        complete_stage(&mut state, Stage::GitCommit, "abc123", now()).expect("commit");
        assert_eq!(state.pipeline_stage, PipelinePosition::GitCommitted);
        assert_eq!(state.first_incomplete(), Some(Stage::GitPush));
    }

    #[test]
    fn completing_out_of_order_is_rejected() {
        let mut state = SessionState::fresh("s", now());
        let err = complete_stage(&mut state, Stage::Tests, "ok", now()).expect_err("reject");
        assert!(err.contains("scripts, container, deploy"));
        assert_eq!(state.status(Stage::Tests), StageStatus::Pending);
        assert!(begin_stage(&mut state, Stage::Deploy, now()).is_err());
    }

    #[test]
    fn begin_invocation_marks_dangling_stage_interrupted() {
        let mut state = SessionState::fresh("s", now());
        begin_invocation(&mut state, now());
        begin_stage(&mut state, Stage::Scripts, now()).expect("begin");
        complete_stage(&mut state, Stage::Scripts, "ok", now()).expect("complete");
        begin_stage(&mut state, Stage::Container, now()).expect("begin");

        let start = begin_invocation(&mut state, now());
        assert_eq!(start.invocation, 2);
        let marker = start.interrupted.expect("interrupted marker");
        assert_eq!(marker.stage, Stage::Container);
        assert_eq!(marker.invocation, 1);
        assert_eq!(state.status(Stage::Container), StageStatus::Interrupted);
        assert!(state.in_flight.is_none());
        assert_eq!(state.first_incomplete(), Some(Stage::Container));
    }

    #[test]
    fn fail_stage_clears_in_flight_and_keeps_position() {
        let mut state = SessionState::fresh("s", now());
        begin_invocation(&mut state, now());
        begin_stage(&mut state, Stage::Scripts, now()).expect("begin");
        fail_stage(&mut state, Stage::Scripts, "exit 2", now());
        assert_eq!(state.status(Stage::Scripts), StageStatus::Failed);
        assert_eq!(state.pipeline_stage, PipelinePosition::None);
        assert!(state.in_flight.is_none());
        finish_invocation(&mut state, 1, now());
        assert!(!state.awaiting_terminal());
    }
}
