//! Semantic invariants of a session state record not expressible via JSON Schema.

use crate::core::session::SessionState;
use crate::core::types::{PipelinePosition, Stage, StageStatus};

/// Check semantic invariants of a session state:
/// - every pipeline stage has a status
/// - a stage is completed only if all preceding stages are completed
/// - `pipeline_stage` matches the furthest completed stage
/// - the in-flight marker belongs to the latest invocation and names an unfinished stage
/// - the terminal invocation never runs ahead of the invocation counter
pub fn validate_invariants(state: &SessionState) -> Vec<String> {
    let mut errors = Vec::new();

    for stage in Stage::PIPELINE {
        if !state.stage_status.contains_key(&stage) {
            errors.push(format!("missing status for stage {stage}"));
        }
    }

    for stage in Stage::PIPELINE {
        if state.status(stage) != StageStatus::Completed {
            continue;
        }
        for prev in stage.predecessors() {
            if state.status(*prev) != StageStatus::Completed {
                errors.push(format!(
                    "stage {stage} is completed while {prev} is {}",
                    status_name(state.status(*prev))
                ));
            }
        }
    }

    let expected = furthest_completed(state);
    if state.pipeline_stage == PipelinePosition::GitStaged {
        if expected != PipelinePosition::Tests {
            errors.push(format!(
                "pipeline_stage git_staged requires tests as furthest completed stage (found {expected:?})"
            ));
        }
    } else if state.pipeline_stage != expected {
        errors.push(format!(
            "pipeline_stage {:?} does not match furthest completed stage {expected:?}",
            state.pipeline_stage
        ));
    }

    if let Some(marker) = &state.in_flight {
        if marker.invocation != state.invocations {
            errors.push(format!(
                "in_flight invocation {} is not the latest invocation {}",
                marker.invocation, state.invocations
            ));
        }
        if state.status(marker.stage) == StageStatus::Completed {
            errors.push(format!("in_flight stage {} is already completed", marker.stage));
        }
    }

    if let Some(terminal) = state.last_terminal_invocation
        && terminal > state.invocations
    {
        errors.push(format!(
            "last_terminal_invocation {terminal} exceeds invocations {}",
            state.invocations
        ));
    }

    errors
}

fn furthest_completed(state: &SessionState) -> PipelinePosition {
    Stage::PIPELINE
        .iter()
        .rev()
        .find(|stage| state.status(**stage) == StageStatus::Completed)
        .map_or(PipelinePosition::None, |stage| stage.completed_position())
}

fn status_name(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Pending => "pending",
        StageStatus::Completed => "completed",
        StageStatus::Failed => "failed",
        StageStatus::Interrupted => "interrupted",
    }
}
