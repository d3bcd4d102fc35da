//! Session state record: the single source of truth for pipeline position.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{PipelinePosition, Stage, StageStatus};

/// Persisted pipeline position for one session (`.gate/sessions/<id>/state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    /// Compare-and-swap version. `0` means the record has never been written.
    pub version: u64,
    pub pipeline_stage: PipelinePosition,
    pub stage_status: BTreeMap<Stage, StageStatus>,
    /// Last detail reported by each stage runner.
    #[serde(default)]
    pub stage_detail: BTreeMap<Stage, String>,
    pub git_dirty: bool,
    /// Number of reconciliation invocations that have begun for this session.
    pub invocations: u64,
    /// Invocation number of the most recent terminal SR artifact.
    pub last_terminal_invocation: Option<u64>,
    /// Stage currently being executed. Left set if the process dies mid-stage.
    pub in_flight: Option<InFlight>,
    /// Pin key of the previous session recovered when this state was created.
    pub previous_pin: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub invocation: u64,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
}

impl SessionState {
    /// State of a session that has never been reconciled.
    pub fn fresh(session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            version: 0,
            pipeline_stage: PipelinePosition::None,
            stage_status: Stage::PIPELINE
                .iter()
                .map(|stage| (*stage, StageStatus::Pending))
                .collect(),
            stage_detail: BTreeMap::new(),
            git_dirty: false,
            invocations: 0,
            last_terminal_invocation: None,
            in_flight: None,
            previous_pin: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.stage_status.get(&stage).copied().unwrap_or_default()
    }

    /// First stage in pipeline order that is not completed.
    pub fn first_incomplete(&self) -> Option<Stage> {
        Stage::PIPELINE
            .iter()
            .copied()
            .find(|stage| self.status(*stage) != StageStatus::Completed)
    }

    /// True while the latest invocation has not produced a terminal artifact.
    pub fn awaiting_terminal(&self) -> bool {
        if self.in_flight.is_some() {
            return true;
        }
        self.invocations > 0 && self.last_terminal_invocation != Some(self.invocations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_starts_at_scripts() {
        let state = SessionState::fresh("s-1", Utc::now());
        assert_eq!(state.version, 0);
        assert_eq!(state.first_incomplete(), Some(Stage::Scripts));
        assert!(!state.awaiting_terminal());
        assert_eq!(state.stage_status.len(), Stage::PIPELINE.len());
    }

    #[test]
    fn awaiting_terminal_tracks_latest_invocation() {
        let mut state = SessionState::fresh("s-1", Utc::now());
        state.invocations = 2;
        state.last_terminal_invocation = Some(1);
        assert!(state.awaiting_terminal());
        state.last_terminal_invocation = Some(2);
        assert!(!state.awaiting_terminal());
    }
}
