//! Deterministic collaborators for drills and tests.
//!
//! Each scripted collaborator replays queued responses and records the calls
//! it received. When a queue runs dry the collaborator reports success.

use std::collections::{BTreeMap, VecDeque};
use std::panic;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};

use crate::core::tiers::{ResourceSnapshot, Tier1Action, Tier2Action};
use crate::core::types::{HealthReport, Stage, StageOutcome};
use crate::io::probes::{ActionOutcome, CleanupRunner, HealthCheck, ResourceProbe};
use crate::io::stage_runner::{CommitSummary, GitOps, StageRunner};

/// Payload of a simulated process death. Unwinds without running the panic hook.
#[derive(Debug)]
pub struct SimulatedInterrupt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    Succeed(String),
    Fail(String),
    /// The runner itself errors (spawn failure, crash).
    Crash(String),
    /// The process dies while the stage is running.
    Interrupt,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn replay(step: Option<Scripted>, default_detail: &str) -> Result<StageOutcome> {
    match step {
        None => Ok(StageOutcome::success(default_detail)),
        Some(Scripted::Succeed(detail)) => Ok(StageOutcome::success(detail)),
        Some(Scripted::Fail(detail)) => Ok(StageOutcome::failure(detail)),
        Some(Scripted::Crash(reason)) => Err(anyhow!(reason)),
        Some(Scripted::Interrupt) => panic::resume_unwind(Box::new(SimulatedInterrupt)),
    }
}

#[derive(Debug, Default)]
pub struct ScriptedStageRunner {
    script: Mutex<BTreeMap<Stage, VecDeque<Scripted>>>,
    calls: Mutex<Vec<Stage>>,
}

impl ScriptedStageRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next response for `stage`.
    pub fn push(&self, stage: Stage, step: Scripted) -> &Self {
        lock(&self.script).entry(stage).or_default().push_back(step);
        self
    }

    pub fn calls(&self) -> Vec<Stage> {
        lock(&self.calls).clone()
    }
}

impl StageRunner for ScriptedStageRunner {
    fn run(&self, stage: Stage) -> Result<StageOutcome> {
        lock(&self.calls).push(stage);
        let step = lock(&self.script)
            .get_mut(&stage)
            .and_then(VecDeque::pop_front);
        replay(step, &format!("{stage} ok"))
    }
}

#[derive(Debug, Default)]
pub struct ScriptedGit {
    stage_all: Mutex<VecDeque<Scripted>>,
    commit: Mutex<VecDeque<Scripted>>,
    push: Mutex<VecDeque<Scripted>>,
    pending: Mutex<Vec<String>>,
    pushes: Mutex<u32>,
    commits: Mutex<Vec<String>>,
}

impl ScriptedGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stage_all(&self, step: Scripted) -> &Self {
        lock(&self.stage_all).push_back(step);
        self
    }

    pub fn push_commit(&self, step: Scripted) -> &Self {
        lock(&self.commit).push_back(step);
        self
    }

    pub fn push_push(&self, step: Scripted) -> &Self {
        lock(&self.push).push_back(step);
        self
    }

    pub fn set_pending(&self, pending: Vec<String>) {
        *lock(&self.pending) = pending;
    }

    pub fn push_attempts(&self) -> u32 {
        *lock(&self.pushes)
    }

    /// Commit messages received.
    pub fn commit_messages(&self) -> Vec<String> {
        lock(&self.commits).clone()
    }
}

impl GitOps for ScriptedGit {
    fn stage_all(&self) -> Result<StageOutcome> {
        replay(lock(&self.stage_all).pop_front(), "worktree staged")
    }

    fn commit(&self, message: &str) -> Result<StageOutcome> {
        lock(&self.commits).push(message.to_string());
        replay(lock(&self.commit).pop_front(), "committed 0000000c0ffee")
    }

    fn push(&self) -> Result<StageOutcome> {
        *lock(&self.pushes) += 1;
        replay(lock(&self.push).pop_front(), "pushed HEAD to origin")
    }

    fn pending_changes(&self) -> Result<Vec<String>> {
        Ok(lock(&self.pending).clone())
    }

    fn head_summary(&self) -> Result<Option<CommitSummary>> {
        Ok(Some(CommitSummary {
            sha: "0000000c0ffee".to_string(),
            files_changed: 1,
            insertions: 1,
            deletions: 0,
        }))
    }
}

/// Probe returning a fixed snapshot, or failing with a fixed message.
#[derive(Debug, Clone)]
pub struct ScriptedProbe {
    result: Result<ResourceSnapshot, String>,
}

impl ScriptedProbe {
    pub fn healthy() -> Self {
        Self::with(ResourceSnapshot {
            zombie_processes: Some(0),
            orphan_containers: Some(0),
            ..ResourceSnapshot::default()
        })
    }

    pub fn with(snapshot: ResourceSnapshot) -> Self {
        Self {
            result: Ok(snapshot),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
        }
    }
}

impl ResourceProbe for ScriptedProbe {
    fn scan(&self) -> Result<ResourceSnapshot> {
        self.result.clone().map_err(|msg| anyhow!(msg))
    }
}

/// Health check replaying a sequence of readings; the last reading repeats.
#[derive(Debug)]
pub struct ScriptedHealthCheck {
    name: String,
    readings: Mutex<VecDeque<bool>>,
    last: bool,
}

impl ScriptedHealthCheck {
    pub fn new(name: &str, readings: &[bool]) -> Self {
        Self {
            name: name.to_string(),
            readings: Mutex::new(readings.iter().copied().collect()),
            last: readings.last().copied().unwrap_or(true),
        }
    }
}

impl HealthCheck for ScriptedHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> Result<HealthReport> {
        let healthy = lock(&self.readings)
            .pop_front()
            .unwrap_or(self.last);
        if healthy {
            Ok(HealthReport::healthy("scripted healthy"))
        } else {
            Ok(HealthReport::unhealthy("scripted unhealthy"))
        }
    }
}

/// Cleanup runner that records actions instead of running them.
#[derive(Debug, Default)]
pub struct ScriptedCleanup {
    executed: Mutex<Vec<String>>,
}

impl ScriptedCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }
}

impl CleanupRunner for ScriptedCleanup {
    fn run_tier1(&self, action: Tier1Action) -> Result<ActionOutcome> {
        lock(&self.executed).push(action.to_string());
        Ok(ActionOutcome::executed(format!("{action} done")))
    }

    fn run_tier2(&self, action: &Tier2Action) -> Result<ActionOutcome> {
        lock(&self.executed).push(action.to_string());
        Ok(ActionOutcome::executed(format!("{action} done")))
    }
}
