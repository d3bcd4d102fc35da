//! Orchestration for one `gate reconcile` invocation (work-state domain).
//!
//! Drives `scripts → container → deploy → tests → git_commit → git_push` in
//! order, persisting every transition through compare-and-swap, and ends with
//! exactly one SR artifact. A fully reconciled session also gets a pin.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn};

use crate::core::domain::{SessionId, WorkCommand, WorkStateAction};
use crate::core::records::{
    ArtifactRef, NextSessionContext, ReconciliationArtifact, SessionPin, StageRecord, WorkSummary,
};
use crate::core::session::SessionState;
use crate::core::state_update::{
    begin_invocation, begin_stage, complete_stage, fail_stage, finish_invocation, mark_staged,
};
use crate::core::types::{ReconcileVerdict, Stage, StageOutcome};
use crate::error::GateError;
use crate::io::artifact_store::{ArtifactStore, next_artifact_id};
use crate::io::init::GatePaths;
use crate::io::pin::{PinStore, parse_tests_passed};
use crate::io::stage_runner::{GitOps, StageRunner};
use crate::io::state_store::SessionStateStore;

/// Result of a reconciliation invocation that reached a verdict.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub session_id: SessionId,
    pub artifact: ReconciliationArtifact,
    pub reference: ArtifactRef,
    pub pin: Option<ArtifactRef>,
    /// Stage found in flight from an earlier invocation that never finished.
    pub interrupted: Option<Stage>,
}

impl ReconcileReport {
    pub fn verdict(&self) -> ReconcileVerdict {
        self.artifact.verdict
    }
}

/// The only component that holds the mutating [`SessionStateStore`].
pub struct ReconciliationEngine<'a> {
    paths: GatePaths,
    store: SessionStateStore,
    runner: &'a dyn StageRunner,
    git: &'a dyn GitOps,
    commit_message: String,
}

/// Where an invocation stopped.
enum Halt {
    Done,
    Failed { stage: Stage, detail: String },
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(
        paths: &GatePaths,
        store: SessionStateStore,
        runner: &'a dyn StageRunner,
        git: &'a dyn GitOps,
        commit_message: &str,
    ) -> Self {
        Self {
            paths: paths.clone(),
            store,
            runner,
            git,
            commit_message: commit_message.to_string(),
        }
    }

    pub fn run(&self, command: WorkCommand) -> Result<ReconcileReport> {
        let WorkCommand::Reconcile { session_id } = command;
        let _span = info_span!("reconcile", session_id = %session_id).entered();
        let sr_store = ArtifactStore::new(self.paths.reconciliation_dir(&session_id));
        // Refused before any work: no invocation number, no SR.
        let _lease = self.store.lease(&session_id)?;
        let mut run = Invocation {
            session_id: session_id.clone(),
            state: None,
            invocation: 0,
            owned: false,
            resumed_from: None,
            executed: Vec::new(),
        };
        match self.drive(&mut run) {
            Ok((halt, interrupted)) => {
                let (verdict, blocking_reason) = match halt {
                    Halt::Done => (ReconcileVerdict::ReconciledExitReady, None),
                    Halt::Failed { stage, detail } => (
                        ReconcileVerdict::for_halt(stage),
                        Some(format!("stage {stage} failed: {detail}")),
                    ),
                };
                let now = Utc::now();
                let artifact = run.artifact(verdict, blocking_reason, false, now);
                let reference = sr_store
                    .append(now, &artifact.id, &artifact)
                    .context("write reconciliation artifact")?;
                info!(verdict = %verdict, invocation = run.invocation, "reconciliation finished");

                let pin = if verdict == ReconcileVerdict::ReconciledExitReady {
                    self.write_pin_once(&run, &sr_store, &reference, now)?
                } else {
                    None
                };
                Ok(ReconcileReport {
                    session_id,
                    artifact,
                    reference,
                    pin,
                    interrupted,
                })
            }
            Err(err) if !run.owned => {
                warn!(err = %format!("{err:#}"), "invocation never began; no SR written");
                Err(err)
            }
            Err(err) => {
                let now = Utc::now();
                let artifact = run.artifact(
                    ReconcileVerdict::ReconciliationBlocked,
                    Some(format!("invocation aborted: {err:#}")),
                    true,
                    now,
                );
                match sr_store.append(now, &artifact.id, &artifact) {
                    Ok(reference) => {
                        warn!(key = %reference.key, err = %format!("{err:#}"), "reconciliation aborted");
                    }
                    Err(write_err) => {
                        warn!(err = %format!("{write_err:#}"), "failed to write abort artifact");
                    }
                }
                Err(err)
            }
        }
    }

    fn drive(&self, run: &mut Invocation) -> Result<(Halt, Option<Stage>)> {
        let now = Utc::now();
        let mut state = match self.store.load(&run.session_id)? {
            Some(state) => state,
            None => self.fresh_state(&run.session_id, now)?,
        };
        let start = begin_invocation(&mut state, now);
        run.invocation = start.invocation;
        let interrupted = start.interrupted.as_ref().map(|marker| {
            warn!(
                stage = %marker.stage,
                invocation = marker.invocation,
                "previous invocation was interrupted; resuming"
            );
            marker.stage
        });
        let mut state = self.persist(run, state)?;
        run.owned = true;
        run.resumed_from = state.first_incomplete();
        debug!(resumed_from = ?run.resumed_from, "pipeline position loaded");

        while let Some(stage) = state.first_incomplete() {
            begin_stage(&mut state, stage, Utc::now()).map_err(|err| anyhow!(err))?;
            state = self.persist(run, state)?;
            run.executed.push(stage);

            let outcome = match self.execute(stage, &mut state, run) {
                Ok(outcome) => outcome,
                Err(err) => {
                    let reason = format!("{err:#}");
                    fail_stage(&mut state, stage, &format!("runner crashed: {reason}"), Utc::now());
                    finish_invocation(&mut state, run.invocation, Utc::now());
                    self.persist(run, state)?;
                    return Err(GateError::StageCrashed { stage, reason }.into());
                }
            };

            if !outcome.succeeded() {
                warn!(stage = %stage, detail = %outcome.detail, "stage failed, halting pipeline");
                fail_stage(&mut state, stage, &outcome.detail, Utc::now());
                finish_invocation(&mut state, run.invocation, Utc::now());
                self.persist(run, state)?;
                return Ok((
                    Halt::Failed {
                        stage,
                        detail: outcome.detail,
                    },
                    interrupted,
                ));
            }
            complete_stage(&mut state, stage, &outcome.detail, Utc::now())
                .map_err(|err| anyhow!(err))?;
            if matches!(stage, Stage::GitCommit | Stage::GitPush) {
                state.git_dirty = self.worktree_dirty(state.git_dirty);
            }
            state = self.persist(run, state)?;
        }

        finish_invocation(&mut state, run.invocation, Utc::now());
        self.persist(run, state)?;
        Ok((Halt::Done, interrupted))
    }

    fn fresh_state(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<SessionState> {
        let mut state = SessionState::fresh(session_id.as_str(), now);
        let pins = PinStore::new(ArtifactStore::new(&self.paths.pins_dir));
        if let Some(previous) = pins.latest_other_than(session_id.as_str())? {
            let context = &previous.record.next_session_context;
            info!(
                previous_session = %previous.record.session_id,
                pending_work = ?context.pending_work,
                blockers = ?context.blockers,
                "recovered context from previous session pin"
            );
            state.previous_pin = Some(previous.reference.key);
        }
        Ok(state)
    }

    /// Invoke the collaborator for one work-state action.
    fn execute<A>(
        &self,
        action: A,
        state: &mut SessionState,
        run: &mut Invocation,
    ) -> Result<StageOutcome>
    where
        A: WorkStateAction + Copy + Into<Stage>,
    {
        let _span = info_span!("stage", stage = %action).entered();
        let stage: Stage = action.into();
        match stage {
            Stage::Scripts | Stage::Container | Stage::Deploy | Stage::Tests => {
                self.runner.run(stage)
            }
            Stage::GitCommit => {
                let staged = self.git.stage_all()?;
                if !staged.succeeded() {
                    return Ok(staged);
                }
                mark_staged(state, Utc::now()).map_err(|err| anyhow!(err))?;
                let persisted = self.persist(run, state.clone())?;
                *state = persisted;
                let message = self
                    .commit_message
                    .replace("{session_id}", run.session_id.as_str());
                self.git.commit(&message)
            }
            Stage::GitPush => {
                let first = self.git.push()?;
                if first.succeeded() {
                    return Ok(first);
                }
                warn!(detail = %first.detail, "git push failed, retrying once");
                let second = self.git.push()?;
                if second.succeeded() {
                    return Ok(second);
                }
                Ok(StageOutcome::failure(format!(
                    "push failed after retry: {}",
                    second.detail
                )))
            }
        }
    }

    fn persist(&self, run: &mut Invocation, state: SessionState) -> Result<SessionState> {
        let expected = state.version;
        let stored = self
            .store
            .compare_and_swap(expected, &state)
            .context("persist session state")?;
        run.state = Some(stored.clone());
        Ok(stored)
    }

    fn worktree_dirty(&self, previous: bool) -> bool {
        match self.git.pending_changes() {
            Ok(changes) => !changes.is_empty(),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not refresh worktree status");
                previous
            }
        }
    }

    fn write_pin_once(
        &self,
        run: &Invocation,
        sr_store: &ArtifactStore,
        reference: &ArtifactRef,
        now: DateTime<Utc>,
    ) -> Result<Option<ArtifactRef>> {
        let pins = PinStore::new(ArtifactStore::new(&self.paths.pins_dir));
        if pins.exists_for(run.session_id.as_str())? {
            debug!("session already pinned");
            return Ok(None);
        }
        let Some(state) = run.state.as_ref() else {
            return Ok(None);
        };
        let pin = SessionPin {
            id: next_artifact_id("pin"),
            session_id: run.session_id.to_string(),
            started_at: state.created_at,
            ended_at: now,
            reconciliation: reference.clone(),
            work_summary: self.work_summary(state),
            next_session_context: NextSessionContext {
                pending_work: self.git.pending_changes().unwrap_or_else(|err| {
                    warn!(err = %format!("{err:#}"), "could not list pending changes for pin");
                    Vec::new()
                }),
                blockers: earlier_blockers(sr_store, run.invocation)?,
            },
        };
        pins.write(&pin).map(Some)
    }

    fn work_summary(&self, state: &SessionState) -> WorkSummary {
        let tests_detail = state
            .stage_detail
            .get(&Stage::Tests)
            .cloned()
            .unwrap_or_default();
        let mut summary = WorkSummary {
            tests_passed: parse_tests_passed(&tests_detail),
            tests_detail,
            ..WorkSummary::default()
        };
        let committed = state
            .stage_detail
            .get(&Stage::GitCommit)
            .is_some_and(|detail| detail.starts_with("committed"));
        if !committed {
            return summary;
        }
        match self.git.head_summary() {
            Ok(Some(head)) => {
                summary.commits.push(head.sha);
                summary.files_changed = head.files_changed;
                summary.insertions = head.insertions;
                summary.deletions = head.deletions;
            }
            Ok(None) => {}
            Err(err) => warn!(err = %format!("{err:#}"), "could not summarize head commit"),
        }
        summary
    }
}

/// Blocking reasons of this session's earlier invocations, oldest first.
fn earlier_blockers(sr_store: &ArtifactStore, invocation: u64) -> Result<Vec<String>> {
    Ok(sr_store
        .all::<ReconciliationArtifact>()?
        .into_iter()
        .filter(|stored| stored.record.invocation < invocation)
        .filter_map(|stored| {
            stored
                .record
                .blocking_reason
                .map(|reason| format!("invocation {}: {reason}", stored.record.invocation))
        })
        .collect())
}

/// Bookkeeping for the SR artifact, kept current as the invocation proceeds.
struct Invocation {
    session_id: SessionId,
    state: Option<SessionState>,
    invocation: u64,
    /// Set once the begin-invocation write has landed.
    owned: bool,
    resumed_from: Option<Stage>,
    executed: Vec<Stage>,
}

impl Invocation {
    fn artifact(
        &self,
        verdict: ReconcileVerdict,
        blocking_reason: Option<String>,
        aborted: bool,
        now: DateTime<Utc>,
    ) -> ReconciliationArtifact {
        let stages = match &self.state {
            Some(state) => Stage::PIPELINE
                .iter()
                .map(|stage| {
                    (
                        *stage,
                        StageRecord {
                            status: state.status(*stage),
                            detail: state.stage_detail.get(stage).cloned().unwrap_or_default(),
                        },
                    )
                })
                .collect(),
            None => Default::default(),
        };
        ReconciliationArtifact {
            id: next_artifact_id("sr"),
            session_id: self.session_id.to_string(),
            timestamp: now,
            invocation: self.invocation,
            state_version: self.state.as_ref().map_or(0, |state| state.version),
            resumed_from: self.resumed_from,
            executed: self.executed.clone(),
            stages,
            verdict,
            exit_ready: verdict == ReconcileVerdict::ReconciledExitReady,
            blocking_reason,
            aborted,
        }
    }
}
