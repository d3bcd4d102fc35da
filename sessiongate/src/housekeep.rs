//! Orchestration for one `gate housekeep` invocation (system-health domain).
//!
//! Tier-0 scan first, then the health precondition, tier-1 cleanup, approved
//! tier-2 actions and the post-cleanup health re-check. Exactly one HK artifact
//! is written per invocation. Session state is never read or written here.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, info_span, warn};

use crate::core::domain::{HousekeepingCommand, SystemHealthAction};
use crate::core::records::{
    ActionRecord, ActionStatus, ArtifactRef, HousekeepingArtifact, HousekeepingOutcome,
    HousekeepingResult, ServiceHealth, Tier2Record,
};
use crate::core::tiers::{ResourceSnapshot, Tier1Action, Tier2Plan, plan_tier2, propose_tier2};
use crate::io::artifact_store::{ArtifactStore, next_artifact_id};
use crate::io::config::HousekeepingConfig;
use crate::io::init::GatePaths;
use crate::io::probes::{ActionOutcome, CleanupRunner, HealthCheck, ResourceProbe, check_all};

#[derive(Debug, Clone)]
pub struct HousekeepReport {
    pub artifact: HousekeepingArtifact,
    pub reference: ArtifactRef,
}

impl HousekeepReport {
    pub fn outcome(&self) -> HousekeepingOutcome {
        self.artifact.result.outcome
    }
}

pub struct HousekeepingEngine<'a> {
    paths: GatePaths,
    config: HousekeepingConfig,
    probe: &'a dyn ResourceProbe,
    checks: Vec<&'a dyn HealthCheck>,
    cleanup: &'a dyn CleanupRunner,
}

impl<'a> HousekeepingEngine<'a> {
    pub fn new(
        paths: &GatePaths,
        config: &HousekeepingConfig,
        probe: &'a dyn ResourceProbe,
        checks: Vec<&'a dyn HealthCheck>,
        cleanup: &'a dyn CleanupRunner,
    ) -> Self {
        Self {
            paths: paths.clone(),
            config: config.clone(),
            probe,
            checks,
            cleanup,
        }
    }

    /// Run one invocation. The approval token, if any, is consumed here.
    pub fn run(&self, command: HousekeepingCommand) -> Result<HousekeepReport> {
        let HousekeepingCommand::Housekeep { approval } = command;
        let _span = info_span!("housekeep").entered();
        let store = ArtifactStore::new(self.paths.housekeeping_dir());
        let approved = approval
            .as_ref()
            .map(|token| token.actions().cloned().collect())
            .unwrap_or_default();

        let snapshot = match self.scan() {
            Ok(snapshot) => snapshot,
            Err(reason) => {
                warn!(reason = %reason, "resource scan aborted; no cleanup");
                let artifact = self.artifact(
                    None,
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                    Tier2Record {
                        approved,
                        ..Tier2Record::default()
                    },
                    HousekeepingResult {
                        services_protected: true,
                        success: false,
                        outcome: HousekeepingOutcome::ScanAborted,
                        reason: Some(reason),
                    },
                );
                return self.write(&store, artifact);
            }
        };

        let proposals = propose_tier2(&snapshot, &self.config.pressure_policy());
        let plan = plan_tier2(proposals, approval.as_ref());
        debug!(requested = ?plan.requested, to_execute = ?plan.to_execute, "tier-2 plan");

        let health_pre = self.health();
        let unhealthy: Vec<String> = health_pre
            .iter()
            .filter(|health| !health.healthy)
            .map(ServiceHealth::describe)
            .collect();
        if !unhealthy.is_empty() {
            let reason = format!(
                "protected service unhealthy before cleanup: {}",
                unhealthy.join("; ")
            );
            warn!(reason = %reason, "housekeeping precondition failed; no cleanup");
            let Tier2Plan {
                requested,
                approved,
                ..
            } = plan;
            let artifact = self.artifact(
                Some(snapshot),
                health_pre,
                Vec::new(),
                Vec::new(),
                Tier2Record {
                    skipped: requested.clone(),
                    requested,
                    approved,
                    executed: Vec::new(),
                },
                HousekeepingResult {
                    services_protected: true,
                    success: false,
                    outcome: HousekeepingOutcome::PreconditionFailed,
                    reason: Some(reason),
                },
            );
            return self.write(&store, artifact);
        }

        let tier1: Vec<ActionRecord> = Tier1Action::ALL
            .iter()
            .map(|action| run_action(action, || self.cleanup.run_tier1(*action)))
            .collect();
        let tier2_executed: Vec<ActionRecord> = plan
            .to_execute
            .iter()
            .map(|action| run_action(action, || self.cleanup.run_tier2(action)))
            .collect();
        for skipped in &plan.skipped {
            info!(action = %skipped, "tier-2 action proposed but not approved; skipped");
        }

        let health_post = self.health();
        let degraded: Vec<String> = health_pre
            .iter()
            .filter(|before| before.healthy)
            .filter_map(|before| {
                health_post
                    .iter()
                    .find(|after| after.name == before.name && !after.healthy)
            })
            .map(ServiceHealth::describe)
            .collect();

        let result = if degraded.is_empty() {
            let failed: Vec<&str> = tier1
                .iter()
                .chain(&tier2_executed)
                .filter(|record| record.status == ActionStatus::Failed)
                .map(|record| record.action.as_str())
                .collect();
            HousekeepingResult {
                services_protected: true,
                success: failed.is_empty(),
                outcome: HousekeepingOutcome::Completed,
                reason: (!failed.is_empty())
                    .then(|| format!("cleanup actions failed: {}", failed.join(", "))),
            }
        } else {
            let reason = format!("service degraded after cleanup: {}", degraded.join("; "));
            error!(reason = %reason, "incident: protected service degraded by housekeeping");
            HousekeepingResult {
                services_protected: false,
                success: false,
                outcome: HousekeepingOutcome::Degraded,
                reason: Some(reason),
            }
        };

        let artifact = self.artifact(
            Some(snapshot),
            health_pre,
            health_post,
            tier1,
            Tier2Record {
                requested: plan.requested,
                approved: plan.approved,
                executed: tier2_executed,
                skipped: plan.skipped,
            },
            result,
        );
        self.write(&store, artifact)
    }

    /// Tier-0 scan; an error or a scan over the timeout aborts the invocation.
    fn scan(&self) -> Result<ResourceSnapshot, String> {
        let timeout = Duration::from_secs(self.config.scan_timeout_secs);
        let started = Instant::now();
        let snapshot = self
            .probe
            .scan()
            .map_err(|err| format!("resource scan failed: {err:#}"))?;
        let elapsed = started.elapsed();
        if elapsed > timeout {
            return Err(format!(
                "resource scan took {}s, over the {}s timeout",
                elapsed.as_secs(),
                timeout.as_secs()
            ));
        }
        Ok(snapshot)
    }

    fn health(&self) -> Vec<ServiceHealth> {
        check_all(&self.checks)
            .into_iter()
            .map(|(name, report)| ServiceHealth::from_report(&name, report))
            .collect()
    }

    fn artifact(
        &self,
        snapshot: Option<ResourceSnapshot>,
        health_pre: Vec<ServiceHealth>,
        health_post: Vec<ServiceHealth>,
        tier1: Vec<ActionRecord>,
        tier2: Tier2Record,
        result: HousekeepingResult,
    ) -> HousekeepingArtifact {
        HousekeepingArtifact {
            id: next_artifact_id("hk"),
            timestamp: Utc::now(),
            snapshot,
            health_pre,
            health_post,
            tier1,
            tier2,
            result,
        }
    }

    fn write(&self, store: &ArtifactStore, artifact: HousekeepingArtifact) -> Result<HousekeepReport> {
        let reference = store
            .append(artifact.timestamp, &artifact.id, &artifact)
            .context("write housekeeping artifact")?;
        info!(
            outcome = artifact.result.outcome.as_str(),
            success = artifact.result.success,
            key = %reference.key,
            "housekeeping finished"
        );
        Ok(HousekeepReport {
            artifact,
            reference,
        })
    }
}

/// Run one system-health action; collaborator errors are recorded as failures.
fn run_action<A: SystemHealthAction>(
    action: &A,
    run: impl FnOnce() -> Result<ActionOutcome>,
) -> ActionRecord {
    let _span = info_span!("cleanup", action = %action, tier = action.tier()).entered();
    let outcome = run().unwrap_or_else(|err| {
        warn!(key = action.command_key(), err = %format!("{err:#}"), "cleanup action errored");
        ActionOutcome::failed(format!("{err:#}"))
    });
    ActionRecord {
        action: action.to_string(),
        tier: action.tier(),
        status: outcome.status,
        detail: outcome.detail,
    }
}
