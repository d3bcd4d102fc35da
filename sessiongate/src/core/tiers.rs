//! Housekeeping risk tiers, resource snapshots and tier-2 approval planning.
//!
//! Tier-0 is the read-only scan that produces a [`ResourceSnapshot`]. Tier-1
//! actions run automatically; tier-2 actions are proposed from the snapshot and
//! only run when an [`ApprovalToken`] names them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier1Action {
    StaleTempFiles,
    DanglingImages,
    BuildCache,
    StoppedContainers,
}

impl Tier1Action {
    /// Execution order for tier-1 cleanup.
    pub const ALL: [Tier1Action; 4] = [
        Tier1Action::StaleTempFiles,
        Tier1Action::DanglingImages,
        Tier1Action::BuildCache,
        Tier1Action::StoppedContainers,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier1Action::StaleTempFiles => "stale_temp_files",
            Tier1Action::DanglingImages => "dangling_images",
            Tier1Action::BuildCache => "build_cache",
            Tier1Action::StoppedContainers => "stopped_containers",
        }
    }
}

impl fmt::Display for Tier1Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Tier2Action {
    PruneVolumes,
    RestartService { service: String },
}

impl fmt::Display for Tier2Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier2Action::PruneVolumes => f.write_str("prune_volumes"),
            Tier2Action::RestartService { service } => write!(f, "restart_service:{service}"),
        }
    }
}

impl FromStr for Tier2Action {
    type Err = String;

    /// Parse `prune_volumes` or `restart_service:<name>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "prune_volumes" {
            return Ok(Tier2Action::PruneVolumes);
        }
        if let Some(service) = s.strip_prefix("restart_service:") {
            let service = service.trim();
            if service.is_empty() {
                return Err("restart_service requires a service name".to_string());
            }
            return Ok(Tier2Action::RestartService {
                service: service.to_string(),
            });
        }
        Err(format!(
            "unknown tier-2 action '{s}' (expected prune_volumes or restart_service:<name>)"
        ))
    }
}

/// Capability to run the listed tier-2 actions during exactly one invocation.
///
/// The token is consumed by the housekeeping invocation it is passed to and
/// cannot be cloned, so an approval never outlives that invocation.
#[derive(Debug, PartialEq, Eq)]
pub struct ApprovalToken {
    actions: BTreeSet<Tier2Action>,
}

impl ApprovalToken {
    pub fn grant(actions: impl IntoIterator<Item = Tier2Action>) -> Self {
        Self {
            actions: actions.into_iter().collect(),
        }
    }

    pub fn covers(&self, action: &Tier2Action) -> bool {
        self.actions.contains(action)
    }

    pub fn actions(&self) -> impl Iterator<Item = &Tier2Action> {
        self.actions.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub mount_point: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskUsage {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        used as f64 * 100.0 / self.total_bytes as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl MemoryUsage {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Tier-0 scan results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub disk: Option<DiskUsage>,
    pub memory: Option<MemoryUsage>,
    pub zombie_processes: Option<u32>,
    pub orphan_containers: Option<u32>,
}

/// Thresholds that turn a snapshot into tier-2 proposals.
#[derive(Debug, Clone, PartialEq)]
pub struct PressurePolicy {
    pub disk_pressure_percent: f64,
    pub memory_pressure_percent: f64,
    pub restart_candidates: Vec<String>,
}

/// Tier-2 actions warranted by the snapshot, in deterministic order.
pub fn propose_tier2(snapshot: &ResourceSnapshot, policy: &PressurePolicy) -> Vec<Tier2Action> {
    let mut proposals = BTreeSet::new();
    if snapshot
        .disk
        .as_ref()
        .is_some_and(|disk| disk.used_percent() >= policy.disk_pressure_percent)
    {
        proposals.insert(Tier2Action::PruneVolumes);
    }
    if snapshot
        .memory
        .as_ref()
        .is_some_and(|memory| memory.used_percent() >= policy.memory_pressure_percent)
    {
        for service in &policy.restart_candidates {
            proposals.insert(Tier2Action::RestartService {
                service: service.clone(),
            });
        }
    }
    proposals.into_iter().collect()
}

/// Split proposals into approved (to execute) and skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier2Plan {
    pub requested: Vec<Tier2Action>,
    /// Every action named by the token, proposed or not.
    pub approved: Vec<Tier2Action>,
    pub to_execute: Vec<Tier2Action>,
    pub skipped: Vec<Tier2Action>,
}

/// Only actions that were both proposed and approved are executed.
pub fn plan_tier2(proposed: Vec<Tier2Action>, token: Option<&ApprovalToken>) -> Tier2Plan {
    let approved: Vec<Tier2Action> = token
        .map(|token| token.actions().cloned().collect())
        .unwrap_or_default();
    let (to_execute, skipped): (Vec<_>, Vec<_>) = proposed
        .iter()
        .cloned()
        .partition(|action| token.is_some_and(|token| token.covers(action)));
    Tier2Plan {
        requested: proposed,
        approved,
        to_execute,
        skipped,
    }
}
