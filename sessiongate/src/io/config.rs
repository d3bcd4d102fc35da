//! Gate configuration stored under `.gate/config.toml`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::freshness::DEFAULT_MAX_AGE_HOURS;
use crate::core::scenario::ScenarioId;
use crate::core::tiers::{PressurePolicy, Tier1Action, Tier2Action};
use crate::core::types::Stage;

/// Upper bound for hour-valued settings (ten years).
pub const MAX_HOURS: u64 = 24 * 365 * 10;
/// Upper bound for `lock_stale_secs` (one week).
pub const MAX_LOCK_STALE_SECS: u64 = 7 * 24 * 3600;

/// Gate configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    /// Maximum age of the latest housekeeping artifact accepted by `exit`.
    pub hk_max_age_hours: u64,

    /// Age after which an abandoned session state lock may be broken.
    pub lock_stale_secs: u64,

    pub stages: StagesConfig,
    pub git: GitConfig,
    pub housekeeping: HousekeepingConfig,
    pub services: Vec<ServiceConfig>,
    pub scenarios: ScenariosConfig,
}

/// Commands for the externally-run pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StagesConfig {
    pub scripts: Vec<String>,
    pub container: Vec<String>,
    pub deploy: Vec<String>,
    pub tests: Vec<String>,
    /// Per-stage wall-clock budget. A stage exceeding it fails.
    pub timeout_secs: u64,
    /// Truncate captured stage stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub remote: String,
    /// Commit message template; `{session_id}` is substituted.
    pub commit_message: String,
    /// Bound on each `git add`, `git commit` and `git push`.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HousekeepingConfig {
    /// Any tier-0 scan exceeding this aborts the invocation before cleanup.
    pub scan_timeout_secs: u64,
    pub action_timeout_secs: u64,
    pub disk_pressure_percent: f64,
    pub memory_pressure_percent: f64,
    /// Services proposed for a tier-2 restart under memory pressure.
    pub restart_candidates: Vec<String>,
    /// Scratch directories (relative to the workspace root) swept for stale files.
    pub scratch_dirs: Vec<PathBuf>,
    pub stale_temp_hours: u64,
    /// Command printing one line per orphaned container.
    pub orphan_container_scan: Vec<String>,
    pub actions: ActionCommands,
}

/// Commands for container-level cleanup actions. Empty means "not configured".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ActionCommands {
    pub dangling_images: Vec<String>,
    pub build_cache: Vec<String>,
    pub stopped_containers: Vec<String>,
    pub prune_volumes: Vec<String>,
    /// `{service}` is substituted with the service name.
    pub restart_service: Vec<String>,
}

/// A protected service and the command that checks its health (exit 0 = healthy).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    pub check: Vec<String>,
    #[serde(default = "default_check_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScenariosConfig {
    /// Scenarios that need a PASSED run before concurrent dispatch is allowed.
    pub required: Vec<ScenarioId>,
}

fn default_check_timeout_secs() -> u64 {
    10
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| (*part).to_string()).collect()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            hk_max_age_hours: DEFAULT_MAX_AGE_HOURS,
            lock_stale_secs: 30,
            stages: StagesConfig::default(),
            git: GitConfig::default(),
            housekeeping: HousekeepingConfig::default(),
            services: Vec::new(),
            scenarios: ScenariosConfig::default(),
        }
    }
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            scripts: argv(&["just", "build"]),
            container: argv(&["just", "container"]),
            deploy: argv(&["just", "deploy"]),
            tests: argv(&["just", "test"]),
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            commit_message: "chore(session): reconcile {session_id}".to_string(),
            timeout_secs: 5 * 60,
        }
    }
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 60,
            action_timeout_secs: 10 * 60,
            disk_pressure_percent: 85.0,
            memory_pressure_percent: 90.0,
            restart_candidates: Vec::new(),
            scratch_dirs: vec![PathBuf::from(".gate/tmp")],
            stale_temp_hours: 24,
            orphan_container_scan: argv(&["docker", "ps", "-aq", "--filter", "status=exited"]),
            actions: ActionCommands::default(),
        }
    }
}

impl Default for ActionCommands {
    fn default() -> Self {
        Self {
            dangling_images: argv(&["docker", "image", "prune", "-f"]),
            build_cache: argv(&["docker", "builder", "prune", "-f"]),
            stopped_containers: argv(&["docker", "container", "prune", "-f"]),
            prune_volumes: argv(&["docker", "volume", "prune", "-f"]),
            restart_service: argv(&["docker", "restart", "{service}"]),
        }
    }
}

impl Default for ScenariosConfig {
    fn default() -> Self {
        Self {
            required: ScenarioId::ALL.to_vec(),
        }
    }
}

impl StagesConfig {
    /// Command for an externally-run stage. Git stages are driven by the git adapter.
    pub fn command(&self, stage: Stage) -> Option<&[String]> {
        match stage {
            Stage::Scripts => Some(&self.scripts),
            Stage::Container => Some(&self.container),
            Stage::Deploy => Some(&self.deploy),
            Stage::Tests => Some(&self.tests),
            Stage::GitCommit | Stage::GitPush => None,
        }
    }
}

impl ActionCommands {
    /// Command for a tier-1 action; `None` for actions run natively or not configured.
    pub fn tier1(&self, action: Tier1Action) -> Option<Vec<String>> {
        let cmd = match action {
            Tier1Action::StaleTempFiles => return None,
            Tier1Action::DanglingImages => &self.dangling_images,
            Tier1Action::BuildCache => &self.build_cache,
            Tier1Action::StoppedContainers => &self.stopped_containers,
        };
        non_empty(cmd.clone())
    }

    pub fn tier2(&self, action: &Tier2Action) -> Option<Vec<String>> {
        match action {
            Tier2Action::PruneVolumes => non_empty(self.prune_volumes.clone()),
            Tier2Action::RestartService { service } => non_empty(
                self.restart_service
                    .iter()
                    .map(|part| part.replace("{service}", service))
                    .collect(),
            ),
        }
    }
}

fn non_empty(cmd: Vec<String>) -> Option<Vec<String>> {
    if cmd.is_empty() || cmd[0].trim().is_empty() {
        None
    } else {
        Some(cmd)
    }
}

impl HousekeepingConfig {
    pub fn pressure_policy(&self) -> PressurePolicy {
        PressurePolicy {
            disk_pressure_percent: self.disk_pressure_percent,
            memory_pressure_percent: self.memory_pressure_percent,
            restart_candidates: self.restart_candidates.clone(),
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_HOURS).contains(&self.hk_max_age_hours) {
            return Err(anyhow!("hk_max_age_hours must be in 1..={MAX_HOURS}"));
        }
        if !(1..=MAX_LOCK_STALE_SECS).contains(&self.lock_stale_secs) {
            return Err(anyhow!("lock_stale_secs must be in 1..={MAX_LOCK_STALE_SECS}"));
        }
        if self.stages.timeout_secs == 0 {
            return Err(anyhow!("stages.timeout_secs must be > 0"));
        }
        if self.stages.output_limit_bytes == 0 {
            return Err(anyhow!("stages.output_limit_bytes must be > 0"));
        }
        for stage in Stage::PIPELINE {
            if let Some(cmd) = self.stages.command(stage)
                && (cmd.is_empty() || cmd[0].trim().is_empty())
            {
                return Err(anyhow!("stages.{stage} must be a non-empty array"));
            }
        }
        if self.git.remote.trim().is_empty() {
            return Err(anyhow!("git.remote must not be empty"));
        }
        if self.git.timeout_secs == 0 {
            return Err(anyhow!("git.timeout_secs must be > 0"));
        }
        let hk = &self.housekeeping;
        if hk.scan_timeout_secs == 0 || hk.action_timeout_secs == 0 {
            return Err(anyhow!(
                "housekeeping.scan_timeout_secs and action_timeout_secs must be > 0"
            ));
        }
        if hk.stale_temp_hours > MAX_HOURS {
            return Err(anyhow!("housekeeping.stale_temp_hours must be at most {MAX_HOURS}"));
        }
        for (name, value) in [
            ("disk_pressure_percent", hk.disk_pressure_percent),
            ("memory_pressure_percent", hk.memory_pressure_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(anyhow!("housekeeping.{name} must be in (0, 100]"));
            }
        }
        for dir in &hk.scratch_dirs {
            if dir.is_absolute() || dir.components().any(|c| c.as_os_str() == "..") {
                return Err(anyhow!(
                    "housekeeping.scratch_dirs must be relative paths inside the workspace (got {})",
                    dir.display()
                ));
            }
        }
        let mut names = BTreeSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(anyhow!("services.name must not be empty"));
            }
            if !names.insert(service.name.as_str()) {
                return Err(anyhow!("duplicate service '{}'", service.name));
            }
            if service.check.is_empty() || service.check[0].trim().is_empty() {
                return Err(anyhow!(
                    "services.{}.check must be a non-empty array",
                    service.name
                ));
            }
            if service.timeout_secs == 0 {
                return Err(anyhow!("services.{}.timeout_secs must be > 0", service.name));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `GateConfig::default()`.
pub fn load_config(path: &Path) -> Result<GateConfig> {
    if !path.exists() {
        let cfg = GateConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: GateConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &GateConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, GateConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = GateConfig::default();
        cfg.services.push(ServiceConfig {
            name: "api".to_string(),
            check: vec!["curl".to_string(), "-sf".to_string()],
            timeout_secs: 5,
        });
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "hk_max_age_hours = 12\n\n[[services]]\nname = \"db\"\ncheck = [\"pg_isready\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.hk_max_age_hours, 12);
        assert_eq!(cfg.services[0].timeout_secs, 10);
        assert_eq!(cfg.stages, StagesConfig::default());
        assert_eq!(cfg.scenarios.required, ScenarioId::ALL.to_vec());
    }

    #[test]
    fn rejects_duplicate_services_and_escaping_scratch_dirs() {
        let mut cfg = GateConfig::default();
        let service = ServiceConfig {
            name: "db".to_string(),
            check: vec!["true".to_string()],
            timeout_secs: 1,
        };
        cfg.services = vec![service.clone(), service];
        assert!(cfg.validate().is_err());

        let mut cfg = GateConfig::default();
        cfg.housekeeping.scratch_dirs = vec![PathBuf::from("../outside")];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_durations() {
        let mut cfg = GateConfig::default();
        cfg.hk_max_age_hours = 3_000_000_000_000;
        assert!(cfg.validate().is_err());

        let mut cfg = GateConfig::default();
        cfg.lock_stale_secs = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = GateConfig::default();
        cfg.housekeeping.stale_temp_hours = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = GateConfig::default();
        cfg.hk_max_age_hours = MAX_HOURS;
        cfg.validate().expect("upper bound is accepted");
    }

    #[test]
    fn restart_command_substitutes_service() {
        let actions = ActionCommands::default();
        let cmd = actions
            .tier2(&Tier2Action::RestartService {
                service: "worker".to_string(),
            })
            .expect("command");
        assert_eq!(cmd, vec!["docker", "restart", "worker"]);
        assert!(actions.tier1(Tier1Action::StaleTempFiles).is_none());
    }
}
