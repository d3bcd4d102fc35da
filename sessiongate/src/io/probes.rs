//! Housekeeping collaborators: resource scans, protected-service health checks
//! and cleanup execution.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use sysinfo::{Disks, ProcessStatus, System};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::core::records::ActionStatus;
use crate::core::tiers::{DiskUsage, MemoryUsage, ResourceSnapshot, Tier1Action, Tier2Action};
use crate::core::types::HealthReport;
use crate::io::config::{HousekeepingConfig, ServiceConfig};
use crate::io::process::{command_from_argv, run_command_with_timeout};

const PROBE_OUTPUT_LIMIT: usize = 64 * 1024;

/// Tier-0 read-only scan.
pub trait ResourceProbe {
    fn scan(&self) -> Result<ResourceSnapshot>;
}

pub trait HealthCheck {
    fn name(&self) -> &str;
    fn check(&self) -> Result<HealthReport>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub status: ActionStatus,
    pub detail: String,
}

impl ActionOutcome {
    pub fn executed(detail: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Executed,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failed,
            detail: detail.into(),
        }
    }

    pub fn skipped(detail: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Skipped,
            detail: detail.into(),
        }
    }
}

/// Executes tier-1 and tier-2 cleanup actions.
pub trait CleanupRunner {
    fn run_tier1(&self, action: Tier1Action) -> Result<ActionOutcome>;
    fn run_tier2(&self, action: &Tier2Action) -> Result<ActionOutcome>;
}

/// Scans the host with `sysinfo` plus the configured orphan-container command.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    root: PathBuf,
    orphan_container_scan: Vec<String>,
    timeout: Duration,
}

impl SystemProbe {
    pub fn new(root: impl Into<PathBuf>, config: &HousekeepingConfig) -> Self {
        Self {
            root: root.into(),
            orphan_container_scan: config.orphan_container_scan.clone(),
            timeout: Duration::from_secs(config.scan_timeout_secs),
        }
    }

    fn disk_usage(&self) -> Option<DiskUsage> {
        let root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| root.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| DiskUsage {
                mount_point: disk.mount_point().display().to_string(),
                total_bytes: disk.total_space(),
                available_bytes: disk.available_space(),
            })
    }

    fn orphan_containers(&self) -> Result<Option<u32>> {
        if self.orphan_container_scan.is_empty() {
            return Ok(None);
        }
        let cmd = command_from_argv(&self.orphan_container_scan, &self.root)?;
        let out = match run_command_with_timeout(cmd, self.timeout, PROBE_OUTPUT_LIMIT) {
            Ok(out) => out,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "orphan container scan unavailable");
                return Ok(None);
            }
        };
        if out.timed_out {
            return Err(anyhow!(
                "orphan container scan timed out after {}s",
                self.timeout.as_secs()
            ));
        }
        if !out.status.success() {
            warn!(
                detail = %out.summary("orphan container scan", self.timeout),
                "orphan container scan failed"
            );
            return Ok(None);
        }
        let count = out
            .stdout_text()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count();
        Ok(Some(u32::try_from(count).unwrap_or(u32::MAX)))
    }
}

impl ResourceProbe for SystemProbe {
    fn scan(&self) -> Result<ResourceSnapshot> {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_processes();
        let memory = (sys.total_memory() > 0).then(|| MemoryUsage {
            total_bytes: sys.total_memory(),
            used_bytes: sys.used_memory(),
        });
        let zombies = sys
            .processes()
            .values()
            .filter(|process| process.status() == ProcessStatus::Zombie)
            .count();

        let snapshot = ResourceSnapshot {
            disk: self.disk_usage(),
            memory,
            zombie_processes: Some(u32::try_from(zombies).unwrap_or(u32::MAX)),
            orphan_containers: self.orphan_containers()?,
        };
        debug!(?snapshot, "resource scan complete");
        Ok(snapshot)
    }
}

/// Protected-service check: the configured command exits 0 when healthy.
#[derive(Debug, Clone)]
pub struct CommandHealthCheck {
    root: PathBuf,
    service: ServiceConfig,
}

impl CommandHealthCheck {
    pub fn new(root: impl Into<PathBuf>, service: &ServiceConfig) -> Self {
        Self {
            root: root.into(),
            service: service.clone(),
        }
    }

    pub fn from_config(root: &Path, services: &[ServiceConfig]) -> Vec<Self> {
        services
            .iter()
            .map(|service| Self::new(root, service))
            .collect()
    }
}

impl HealthCheck for CommandHealthCheck {
    fn name(&self) -> &str {
        &self.service.name
    }

    fn check(&self) -> Result<HealthReport> {
        let cmd = command_from_argv(&self.service.check, &self.root)?;
        let timeout = Duration::from_secs(self.service.timeout_secs);
        let out = run_command_with_timeout(cmd, timeout, PROBE_OUTPUT_LIMIT)
            .with_context(|| format!("health check {}", self.service.name))?;
        let summary = out.summary("check", timeout);
        if out.success() {
            Ok(HealthReport::healthy(summary))
        } else {
            Ok(HealthReport::unhealthy(summary))
        }
    }
}

/// Run every check; a check that errors counts as unhealthy.
pub fn check_all(checks: &[&dyn HealthCheck]) -> Vec<(String, HealthReport)> {
    checks
        .iter()
        .map(|check| {
            let report = match check.check() {
                Ok(report) => report,
                Err(err) => HealthReport::unhealthy(format!("check error: {err:#}")),
            };
            if !report.healthy {
                warn!(service = check.name(), detail = %report.detail, "protected service unhealthy");
            }
            (check.name().to_string(), report)
        })
        .collect()
}

/// Runs configured cleanup commands; stale temp files are swept in-process.
#[derive(Debug, Clone)]
pub struct CommandCleanupRunner {
    root: PathBuf,
    config: HousekeepingConfig,
}

impl CommandCleanupRunner {
    pub fn new(root: impl Into<PathBuf>, config: &HousekeepingConfig) -> Self {
        Self {
            root: root.into(),
            config: config.clone(),
        }
    }

    fn run_argv(&self, label: &str, argv: &[String]) -> Result<ActionOutcome> {
        let cmd = command_from_argv(argv, &self.root)?;
        let timeout = Duration::from_secs(self.config.action_timeout_secs);
        let out = run_command_with_timeout(cmd, timeout, PROBE_OUTPUT_LIMIT)
            .with_context(|| format!("cleanup action {label}"))?;
        let summary = out.summary(label, timeout);
        if out.success() {
            info!(action = label, "cleanup action executed");
            Ok(ActionOutcome::executed(summary))
        } else {
            Ok(ActionOutcome::failed(summary))
        }
    }
}

impl CleanupRunner for CommandCleanupRunner {
    fn run_tier1(&self, action: Tier1Action) -> Result<ActionOutcome> {
        if action == Tier1Action::StaleTempFiles {
            let max_age = Duration::from_secs(self.config.stale_temp_hours.saturating_mul(3600));
            let report = sweep_stale_files(
                &self.root,
                &self.config.scratch_dirs,
                max_age,
                SystemTime::now(),
            )?;
            return Ok(ActionOutcome::executed(report.describe()));
        }
        match self.config.actions.tier1(action) {
            Some(argv) => self.run_argv(action.as_str(), &argv),
            None => Ok(ActionOutcome::skipped("no command configured")),
        }
    }

    fn run_tier2(&self, action: &Tier2Action) -> Result<ActionOutcome> {
        match self.config.actions.tier2(action) {
            Some(argv) => self.run_argv(&action.to_string(), &argv),
            None => Ok(ActionOutcome::skipped("no command configured")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed_files: u64,
    pub removed_bytes: u64,
    pub scanned_dirs: Vec<String>,
}

impl SweepReport {
    pub fn describe(&self) -> String {
        if self.scanned_dirs.is_empty() {
            return "no scratch directories present".to_string();
        }
        format!(
            "removed {} stale files ({} bytes) under {}",
            self.removed_files,
            self.removed_bytes,
            self.scanned_dirs.join(", ")
        )
    }
}

/// Remove regular files older than `max_age` under each scratch dir of `root`.
///
/// Symlinks are neither followed nor removed; missing dirs are skipped.
pub fn sweep_stale_files(
    root: &Path,
    scratch_dirs: &[PathBuf],
    max_age: Duration,
    now: SystemTime,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    for rel in scratch_dirs {
        let dir = root.join(rel);
        if !dir.is_dir() {
            continue;
        }
        report.scanned_dirs.push(rel.display().to_string());
        for entry in WalkDir::new(&dir).follow_links(false) {
            let entry = entry.with_context(|| format!("walk scratch dir {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry
                .metadata()
                .with_context(|| format!("stat {}", entry.path().display()))?;
            let modified = meta
                .modified()
                .with_context(|| format!("mtime {}", entry.path().display()))?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= max_age {
                continue;
            }
            fs::remove_file(entry.path())
                .with_context(|| format!("remove stale file {}", entry.path().display()))?;
            debug!(path = %entry.path().display(), "removed stale temp file");
            report.removed_files += 1;
            report.removed_bytes += meta.len();
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::HealthReport;

    struct FixedCheck(&'static str, Result<bool, &'static str>);

    impl HealthCheck for FixedCheck {
        fn name(&self) -> &str {
            self.0
        }

        fn check(&self) -> Result<HealthReport> {
            match self.1 {
                Ok(true) => Ok(HealthReport::healthy("ok")),
                Ok(false) => Ok(HealthReport::unhealthy("503")),
                Err(msg) => Err(anyhow!(msg)),
            }
        }
    }

    #[test]
    fn erroring_check_counts_as_unhealthy() {
        let ok = FixedCheck("api", Ok(true));
        let broken = FixedCheck("db", Err("connection refused"));
        let results = check_all(&[&ok, &broken]);
        assert!(results[0].1.healthy);
        assert!(!results[1].1.healthy);
        assert!(results[1].1.detail.contains("connection refused"));
    }

    #[test]
    fn sweep_only_removes_old_files_in_scratch_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let scratch = temp.path().join(".gate/tmp/nested");
        fs::create_dir_all(&scratch).expect("mkdir");
        fs::write(scratch.join("old.log"), "12345").expect("write");
        fs::write(temp.path().join("keep.txt"), "app data").expect("write");

        let later = SystemTime::now() + Duration::from_secs(48 * 3600);
        let report = sweep_stale_files(
            temp.path(),
            &[PathBuf::from(".gate/tmp"), PathBuf::from("absent")],
            Duration::from_secs(24 * 3600),
            later,
        )
        .expect("sweep");

        assert_eq!(report.removed_files, 1);
        assert_eq!(report.removed_bytes, 5);
        assert_eq!(report.scanned_dirs, vec![".gate/tmp".to_string()]);
        assert!(!scratch.join("old.log").exists());
        assert!(temp.path().join("keep.txt").exists());
    }

    #[test]
    fn fresh_files_survive_sweep() {
        let temp = tempfile::tempdir().expect("tempdir");
        let scratch = temp.path().join("scratch");
        fs::create_dir_all(&scratch).expect("mkdir");
        fs::write(scratch.join("new.log"), "x").expect("write");
        let report = sweep_stale_files(
            temp.path(),
            &[PathBuf::from("scratch")],
            Duration::from_secs(3600),
            SystemTime::now(),
        )
        .expect("sweep");
        assert_eq!(report.removed_files, 0);
        assert!(scratch.join("new.log").exists());
    }

    #[test]
    fn unconfigured_tier1_action_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = HousekeepingConfig::default();
        config.actions.build_cache = Vec::new();
        let runner = CommandCleanupRunner::new(temp.path(), &config);
        let outcome = runner.run_tier1(Tier1Action::BuildCache).expect("run");
        assert_eq!(outcome.status, ActionStatus::Skipped);
    }
}
