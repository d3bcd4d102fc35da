//! Canonical `.gate/` layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::core::domain::SessionId;

/// All canonical paths within `.gate/` for a workspace root.
#[derive(Debug, Clone)]
pub struct GatePaths {
    pub root: PathBuf,
    pub gate_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub sessions_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub pins_dir: PathBuf,
    pub scenarios_dir: PathBuf,
    pub scenario_ledger_path: PathBuf,
    pub scenario_audit_path: PathBuf,
}

impl GatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let gate_dir = root.join(".gate");
        let scenarios_dir = gate_dir.join("scenarios");
        Self {
            root: root.clone(),
            gate_dir: gate_dir.clone(),
            config_path: gate_dir.join("config.toml"),
            gitignore_path: gate_dir.join(".gitignore"),
            sessions_dir: gate_dir.join("sessions"),
            artifacts_dir: gate_dir.join("artifacts"),
            pins_dir: gate_dir.join("pins"),
            scenarios_dir: scenarios_dir.clone(),
            scenario_ledger_path: scenarios_dir.join("ledger.jsonl"),
            scenario_audit_path: scenarios_dir.join("audit.jsonl"),
        }
    }

    pub fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.sessions_dir.join(session_id.as_str())
    }

    pub fn state_path(&self, session_id: &SessionId) -> PathBuf {
        self.session_dir(session_id).join("state.json")
    }

    pub fn state_lock_path(&self, session_id: &SessionId) -> PathBuf {
        self.session_dir(session_id).join("state.lock")
    }

    pub fn invocation_lease_path(&self, session_id: &SessionId) -> PathBuf {
        self.session_dir(session_id).join("invocation.lock")
    }

    /// Directory for one artifact kind (`reconciliation`, `housekeeping`, `exit`).
    pub fn artifact_dir(&self, kind: &str) -> PathBuf {
        self.artifacts_dir.join(kind)
    }

    pub fn reconciliation_dir(&self, session_id: &SessionId) -> PathBuf {
        self.artifact_dir("reconciliation").join(session_id.as_str())
    }

    pub fn housekeeping_dir(&self) -> PathBuf {
        self.artifact_dir("housekeeping")
    }

    pub fn exit_dir(&self, session_id: &SessionId) -> PathBuf {
        self.artifact_dir("exit").join(session_id.as_str())
    }
}

/// Options for `init_gate`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing gate-owned files.
    pub force: bool,
}

/// Create `.gate/` scaffolding in `root`.
///
/// Fails if `.gate/config.toml` already exists unless `options.force` is set.
/// Sessions, artifacts and the scenario ledger are never touched.
pub fn init_gate(root: &Path, options: &InitOptions) -> Result<GatePaths> {
    let paths = GatePaths::new(root);
    if paths.gate_dir.exists() && !paths.gate_dir.is_dir() {
        return Err(anyhow!("gate init: .gate exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "gate init: .gate/config.toml already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.gate_dir)?;
    create_dir(&paths.sessions_dir)?;
    create_dir(&paths.artifacts_dir)?;
    create_dir(&paths.pins_dir)?;
    create_dir(&paths.scenarios_dir)?;

    write_file(&paths.config_path, CONFIG_TEMPLATE)?;
    write_file(&paths.gitignore_path, GATE_GITIGNORE)?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

/// Runtime records stay out of git; only `config.toml` is meant to be tracked.
const GATE_GITIGNORE: &str = "sessions/\nartifacts/\npins/\nscenarios/\ntmp/\n";

const CONFIG_TEMPLATE: &str = r#"# sessiongate configuration. Missing keys use built-in defaults.

# Maximum age of the latest housekeeping artifact accepted by `exit`.
hk_max_age_hours = 24
lock_stale_secs = 30

[stages]
scripts = ["just", "build"]
container = ["just", "container"]
deploy = ["just", "deploy"]
tests = ["just", "test"]
timeout_secs = 1800
output_limit_bytes = 100000

[git]
remote = "origin"
commit_message = "chore(session): reconcile {session_id}"
timeout_secs = 300

[housekeeping]
scan_timeout_secs = 60
action_timeout_secs = 600
disk_pressure_percent = 85.0
memory_pressure_percent = 90.0
restart_candidates = []
scratch_dirs = [".gate/tmp"]
stale_temp_hours = 24
orphan_container_scan = ["docker", "ps", "-aq", "--filter", "status=exited"]

[housekeeping.actions]
dangling_images = ["docker", "image", "prune", "-f"]
build_cache = ["docker", "builder", "prune", "-f"]
stopped_containers = ["docker", "container", "prune", "-f"]
prune_volumes = ["docker", "volume", "prune", "-f"]
restart_service = ["docker", "restart", "{service}"]

# Protected services. Each check exits 0 when the service is healthy.
# [[services]]
# name = "api"
# check = ["curl", "-sf", "http://localhost:8080/health"]
# timeout_secs = 10

[scenarios]
required = ["interrupted-reconciliation", "forced-exit", "post-cleanup-unhealthy"]
"#;
