//! Append-only scenario evidence ledger and failure audit log (JSON Lines).

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::scenario::{ScenarioId, ScenarioRun};
use crate::error::GateError;
use crate::io::init::GatePaths;

/// Audit record for a FAILED scenario run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAudit {
    pub recorded_at: DateTime<Utc>,
    pub scenario_id: ScenarioId,
    pub run_id: String,
    pub violations_count: u32,
    pub violations: Vec<String>,
    /// True when an earlier PASSED run exists; the failure does not revoke it.
    pub previously_passed: bool,
}

#[derive(Debug, Clone)]
pub struct ScenarioLedger {
    ledger_path: PathBuf,
    audit_path: PathBuf,
}

impl ScenarioLedger {
    pub fn new(paths: &GatePaths) -> Self {
        Self {
            ledger_path: paths.scenario_ledger_path.clone(),
            audit_path: paths.scenario_audit_path.clone(),
        }
    }

    pub fn append_run(&self, run: &ScenarioRun) -> Result<()> {
        append_line(&self.ledger_path, run)
    }

    pub fn append_audit(&self, audit: &FailureAudit) -> Result<()> {
        append_line(&self.audit_path, audit)
    }

    pub fn runs(&self) -> Result<Vec<ScenarioRun>> {
        read_lines(&self.ledger_path)
    }

    pub fn audits(&self) -> Result<Vec<FailureAudit>> {
        read_lines(&self.audit_path)
    }
}

fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(record).context("serialize ledger record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("sync {}", path.display()))?;
    debug!(path = %path.display(), "ledger record appended");
    Ok(())
}

fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let mut records = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|err| GateError::Unparseable {
            path: path.to_path_buf(),
            reason: format!("line {}: {err}", idx + 1),
        })?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scenario::ScenarioResult;
    use crate::error::{ErrorClass, classify};

    #[test]
    fn runs_are_appended_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = ScenarioLedger::new(&GatePaths::new(temp.path()));
        assert!(ledger.runs().expect("empty").is_empty());

        let now = Utc::now();
        let pass = ScenarioRun::from_violations(ScenarioId::ForcedExit, "r1", Vec::new(), now);
        let fail = ScenarioRun::from_violations(
            ScenarioId::ForcedExit,
            "r2",
            vec!["exit artifact missing".to_string()],
            now,
        );
        ledger.append_run(&pass).expect("append");
        ledger.append_run(&fail).expect("append");

        let runs = ledger.runs().expect("runs");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].result, ScenarioResult::Passed);
        assert_eq!(runs[1].violations_count, 1);
    }

    #[test]
    fn corrupt_line_is_ambiguous() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = GatePaths::new(temp.path());
        fs::create_dir_all(&paths.scenarios_dir).expect("mkdir");
        fs::write(&paths.scenario_ledger_path, "{\"scenario_id\":\n").expect("write");
        let err = ScenarioLedger::new(&paths).runs().unwrap_err();
        assert_eq!(classify(&err), ErrorClass::Ambiguous);
        assert!(err.to_string().contains("line 1"));
    }
}
