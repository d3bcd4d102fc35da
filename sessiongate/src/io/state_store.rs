//! Session state storage behind compare-and-swap.
//!
//! [`SessionStateStore`] is the only type that can persist a session state. It
//! is handed to the reconciliation engine alone; every other component gets a
//! [`SessionStateView`], which can only load.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::{debug, warn};

use crate::core::domain::SessionId;
use crate::core::invariants::validate_invariants;
use crate::core::session::SessionState;
use crate::error::GateError;
use crate::io::artifact_store::next_artifact_id;
use crate::io::init::GatePaths;

const STATE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/session_state.v1.schema.json"
));

static STATE_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(STATE_SCHEMA).map_err(|err| err.to_string())?;
    jsonschema::validator_for(&schema).map_err(|err| err.to_string())
});

/// Read-only access to session state.
#[derive(Debug, Clone)]
pub struct SessionStateView {
    paths: GatePaths,
}

impl SessionStateView {
    pub fn new(paths: &GatePaths) -> Self {
        Self {
            paths: paths.clone(),
        }
    }

    /// Load a session's state. `Ok(None)` means the session is FRESH.
    pub fn load(&self, session_id: &SessionId) -> Result<Option<SessionState>> {
        load_state(&self.paths.state_path(session_id), session_id)
    }
}

/// Single-writer session state store.
#[derive(Debug)]
pub struct SessionStateStore {
    paths: GatePaths,
    lock_stale: Duration,
}

/// Exclusive claim on a session for one whole reconciliation invocation.
///
/// Only a dead holder's lease can be broken; a live one is refused however
/// long it has been held. Released on drop.
#[derive(Debug)]
pub struct InvocationLease {
    _lock: FileLock,
}

impl SessionStateStore {
    pub fn new(paths: &GatePaths, lock_stale_secs: u64) -> Self {
        let lock_stale = i64::try_from(lock_stale_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        Self {
            paths: paths.clone(),
            lock_stale,
        }
    }

    /// Claim `session_id` for one invocation, or refuse with [`GateError::LockHeld`].
    pub fn lease(&self, session_id: &SessionId) -> Result<InvocationLease> {
        let lock = FileLock::acquire(
            &self.paths.invocation_lease_path(session_id),
            session_id,
            "invocation lease",
            None,
        )?;
        debug!(session_id = %session_id, "invocation lease acquired");
        Ok(InvocationLease { _lock: lock })
    }

    pub fn view(&self) -> SessionStateView {
        SessionStateView::new(&self.paths)
    }

    pub fn load(&self, session_id: &SessionId) -> Result<Option<SessionState>> {
        load_state(&self.paths.state_path(session_id), session_id)
    }

    /// Persist `new_state` if the stored version still equals `expected_version`.
    ///
    /// `expected_version = 0` asserts that no state has been written yet. On
    /// success the stored record (with `version = expected_version + 1`) is
    /// returned. A mismatch yields [`GateError::VersionConflict`]; nothing is written.
    pub fn compare_and_swap(
        &self,
        expected_version: u64,
        new_state: &SessionState,
    ) -> Result<SessionState> {
        let session_id = SessionId::parse(&new_state.session_id).map_err(GateError::InvalidSessionId)?;
        let path = self.paths.state_path(&session_id);
        let _lock = FileLock::acquire(
            &self.paths.state_lock_path(&session_id),
            &session_id,
            "state lock",
            Some(self.lock_stale),
        )?;

        let found = load_state(&path, &session_id)?.map_or(0, |state| state.version);
        if found != expected_version {
            warn!(session_id = %session_id, expected_version, found, "session state version conflict");
            return Err(GateError::VersionConflict {
                session_id: session_id.to_string(),
                expected: expected_version,
                found,
            }
            .into());
        }

        let mut stored = new_state.clone();
        stored.version = expected_version + 1;
        let errors = validate_invariants(&stored);
        if !errors.is_empty() {
            return Err(anyhow!(
                "refuse to persist session state violating invariants: {}",
                errors.join("; ")
            ));
        }

        debug!(session_id = %session_id, version = stored.version, stage = ?stored.pipeline_stage, "writing session state");
        let mut buf = serde_json::to_string_pretty(&stored)?;
        buf.push('\n');
        write_atomic(&path, &buf)?;
        Ok(stored)
    }
}

fn load_state(path: &Path, session_id: &SessionId) -> Result<Option<SessionState>> {
    if !path.exists() {
        debug!(session_id = %session_id, "no session state (fresh)");
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read session state {}", path.display()))?;
    let state = parse_state(&contents).map_err(|reason| GateError::Unparseable {
        path: path.to_path_buf(),
        reason,
    })?;
    if state.session_id != session_id.as_str() {
        return Err(GateError::Unparseable {
            path: path.to_path_buf(),
            reason: format!(
                "state belongs to session '{}', expected '{session_id}'",
                state.session_id
            ),
        }
        .into());
    }
    debug!(session_id = %session_id, version = state.version, "session state loaded");
    Ok(Some(state))
}

/// Parse and validate a state record: schema conformance + semantic invariants.
fn parse_state(contents: &str) -> Result<SessionState, String> {
    let value: Value = serde_json::from_str(contents).map_err(|err| format!("parse json: {err}"))?;
    let validator = STATE_VALIDATOR
        .as_ref()
        .map_err(|err| format!("invalid embedded schema: {err}"))?;
    let messages: Vec<String> = validator.iter_errors(&value).map(|err| err.to_string()).collect();
    if !messages.is_empty() {
        return Err(format!("schema validation failed: {}", messages.join("; ")));
    }
    let state: SessionState =
        serde_json::from_value(value).map_err(|err| format!("deserialize: {err}"))?;
    let errors = validate_invariants(&state);
    if !errors.is_empty() {
        return Err(format!("invariants failed: {}", errors.join("; ")));
    }
    Ok(state)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("session state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp session state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace session state {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// What a lock path holds right now.
#[derive(Debug, PartialEq, Eq)]
enum Holder {
    Released,
    /// Present but not a lock record. Never treated as stale.
    Unreadable,
    Held(LockInfo),
}

/// Exclusive lock file, released on drop.
///
/// The record is written to a temp file and published with a hard link, so a
/// lock path is never observed half-written.
#[derive(Debug)]
struct FileLock {
    path: PathBuf,
    info: LockInfo,
}

impl FileLock {
    /// `stale_after = None` breaks only locks whose holder process is gone.
    fn acquire(
        path: &Path,
        session_id: &SessionId,
        lock: &'static str,
        stale_after: Option<Duration>,
    ) -> Result<Self> {
        let dir = path
            .parent()
            .with_context(|| format!("lock path missing parent {}", path.display()))?;
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;

        let mut broke_stale = false;
        for _ in 0..3 {
            let info = LockInfo {
                pid: std::process::id(),
                acquired_at: Utc::now(),
            };
            if publish_lock(dir, path, &info)? {
                return Ok(Self {
                    path: path.to_path_buf(),
                    info,
                });
            }
            match read_holder(path) {
                Holder::Released => continue,
                Holder::Held(seen) if !broke_stale && lock_is_stale(&seen, stale_after) => {
                    broke_stale = true;
                    if break_stale_lock(path, &seen)? {
                        continue;
                    }
                    return Err(lock_held(session_id, lock, read_holder(path)));
                }
                holder => return Err(lock_held(session_id, lock, holder)),
            }
        }
        Err(anyhow!("could not acquire {lock} {}", path.display()))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if read_holder(&self.path) != Holder::Held(self.info.clone()) {
            warn!(path = %self.path.display(), "lock no longer ours at release, leaving it");
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to release lock");
        }
    }
}

/// Publish `info` at `path` unless a lock is already there.
fn publish_lock(dir: &Path, path: &Path, info: &LockInfo) -> Result<bool> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".lock-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .with_context(|| format!("create temp lock in {}", dir.display()))?;
    serde_json::to_writer(&mut tmp, info).context("serialize lock record")?;
    tmp.flush()
        .with_context(|| format!("write temp lock {}", tmp.path().display()))?;
    match fs::hard_link(tmp.path(), path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("publish lock {}", path.display())),
    }
}

/// Move a stale lock aside, then confirm the moved file is the one judged stale.
///
/// A lock published in between is put back and `false` is returned.
fn break_stale_lock(path: &Path, seen: &LockInfo) -> Result<bool> {
    let aside = path.with_extension(format!("lock.{}", next_artifact_id("stale")));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
        Err(err) => {
            return Err(err).with_context(|| format!("move stale lock {}", path.display()));
        }
    }
    let moved = read_holder(&aside);
    let confirmed = moved == Holder::Held(seen.clone());
    if confirmed {
        warn!(path = %path.display(), holder = ?seen, "broke stale lock");
    } else {
        match fs::hard_link(&aside, path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => warn!(path = %path.display(), err = %err, "failed to restore lock"),
        }
    }
    if let Err(err) = fs::remove_file(&aside) {
        warn!(path = %aside.display(), err = %err, "failed to remove moved lock");
    }
    Ok(confirmed)
}

fn read_holder(path: &Path) -> Holder {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).map_or(Holder::Unreadable, Holder::Held),
        Err(err) if err.kind() == ErrorKind::NotFound => Holder::Released,
        Err(_) => Holder::Unreadable,
    }
}

fn lock_held(session_id: &SessionId, lock: &'static str, holder: Holder) -> anyhow::Error {
    let (pid, since) = match holder {
        Holder::Held(info) => (info.pid, info.acquired_at.to_rfc3339()),
        Holder::Released | Holder::Unreadable => (0, "unknown".to_string()),
    };
    GateError::LockHeld {
        session_id: session_id.to_string(),
        lock,
        pid,
        since,
    }
    .into()
}

fn lock_is_stale(info: &LockInfo, stale_after: Option<Duration>) -> bool {
    if stale_after.is_some_and(|limit| Utc::now() - info.acquired_at > limit) {
        return true;
    }
    !is_pid_alive(info.pid)
}

fn is_pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state_update::{begin_invocation, begin_stage, complete_stage};
    use crate::core::types::Stage;
    use crate::error::{ErrorClass, classify};

    fn setup() -> (tempfile::TempDir, SessionStateStore, SessionId) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = GatePaths::new(temp.path());
        let store = SessionStateStore::new(&paths, 30);
        (temp, store, SessionId::parse("s-1").expect("id"))
    }

    #[test]
    fn missing_state_is_fresh() {
        let (_temp, store, id) = setup();
        assert!(store.load(&id).expect("load").is_none());
        assert!(store.view().load(&id).expect("view load").is_none());
    }

    #[test]
    fn compare_and_swap_bumps_version() {
        let (_temp, store, id) = setup();
        let now = Utc::now();
        let mut state = SessionState::fresh(id.as_str(), now);
        begin_invocation(&mut state, now);

        let stored = store.compare_and_swap(0, &state).expect("first write");
        assert_eq!(stored.version, 1);

        let mut next = stored.clone();
        begin_stage(&mut next, Stage::Scripts, now).expect("begin");
        complete_stage(&mut next, Stage::Scripts, "ok", now).expect("complete");
        let stored = store.compare_and_swap(1, &next).expect("second write");
        assert_eq!(stored.version, 2);

        let loaded = store.view().load(&id).expect("load").expect("present");
        assert_eq!(loaded, stored);
    }

    #[test]
    fn stale_version_conflicts_without_writing() {
        let (_temp, store, id) = setup();
        let state = SessionState::fresh(id.as_str(), Utc::now());
        store.compare_and_swap(0, &state).expect("first write");

        let err = store.compare_and_swap(0, &state).expect_err("conflict");
        assert_eq!(classify(&err), ErrorClass::Ambiguous);
        assert!(err.to_string().contains("expected version 0, found 1"));
        assert_eq!(store.load(&id).expect("load").expect("present").version, 1);
    }

    #[test]
    fn refuses_to_persist_out_of_order_completion() {
        let (_temp, store, id) = setup();
        let mut state = SessionState::fresh(id.as_str(), Utc::now());
        state
            .stage_status
            .insert(Stage::Tests, crate::core::types::StageStatus::Completed);
        let err = store.compare_and_swap(0, &state).expect_err("invalid");
        assert!(err.to_string().contains("violating invariants"));
        assert!(store.load(&id).expect("load").is_none());
    }

    #[test]
    fn corrupt_state_is_ambiguous() {
        let (temp, store, id) = setup();
        let path = GatePaths::new(temp.path()).state_path(&id);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "{\"session_id\": 3}").expect("write");
        let err = store.load(&id).expect_err("unparseable");
        assert_eq!(classify(&err), ErrorClass::Ambiguous);
    }

    #[test]
    fn live_lock_is_refused_and_dead_lock_is_broken() {
        let (temp, store, id) = setup();
        let paths = GatePaths::new(temp.path());
        let lock_path = paths.state_lock_path(&id);
        fs::create_dir_all(lock_path.parent().expect("parent")).expect("mkdir");

        let live = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        fs::write(&lock_path, serde_json::to_string(&live).expect("json")).expect("write");
        let state = SessionState::fresh(id.as_str(), Utc::now());
        let err = store.compare_and_swap(0, &state).expect_err("lock held");
        assert_eq!(classify(&err), ErrorClass::Ambiguous);

        let abandoned = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now() - Duration::hours(1),
        };
        fs::write(&lock_path, serde_json::to_string(&abandoned).expect("json")).expect("write");
        store.compare_and_swap(0, &state).expect("stale lock broken");
        assert!(!lock_path.exists());
    }

    #[test]
    fn unreadable_lock_is_held_not_stale() {
        let (temp, store, id) = setup();
        let lock_path = GatePaths::new(temp.path()).state_lock_path(&id);
        fs::create_dir_all(lock_path.parent().expect("parent")).expect("mkdir");
        fs::write(&lock_path, "").expect("write");

        let state = SessionState::fresh(id.as_str(), Utc::now());
        let err = store.compare_and_swap(0, &state).expect_err("lock held");
        assert_eq!(classify(&err), ErrorClass::Ambiguous);
        assert!(lock_path.exists());
        assert!(store.load(&id).expect("load").is_none());
    }

    #[test]
    fn lock_replaced_while_held_is_left_alone() {
        let (temp, _store, id) = setup();
        let lock_path = GatePaths::new(temp.path()).state_lock_path(&id);
        let lock = FileLock::acquire(&lock_path, &id, "state lock", None).expect("acquire");
        let other = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now() + Duration::seconds(5),
        };
        fs::write(&lock_path, serde_json::to_string(&other).expect("json")).expect("write");
        drop(lock);
        assert_eq!(read_holder(&lock_path), Holder::Held(other));
    }

    #[test]
    fn live_lease_is_refused_however_old() {
        let (_temp, store, id) = setup();
        let _held = store.lease(&id).expect("first lease");
        let err = store.lease(&id).expect_err("second lease");
        assert_eq!(classify(&err), ErrorClass::Ambiguous);
        assert!(err.to_string().contains("invocation lease held by pid"));
    }

    #[test]
    fn lease_of_dead_process_is_broken_and_released_on_drop() {
        let (temp, store, id) = setup();
        let lease_path = GatePaths::new(temp.path()).invocation_lease_path(&id);
        fs::create_dir_all(lease_path.parent().expect("parent")).expect("mkdir");
        let dead = LockInfo {
            pid: u32::MAX,
            acquired_at: Utc::now(),
        };
        fs::write(&lease_path, serde_json::to_string(&dead).expect("json")).expect("write");

        let lease = store.lease(&id).expect("dead lease broken");
        assert!(matches!(read_holder(&lease_path), Holder::Held(info) if info.pid == std::process::id()));
        drop(lease);
        assert_eq!(read_holder(&lease_path), Holder::Released);
        let leftovers: Vec<_> = fs::read_dir(lease_path.parent().expect("parent"))
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name())
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}
