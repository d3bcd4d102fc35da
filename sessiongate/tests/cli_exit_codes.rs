//! CLI tests: verdicts and refusals map to distinct process exit codes.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use sessiongate::exit_codes;
use sessiongate::io::init::{InitOptions, init_gate};

fn gate(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sessiongate"))
        .current_dir(root)
        .args(args)
        .output()
        .expect("run sessiongate")
}

fn initialized() -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    init_gate(temp.path(), &InitOptions { force: false }).expect("init");
    temp
}

#[test]
fn commands_outside_a_gate_workspace_are_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = gate(temp.path(), &["exit", "s-1"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("sessiongate init"));
}

#[test]
fn init_twice_requires_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    assert_eq!(gate(temp.path(), &["init"]).status.code(), Some(exit_codes::OK));
    assert_eq!(gate(temp.path(), &["init"]).status.code(), Some(exit_codes::INVALID));
    assert_eq!(
        gate(temp.path(), &["init", "--force"]).status.code(),
        Some(exit_codes::OK)
    );
}

#[test]
fn unreconciled_exit_is_blocked_and_forced_exit_is_dirty() {
    let temp = initialized();

    let blocked = gate(temp.path(), &["exit", "s-1"]);
    assert_eq!(blocked.status.code(), Some(exit_codes::BLOCKED));
    let stdout = String::from_utf8_lossy(&blocked.stdout);
    assert!(stdout.starts_with("EXIT_BLOCKED"), "{stdout}");
    assert!(stdout.contains("HK artifact missing"));

    let forced = gate(temp.path(), &["exit", "s-1", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::DIRTY_EXIT));
    assert!(String::from_utf8_lossy(&forced.stdout).starts_with("DIRTY_EXIT"));
}

#[test]
fn invalid_session_id_is_blocked() {
    let temp = initialized();
    let output = gate(temp.path(), &["status", "../etc"]);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));
}

#[test]
fn corrupt_state_is_refused_as_ambiguous() {
    let temp = initialized();
    let dir = temp.path().join(".gate/sessions/s-1");
    fs::create_dir_all(&dir).expect("session dir");
    fs::write(dir.join("state.json"), "{ not json").expect("corrupt state");

    let output = gate(temp.path(), &["status", "s-1"]);
    assert_eq!(output.status.code(), Some(exit_codes::AMBIGUOUS));
}

#[test]
fn concurrent_reconcile_without_scenarios_is_blocked() {
    let temp = initialized();
    let output = gate(temp.path(), &["reconcile", "s-a", "s-b"]);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));
    assert!(String::from_utf8_lossy(&output.stderr).contains("concurrent dispatch refused"));
}

#[test]
fn scenario_drill_records_a_passing_run() {
    let temp = initialized();
    let drill = gate(temp.path(), &["scenario", "drill", "forced-exit"]);
    assert_eq!(drill.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&drill.stdout).contains("PASSED"));

    let status = gate(temp.path(), &["scenario", "status"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&status.stdout);
    assert!(stdout.contains("forced-exit: passed=1 failed=0 last=PASSED"), "{stdout}");
    assert!(stdout.contains("not authorized"));
}

#[test]
fn recorded_failure_is_listed() {
    let temp = initialized();
    let output = gate(
        temp.path(),
        &[
            "scenario",
            "record",
            "interrupted-reconciliation",
            "--run-id",
            "ext-1",
            "--violation",
            "lock left behind",
        ],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("FAILED"));
}
