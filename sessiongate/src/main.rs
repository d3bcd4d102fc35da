//! Session lifecycle gate.
//!
//! Reconciles a session's work, keeps the host healthy and decides whether the
//! session may end. Every verdict is printed verbatim and mapped to a distinct
//! exit code (see `sessiongate::exit_codes`).

use std::env;
use std::process;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};

use sessiongate::core::domain::{HousekeepingCommand, SessionId, WorkCommand};
use sessiongate::core::records::ActionStatus;
use sessiongate::core::scenario::{ScenarioId, ScenarioResult, ScenarioRun};
use sessiongate::core::tiers::{ApprovalToken, Tier2Action};
use sessiongate::dispatch::dispatch_reconcile;
use sessiongate::drills::drill_and_record;
use sessiongate::error::{GateError, classify};
use sessiongate::exit_codes;
use sessiongate::exit_gate::{ExitGate, ExitRequest};
use sessiongate::housekeep::HousekeepingEngine;
use sessiongate::io::config::{GateConfig, MAX_HOURS, load_config};
use sessiongate::io::git::Git;
use sessiongate::io::init::{GatePaths, InitOptions, init_gate};
use sessiongate::io::probes::{
    CommandCleanupRunner, CommandHealthCheck, HealthCheck, SystemProbe,
};
use sessiongate::io::stage_runner::CommandStageRunner;
use sessiongate::io::state_store::{SessionStateStore, SessionStateView};
use sessiongate::logging;
use sessiongate::reconcile::ReconciliationEngine;
use sessiongate::scenario::ScenarioAuthority;

#[derive(Parser)]
#[command(
    name = "sessiongate",
    version,
    about = "Session lifecycle gate: reconcile work, housekeep the host, exit cleanly"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.gate/` with a default config.
    Init {
        /// Overwrite existing gate-owned files.
        #[arg(short, long)]
        force: bool,
    },
    /// Drive the pipeline for one or more sessions; several run concurrently.
    Reconcile {
        #[arg(required = true)]
        sessions: Vec<String>,
    },
    /// Scan, clean up and re-check protected services.
    Housekeep {
        /// Approve a tier-2 action for this invocation (`prune_volumes`, `restart_service:<name>`).
        #[arg(long = "approve", value_name = "ACTION")]
        approve: Vec<Tier2Action>,
    },
    /// Classify an exit attempt as CLEAN_EXIT, EXIT_BLOCKED or DIRTY_EXIT.
    Exit {
        session: String,
        /// Exit regardless of unmet preconditions (recorded as DIRTY_EXIT).
        #[arg(long)]
        force: bool,
        /// Override the housekeeping freshness threshold.
        #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..=MAX_HOURS))]
        max_age_hours: Option<u64>,
    },
    /// Print the persisted session state.
    Status { session: String },
    /// Scenario evidence gating concurrent dispatch.
    Scenario {
        #[command(subcommand)]
        command: ScenarioCommand,
    },
}

#[derive(Subcommand)]
enum ScenarioCommand {
    /// Record an externally run scenario.
    Record {
        scenario: ScenarioId,
        #[arg(long)]
        run_id: String,
        /// Invariant violation observed; omit for a passing run.
        #[arg(long = "violation", value_name = "TEXT")]
        violations: Vec<String>,
    },
    /// Print per-scenario results and whether concurrent dispatch is authorized.
    Status,
    /// Run a scenario drill in a throwaway workspace and record the result.
    Drill { scenario: ScenarioId },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::INVALID
            } else {
                exit_codes::OK
            };
            let _ = err.print();
            process::exit(code);
        }
    };
    logging::init();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::for_error(classify(&err))
        }
    };
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let root = env::current_dir()?;
    if let Command::Init { force } = cli.command {
        let paths = init_gate(&root, &InitOptions { force })?;
        println!("initialized {}", paths.gate_dir.display());
        return Ok(exit_codes::OK);
    }

    let paths = GatePaths::new(&root);
    if !paths.gate_dir.is_dir() {
        return Err(anyhow!(
            "no .gate directory in {} (run `sessiongate init`)",
            root.display()
        ));
    }
    let config = load_config(&paths.config_path)?;
    match cli.command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::Reconcile { sessions } => cmd_reconcile(&paths, &config, &sessions),
        Command::Housekeep { approve } => cmd_housekeep(&paths, &config, approve),
        Command::Exit {
            session,
            force,
            max_age_hours,
        } => cmd_exit(&paths, &config, &session, force, max_age_hours),
        Command::Status { session } => cmd_status(&paths, &session),
        Command::Scenario { command } => cmd_scenario(&paths, &config, command),
    }
}

fn parse_session(raw: &str) -> Result<SessionId> {
    SessionId::parse(raw).map_err(|reason| GateError::InvalidSessionId(reason).into())
}

fn cmd_reconcile(paths: &GatePaths, config: &GateConfig, sessions: &[String]) -> Result<i32> {
    let ids = sessions
        .iter()
        .map(String::as_str)
        .map(parse_session)
        .collect::<Result<Vec<_>>>()?;
    let authority = ScenarioAuthority::new(paths, &config.scenarios.required);
    let git = Git::new(
        &paths.root,
        &config.git.remote,
        Duration::from_secs(config.git.timeout_secs),
    );
    let outcomes = dispatch_reconcile(&authority, &ids, |session_id| {
        let runner = CommandStageRunner::new(&paths.root, &config.stages, session_id.as_str());
        let store = SessionStateStore::new(paths, config.lock_stale_secs);
        ReconciliationEngine::new(paths, store, &runner, &git, &config.git.commit_message).run(
            WorkCommand::Reconcile {
                session_id: session_id.clone(),
            },
        )
    })?;

    let mut code = exit_codes::OK;
    for outcome in outcomes {
        let session_code = match outcome.result {
            Ok(report) => {
                println!("{}: {}", outcome.session_id, report.verdict());
                if let Some(stage) = report.interrupted {
                    println!("  resumed after interruption at {stage}");
                }
                if let Some(reason) = &report.artifact.blocking_reason {
                    println!("  {reason}");
                }
                println!("  artifact: {}", report.reference.key);
                if let Some(pin) = &report.pin {
                    println!("  pin: {}", pin.key);
                }
                exit_codes::for_reconcile(report.verdict())
            }
            Err(err) => {
                eprintln!("{}: {err:#}", outcome.session_id);
                exit_codes::for_error(classify(&err))
            }
        };
        if code == exit_codes::OK {
            code = session_code;
        }
    }
    Ok(code)
}

fn cmd_housekeep(paths: &GatePaths, config: &GateConfig, approve: Vec<Tier2Action>) -> Result<i32> {
    let approval = (!approve.is_empty()).then(|| ApprovalToken::grant(approve));
    let probe = SystemProbe::new(&paths.root, &config.housekeeping);
    let checks = CommandHealthCheck::from_config(&paths.root, &config.services);
    let cleanup = CommandCleanupRunner::new(&paths.root, &config.housekeeping);
    let report = HousekeepingEngine::new(
        paths,
        &config.housekeeping,
        &probe,
        checks.iter().map(|check| check as &dyn HealthCheck).collect(),
        &cleanup,
    )
    .run(HousekeepingCommand::Housekeep { approval })?;

    let result = &report.artifact.result;
    println!("housekeeping: {}", result.outcome.as_str());
    if let Some(reason) = &result.reason {
        println!("  {reason}");
    }
    for action in report.artifact.tier1.iter().chain(&report.artifact.tier2.executed) {
        let status = match action.status {
            ActionStatus::Executed => "executed",
            ActionStatus::Failed => "failed",
            ActionStatus::Skipped => "skipped",
        };
        println!("  tier {} {}: {status} ({})", action.tier, action.action, action.detail);
    }
    for skipped in &report.artifact.tier2.skipped {
        println!("  tier 2 {skipped}: not approved");
    }
    println!("  artifact: {}", report.reference.key);
    Ok(exit_codes::for_housekeeping(result.outcome, result.success))
}

fn cmd_exit(
    paths: &GatePaths,
    config: &GateConfig,
    session: &str,
    forced: bool,
    max_age_hours: Option<u64>,
) -> Result<i32> {
    let session_id = parse_session(session)?;
    let checks = CommandHealthCheck::from_config(&paths.root, &config.services);
    let gate = ExitGate::new(
        paths,
        SessionStateView::new(paths),
        checks.iter().map(|check| check as &dyn HealthCheck).collect(),
    );
    let report = gate.evaluate(
        &ExitRequest {
            session_id,
            forced,
            max_age_hours: max_age_hours.unwrap_or(config.hk_max_age_hours),
        },
        Utc::now(),
    )?;
    println!("{}", report.verdict());
    for reason in &report.artifact.reasons {
        println!("  - {reason}");
    }
    println!("  artifact: {}", report.reference.key);
    Ok(exit_codes::for_exit(report.verdict()))
}

fn cmd_status(paths: &GatePaths, session: &str) -> Result<i32> {
    let session_id = parse_session(session)?;
    match SessionStateView::new(paths).load(&session_id)? {
        Some(state) => {
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(exit_codes::OK)
        }
        None => {
            println!("{session_id}: no session state (run reconcile)");
            Ok(exit_codes::BLOCKED)
        }
    }
}

fn cmd_scenario(paths: &GatePaths, config: &GateConfig, command: ScenarioCommand) -> Result<i32> {
    let authority = ScenarioAuthority::new(paths, &config.scenarios.required);
    match command {
        ScenarioCommand::Record {
            scenario,
            run_id,
            violations,
        } => {
            let run = ScenarioRun::from_violations(scenario, run_id, violations, Utc::now());
            authority.record(&run)?;
            println!("{} {}: {}", run.scenario_id, run.run_id, run.result.as_str());
            Ok(exit_codes::OK)
        }
        ScenarioCommand::Status => {
            let status = authority.status()?;
            for id in ScenarioId::ALL {
                let summary = status.summaries.get(&id).cloned().unwrap_or_default();
                let last = summary.last_result.map_or("none", ScenarioResult::as_str);
                println!(
                    "{id}: passed={} failed={} last={last}",
                    summary.passed, summary.failed
                );
            }
            if status.authorization.authorized {
                println!("concurrent dispatch: authorized");
            } else {
                let missing: Vec<&str> = status
                    .authorization
                    .missing
                    .iter()
                    .map(|id| id.as_str())
                    .collect();
                println!("concurrent dispatch: not authorized (missing: {})", missing.join(", "));
            }
            Ok(exit_codes::OK)
        }
        ScenarioCommand::Drill { scenario } => {
            let run = drill_and_record(&authority, scenario)?;
            println!("{} {}: {}", run.scenario_id, run.run_id, run.result.as_str());
            for violation in &run.violations {
                println!("  - {violation}");
            }
            if run.violations.is_empty() {
                Ok(exit_codes::OK)
            } else {
                Ok(exit_codes::BLOCKED)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reconcile_many() {
        let cli = Cli::parse_from(["sessiongate", "reconcile", "a", "b"]);
        assert!(matches!(cli.command, Command::Reconcile { sessions } if sessions == ["a", "b"]));
    }

    #[test]
    fn parse_housekeep_approvals() {
        let cli = Cli::parse_from([
            "sessiongate",
            "housekeep",
            "--approve",
            "prune_volumes",
            "--approve",
            "restart_service:api",
        ]);
        let Command::Housekeep { approve } = cli.command else {
            panic!("expected housekeep");
        };
        assert_eq!(
            approve,
            vec![
                Tier2Action::PruneVolumes,
                Tier2Action::RestartService {
                    service: "api".to_string()
                }
            ]
        );
    }

    #[test]
    fn parse_exit_flags() {
        let cli = Cli::parse_from(["sessiongate", "exit", "s-1", "--force", "--max-age-hours", "48"]);
        assert!(matches!(
            cli.command,
            Command::Exit {
                force: true,
                max_age_hours: Some(48),
                ..
            }
        ));
    }

    #[test]
    fn max_age_hours_is_bounded() {
        assert!(Cli::try_parse_from(["sessiongate", "exit", "s-1", "--max-age-hours", "0"]).is_err());
        assert!(
            Cli::try_parse_from(["sessiongate", "exit", "s-1", "--max-age-hours", "3000000000000"])
                .is_err()
        );
    }

    #[test]
    fn unknown_tier2_action_is_rejected() {
        assert!(Cli::try_parse_from(["sessiongate", "housekeep", "--approve", "rm_rf"]).is_err());
    }

    #[test]
    fn parse_scenario_drill() {
        let cli = Cli::parse_from(["sessiongate", "scenario", "drill", "forced-exit"]);
        assert!(matches!(
            cli.command,
            Command::Scenario {
                command: ScenarioCommand::Drill {
                    scenario: ScenarioId::ForcedExit
                }
            }
        ));
    }
}
