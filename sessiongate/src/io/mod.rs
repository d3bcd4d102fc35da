//! Side-effecting adapters: filesystem stores, processes, git and host probes.

pub mod artifact_store;
pub mod config;
pub mod git;
pub mod init;
pub mod pin;
pub mod probes;
pub mod process;
pub mod scenario_ledger;
pub mod stage_runner;
pub mod state_store;
