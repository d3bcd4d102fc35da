//! Session lifecycle governance for agent-driven development sessions.
//!
//! A session may only be declared cleanly finished once its work has been
//! reconciled (built, deployed, tested, committed and pushed) and the host has
//! been kept healthy. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (pipeline position, invariants,
//!   freshness, the exit decision table, tier planning, scenario predicate).
//! - **[`io`]**: Side-effecting adapters (state and artifact stores, processes,
//!   git, host probes).
//!
//! Orchestration modules ([`reconcile`], [`housekeep`], [`exit_gate`],
//! [`scenario`], [`dispatch`], [`drills`]) coordinate the two for the CLI.

pub mod core;
pub mod dispatch;
pub mod drills;
pub mod error;
pub mod exit_codes;
pub mod exit_gate;
pub mod housekeep;
pub mod io;
pub mod logging;
pub mod reconcile;
pub mod scenario;
pub mod scripted;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
