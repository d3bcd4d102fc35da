//! Deterministic, pure logic shared by the session gate.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod domain;
pub mod exit_decision;
pub mod freshness;
pub mod invariants;
pub mod records;
pub mod scenario;
pub mod session;
pub mod state_update;
pub mod tiers;
pub mod types;
