//! Domain refusals that callers must tell apart from ordinary I/O failures.
//!
//! Orchestration code returns `anyhow::Result`; a [`GateError`] inside the chain
//! is recovered with [`classify`] at the CLI boundary.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::types::Stage;

#[derive(Debug, Error)]
pub enum GateError {
    #[error(
        "version conflict on session {session_id}: expected version {expected}, found {found} (ambiguous state, refuse; re-invoke explicitly)"
    )]
    VersionConflict {
        session_id: String,
        expected: u64,
        found: u64,
    },

    #[error("session {session_id} {lock} held by pid {pid} since {since} (ambiguous state, refuse)")]
    LockHeld {
        session_id: String,
        lock: &'static str,
        pid: u32,
        since: String,
    },

    #[error("unparseable artifact {}: {reason}", path.display())]
    Unparseable { path: PathBuf, reason: String },

    #[error("stage {stage} runner crashed: {reason}")]
    StageCrashed { stage: Stage, reason: String },

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("concurrent dispatch refused: scenarios without a PASSED run: {}", missing.join(", "))]
    ConcurrencyNotAuthorized { missing: Vec<String> },
}

/// Error taxonomy surfaced to the invoking layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Remediate the named precondition and re-invoke.
    Blocked,
    /// Needs human or agent clarification; never guessed.
    Ambiguous,
    /// The invocation aborted.
    Fatal,
}

impl GateError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GateError::VersionConflict { .. }
            | GateError::LockHeld { .. }
            | GateError::Unparseable { .. } => ErrorClass::Ambiguous,
            GateError::StageCrashed { .. } => ErrorClass::Fatal,
            GateError::InvalidSessionId(_) | GateError::ConcurrencyNotAuthorized { .. } => {
                ErrorClass::Blocked
            }
        }
    }
}

/// Classify an error chain. Errors without a [`GateError`] are fatal.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<GateError>())
        .map_or(ErrorClass::Fatal, GateError::class)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classifies_through_context() {
        let err = Err::<(), _>(GateError::VersionConflict {
            session_id: "s".to_string(),
            expected: 1,
            found: 2,
        })
        .context("write session state")
        .expect_err("error");
        assert_eq!(classify(&err), ErrorClass::Ambiguous);
        assert!(format!("{err:#}").contains("ambiguous state, refuse"));
    }

    #[test]
    fn plain_errors_are_fatal() {
        let err = anyhow::anyhow!("disk full");
        assert_eq!(classify(&err), ErrorClass::Fatal);
    }
}
