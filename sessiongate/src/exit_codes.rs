//! Stable exit codes for `sessiongate` commands.
//!
//! Verdicts map to distinct codes so callers never have to parse stdout.

use crate::core::records::HousekeepingOutcome;
use crate::core::types::{ExitVerdict, ReconcileVerdict};
use crate::error::ErrorClass;

/// Command succeeded: `CLEAN_EXIT`, `RECONCILED_EXIT_READY` or completed housekeeping.
pub const OK: i32 = 0;
/// Invalid invocation, configuration or a fatal abort.
pub const INVALID: i32 = 1;
/// A named precondition is unmet (`EXIT_BLOCKED`, housekeeping refused, dispatch refused).
pub const BLOCKED: i32 = 2;
pub const DIRTY_EXIT: i32 = 3;
pub const RECONCILIATION_BLOCKED: i32 = 4;
pub const FAILED_TESTS: i32 = 5;
/// Refused on ambiguous state: version conflict, held lock or unparseable artifact.
pub const AMBIGUOUS: i32 = 6;
/// Housekeeping left a protected service unhealthy.
pub const DEGRADED: i32 = 7;

pub fn for_reconcile(verdict: ReconcileVerdict) -> i32 {
    match verdict {
        ReconcileVerdict::ReconciledExitReady => OK,
        ReconcileVerdict::ReconciliationBlocked => RECONCILIATION_BLOCKED,
        ReconcileVerdict::FailedTests => FAILED_TESTS,
    }
}

pub fn for_exit(verdict: ExitVerdict) -> i32 {
    match verdict {
        ExitVerdict::CleanExit => OK,
        ExitVerdict::ExitBlocked => BLOCKED,
        ExitVerdict::DirtyExit => DIRTY_EXIT,
    }
}

/// Completed housekeeping with failed actions is still `BLOCKED`.
pub fn for_housekeeping(outcome: HousekeepingOutcome, success: bool) -> i32 {
    match outcome {
        HousekeepingOutcome::Completed if success => OK,
        HousekeepingOutcome::Completed
        | HousekeepingOutcome::PreconditionFailed
        | HousekeepingOutcome::ScanAborted => BLOCKED,
        HousekeepingOutcome::Degraded => DEGRADED,
    }
}

pub fn for_error(class: ErrorClass) -> i32 {
    match class {
        ErrorClass::Blocked => BLOCKED,
        ErrorClass::Ambiguous => AMBIGUOUS,
        ErrorClass::Fatal => INVALID,
    }
}
