//! Disjoint command vocabularies for the work-state and system-health domains.
//!
//! Reconciliation accepts only [`WorkCommand`] and drives only [`WorkStateAction`]s;
//! housekeeping accepts only [`HousekeepingCommand`] and drives only
//! [`SystemHealthAction`]s. Both marker traits are sealed, so no action type can
//! be made to belong to the other domain outside this module.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::tiers::{ApprovalToken, Tier1Action, Tier2Action};
use crate::core::types::Stage;

mod sealed {
    pub trait Sealed {}
}

/// An action of the work-state domain (pipeline stages).
pub trait WorkStateAction: sealed::Sealed + fmt::Display {}

/// An action of the system-health domain (cleanup tiers).
pub trait SystemHealthAction: sealed::Sealed + fmt::Display {
    /// Tier of the action (1 = automatic, 2 = approval required).
    fn tier(&self) -> u8;
    /// Key used to look up the configured command for this action.
    fn command_key(&self) -> &'static str;
}

impl sealed::Sealed for Stage {}
impl WorkStateAction for Stage {}

impl sealed::Sealed for Tier1Action {}
impl SystemHealthAction for Tier1Action {
    fn tier(&self) -> u8 {
        1
    }

    fn command_key(&self) -> &'static str {
        self.as_str()
    }
}

impl sealed::Sealed for Tier2Action {}
impl SystemHealthAction for Tier2Action {
    fn tier(&self) -> u8 {
        2
    }

    fn command_key(&self) -> &'static str {
        match self {
            Tier2Action::PruneVolumes => "prune_volumes",
            Tier2Action::RestartService { .. } => "restart_service",
        }
    }
}

/// Validated session identifier (`[A-Za-z0-9._-]`, 1-64 chars, no leading dot).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Err("session id must not be empty".to_string());
        }
        if raw.len() > 64 {
            return Err(format!("session id must be at most 64 chars (got {})", raw.len()));
        }
        if raw.starts_with('.') {
            return Err(format!("session id must not start with '.' (got '{raw}')"));
        }
        if raw
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
        {
            return Err(format!(
                "session id must be [A-Za-z0-9._-] only (got '{raw}')"
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SessionId::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

/// Trigger for the work-state domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkCommand {
    Reconcile { session_id: SessionId },
}

/// Trigger for the system-health domain.
#[derive(Debug)]
pub enum HousekeepingCommand {
    Housekeep { approval: Option<ApprovalToken> },
}
