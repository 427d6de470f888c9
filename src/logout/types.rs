//! Logout triggers, per-target steps and aggregate outcomes.

use serde::{Deserialize, Serialize};

use crate::tgt::TicketId;

/// Who changed authentication state; attached to log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorityKind {
    AuthenticationMethod,
    Requestor,
    TgtStore,
    Administrator,
    RemoteAuthority,
}

impl std::fmt::Display for AuthorityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorityKind::AuthenticationMethod => write!(f, "authn_method"),
            AuthorityKind::Requestor => write!(f, "requestor"),
            AuthorityKind::TgtStore => write!(f, "tgt_store"),
            AuthorityKind::Administrator => write!(f, "administrator"),
            AuthorityKind::RemoteAuthority => write!(f, "remote_authority"),
        }
    }
}

/// Event that started a logout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogoutTrigger {
    /// The user logged out at a requestor.
    Explicit { requestor: String },
    /// An administrator ended the session.
    Administrative,
    /// A remote authority told us its session ended.
    RemoteNotification { authority: String },
}

impl LogoutTrigger {
    pub fn authority_kind(&self) -> AuthorityKind {
        match self {
            LogoutTrigger::Explicit { .. } => AuthorityKind::Requestor,
            LogoutTrigger::Administrative => AuthorityKind::Administrator,
            LogoutTrigger::RemoteNotification { .. } => AuthorityKind::RemoteAuthority,
        }
    }

    /// The party that initiated the logout and needs no call back.
    pub fn initiator(&self) -> Option<&str> {
        match self {
            LogoutTrigger::Explicit { requestor } => Some(requestor.as_str()),
            LogoutTrigger::Administrative => None,
            LogoutTrigger::RemoteNotification { authority } => Some(authority.as_str()),
        }
    }
}

/// Result of ending one party's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Remote logout call succeeded.
    Completed,
    /// No remote step; the session ended with the ticket.
    Local,
    /// The party initiated the logout itself.
    Skipped,
    /// Remote logout call failed.
    Failed(String),
    /// Remote logout call did not finish in time.
    TimedOut,
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Local | StepStatus::Skipped
        )
    }
}

/// One party touched by a logout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoutStep {
    /// Method or requestor id.
    pub target: String,
    pub kind: AuthorityKind,
    pub status: StepStatus,
}

/// Aggregate result of a logout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogoutOutcome {
    /// Every session ended (or there was nothing remote to end).
    Success,
    /// Some remote sessions ended, others are orphaned.
    PartialFailure,
    /// No remote session could be ended.
    Failure,
}

impl LogoutOutcome {
    /// Fold step results: all succeeded (or none), all failed, or mixed.
    pub fn aggregate(steps: &[LogoutStep]) -> Self {
        let failed = steps.iter().filter(|s| !s.status.is_success()).count();
        if failed == 0 {
            LogoutOutcome::Success
        } else if failed == steps.len() {
            LogoutOutcome::Failure
        } else {
            LogoutOutcome::PartialFailure
        }
    }
}

impl std::fmt::Display for LogoutOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogoutOutcome::Success => write!(f, "success"),
            LogoutOutcome::PartialFailure => write!(f, "partial_failure"),
            LogoutOutcome::Failure => write!(f, "failure"),
        }
    }
}

/// Everything a caller needs to decide how to present a logout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutReport {
    pub ticket: TicketId,
    pub user_id: String,
    pub trigger: LogoutTrigger,
    pub outcome: LogoutOutcome,
    pub steps: Vec<LogoutStep>,
}

impl LogoutReport {
    /// Targets whose sessions may still be alive.
    pub fn failed_targets(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| !s.status.is_success())
            .map(|s| s.target.as_str())
            .collect()
    }
}
