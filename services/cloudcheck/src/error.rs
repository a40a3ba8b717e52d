//! Error taxonomy for recovery operations.
//!
//! A [`ProblemError`] means "this resolution did not work, here is why" and
//! is meant for the operator. Every other variant is an infrastructure
//! failure passed through with its source chain intact.

use thiserror::Error;

use crate::agent::AgentError;
use crate::cloud::CloudError;
use crate::convergence::ConvergenceError;
use crate::dns::DnsError;
use crate::plan::PlanError;
use crate::templates::TemplateError;

/// Result type for recovery operations.
pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// A recoverable, user-facing resolution failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProblemError {
    message: String,
}

impl ProblemError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors returned by recovery operations.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Problem(#[from] ProblemError),

    #[error("agent error")]
    Agent(#[source] AgentError),

    #[error("cloud error")]
    Cloud(#[from] CloudError),

    #[error("failed to rebuild instance plan")]
    Plan(#[from] PlanError),

    #[error("dns update failed")]
    Dns(#[from] DnsError),

    #[error("rendered templates")]
    Templates(#[from] TemplateError),

    #[error("invalid update config")]
    UpdateConfig(#[from] keel_reconcile::ReconcileError),

    #[error(transparent)]
    Convergence(#[from] ConvergenceError),

    #[error("deployment planning failed")]
    Deployment(#[source] anyhow::Error),

    #[error("instance store")]
    Store(#[source] anyhow::Error),
}

impl From<AgentError> for RecoveryError {
    /// Cancellation is always the operator's business; every other agent
    /// failure stays fatal unless the caller classifies it.
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Cancelled { .. } => problem("Task was cancelled"),
            other => Self::Agent(other),
        }
    }
}

impl RecoveryError {
    pub fn is_problem(&self) -> bool {
        matches!(self, Self::Problem(_))
    }

    pub fn as_problem(&self) -> Option<&ProblemError> {
        match self {
            Self::Problem(problem) => Some(problem),
            _ => None,
        }
    }
}

/// Wrap a message into a problem error.
pub fn problem(message: impl Into<String>) -> RecoveryError {
    RecoveryError::Problem(ProblemError::new(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_id::AgentId;

    #[test]
    fn test_problem_displays_message_only() {
        let err = problem("VM has persistent disk attached");
        assert_eq!(err.to_string(), "VM has persistent disk attached");
        assert!(err.is_problem());
    }

    #[test]
    fn test_cancelled_agent_call_is_a_problem() {
        let err: RecoveryError = AgentError::Cancelled {
            agent_id: AgentId::new(),
        }
        .into();
        assert_eq!(err.as_problem().unwrap().message(), "Task was cancelled");
    }

    #[test]
    fn test_source_message_appears_once_in_chain() {
        let err: RecoveryError = CloudError::Driver {
            method: "reboot_vm",
            source: anyhow::anyhow!("connection refused"),
        }
        .into();

        assert_eq!(err.to_string(), "cloud error");
        assert_eq!(
            format!("{:#}", anyhow::Error::from(err)),
            "cloud error: reboot_vm failed: connection refused"
        );
    }

    #[test]
    fn test_store_error_keeps_source() {
        let err = RecoveryError::Store(anyhow::anyhow!("row locked"));
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(err.to_string(), "instance store");
        assert_eq!(source.to_string(), "row locked");
    }

    #[test]
    fn test_agent_timeout_stays_fatal() {
        let err: RecoveryError = AgentError::Timeout {
            agent_id: AgentId::new(),
            method: "get_state",
            elapsed: std::time::Duration::from_secs(10),
        }
        .into();
        assert!(!err.is_problem());
        assert!(matches!(err, RecoveryError::Agent(_)));
    }
}
