//! Error types for graph validation, step execution and orchestration.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::adapters::{GatewayError, RepositoryError};
use crate::domain::ManifestFrozen;

use super::ledger::LedgerError;
use super::run_store::StoreError;

/// Step graph validation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Step '{0}' is already registered")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("Step graph is finalized; no more steps can be registered")]
    AlreadyFinalized,
}

/// Why a single step attempt failed
#[derive(Debug, Error)]
pub enum StepError {
    /// Bad input or a rejected transition; never retried
    #[error("validation failed: {0}")]
    Validation(String),

    /// Network or transport failure; retried with backoff
    #[error("transient failure: {0}")]
    Transient(String),

    /// Existing state contradicts the expected result; needs a human
    #[error("conflict: {0}")]
    Conflict(String),

    /// A published workflow did not finish in time
    #[error("workflow '{workflow}' timed out after {elapsed:?}")]
    Timeout { workflow: String, elapsed: Duration },

    /// An external workflow reported failure
    #[error("external workflow failed: {0}")]
    External(String),
}

impl StepError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<RepositoryError> for StepError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Transport(_) | RepositoryError::Io(_) | RepositoryError::CommandFailed { .. } => {
                Self::Transient(err.to_string())
            }
            RepositoryError::Conflict { .. }
            | RepositoryError::TagAlreadyExists { .. }
            | RepositoryError::BranchAlreadyExists { .. } => Self::Conflict(err.to_string()),
            RepositoryError::NotFound(_) => Self::Validation(err.to_string()),
        }
    }
}

impl From<GatewayError> for StepError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Timeout { workflow, elapsed } => Self::Timeout { workflow, elapsed },
            GatewayError::WorkflowFailed { .. } => Self::External(err.to_string()),
            GatewayError::Transport(_) | GatewayError::UnexpectedResponse { .. } => {
                Self::Transient(err.to_string())
            }
            GatewayError::UnknownWorkflow(_) => Self::Validation(err.to_string()),
        }
    }
}

impl From<LedgerError> for StepError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Io(_) | LedgerError::Serialization(_) => Self::Transient(err.to_string()),
            _ => Self::Validation(err.to_string()),
        }
    }
}

impl From<ManifestFrozen> for StepError {
    fn from(err: ManifestFrozen) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Orchestrator-level errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("An unfinished release run ({run_id}) already exists for branch '{branch}'")]
    ActiveRunExists { branch: String, run_id: Uuid },

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Step '{0}' is not part of the release graph")]
    UnknownStep(String),

    #[error("Step graph must be finalized before starting a run")]
    GraphNotFinalized,

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_path() {
        let err = GraphError::CycleDetected {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(StepError::Transient("reset".into()).is_retryable());
        assert!(!StepError::Validation("bad".into()).is_retryable());
        assert!(!StepError::Conflict("tag".into()).is_retryable());
        assert!(!StepError::Timeout {
            workflow: "release".into(),
            elapsed: Duration::from_secs(1)
        }
        .is_retryable());
    }

    #[test]
    fn test_repository_error_classification() {
        let transport: StepError = RepositoryError::Transport("connection reset".into()).into();
        assert!(transport.is_retryable());

        let conflict: StepError = RepositoryError::Conflict {
            commit: "abc".into(),
            details: "CONFLICT (content)".into(),
        }
        .into();
        assert!(matches!(conflict, StepError::Conflict(_)));
    }
}
