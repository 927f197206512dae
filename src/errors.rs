//! Typed error hierarchy for bizimatch.
//!
//! - `StageError`: what a stage executor reports; drives retry policy
//! - `AiError`: failures of the text-generation service
//! - `StoreError`: run persistence failures
//! - `OrchestratorError`: what callers of the orchestrator see

use thiserror::Error;

use crate::pipeline::models::{RunId, RunStatus};

/// Errors from a single stage attempt.
#[derive(Debug, Error)]
pub enum StageError {
    /// Required prior-stage output is missing or invalid. Fatal, never retried.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Transient failure (upstream timeout, rate limit, failing test run). Retried.
    #[error("Execution failed: {0}")]
    Execution(String),
}

impl StageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(_))
    }
}

/// Errors from the AI text-generation service.
#[derive(Debug, Error)]
pub enum AiError {
    #[error("Anthropic API key is required")]
    MissingApiKey,

    #[error("AI request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("AI service rate limited the request")]
    RateLimited,

    #[error("AI service returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("AI request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("AI service returned no text content")]
    EmptyResponse,
}

impl From<AiError> for StageError {
    /// A missing key cannot fix itself between attempts; everything else is transient.
    fn from(err: AiError) -> Self {
        match err {
            AiError::MissingApiKey => StageError::Precondition(err.to_string()),
            _ => StageError::Execution(err.to_string()),
        }
    }
}

/// Errors from the run store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not complete the operation. Worth retrying.
    #[error("Store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    /// Another writer persisted a newer version first.
    #[error("Run {run_id} version conflict: expected {expected}, found {found}")]
    VersionConflict {
        run_id: RunId,
        expected: u64,
        found: u64,
    },

    #[error("Run {0} not found")]
    NotFound(RunId),

    #[error("Corrupt run record: {0}")]
    Corrupt(String),
}

/// Errors surfaced by the orchestrator to its callers.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Pipeline run {run_id} not found")]
    RunNotFound { run_id: RunId },

    #[error("Prompt must not be empty")]
    EmptyPrompt,

    #[error("Run {run_id} is not awaiting approval (status: {status})")]
    NotAwaitingApproval { run_id: RunId, status: RunStatus },

    #[error("Run {run_id} is already {status}")]
    AlreadyTerminal { run_id: RunId, status: RunStatus },

    #[error("Failed to persist run {run_id}: {source}")]
    Persistence {
        run_id: RunId,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_retryability() {
        assert!(StageError::Execution("timeout".into()).is_retryable());
        assert!(!StageError::Precondition("no prd".into()).is_retryable());
    }

    #[test]
    fn ai_error_converts_to_execution_error() {
        let err: StageError = AiError::RateLimited.into();
        match &err {
            StageError::Execution(msg) => assert!(msg.contains("rate limited")),
            _ => panic!("Expected Execution"),
        }
        let err: StageError = AiError::Timeout { secs: 30 }.into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("30s"));

        let err: StageError = AiError::MissingApiKey.into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn store_error_conflict_carries_versions() {
        let err = StoreError::VersionConflict {
            run_id: "r1".into(),
            expected: 3,
            found: 4,
        };
        match &err {
            StoreError::VersionConflict { expected, found, .. } => {
                assert_eq!(*expected, 3);
                assert_eq!(*found, 4);
            }
            _ => panic!("Expected VersionConflict"),
        }
        assert!(err.to_string().contains("r1"));
    }

    #[test]
    fn orchestrator_error_messages_carry_status() {
        let err = OrchestratorError::AlreadyTerminal {
            run_id: "r9".into(),
            status: RunStatus::Cancelled,
        };
        assert_eq!(err.to_string(), "Run r9 is already cancelled");

        let err = OrchestratorError::NotAwaitingApproval {
            run_id: "r9".into(),
            status: RunStatus::Running,
        };
        assert!(err.to_string().contains("running"));
    }

    #[test]
    fn persistence_error_exposes_source() {
        use std::error::Error as _;
        let err = OrchestratorError::Persistence {
            run_id: "r1".into(),
            source: StoreError::Unavailable(anyhow::anyhow!("disk full")),
        };
        let source = err.source().expect("source");
        assert!(source.to_string().contains("disk full"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StageError::Execution("x".into()));
        assert_std_error(&AiError::EmptyResponse);
        assert_std_error(&StoreError::Corrupt("x".into()));
        assert_std_error(&OrchestratorError::EmptyPrompt);
    }
}
