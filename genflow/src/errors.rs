//! Error types for the genflow engine.
//!
//! Configuration-class errors (`UnknownMode`, plan validation, unresolved
//! conditional stages, missing parents) are returned synchronously to the
//! submitter. Run-time errors are folded into the job record and the progress
//! channel instead of crossing the task boundary.

use crate::core::{JobId, Mode};
use crate::extract::ExtractionStrategy;
use crate::lineage::ParentRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The main error type for genflow operations.
#[derive(Debug, Error)]
pub enum GenflowError {
    /// The requested mode has no stage plan.
    #[error("Unknown mode: '{0}'")]
    UnknownMode(String),

    /// A conditional slot selected a stage that is not registered.
    #[error("{0}")]
    UnresolvedConditionalStage(#[from] UnresolvedConditionalStageError),

    /// A stage plan failed validation against the registry.
    #[error("{0}")]
    PlanValidation(#[from] PlanValidationError),

    /// A stage failed while executing.
    #[error("Stage '{stage}' failed: {message}")]
    StageExecution {
        /// The stage name.
        stage: String,
        /// The underlying failure.
        message: String,
    },

    /// A stage or a whole job exceeded its deadline.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),

    /// The job was cancelled cooperatively.
    #[error("Job cancelled: {0}")]
    Cancelled(String),

    /// A refinement referenced a parent that cannot be resolved.
    #[error("{0}")]
    ParentNotFound(#[from] ParentNotFoundError),

    /// Structured output could not be recovered from model text.
    #[error("{0}")]
    JsonExtraction(#[from] JsonExtractionError),

    /// No job record exists for the id.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// A mode's client set could not be constructed at startup.
    #[error("Failed to initialize clients for mode '{mode}': {source}")]
    ResourceInit {
        /// The mode whose clients failed.
        mode: Mode,
        /// The factory error.
        #[source]
        source: anyhow::Error,
    },

    /// The job store rejected an operation.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Invalid engine configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GenflowError {
    /// Returns true for errors that reject a request before any job exists.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownMode(_)
                | Self::UnresolvedConditionalStage(_)
                | Self::PlanValidation(_)
                | Self::ParentNotFound(_)
                | Self::Config(_)
        )
    }
}

/// Diagnostic details attached to a plan validation failure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PlanIssue {
    /// Error code (e.g., "PLAN-UNREGISTERED-STAGE").
    pub code: String,
    /// Short summary of the problem.
    pub summary: String,
    /// Hint for fixing the problem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
    /// Stages involved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<String>,
}

impl PlanIssue {
    /// Creates a new issue.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            stages: Vec::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds an involved stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stages.push(stage.into());
        self
    }
}

/// Error raised when a mode's plan is inconsistent with the stage registry.
#[derive(Debug, Clone, Error)]
#[error("Invalid plan for mode '{mode}': {}", issue.summary)]
pub struct PlanValidationError {
    /// The mode whose plan is invalid.
    pub mode: String,
    /// What went wrong.
    pub issue: PlanIssue,
}

impl PlanValidationError {
    /// Creates a new plan validation error.
    #[must_use]
    pub fn new(mode: impl Into<String>, issue: PlanIssue) -> Self {
        Self {
            mode: mode.into(),
            issue,
        }
    }

    /// Returns the diagnostic code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.issue.code
    }
}

/// Error raised when a conditional slot cannot be turned into a registered stage.
#[derive(Debug, Clone, Error)]
#[error("Conditional slot {slot_order} of mode '{mode}' could not be resolved: {reason}")]
pub struct UnresolvedConditionalStageError {
    /// The mode being executed.
    pub mode: String,
    /// Position of the conditional slot in the plan.
    pub slot_order: usize,
    /// The stage name the resolver produced, if any.
    pub selected: Option<String>,
    /// Why resolution failed.
    pub reason: String,
}

/// Which deadline was exceeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum TimeoutScope {
    /// A single stage call.
    Stage {
        /// The stage name.
        name: String,
    },
    /// The whole job run.
    Job,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage { name } => write!(f, "stage '{name}'"),
            Self::Job => write!(f, "job"),
        }
    }
}

/// Error raised when a deadline is exceeded.
#[derive(Debug, Clone, Error)]
#[error("Timeout: {scope} exceeded {limit_seconds:.1}s")]
pub struct TimeoutError {
    /// What timed out.
    pub scope: TimeoutScope,
    /// The limit that was exceeded.
    pub limit_seconds: f64,
}

/// Error raised when a refinement parent cannot be resolved to an artifact.
#[derive(Debug, Clone, Error)]
#[error("Parent not found ({parent}): {reason}")]
pub struct ParentNotFoundError {
    /// The reference that failed to resolve.
    pub parent: ParentRef,
    /// Why it failed.
    pub reason: String,
}

impl ParentNotFoundError {
    /// Creates a new parent-not-found error.
    #[must_use]
    pub fn new(parent: ParentRef, reason: impl Into<String>) -> Self {
        Self {
            parent,
            reason: reason.into(),
        }
    }
}

/// Error raised when no extraction strategy recovers an acceptable value.
#[derive(Debug, Clone, Error)]
#[error(
    "Failed to extract structured output (expected {expected}; tried {}): {preview}",
    attempted.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
)]
pub struct JsonExtractionError {
    /// Truncated original text.
    pub preview: String,
    /// Strategies attempted, in order.
    pub attempted: Vec<ExtractionStrategy>,
    /// Description of the expected shape.
    pub expected: String,
    /// Extra detail, e.g. a typed deserialization failure.
    pub reason: Option<String>,
}

/// Error raised when writing a second output under the same stage name.
#[derive(Debug, Clone, Error)]
#[error("Output conflict: stage '{stage}' already recorded an output")]
pub struct OutputConflictError {
    /// The stage name.
    pub stage: String,
}

impl OutputConflictError {
    /// Creates a new output conflict error.
    #[must_use]
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
        }
    }
}

/// Errors returned by a stage unit.
#[derive(Debug, Error)]
pub enum StageError {
    /// Generic failure with a message.
    #[error("{0}")]
    Failed(String),

    /// The external model call failed.
    #[error("Model call failed: {0}")]
    Model(#[from] ModelError),

    /// Structured output could not be extracted.
    #[error("{0}")]
    Extraction(#[from] JsonExtractionError),

    /// A required input was not present in the context.
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// The job's client set has no client with this name.
    #[error("Client not configured: {0}")]
    MissingClient(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The stage observed cancellation and stopped early.
    #[error("Stage cancelled")]
    Cancelled,
}

impl StageError {
    /// Creates a generic failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors returned by an external model client.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// Network or connection failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Provider asked the caller to slow down.
    #[error("Rate limited by provider")]
    RateLimited {
        /// Suggested wait, if the provider sent one.
        retry_after_seconds: Option<f64>,
    },

    /// Provider refused the request (policy, validation).
    #[error("Provider rejected request: {0}")]
    Rejected(String),

    /// Provider answered with something unusable.
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ModelError {
    /// Returns true if a retry may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited { .. })
    }
}

/// Errors returned by `JobScheduler::cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    /// No job with this id.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// The job already reached a terminal state.
    #[error("Job {0} already finished")]
    AlreadyTerminal(JobId),
}

/// Errors returned by a job store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No record with this id.
    #[error("Job record not found: {0}")]
    NotFound(JobId),

    /// A record with this id already exists.
    #[error("Job record already exists: {0}")]
    Duplicate(JobId),
}

/// Errors returned by the lineage tracker.
#[derive(Debug, Clone, Error)]
pub enum LineageError {
    /// The parent reference does not resolve.
    #[error("{0}")]
    ParentNotFound(#[from] ParentNotFoundError),

    /// The child already has a lineage record.
    #[error("Job {0} already has a registered parent")]
    AlreadyRegistered(JobId),
}

impl From<LineageError> for GenflowError {
    fn from(err: LineageError) -> Self {
        match err {
            LineageError::ParentNotFound(e) => Self::ParentNotFound(e),
            LineageError::AlreadyRegistered(id) => {
                Self::Config(format!("Job {id} already has a registered parent"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_issue_builder() {
        let issue = PlanIssue::new("PLAN-TEST", "Test issue")
            .with_fix_hint("Fix it")
            .with_stage("a");

        assert_eq!(issue.code, "PLAN-TEST");
        assert_eq!(issue.fix_hint.as_deref(), Some("Fix it"));
        assert_eq!(issue.stages, vec!["a".to_string()]);
    }

    #[test]
    fn test_plan_validation_error_message() {
        let err = PlanValidationError::new("refinement", PlanIssue::new("PLAN-X", "broken"));
        assert_eq!(err.code(), "PLAN-X");
        assert!(err.to_string().contains("refinement"));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_timeout_error_display() {
        let err = TimeoutError {
            scope: TimeoutScope::Stage {
                name: "caption".to_string(),
            },
            limit_seconds: 2.0,
        };
        assert_eq!(err.to_string(), "Timeout: stage 'caption' exceeded 2.0s");

        let err = TimeoutError {
            scope: TimeoutScope::Job,
            limit_seconds: 30.0,
        };
        assert!(err.to_string().contains("job"));
    }

    #[test]
    fn test_model_error_retryable() {
        assert!(ModelError::Transport("reset".into()).is_retryable());
        assert!(ModelError::RateLimited {
            retry_after_seconds: None
        }
        .is_retryable());
        assert!(!ModelError::Rejected("policy".into()).is_retryable());
        assert!(!ModelError::InvalidResponse("empty".into()).is_retryable());
    }

    #[test]
    fn test_extraction_error_lists_strategies() {
        let err = JsonExtractionError {
            preview: "no json".to_string(),
            attempted: vec![
                ExtractionStrategy::FencedBlock,
                ExtractionStrategy::BracketRepair,
            ],
            expected: "object".to_string(),
            reason: None,
        };
        let text = err.to_string();
        assert!(text.contains("fenced_block, bracket_repair"));
        assert!(text.contains("no json"));
    }

    #[test]
    fn test_configuration_classification() {
        assert!(GenflowError::UnknownMode("x".into()).is_configuration());
        assert!(!GenflowError::Cancelled("stop".into()).is_configuration());
        assert!(!GenflowError::JobNotFound(JobId::new()).is_configuration());
    }

    #[test]
    fn test_stage_error_from_model_error() {
        let err: StageError = ModelError::Rejected("nsfw".into()).into();
        assert!(matches!(err, StageError::Model(_)));
        assert!(err.to_string().contains("nsfw"));
    }
}
