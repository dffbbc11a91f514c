//! Job, stage and failure status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted but not yet started.
    #[default]
    Pending,
    /// Executing stages.
    Running,
    /// All stages succeeded.
    Completed,
    /// A stage failed or a deadline was exceeded.
    Failed,
    /// Stopped at a stage boundary after a cancel request.
    Cancelled,
}

impl JobStatus {
    /// Returns true once no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The execution status of a single stage within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet reached.
    #[default]
    Pending,
    /// Currently executing.
    Started,
    /// Finished successfully.
    Completed,
    /// Returned an error or timed out.
    Failed,
    /// Stopped itself after the job was cancelled.
    Cancelled,
}

impl StageStatus {
    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A stage returned an error.
    StageError,
    /// A single stage exceeded its deadline.
    StageTimeout,
    /// The whole job exceeded its deadline.
    JobTimeout,
    /// A conditional slot could not be resolved at run time.
    Configuration,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StageError => write!(f, "stage_error"),
            Self::StageTimeout => write!(f, "stage_timeout"),
            Self::JobTimeout => write!(f, "job_timeout"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}
