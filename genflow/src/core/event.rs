//! Messages carried by the progress channel.

use super::{FailureKind, JobId, JobStatus, Mode, StageProgress, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// A per-stage status transition.
///
/// Serializes to the wire shape
/// `{ stage_name, stage_order, status, started_at?, completed_at?,
/// duration_seconds?, message, output_summary?, error_message? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Concrete stage name (conditional slots report the resolved stage).
    pub stage_name: String,
    /// Position in the plan.
    pub stage_order: usize,
    /// The transition.
    pub status: StageStatus,
    /// When the stage started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration of the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Human readable message.
    pub message: String,
    /// Small structured payload from the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<Value>,
    /// Error detail for failed stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProgressEvent {
    /// Creates a `started` event stamped now.
    #[must_use]
    pub fn started(stage_name: impl Into<String>, stage_order: usize) -> Self {
        let stage_name = stage_name.into();
        Self {
            message: format!("Running {stage_name}"),
            stage_name,
            stage_order,
            status: StageStatus::Started,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_seconds: None,
            output_summary: None,
            error_message: None,
        }
    }

    /// Creates a `completed` event for a stage that began at `started_at`.
    #[must_use]
    pub fn completed(
        stage_name: impl Into<String>,
        stage_order: usize,
        started_at: DateTime<Utc>,
        duration_seconds: f64,
    ) -> Self {
        let stage_name = stage_name.into();
        Self {
            message: format!("Completed {stage_name}"),
            stage_name,
            stage_order,
            status: StageStatus::Completed,
            started_at: Some(started_at),
            completed_at: Some(Utc::now()),
            duration_seconds: Some(duration_seconds),
            output_summary: None,
            error_message: None,
        }
    }

    /// Creates a `failed` event carrying the error.
    #[must_use]
    pub fn failed(
        stage_name: impl Into<String>,
        stage_order: usize,
        error: impl Into<String>,
    ) -> Self {
        let stage_name = stage_name.into();
        Self {
            message: format!("Failed {stage_name}"),
            stage_name,
            stage_order,
            status: StageStatus::Failed,
            started_at: None,
            completed_at: Some(Utc::now()),
            duration_seconds: None,
            output_summary: None,
            error_message: Some(error.into()),
        }
    }

    /// Creates a `cancelled` event for a stage that stopped on a cancel request.
    #[must_use]
    pub fn cancelled(
        stage_name: impl Into<String>,
        stage_order: usize,
        reason: impl Into<String>,
    ) -> Self {
        let stage_name = stage_name.into();
        Self {
            message: format!("Cancelled {stage_name}"),
            stage_name,
            stage_order,
            status: StageStatus::Cancelled,
            started_at: None,
            completed_at: Some(Utc::now()),
            duration_seconds: None,
            output_summary: None,
            error_message: Some(reason.into()),
        }
    }

    /// Sets the start time and duration.
    #[must_use]
    pub fn with_timing(mut self, started_at: DateTime<Utc>, duration_seconds: f64) -> Self {
        self.started_at = Some(started_at);
        self.duration_seconds = Some(duration_seconds);
        self
    }

    /// Replaces the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Sets the output summary.
    #[must_use]
    pub fn with_summary(mut self, summary: Option<Value>) -> Self {
        self.output_summary = summary;
        self
    }
}

/// Folded state of a job, sent first to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Job id.
    pub job_id: JobId,
    /// Job mode.
    pub mode: Mode,
    /// Current status.
    pub status: JobStatus,
    /// Last known status of every stage reached so far, in plan order.
    pub stages: Vec<StageProgress>,
    /// Raw running cost.
    pub total_cost: f64,
    /// Artifacts recorded so far.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    /// Error message, for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobSnapshot {
    /// Number of stages that completed.
    #[must_use]
    pub fn completed_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .count()
    }
}

/// Final message of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    /// Job id.
    pub job_id: JobId,
    /// Terminal status.
    pub status: JobStatus,
    /// Why the job failed, when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    /// Error message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Raw cost sum.
    pub total_cost: f64,
    /// Cost rounded for reporting.
    pub rounded_cost: f64,
    /// Sum of stage durations.
    pub total_duration_seconds: f64,
    /// Artifacts produced by the job.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    /// When the job finished.
    pub completed_at: DateTime<Utc>,
}

impl TerminalEvent {
    /// Creates a terminal event with no cost or artifacts.
    #[must_use]
    pub fn new(job_id: JobId, status: JobStatus) -> Self {
        Self {
            job_id,
            status,
            failure_kind: None,
            error_message: None,
            total_cost: 0.0,
            rounded_cost: 0.0,
            total_duration_seconds: 0.0,
            artifacts: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    /// Marks the event as a failure.
    #[must_use]
    pub fn with_failure(mut self, kind: FailureKind, error: impl Into<String>) -> Self {
        self.failure_kind = Some(kind);
        self.error_message = Some(error.into());
        self
    }

    /// Sets the error message without a failure kind.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    /// Sets cost totals.
    #[must_use]
    pub fn with_cost(mut self, total_cost: f64) -> Self {
        self.total_cost = total_cost;
        self.rounded_cost = super::round_cost(total_cost);
        self
    }

    /// Sets the accumulated stage duration.
    #[must_use]
    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.total_duration_seconds = seconds;
        self
    }

    /// Sets the artifacts.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<PathBuf>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// A message delivered to progress subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressMessage {
    /// Current state, always the first message of a subscription.
    Snapshot(JobSnapshot),
    /// A live stage transition.
    Stage(ProgressEvent),
    /// The job finished; no further messages follow.
    Terminal(TerminalEvent),
}

impl ProgressMessage {
    /// Returns true for the terminal message.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    /// Returns the stage event, if this is one.
    #[must_use]
    pub fn as_stage(&self) -> Option<&ProgressEvent> {
        match self {
            Self::Stage(event) => Some(event),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_started_event_wire_shape() {
        let event = ProgressEvent::started("load_base_image", 0);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["stage_name"], "load_base_image");
        assert_eq!(json["stage_order"], 0);
        assert_eq!(json["status"], "started");
        assert!(json.get("started_at").is_some());
        assert!(json.get("completed_at").is_none());
        assert!(json.get("error_message").is_none());
    }

    #[test]
    fn test_failed_event_carries_error() {
        let event = ProgressEvent::failed("caption", 2, "boom");
        assert_eq!(event.status, StageStatus::Failed);
        assert_eq!(event.error_message.as_deref(), Some("boom"));
        assert!(event.completed_at.is_some());
    }

    #[test]
    fn test_completed_event_with_summary() {
        let started = Utc::now();
        let event = ProgressEvent::completed("caption", 1, started, 0.5)
            .with_summary(Some(json!({"words": 12})));
        assert_eq!(event.duration_seconds, Some(0.5));
        assert_eq!(event.output_summary, Some(json!({"words": 12})));
    }

    #[test]
    fn test_message_is_tagged() {
        let msg = ProgressMessage::Stage(ProgressEvent::started("a", 0));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "stage");
        assert_eq!(json["stage_name"], "a");

        let terminal = ProgressMessage::Terminal(TerminalEvent::new(JobId::new(), JobStatus::Completed));
        assert!(terminal.is_terminal());
        assert!(terminal.as_stage().is_none());
    }

    #[test]
    fn test_terminal_rounds_cost() {
        let event = TerminalEvent::new(JobId::new(), JobStatus::Completed).with_cost(0.123_456_7);
        assert!((event.total_cost - 0.123_456_7).abs() < 1e-12);
        assert!((event.rounded_cost - 0.1235).abs() < 1e-12);
    }
}
