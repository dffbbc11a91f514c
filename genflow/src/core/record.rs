//! The persisted job record.

use super::{
    FailureKind, JobId, JobSnapshot, JobStatus, Mode, ProgressEvent, StageStatus, TerminalEvent,
};
use crate::lineage::ParentRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Rounds a cost to 4 decimal places for reporting.
#[must_use]
pub fn round_cost(cost: f64) -> f64 {
    (cost * 10_000.0).round() / 10_000.0
}

/// Last known state of one stage, folded from its progress events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    /// Concrete stage name.
    pub name: String,
    /// Position in the plan.
    pub order: usize,
    /// Latest status.
    pub status: StageStatus,
    /// When the stage started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Stage duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Latest message.
    pub message: String,
    /// Error detail, if the stage failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StageProgress {
    fn from_event(event: &ProgressEvent) -> Self {
        let mut progress = Self {
            name: event.stage_name.clone(),
            order: event.stage_order,
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            message: String::new(),
            error_message: None,
        };
        progress.apply(event);
        progress
    }

    fn apply(&mut self, event: &ProgressEvent) {
        self.status = event.status;
        self.message.clone_from(&event.message);
        if event.started_at.is_some() {
            self.started_at = event.started_at;
        }
        if event.completed_at.is_some() {
            self.completed_at = event.completed_at;
        }
        if event.duration_seconds.is_some() {
            self.duration_seconds = event.duration_seconds;
        }
        if event.error_message.is_some() {
            self.error_message.clone_from(&event.error_message);
        }
    }
}

/// A job as seen by status pages and history lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id.
    pub id: JobId,
    /// Job mode.
    pub mode: Mode,
    /// Lifecycle status.
    pub status: JobStatus,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// When the executor picked the job up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Raw running cost sum.
    pub total_cost: f64,
    /// Sum of stage durations, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_seconds: Option<f64>,
    /// Error message, for failed or cancelled jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Failure classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    /// Output artifact paths, in production order.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    /// Per-stage folded progress, in plan order.
    #[serde(default)]
    pub stages: Vec<StageProgress>,
    /// The refined parent, for refinement jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
}

impl JobRecord {
    /// Creates a pending record.
    #[must_use]
    pub fn new(id: JobId, mode: Mode) -> Self {
        Self {
            id,
            mode,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_cost: 0.0,
            total_duration_seconds: None,
            error_message: None,
            failure_kind: None,
            artifacts: Vec::new(),
            stages: Vec::new(),
            parent: None,
        }
    }

    /// Sets the parent reference.
    #[must_use]
    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Returns true once the job has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the first artifact, if any.
    #[must_use]
    pub fn primary_artifact(&self) -> Option<&PathBuf> {
        self.artifacts.first()
    }

    /// Moves the record to `Running`.
    pub fn mark_running(&mut self) {
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Running;
            self.started_at = Some(Utc::now());
        }
    }

    /// Folds a stage event into the per-stage progress.
    pub fn apply_stage_event(&mut self, event: &ProgressEvent) {
        match self
            .stages
            .iter_mut()
            .find(|s| s.order == event.stage_order && s.name == event.stage_name)
        {
            Some(progress) => progress.apply(event),
            None => {
                self.stages.push(StageProgress::from_event(event));
                self.stages.sort_by_key(|s| s.order);
            }
        }
    }

    /// Appends artifacts that are not yet recorded.
    pub fn add_artifacts(&mut self, artifacts: &[PathBuf]) {
        for path in artifacts {
            if !self.artifacts.contains(path) {
                self.artifacts.push(path.clone());
            }
        }
    }

    /// Applies the terminal transition. Later calls are ignored.
    pub fn finalize(&mut self, terminal: &TerminalEvent) {
        if self.is_terminal() {
            return;
        }
        self.status = terminal.status;
        self.completed_at = Some(terminal.completed_at);
        self.total_cost = terminal.total_cost;
        self.total_duration_seconds = Some(terminal.total_duration_seconds);
        self.error_message.clone_from(&terminal.error_message);
        self.failure_kind = terminal.failure_kind;
        self.add_artifacts(&terminal.artifacts);
    }

    /// Cost rounded to 4 decimal places.
    #[must_use]
    pub fn cost_report(&self) -> f64 {
        round_cost(self.total_cost)
    }

    /// Builds the snapshot sent to subscribers.
    #[must_use]
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id,
            mode: self.mode.clone(),
            status: self.status,
            stages: self.stages.clone(),
            total_cost: self.total_cost,
            artifacts: self.artifacts.clone(),
            error_message: self.error_message.clone(),
        }
    }
}
