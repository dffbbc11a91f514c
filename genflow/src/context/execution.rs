//! Mutable per-job execution context.

use super::{JobRequest, StageOutputs};
use crate::cancellation::CancellationToken;
use crate::core::{JobId, Mode};
use crate::errors::OutputConflictError;
use crate::resources::ClientSet;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// State owned by one in-flight executor run.
///
/// Stages read earlier outputs and request fields, use the job's client set
/// and record artifacts. Outputs, cost and duration are written by the
/// executor from each stage's returned `StageOutput`.
#[derive(Debug)]
pub struct ExecutionContext {
    job_id: JobId,
    mode: Mode,
    request: JobRequest,
    outputs: StageOutputs,
    total_cost: f64,
    total_duration: Duration,
    cancel_token: Arc<CancellationToken>,
    clients: Arc<ClientSet>,
    base_image: Option<PathBuf>,
    artifacts: Vec<PathBuf>,
    persisted_artifacts: usize,
}

impl ExecutionContext {
    /// Creates a context for a job.
    #[must_use]
    pub fn new(job_id: JobId, mode: Mode, request: JobRequest, clients: Arc<ClientSet>) -> Self {
        Self {
            job_id,
            mode,
            request,
            outputs: StageOutputs::new(),
            total_cost: 0.0,
            total_duration: Duration::ZERO,
            cancel_token: Arc::new(CancellationToken::new()),
            clients,
            base_image: None,
            artifacts: Vec::new(),
            persisted_artifacts: 0,
        }
    }

    /// Shares an existing cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel_token = token;
        self
    }

    /// Sets the resolved parent artifact for refinement jobs.
    #[must_use]
    pub fn with_base_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_image = Some(path.into());
        self
    }

    /// Returns the job id.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Returns the mode.
    #[must_use]
    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Returns the request.
    #[must_use]
    pub fn request(&self) -> &JobRequest {
        &self.request
    }

    /// Returns the brief, if any.
    #[must_use]
    pub fn brief(&self) -> Option<&str> {
        self.request.brief.as_deref()
    }

    /// Returns the reference image, if any.
    #[must_use]
    pub fn reference_image(&self) -> Option<&Path> {
        self.request.reference_image.as_deref()
    }

    /// Returns the resolved parent artifact, if any.
    #[must_use]
    pub fn base_image(&self) -> Option<&Path> {
        self.base_image.as_deref()
    }

    /// Returns all stage outputs so far.
    #[must_use]
    pub fn outputs(&self) -> &StageOutputs {
        &self.outputs
    }

    /// Returns one stage's output.
    #[must_use]
    pub fn output(&self, stage: &str) -> Option<&Value> {
        self.outputs.get(stage)
    }

    /// Returns the running cost sum.
    #[must_use]
    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    /// Returns the summed stage durations.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    /// Returns the job's client set.
    #[must_use]
    pub fn clients(&self) -> &ClientSet {
        &self.clients
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel_token
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Records an output artifact produced by the current stage.
    pub fn record_artifact(&mut self, path: impl Into<PathBuf>) {
        self.artifacts.push(path.into());
    }

    /// Returns every artifact recorded so far.
    #[must_use]
    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    pub(crate) fn record_output(&mut self, stage: &str, value: Value) -> Result<(), OutputConflictError> {
        self.outputs.insert(stage, value)
    }

    pub(crate) fn add_cost(&mut self, cost: f64) {
        self.total_cost += cost;
    }

    pub(crate) fn add_duration(&mut self, duration: Duration) {
        self.total_duration += duration;
    }

    /// Artifacts recorded since the last call.
    pub(crate) fn take_new_artifacts(&mut self) -> Vec<PathBuf> {
        let fresh = self.artifacts[self.persisted_artifacts..].to_vec();
        self.persisted_artifacts = self.artifacts.len();
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            JobId::new(),
            Mode::from("generation"),
            JobRequest::new().with_brief("hello"),
            Arc::new(ClientSet::new(Mode::from("generation"))),
        )
    }

    #[test]
    fn test_accessors() {
        let ctx = ctx().with_base_image("/tmp/base.png");
        assert_eq!(ctx.mode().as_str(), "generation");
        assert_eq!(ctx.brief(), Some("hello"));
        assert_eq!(ctx.base_image(), Some(Path::new("/tmp/base.png")));
        assert!(ctx.reference_image().is_none());
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_cost_is_raw_running_sum() {
        let mut ctx = ctx();
        ctx.add_cost(0.1);
        ctx.add_cost(0.2);
        assert!((ctx.total_cost() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_record_output_rejects_duplicates() {
        let mut ctx = ctx();
        ctx.record_output("a", json!(1)).unwrap();
        assert!(ctx.record_output("a", json!(2)).is_err());
        assert_eq!(ctx.output("a"), Some(&json!(1)));
    }

    #[test]
    fn test_take_new_artifacts() {
        let mut ctx = ctx();
        ctx.record_artifact("/a.png");
        assert_eq!(ctx.take_new_artifacts(), vec![PathBuf::from("/a.png")]);
        assert!(ctx.take_new_artifacts().is_empty());

        ctx.record_artifact("/b.png");
        assert_eq!(ctx.take_new_artifacts(), vec![PathBuf::from("/b.png")]);
        assert_eq!(ctx.artifacts().len(), 2);
    }

    #[test]
    fn test_shared_cancel_token() {
        let token = Arc::new(CancellationToken::new());
        let ctx = ctx().with_cancel_token(token.clone());
        token.cancel("stop");
        assert!(ctx.is_cancelled());
    }
}
