//! Detached job execution.
//!
//! `submit` validates the request, creates the job record and spawns the
//! executor run as a tokio task. It never waits for a stage.

use super::{JobFilter, JobStore};
use crate::cancellation::CancellationToken;
use crate::context::{ExecutionContext, JobRequest};
use crate::core::{JobId, JobRecord, Mode};
use crate::errors::{CancelError, GenflowError};
use crate::lineage::{LineageTracker, ParentRef};
use crate::pipeline::{PipelineExecutor, PlanResolver};
use crate::progress::{ProgressChannel, ProgressSubscription};
use crate::resources::ResourcePool;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Accepts jobs and manages their lifecycle.
#[derive(Debug, Clone)]
pub struct JobScheduler {
    resolver: Arc<PlanResolver>,
    pool: Arc<ResourcePool>,
    store: Arc<dyn JobStore>,
    channel: Arc<ProgressChannel>,
    lineage: Arc<LineageTracker>,
    executor: PipelineExecutor,
    active: Arc<DashMap<JobId, Arc<CancellationToken>>>,
}

impl JobScheduler {
    /// Creates a scheduler from its collaborators.
    #[must_use]
    pub fn new(
        resolver: Arc<PlanResolver>,
        pool: Arc<ResourcePool>,
        store: Arc<dyn JobStore>,
        channel: Arc<ProgressChannel>,
        lineage: Arc<LineageTracker>,
    ) -> Self {
        let executor = PipelineExecutor::new(store.clone(), channel.clone());
        Self {
            resolver,
            pool,
            store,
            channel,
            lineage,
            executor,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Submits a job and returns its id once the run is scheduled.
    ///
    /// # Errors
    ///
    /// Configuration-class errors reject the request before any record
    /// exists: `UnknownMode`, `UnresolvedConditionalStage` when the
    /// conditional slot cannot be resolved from the request, `ParentNotFound`
    /// for a refinement whose parent does not resolve, and `Config` if the
    /// mode has no client set.
    pub async fn submit(&self, mode: &str, request: JobRequest) -> Result<JobId, GenflowError> {
        let plan = self.resolver.resolve(mode)?;
        plan.preflight(&request)?;
        let clients = self
            .pool
            .get(mode)
            .ok_or_else(|| GenflowError::Config(format!("no client set for mode '{mode}'")))?;

        let job_id = JobId::new();
        let mode = plan.mode().clone();
        let base_image = match &request.parent {
            Some(parent) => Some(self.lineage.register(job_id, parent).await?.base_artifact),
            None => None,
        };

        let mut record = JobRecord::new(job_id, mode.clone());
        if let Some(parent) = request.parent {
            record = record.with_parent(parent);
        }
        if let Err(err) = self.store.insert(record).await {
            self.lineage.forget(job_id);
            return Err(err.into());
        }

        let token = Arc::new(CancellationToken::new());
        let mut ctx = ExecutionContext::new(job_id, mode.clone(), request, clients)
            .with_cancel_token(token.clone());
        if let Some(path) = base_image {
            ctx = ctx.with_base_image(path);
        }

        self.channel.open(job_id);
        self.active.insert(job_id, token);

        let executor = self.executor.clone();
        let active = self.active.clone();
        let span = info_span!("job", job_id = %job_id, mode = %mode);
        tokio::spawn(
            async move {
                let outcome = executor.run(&plan, ctx).await;
                active.remove(&job_id);
                outcome.status
            }
            .instrument(span),
        );

        info!(job_id = %job_id, mode = %mode, "Job submitted");
        Ok(job_id)
    }

    /// Submits a refinement of `parent`.
    ///
    /// # Errors
    ///
    /// Same as [`submit`](Self::submit).
    pub async fn submit_refinement(
        &self,
        mode: &str,
        parent: ParentRef,
        request: JobRequest,
    ) -> Result<JobId, GenflowError> {
        self.submit(mode, request.with_parent(parent)).await
    }

    /// Requests cooperative cancellation; the run stops at the next stage
    /// boundary.
    ///
    /// # Errors
    ///
    /// Returns `CancelError::NotFound` for unknown jobs and
    /// `CancelError::AlreadyTerminal` for finished ones.
    pub async fn cancel(&self, job_id: JobId) -> Result<(), CancelError> {
        let record = self.store.get(job_id).await.ok_or(CancelError::NotFound(job_id))?;
        if record.is_terminal() {
            return Err(CancelError::AlreadyTerminal(job_id));
        }
        let token = self.active.get(&job_id).map(|entry| entry.value().clone());
        let Some(token) = token else {
            // The run may have finished since the record was read.
            return match self.store.get(job_id).await {
                Some(record) if record.is_terminal() => Err(CancelError::AlreadyTerminal(job_id)),
                _ => Err(CancelError::NotFound(job_id)),
            };
        };
        if token.cancel("cancelled by request") {
            info!(job_id = %job_id, "Cancellation requested");
        }
        Ok(())
    }

    /// Returns the current job record.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::JobNotFound` for unknown jobs.
    pub async fn status(&self, job_id: JobId) -> Result<JobRecord, GenflowError> {
        self.store.get(job_id).await.ok_or(GenflowError::JobNotFound(job_id))
    }

    /// Subscribes to a job's progress.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::JobNotFound` for unknown jobs.
    pub async fn subscribe(&self, job_id: JobId) -> Result<ProgressSubscription, GenflowError> {
        self.channel.subscribe(job_id).await
    }

    /// Waits for a job to finish and returns its final record.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::JobNotFound` for unknown jobs.
    pub async fn wait(&self, job_id: JobId) -> Result<JobRecord, GenflowError> {
        let mut subscription = self.channel.subscribe(job_id).await?;
        while subscription.next().await.is_some() {}
        self.status(job_id).await
    }

    /// Lists job records, newest first.
    pub async fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        self.store.list(filter).await
    }

    /// Ids of jobs whose run has not finished.
    #[must_use]
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    /// The lineage tracker of this scheduler.
    #[must_use]
    pub fn lineage(&self) -> &LineageTracker {
        &self.lineage
    }

    /// Modes this scheduler accepts.
    #[must_use]
    pub fn modes(&self) -> Vec<Mode> {
        self.resolver.modes().cloned().collect()
    }

    /// Cancels every active job and waits up to `grace` for them to stop.
    ///
    /// Returns the number of jobs still running when the grace period ended.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let tokens: Vec<_> = self.active.iter().map(|entry| entry.value().clone()).collect();
        info!(jobs = tokens.len(), grace_ms = grace.as_millis() as u64, "Shutting down scheduler");
        for token in tokens {
            token.cancel("scheduler shutdown");
        }

        let deadline = Instant::now().checked_add(grace);
        while !self.active.is_empty() && deadline.map_or(true, |d| Instant::now() < d) {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        let remaining = self.active.len();
        if remaining > 0 {
            warn!(remaining, "Jobs still running after shutdown grace period");
        }
        remaining
    }
}
