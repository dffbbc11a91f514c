//! Sequential execution of one job's stage plan.

use super::plan::StagePlan;
use crate::context::ExecutionContext;
use crate::core::{FailureKind, JobId, JobStatus, ProgressEvent, StageOutput, TerminalEvent};
use crate::errors::{GenflowError, StageError, TimeoutError, TimeoutScope};
use crate::progress::ProgressChannel;
use crate::scheduler::JobStore;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// How a run ended.
#[derive(Debug)]
pub struct RunOutcome {
    /// Terminal status.
    pub status: JobStatus,
    /// Failure classification for failed runs.
    pub failure_kind: Option<FailureKind>,
    /// The error that ended the run, if any.
    pub error: Option<GenflowError>,
    /// The context with every output recorded before the run ended.
    pub context: ExecutionContext,
}

impl RunOutcome {
    /// Returns true if every stage completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

enum Exit {
    Completed,
    Cancelled(String),
    Failed(FailureKind, GenflowError),
}

/// Drives stage plans, publishing progress and folding state into job records.
///
/// Stages run strictly one at a time. Cancellation is checked before every
/// stage; the first failure or timeout ends the run. The executor never
/// retries.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    store: Arc<dyn JobStore>,
    channel: Arc<ProgressChannel>,
}

impl PipelineExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, channel: Arc<ProgressChannel>) -> Self {
        Self { store, channel }
    }

    /// Runs `plan` against `ctx` to a terminal state.
    ///
    /// Run-time failures end up in the outcome, the job record and the
    /// progress channel; this method itself does not fail.
    pub async fn run(&self, plan: &StagePlan, mut ctx: ExecutionContext) -> RunOutcome {
        let job_id = ctx.job_id();
        let started = Instant::now();
        let deadline = started.checked_add(plan.job_timeout());

        if let Err(err) = self.store.mark_running(job_id).await {
            warn!(job_id = %job_id, error = %err, "Failed to mark job running");
        }
        info!(job_id = %job_id, mode = %plan.mode(), stages = plan.len(), "Job started");

        for descriptor in plan.stages() {
            if ctx.is_cancelled() {
                let reason = ctx
                    .cancel_token()
                    .reason()
                    .unwrap_or_else(|| "cancellation requested".to_string());
                return self.finish(ctx, started, Exit::Cancelled(reason)).await;
            }

            let remaining = deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
            if remaining.is_zero() {
                let err = job_timeout_error(plan);
                ctx.cancel_token().cancel(err.to_string());
                return self
                    .finish(ctx, started, Exit::Failed(FailureKind::JobTimeout, err.into()))
                    .await;
            }

            let (name, stage) = match plan.resolve_stage(descriptor, &ctx) {
                Ok(resolved) => resolved,
                Err(err) => {
                    self.publish(
                        job_id,
                        ProgressEvent::failed(&descriptor.name, descriptor.order, err.to_string()),
                    )
                    .await;
                    return self
                        .finish(ctx, started, Exit::Failed(FailureKind::Configuration, err.into()))
                        .await;
                }
            };

            self.publish(job_id, ProgressEvent::started(&name, descriptor.order)).await;
            let stage_started_at = Utc::now();
            let clock = Instant::now();
            let job_bound = remaining < plan.stage_timeout();
            let limit = plan.stage_timeout().min(remaining);

            let result = timeout(limit, AssertUnwindSafe(stage.execute(&mut ctx)).catch_unwind()).await;
            let elapsed = clock.elapsed();
            ctx.add_duration(elapsed);

            let failure = match result {
                Ok(Ok(Ok(output))) => {
                    match self
                        .complete(&mut ctx, &name, descriptor.order, stage_started_at, elapsed, output)
                        .await
                    {
                        Ok(()) => continue,
                        Err(err) => Exit::Failed(FailureKind::StageError, err),
                    }
                }
                Ok(Ok(Err(StageError::Cancelled))) => {
                    let reason = ctx
                        .cancel_token()
                        .reason()
                        .unwrap_or_else(|| format!("stage '{name}' cancelled"));
                    Exit::Cancelled(reason)
                }
                Ok(Ok(Err(err))) => Exit::Failed(
                    FailureKind::StageError,
                    GenflowError::StageExecution {
                        stage: name.clone(),
                        message: err.to_string(),
                    },
                ),
                Ok(Err(panic)) => Exit::Failed(
                    FailureKind::StageError,
                    GenflowError::StageExecution {
                        stage: name.clone(),
                        message: format!("stage panicked: {}", panic_message(panic.as_ref())),
                    },
                ),
                Err(_) if job_bound => {
                    let err = job_timeout_error(plan);
                    ctx.cancel_token().cancel(err.to_string());
                    Exit::Failed(FailureKind::JobTimeout, err.into())
                }
                Err(_) => Exit::Failed(
                    FailureKind::StageTimeout,
                    TimeoutError {
                        scope: TimeoutScope::Stage { name: name.clone() },
                        limit_seconds: limit.as_secs_f64(),
                    }
                    .into(),
                ),
            };

            let event = match &failure {
                Exit::Cancelled(reason) => ProgressEvent::cancelled(
                    &name,
                    descriptor.order,
                    format!("Job cancelled: {reason}"),
                ),
                Exit::Failed(_, err) => ProgressEvent::failed(&name, descriptor.order, err.to_string()),
                Exit::Completed => ProgressEvent::failed(&name, descriptor.order, String::new()),
            };
            self.publish(
                job_id,
                event.with_timing(stage_started_at, elapsed.as_secs_f64()),
            )
            .await;
            return self.finish(ctx, started, failure).await;
        }

        self.finish(ctx, started, Exit::Completed).await
    }

    async fn complete(
        &self,
        ctx: &mut ExecutionContext,
        name: &str,
        order: usize,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        output: StageOutput,
    ) -> Result<(), GenflowError> {
        let StageOutput {
            data,
            cost,
            summary,
            message,
        } = output;

        ctx.record_output(name, data)
            .map_err(|err| GenflowError::StageExecution {
                stage: name.to_string(),
                message: err.to_string(),
            })?;
        ctx.add_cost(cost);

        let fresh = ctx.take_new_artifacts();
        if !fresh.is_empty() {
            if let Err(err) = self.store.record_artifacts(ctx.job_id(), &fresh).await {
                warn!(job_id = %ctx.job_id(), error = %err, "Failed to persist artifacts");
            }
        }

        debug!(
            job_id = %ctx.job_id(),
            stage = name,
            duration_ms = elapsed.as_millis() as u64,
            cost,
            "Stage completed"
        );

        let mut event = ProgressEvent::completed(name, order, started_at, elapsed.as_secs_f64())
            .with_summary(summary);
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.publish(ctx.job_id(), event).await;
        Ok(())
    }

    async fn publish(&self, job_id: JobId, event: ProgressEvent) {
        if let Err(err) = self.channel.publish(job_id, event).await {
            warn!(job_id = %job_id, error = %err, "Failed to publish progress event");
        }
    }

    async fn finish(&self, ctx: ExecutionContext, started: Instant, exit: Exit) -> RunOutcome {
        let job_id = ctx.job_id();
        let elapsed = started.elapsed();
        let (status, failure_kind, error) = match exit {
            Exit::Completed => (JobStatus::Completed, None, None),
            Exit::Cancelled(reason) => (JobStatus::Cancelled, None, Some(GenflowError::Cancelled(reason))),
            Exit::Failed(kind, err) => (JobStatus::Failed, Some(kind), Some(err)),
        };

        let mut terminal = TerminalEvent::new(job_id, status)
            .with_cost(ctx.total_cost())
            .with_duration(elapsed.as_secs_f64())
            .with_artifacts(ctx.artifacts().to_vec());
        terminal = match (failure_kind, &error) {
            (Some(kind), Some(err)) => terminal.with_failure(kind, err.to_string()),
            (None, Some(err)) => terminal.with_error(err.to_string()),
            _ => terminal,
        };
        let rounded_cost = terminal.rounded_cost;

        if let Err(err) = self.channel.publish_terminal(terminal).await {
            error!(job_id = %job_id, error = %err, "Failed to finalize job record");
        }

        let duration_ms = elapsed.as_millis() as u64;
        match &error {
            None => info!(job_id = %job_id, duration_ms, cost = rounded_cost, "Job completed"),
            Some(err) => warn!(
                job_id = %job_id,
                status = %status,
                failure_kind = ?failure_kind,
                duration_ms,
                error = %err,
                "Job ended early"
            ),
        }

        RunOutcome {
            status,
            failure_kind,
            error,
            context: ctx,
        }
    }
}

fn job_timeout_error(plan: &StagePlan) -> TimeoutError {
    TimeoutError {
        scope: TimeoutScope::Job,
        limit_seconds: plan.job_timeout().as_secs_f64(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ModeConfig};
    use crate::context::JobRequest;
    use crate::core::{JobRecord, Mode, ProgressMessage, StageStatus};
    use crate::pipeline::PlanResolver;
    use crate::resources::ClientSet;
    use crate::scheduler::InMemoryJobStore;
    use crate::stages::{FnStage, NoOpStage, Stage, StageRegistry};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Debug)]
    struct Panicking;

    #[async_trait]
    impl Stage for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<StageOutput, StageError> {
            panic!("kaboom");
        }
    }

    struct Harness {
        executor: PipelineExecutor,
        store: Arc<InMemoryJobStore>,
        channel: Arc<ProgressChannel>,
        plan: Arc<StagePlan>,
    }

    fn harness(stages: &[&str], registry: StageRegistry) -> Harness {
        let config = EngineConfig {
            modes: std::collections::BTreeMap::new(),
            ..EngineConfig::default()
        }
        .with_mode("test", ModeConfig::new(stages.iter().copied()));
        let plan = PlanResolver::new(&config, Arc::new(registry))
            .unwrap()
            .resolve("test")
            .unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        let channel = Arc::new(ProgressChannel::new(store.clone(), 64));
        Harness {
            executor: PipelineExecutor::new(store.clone(), channel.clone()),
            store,
            channel,
            plan,
        }
    }

    async fn context(h: &Harness) -> ExecutionContext {
        let id = JobId::new();
        h.store
            .insert(JobRecord::new(id, Mode::from("test")))
            .await
            .unwrap();
        h.channel.open(id);
        ExecutionContext::new(
            id,
            Mode::from("test"),
            JobRequest::new(),
            Arc::new(ClientSet::new(Mode::from("test"))),
        )
    }

    #[tokio::test]
    async fn test_outputs_cost_and_record() {
        let registry = StageRegistry::new()
            .with_stage(FnStage::new("a", |_: &ExecutionContext| {
                Ok(StageOutput::new(json!({"v": 1})).with_cost(0.00011))
            }))
            .unwrap()
            .with_stage(FnStage::new("b", |ctx: &ExecutionContext| {
                let v = ctx.output("a").and_then(|o| o["v"].as_i64()).unwrap_or(0);
                Ok(StageOutput::new(json!({"v": v + 1})).with_cost(0.00012))
            }))
            .unwrap();
        let h = harness(&["a", "b"], registry);
        let ctx = context(&h).await;
        let id = ctx.job_id();

        let outcome = h.executor.run(&h.plan, ctx).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.context.outputs().names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(outcome.context.output("b").unwrap()["v"], 2);
        assert!((outcome.context.total_cost() - 0.00023).abs() < 1e-12);

        let record = h.store.get(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.stages.len(), 2);
        assert!(record.stages.iter().all(|s| s.status == StageStatus::Completed));
        assert_eq!(record.cost_report(), 0.0002);
    }

    #[tokio::test]
    async fn test_failure_stops_run() {
        let registry = StageRegistry::new()
            .with_stage(NoOpStage::new("a"))
            .unwrap()
            .with_stage(FnStage::new("b", |_: &ExecutionContext| {
                Err(StageError::failed("bad input"))
            }))
            .unwrap()
            .with_stage(NoOpStage::new("c"))
            .unwrap();
        let h = harness(&["a", "b", "c"], registry);
        let ctx = context(&h).await;
        let id = ctx.job_id();
        let subscription = h.channel.subscribe(id).await.unwrap();

        let outcome = h.executor.run(&h.plan, ctx).await;
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.failure_kind, Some(FailureKind::StageError));
        assert!(outcome.context.outputs().contains("a"));
        assert!(!outcome.context.outputs().contains("c"));

        let events: Vec<_> = subscription
            .collect()
            .await
            .iter()
            .filter_map(ProgressMessage::as_stage)
            .map(|e| (e.stage_name.clone(), e.status))
            .collect();
        assert_eq!(
            events,
            vec![
                ("a".to_string(), StageStatus::Started),
                ("a".to_string(), StageStatus::Completed),
                ("b".to_string(), StageStatus::Started),
                ("b".to_string(), StageStatus::Failed),
            ]
        );

        let record = h.store.get(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error_message.unwrap().contains("bad input"));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let registry = StageRegistry::new().with_stage(Panicking).unwrap();
        let h = harness(&["panicking"], registry);
        let ctx = context(&h).await;

        let outcome = h.executor.run(&h.plan, ctx).await;
        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.error.unwrap().to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let registry = StageRegistry::new().with_stage(NoOpStage::new("a")).unwrap();
        let h = harness(&["a"], registry);
        let ctx = context(&h).await;
        ctx.cancel_token().cancel("user");
        let id = ctx.job_id();

        let outcome = h.executor.run(&h.plan, ctx).await;
        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert!(outcome.context.outputs().is_empty());

        let record = h.store.get(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.stages.is_empty());
        assert!(record.failure_kind.is_none());
    }

    #[tokio::test]
    async fn test_stage_error_cancelled_maps_to_cancelled() {
        let registry = StageRegistry::new()
            .with_stage(FnStage::new("a", |_: &ExecutionContext| Err(StageError::Cancelled)))
            .unwrap();
        let h = harness(&["a"], registry);
        let ctx = context(&h).await;
        let id = ctx.job_id();
        let subscription = h.channel.subscribe(id).await.unwrap();

        let outcome = h.executor.run(&h.plan, ctx).await;
        assert_eq!(outcome.status, JobStatus::Cancelled);

        let events: Vec<_> = subscription
            .collect()
            .await
            .iter()
            .filter_map(ProgressMessage::as_stage)
            .map(|e| (e.stage_name.clone(), e.status))
            .collect();
        assert_eq!(
            events,
            vec![
                ("a".to_string(), StageStatus::Started),
                ("a".to_string(), StageStatus::Cancelled),
            ]
        );

        let record = h.store.get(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(record.stages[0].status, StageStatus::Cancelled);
    }
}
