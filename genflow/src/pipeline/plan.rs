//! Stage plans and their resolution.
//!
//! A plan is the ordered list of stage descriptors of one mode. Fixed slots
//! are bound to a registered stage when the plan is built; the single
//! conditional slot is bound when execution reaches it.

use crate::config::{ConditionalRoute, EngineConfig, ModeConfig, CONDITIONAL_SLOT};
use crate::context::{ExecutionContext, JobRequest};
use crate::core::Mode;
use crate::errors::{GenflowError, PlanIssue, PlanValidationError, UnresolvedConditionalStageError};
use crate::stages::{Stage, StageRegistry};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Chooses the concrete stage of a conditional slot.
pub trait ConditionalResolver: Send + Sync + Debug {
    /// Every stage name this resolver can return.
    fn targets(&self) -> Vec<String>;

    /// Picks a stage from the context at the point execution reaches the
    /// slot. `Err` carries the reason no stage could be chosen.
    fn select(&self, ctx: &ExecutionContext) -> Result<String, String>;

    /// Picks a stage from the request alone, before the job starts.
    ///
    /// Returns `None` when the choice depends on run-time state.
    fn preflight(&self, _request: &JobRequest) -> Option<Result<String, String>> {
        None
    }
}

/// Routes on a request parameter using a [`ConditionalRoute`].
#[derive(Debug, Clone)]
pub struct ParamRouter {
    route: ConditionalRoute,
}

impl ParamRouter {
    /// Creates a router.
    #[must_use]
    pub fn new(route: ConditionalRoute) -> Self {
        Self { route }
    }

    fn pick(&self, request: &JobRequest) -> Result<String, String> {
        let param = &self.route.param;
        let routed = match request.param(param) {
            None => None,
            Some(value) => {
                let key = value
                    .as_str()
                    .ok_or_else(|| format!("parameter '{param}' must be a string"))?;
                match self.route.routes.get(key) {
                    Some(stage) => Some(stage),
                    None if self.route.default.is_some() => None,
                    None => return Err(format!("no route for {param}='{key}'")),
                }
            }
        };
        routed
            .or(self.route.default.as_ref())
            .cloned()
            .ok_or_else(|| format!("parameter '{param}' is required"))
    }
}

impl ConditionalResolver for ParamRouter {
    fn targets(&self) -> Vec<String> {
        self.route.targets().map(str::to_string).collect()
    }

    fn select(&self, ctx: &ExecutionContext) -> Result<String, String> {
        self.pick(ctx.request())
    }

    fn preflight(&self, request: &JobRequest) -> Option<Result<String, String>> {
        Some(self.pick(request))
    }
}

/// What occupies a plan slot.
#[derive(Debug, Clone)]
pub enum SlotKind {
    /// A stage bound at plan-build time.
    Fixed(Arc<dyn Stage>),
    /// A stage chosen at run time.
    Conditional(Arc<dyn ConditionalResolver>),
}

/// One slot of a plan.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    /// Stage name, or [`CONDITIONAL_SLOT`] for the conditional slot.
    pub name: String,
    /// Position in the plan.
    pub order: usize,
    /// What runs in this slot.
    pub kind: SlotKind,
}

impl StageDescriptor {
    /// Returns true for the conditional slot.
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        matches!(self.kind, SlotKind::Conditional(_))
    }
}

/// The validated plan of one mode.
#[derive(Debug, Clone)]
pub struct StagePlan {
    mode: Mode,
    stages: Vec<StageDescriptor>,
    job_timeout: Duration,
    stage_timeout: Duration,
    registry: Arc<StageRegistry>,
}

impl StagePlan {
    /// Returns the mode.
    #[must_use]
    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Slots in execution order.
    #[must_use]
    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Slot names in execution order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|d| d.name.as_str())
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true for a plan without slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Wall-clock limit for the whole run.
    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    /// Limit for one stage call.
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        self.stage_timeout
    }

    /// Overrides both deadlines.
    #[must_use]
    pub fn with_timeouts(mut self, job: Duration, stage: Duration) -> Self {
        self.job_timeout = job;
        self.stage_timeout = stage;
        self
    }

    fn unresolved(
        &self,
        descriptor: &StageDescriptor,
        selected: Option<String>,
        reason: impl Into<String>,
    ) -> UnresolvedConditionalStageError {
        UnresolvedConditionalStageError {
            mode: self.mode.to_string(),
            slot_order: descriptor.order,
            selected,
            reason: reason.into(),
        }
    }

    fn lookup(
        &self,
        descriptor: &StageDescriptor,
        choice: Result<String, String>,
    ) -> Result<(String, Arc<dyn Stage>), UnresolvedConditionalStageError> {
        let name = choice.map_err(|reason| self.unresolved(descriptor, None, reason))?;
        match self.registry.get(&name) {
            Some(stage) => Ok((name, stage)),
            None => {
                let reason = format!("stage '{name}' is not registered");
                Err(self.unresolved(descriptor, Some(name), reason))
            }
        }
    }

    /// Rejects requests whose conditional slot cannot be resolved up front.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedConditionalStageError` when the resolver can decide
    /// from the request alone and its choice is not a registered stage.
    pub fn preflight(&self, request: &JobRequest) -> Result<(), UnresolvedConditionalStageError> {
        for descriptor in &self.stages {
            if let SlotKind::Conditional(resolver) = &descriptor.kind {
                if let Some(choice) = resolver.preflight(request) {
                    self.lookup(descriptor, choice)?;
                }
            }
        }
        Ok(())
    }

    /// Binds a slot to its concrete stage.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedConditionalStageError` if a conditional slot's
    /// resolver fails or names an unregistered stage.
    pub fn resolve_stage(
        &self,
        descriptor: &StageDescriptor,
        ctx: &ExecutionContext,
    ) -> Result<(String, Arc<dyn Stage>), UnresolvedConditionalStageError> {
        match &descriptor.kind {
            SlotKind::Fixed(stage) => Ok((descriptor.name.clone(), Arc::clone(stage))),
            SlotKind::Conditional(resolver) => {
                let resolved = self.lookup(descriptor, resolver.select(ctx))?;
                debug!(slot = descriptor.order, stage = %resolved.0, "Resolved conditional stage");
                Ok(resolved)
            }
        }
    }
}

fn issue(mode: &str, code: &str, summary: String) -> PlanValidationError {
    PlanValidationError::new(mode, PlanIssue::new(code, summary))
}

fn build_plan(
    mode: &str,
    config: &ModeConfig,
    registry: &Arc<StageRegistry>,
    custom: Option<Arc<dyn ConditionalResolver>>,
) -> Result<StagePlan, PlanValidationError> {
    let resolver: Option<Arc<dyn ConditionalResolver>> = custom.or_else(|| {
        config
            .conditional
            .clone()
            .map(|route| Arc::new(ParamRouter::new(route)) as Arc<dyn ConditionalResolver>)
    });

    if config.stages.is_empty() {
        return Err(PlanValidationError::new(
            mode,
            PlanIssue::new("PLAN-001-EMPTY", format!("Mode '{mode}' has no stages"))
                .with_fix_hint("List at least one stage for the mode"),
        ));
    }

    let mut seen = HashSet::new();
    let mut stages = Vec::with_capacity(config.stages.len());
    let mut conditional_seen = false;

    for (order, name) in config.stages.iter().enumerate() {
        if name == CONDITIONAL_SLOT {
            if conditional_seen {
                return Err(PlanValidationError::new(
                    mode,
                    PlanIssue::new(
                        "PLAN-003-MULTIPLE_CONDITIONAL",
                        format!("Mode '{mode}' has more than one conditional slot"),
                    )
                    .with_fix_hint("A plan may contain a single conditional slot"),
                ));
            }
            conditional_seen = true;
            let Some(resolver) = resolver.clone() else {
                return Err(PlanValidationError::new(
                    mode,
                    PlanIssue::new(
                        "PLAN-004-MISSING_ROUTE",
                        format!("Mode '{mode}' has a conditional slot but no route"),
                    )
                    .with_fix_hint("Add a `conditional` section with a param and routes"),
                ));
            };
            stages.push(StageDescriptor {
                name: name.clone(),
                order,
                kind: SlotKind::Conditional(resolver),
            });
            continue;
        }

        if !seen.insert(name.as_str()) {
            return Err(PlanValidationError::new(
                mode,
                PlanIssue::new(
                    "PLAN-002-DUPLICATE_STAGE",
                    format!("Stage '{name}' appears more than once in mode '{mode}'"),
                )
                .with_stage(name.clone()),
            ));
        }
        let Some(stage) = registry.get(name) else {
            return Err(PlanValidationError::new(
                mode,
                PlanIssue::new(
                    "PLAN-005-UNREGISTERED_STAGE",
                    format!("Stage '{name}' in mode '{mode}' is not registered"),
                )
                .with_fix_hint("Register the stage with the engine or fix the plan")
                .with_stage(name.clone()),
            ));
        };
        stages.push(StageDescriptor {
            name: name.clone(),
            order,
            kind: SlotKind::Fixed(stage),
        });
    }

    match (&resolver, conditional_seen) {
        (Some(_), false) => {
            return Err(issue(
                mode,
                "PLAN-006-UNUSED_ROUTE",
                format!("Mode '{mode}' defines a conditional route but no '{CONDITIONAL_SLOT}' slot"),
            ));
        }
        (Some(resolver), true) => {
            let targets = resolver.targets();
            if targets.is_empty() {
                return Err(issue(
                    mode,
                    "PLAN-004-MISSING_ROUTE",
                    format!("Conditional route of mode '{mode}' has no targets"),
                ));
            }
            for target in targets {
                if !registry.contains(&target) {
                    return Err(PlanValidationError::new(
                        mode,
                        PlanIssue::new(
                            "PLAN-007-UNREGISTERED_ROUTE_TARGET",
                            format!("Conditional target '{target}' of mode '{mode}' is not registered"),
                        )
                        .with_stage(target),
                    ));
                }
                if seen.contains(target.as_str()) {
                    return Err(PlanValidationError::new(
                        mode,
                        PlanIssue::new(
                            "PLAN-002-DUPLICATE_STAGE",
                            format!("Conditional target '{target}' also appears as a fixed stage in mode '{mode}'"),
                        )
                        .with_stage(target),
                    ));
                }
            }
        }
        (None, _) => {}
    }

    Ok(StagePlan {
        mode: Mode::from(mode),
        stages,
        job_timeout: config.job_timeout(),
        stage_timeout: config.stage_timeout(),
        registry: Arc::clone(registry),
    })
}

/// Maps modes to validated plans.
#[derive(Debug, Clone)]
pub struct PlanResolver {
    plans: HashMap<Mode, Arc<StagePlan>>,
    registry: Arc<StageRegistry>,
}

impl PlanResolver {
    /// Builds and validates the plan of every configured mode.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::PlanValidation` for the first invalid plan.
    pub fn new(config: &EngineConfig, registry: Arc<StageRegistry>) -> Result<Self, GenflowError> {
        Self::with_resolvers(config, registry, HashMap::new())
    }

    /// Like [`new`](Self::new), with custom conditional resolvers per mode
    /// taking precedence over configured routes.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::PlanValidation` for the first invalid plan.
    pub fn with_resolvers(
        config: &EngineConfig,
        registry: Arc<StageRegistry>,
        mut resolvers: HashMap<String, Arc<dyn ConditionalResolver>>,
    ) -> Result<Self, GenflowError> {
        let mut plans = HashMap::with_capacity(config.modes.len());
        for (name, mode) in &config.modes {
            let plan = build_plan(name, mode, &registry, resolvers.remove(name))?;
            plans.insert(Mode::from(name.as_str()), Arc::new(plan));
        }
        if let Some(name) = resolvers.keys().next() {
            return Err(GenflowError::Config(format!(
                "conditional resolver given for unknown mode '{name}'"
            )));
        }
        Ok(Self { plans, registry })
    }

    /// Returns the plan of `mode`.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::UnknownMode` if the mode has no plan.
    pub fn resolve(&self, mode: &str) -> Result<Arc<StagePlan>, GenflowError> {
        self.plans
            .get(mode)
            .cloned()
            .ok_or_else(|| GenflowError::UnknownMode(mode.to_string()))
    }

    /// Known modes.
    pub fn modes(&self) -> impl Iterator<Item = &Mode> {
        self.plans.keys()
    }

    /// The registry plans are bound against.
    #[must_use]
    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }
}
