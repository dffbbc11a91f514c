//! Engine assembly.
//!
//! [`Engine::builder`] wires configuration, the stage registry, the client
//! factory and the job store into a ready [`JobScheduler`]. Every plan is
//! validated and every mode's clients are built before `build` returns.

use crate::config::EngineConfig;
use crate::errors::GenflowError;
use crate::extract::StructuredExtractor;
use crate::lineage::LineageTracker;
use crate::pipeline::{ConditionalResolver, PlanResolver};
use crate::progress::ProgressChannel;
use crate::resources::{ClientFactory, ResourcePool};
use crate::scheduler::{InMemoryJobStore, JobScheduler, JobStore};
use crate::stages::{standard_registry, Stage, StageRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<StageRegistry>,
    overrides: Vec<Arc<dyn Stage>>,
    factory: Option<Arc<dyn ClientFactory>>,
    store: Option<Arc<dyn JobStore>>,
    resolvers: HashMap<String, Arc<dyn ConditionalResolver>>,
}

impl EngineBuilder {
    /// Uses `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `registry` instead of the standard stage set.
    #[must_use]
    pub fn registry(mut self, registry: StageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Registers a stage, replacing any stage with the same name.
    #[must_use]
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.overrides.push(Arc::new(stage));
        self
    }

    /// Sets the factory building each mode's clients. Required.
    #[must_use]
    pub fn client_factory(mut self, factory: impl ClientFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Uses `store` for job records instead of an in-memory store.
    #[must_use]
    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses `resolver` for the conditional slot of `mode`.
    #[must_use]
    pub fn conditional_resolver(
        mut self,
        mode: impl Into<String>,
        resolver: impl ConditionalResolver + 'static,
    ) -> Self {
        self.resolvers.insert(mode.into(), Arc::new(resolver));
        self
    }

    /// Validates plans, builds every mode's clients and returns the engine.
    ///
    /// # Errors
    ///
    /// Returns `Config` for invalid settings or a missing client factory,
    /// `PlanValidation` for plans inconsistent with the registry and
    /// `ResourceInit` if a mode's clients cannot be built.
    pub async fn build(self) -> Result<Engine, GenflowError> {
        let started = Instant::now();
        self.config.validate()?;
        let factory = self
            .factory
            .ok_or_else(|| GenflowError::Config("a client factory is required".into()))?;

        let extractor = Arc::new(StructuredExtractor::from_config(&self.config.extraction));
        let mut registry = match self.registry {
            Some(registry) => registry,
            None => standard_registry(&self.config, &extractor)?,
        };
        for stage in self.overrides {
            let name = stage.name().to_string();
            if registry.replace(stage).is_some() {
                debug!(stage = %name, "Replaced registered stage");
            }
        }

        let stage_count = registry.len();
        let resolver = PlanResolver::with_resolvers(&self.config, Arc::new(registry), self.resolvers)?;
        let modes: Vec<_> = resolver.modes().cloned().collect();
        let pool = ResourcePool::initialize(factory.as_ref(), modes.iter().cloned()).await?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()) as Arc<dyn JobStore>);
        let channel = Arc::new(ProgressChannel::new(
            store.clone(),
            self.config.progress.channel_capacity,
        ));
        let lineage = Arc::new(LineageTracker::new(store.clone()));
        let scheduler = JobScheduler::new(Arc::new(resolver), Arc::new(pool), store, channel, lineage);

        info!(
            modes = modes.len(),
            stages = stage_count,
            duration_ms = started.elapsed().as_millis() as u64,
            "Engine ready"
        );

        Ok(Engine {
            config: Arc::new(self.config),
            extractor,
            scheduler,
        })
    }
}

/// A running engine.
#[derive(Debug, Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    extractor: Arc<StructuredExtractor>,
    scheduler: JobScheduler,
}

impl Engine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// The job scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// The structured-output extractor shared by the standard stages.
    #[must_use]
    pub fn extractor(&self) -> &Arc<StructuredExtractor> {
        &self.extractor
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModeConfig;
    use crate::context::JobRequest;
    use crate::core::{JobStatus, Mode};
    use crate::resources::ClientSet;
    use crate::stages::NoOpStage;
    use crate::testing::{MockStage, StaticClientFactory};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    fn single_mode(stages: &[&str]) -> EngineConfig {
        EngineConfig {
            modes: BTreeMap::new(),
            ..EngineConfig::default()
        }
        .with_mode("quick", ModeConfig::new(stages.iter().copied()))
    }

    #[tokio::test]
    async fn test_missing_factory_rejected() {
        let err = Engine::builder().build().await.unwrap_err();
        assert!(matches!(err, GenflowError::Config(ref m) if m.contains("client factory")));
    }

    #[tokio::test]
    async fn test_default_engine_builds() {
        let engine = Engine::builder()
            .client_factory(StaticClientFactory::new())
            .build()
            .await
            .unwrap();

        let mut modes = engine.scheduler().modes();
        modes.sort();
        assert_eq!(
            modes,
            vec![Mode::from("caption"), Mode::from("generation"), Mode::from("refinement")]
        );
        assert_eq!(engine.config().progress.channel_capacity, 256);
    }

    #[tokio::test]
    async fn test_unregistered_stage_rejects_startup() {
        let err = Engine::builder()
            .config(single_mode(&["missing"]))
            .registry(StageRegistry::new())
            .client_factory(StaticClientFactory::new())
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, GenflowError::PlanValidation(_)));
    }

    struct BrokenFactory;

    #[async_trait]
    impl ClientFactory for BrokenFactory {
        async fn build(&self, mode: &Mode) -> anyhow::Result<ClientSet> {
            anyhow::bail!("no credentials for {mode}")
        }
    }

    #[tokio::test]
    async fn test_client_failure_aborts_startup() {
        let err = Engine::builder()
            .config(single_mode(&["a"]))
            .registry(StageRegistry::new().with_stage(NoOpStage::new("a")).unwrap())
            .client_factory(BrokenFactory)
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, GenflowError::ResourceInit { ref mode, .. } if mode.as_str() == "quick"));
    }

    #[tokio::test]
    async fn test_stage_override_runs() {
        let engine = Engine::builder()
            .config(single_mode(&["a"]))
            .registry(StageRegistry::new().with_stage(NoOpStage::new("a")).unwrap())
            .stage(MockStage::new("a").with_output(crate::core::StageOutput::new("mocked")))
            .client_factory(StaticClientFactory::new())
            .build()
            .await
            .unwrap();

        let id = engine.scheduler().submit("quick", JobRequest::new()).await.unwrap();
        let record = engine.scheduler().wait(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }
}
