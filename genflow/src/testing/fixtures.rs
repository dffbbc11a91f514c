//! Test fixtures wiring a complete engine in memory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::StaticClientFactory;
use crate::config::{EngineConfig, ModeConfig};
use crate::context::JobRequest;
use crate::core::{JobId, JobRecord, JobStatus, Mode, ProgressMessage, TerminalEvent};
use crate::engine::Engine;
use crate::errors::GenflowError;
use crate::scheduler::{InMemoryJobStore, JobScheduler, JobStore};
use crate::stages::StageRegistry;

/// A config with a single mode named `name`.
#[must_use]
pub fn single_mode_config(name: &str, mode: ModeConfig) -> EngineConfig {
    EngineConfig {
        modes: BTreeMap::new(),
        ..EngineConfig::default()
    }
    .with_mode(name, mode)
}

/// An engine over an in-memory store the test can inspect and seed.
#[derive(Debug)]
pub struct TestEngine {
    engine: Engine,
    store: Arc<InMemoryJobStore>,
}

impl TestEngine {
    /// Builds an engine with empty client sets.
    ///
    /// # Errors
    ///
    /// Returns the engine build error.
    pub async fn start(config: EngineConfig, registry: StageRegistry) -> Result<Self, GenflowError> {
        Self::with_factory(config, registry, StaticClientFactory::new()).await
    }

    /// Builds an engine whose clients come from `factory`.
    ///
    /// # Errors
    ///
    /// Returns the engine build error.
    pub async fn with_factory(
        config: EngineConfig,
        registry: StageRegistry,
        factory: StaticClientFactory,
    ) -> Result<Self, GenflowError> {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = Engine::builder()
            .config(config)
            .registry(registry)
            .client_factory(factory)
            .job_store(store.clone())
            .build()
            .await?;
        Ok(Self { engine, store })
    }

    /// The engine.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The engine's scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &JobScheduler {
        self.engine.scheduler()
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<InMemoryJobStore> {
        &self.store
    }

    /// Inserts a completed original job owning `artifacts`.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::Store` if the record cannot be stored.
    pub async fn seed_original(&self, artifacts: Vec<PathBuf>) -> Result<JobId, GenflowError> {
        let id = JobId::new();
        let mut record = JobRecord::new(id, Mode::from(Mode::GENERATION));
        record.finalize(&TerminalEvent::new(id, JobStatus::Completed).with_artifacts(artifacts));
        self.store.insert(record).await?;
        Ok(id)
    }

    /// Submits a job and waits for its final record.
    ///
    /// # Errors
    ///
    /// Returns the submission error.
    pub async fn run(&self, mode: &str, request: JobRequest) -> Result<JobRecord, GenflowError> {
        let id = self.scheduler().submit(mode, request).await?;
        self.scheduler().wait(id).await
    }

    /// Subscribes to a job and drains its messages until it ends.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::JobNotFound` for unknown jobs.
    pub async fn collect_messages(&self, id: JobId) -> Result<Vec<ProgressMessage>, GenflowError> {
        Ok(self.scheduler().subscribe(id).await?.collect().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::NoOpStage;

    #[tokio::test]
    async fn test_seed_original_is_resolvable() {
        let registry = StageRegistry::new().with_stage(NoOpStage::new("a")).unwrap();
        let engine = TestEngine::start(single_mode_config("m", ModeConfig::new(["a"])), registry)
            .await
            .unwrap();

        let id = engine
            .seed_original(vec![PathBuf::from("/tmp/one.png")])
            .await
            .unwrap();
        let record = engine.scheduler().status(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.primary_artifact(), Some(&PathBuf::from("/tmp/one.png")));
    }

    #[tokio::test]
    async fn test_run_waits_for_completion() {
        let registry = StageRegistry::new().with_stage(NoOpStage::new("a")).unwrap();
        let engine = TestEngine::start(single_mode_config("m", ModeConfig::new(["a"])), registry)
            .await
            .unwrap();

        let record = engine.run("m", JobRequest::new()).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.stages.len(), 1);
    }
}
