//! Stage trait and implementations.
//!
//! Stages are the units of work a mode's plan strings together. A stage
//! reads the request and earlier outputs from the [`ExecutionContext`] and
//! returns a [`StageOutput`]; the executor records it under the stage's
//! name.

mod builtin;
mod catalog;
mod model;
mod registry;
mod retry;

pub use builtin::{LoadBaseImageStage, SaveOutputsStage};
pub use catalog::{standard_registry, standard_stages, IMAGE_CLIENT, TEXT_CLIENT};
pub use model::{ImageInput, ModelStage};
pub use registry::StageRegistry;
pub use retry::{with_retry, BackoffStrategy, JitterStrategy, RetryConfig};

use crate::context::ExecutionContext;
use crate::core::StageOutput;
use crate::errors::StageError;
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Executes the stage.
    ///
    /// # Errors
    ///
    /// Any error fails the job at this stage.
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StageOutput, StageError>;
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(&ExecutionContext) -> Result<StageOutput, StageError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&ExecutionContext) -> Result<StageOutput, StageError> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&ExecutionContext) -> Result<StageOutput, StageError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&ExecutionContext) -> Result<StageOutput, StageError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StageOutput, StageError> {
        (self.func)(ctx)
    }
}

/// A stage that succeeds without output.
#[derive(Debug, Clone)]
pub struct NoOpStage {
    name: String,
}

impl NoOpStage {
    /// Creates a new no-op stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Stage for NoOpStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<StageOutput, StageError> {
        Ok(StageOutput::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JobRequest;
    use crate::core::{JobId, Mode};
    use crate::resources::ClientSet;
    use serde_json::json;
    use std::sync::Arc;

    fn test_context() -> ExecutionContext {
        ExecutionContext::new(
            JobId::new(),
            Mode::from("caption"),
            JobRequest::new().with_brief("coffee"),
            Arc::new(ClientSet::new(Mode::from("caption"))),
        )
    }

    #[tokio::test]
    async fn test_fn_stage() {
        let stage = FnStage::new("echo", |ctx: &ExecutionContext| {
            Ok(StageOutput::new(json!({"brief": ctx.brief()})))
        });

        assert_eq!(stage.name(), "echo");

        let mut ctx = test_context();
        let output = stage.execute(&mut ctx).await.unwrap();
        assert_eq!(output.data, json!({"brief": "coffee"}));
    }

    #[tokio::test]
    async fn test_noop_stage() {
        let stage = NoOpStage::new("noop");

        assert_eq!(stage.name(), "noop");

        let mut ctx = test_context();
        let output = stage.execute(&mut ctx).await.unwrap();
        assert!(output.data.is_null());
    }
}
