//! Mock stages, clients and factories for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::context::ExecutionContext;
use crate::core::{JobId, Mode, StageOutput};
use crate::errors::{ModelError, StageError};
use crate::resources::{ClientFactory, ClientSet, ModelClient, ModelRequest, ModelResponse};
use crate::stages::Stage;

/// A stage that counts calls and returns a configurable output.
#[derive(Debug)]
pub struct MockStage {
    name: String,
    output: Mutex<StageOutput>,
    call_count: AtomicUsize,
}

impl MockStage {
    /// Creates a mock returning an empty output.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: Mutex::new(StageOutput::empty()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Sets the output, builder style.
    #[must_use]
    pub fn with_output(self, output: StageOutput) -> Self {
        self.set_output(output);
        self
    }

    /// Sets the output to return.
    pub fn set_output(&self, output: StageOutput) {
        *self.output.lock() = output;
    }

    /// Returns the number of times the stage was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for MockStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<StageOutput, StageError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.lock().clone())
    }
}

/// A stage that always fails.
#[derive(Debug)]
pub struct FailingStage {
    name: String,
    error: String,
}

impl FailingStage {
    /// Creates a failing stage.
    #[must_use]
    pub fn new(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
        }
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<StageOutput, StageError> {
        Err(StageError::failed(self.error.clone()))
    }
}

/// A stage that sleeps before succeeding.
#[derive(Debug)]
pub struct SlowStage {
    name: String,
    delay: Duration,
}

impl SlowStage {
    /// Creates a slow stage.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }

    /// Creates a slow stage with a delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(name: impl Into<String>, ms: u64) -> Self {
        Self::new(name, Duration::from_millis(ms))
    }
}

#[async_trait]
impl Stage for SlowStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<StageOutput, StageError> {
        tokio::time::sleep(self.delay).await;
        Ok(StageOutput::empty())
    }
}

/// A stage that waits until released.
///
/// Useful to hold a job inside a known stage while the test acts on it.
#[derive(Debug)]
pub struct GatedStage {
    name: String,
    gate: Arc<Notify>,
}

impl GatedStage {
    /// Creates a gated stage and the handle that releases it.
    #[must_use]
    pub fn new(name: impl Into<String>) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (
            Self {
                name: name.into(),
                gate: gate.clone(),
            },
            gate,
        )
    }
}

#[async_trait]
impl Stage for GatedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<StageOutput, StageError> {
        self.gate.notified().await;
        Ok(StageOutput::empty())
    }
}

/// A recorded execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedExecution {
    /// The job that ran the stage.
    pub job_id: JobId,
    /// Stage outputs visible when the stage ran, in order.
    pub outputs_seen: Vec<String>,
}

/// A stage that records what it saw and appends its name to a shared journal.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    executions: Mutex<Vec<RecordedExecution>>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl RecordingStage {
    /// Creates a recording stage with its own journal.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_journal(name, Arc::new(Mutex::new(Vec::new())))
    }

    /// Creates a recording stage writing to a shared journal.
    #[must_use]
    pub fn with_journal(name: impl Into<String>, journal: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.into(),
            executions: Mutex::new(Vec::new()),
            journal,
        }
    }

    /// Returns all recorded executions.
    #[must_use]
    pub fn executions(&self) -> Vec<RecordedExecution> {
        self.executions.lock().clone()
    }

    /// Returns the number of executions.
    #[must_use]
    pub fn execution_count(&self) -> usize {
        self.executions.lock().len()
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StageOutput, StageError> {
        self.executions.lock().push(RecordedExecution {
            job_id: ctx.job_id(),
            outputs_seen: ctx.outputs().names().map(str::to_string).collect(),
        });
        self.journal.lock().push(self.name.clone());
        Ok(StageOutput::new(serde_json::json!({ "stage": self.name })))
    }
}

/// A model client replaying scripted responses.
///
/// Responses are returned in order; once the script runs out the fallback
/// response is used, or an `InvalidResponse` error if there is none.
#[derive(Debug, Default)]
pub struct ScriptedModelClient {
    script: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    fallback: Option<ModelResponse>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModelClient {
    /// Creates an empty client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A client that always answers with `response`.
    #[must_use]
    pub fn always(response: ModelResponse) -> Self {
        Self {
            fallback: Some(response),
            ..Self::default()
        }
    }

    /// Queues a response.
    #[must_use]
    pub fn then(self, response: Result<ModelResponse, ModelError>) -> Self {
        self.script.lock().push_back(response);
        self
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        self.requests.lock().push(request);
        let next = self.script.lock().pop_front();
        match next {
            Some(response) => response,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| ModelError::InvalidResponse("script exhausted".to_string())),
        }
    }
}

/// A client factory handing out prepared clients.
///
/// Clients added with [`with_client`](Self::with_client) go into every
/// mode's set; [`with_set`](Self::with_set) overrides one mode entirely.
#[derive(Default)]
pub struct StaticClientFactory {
    shared: Vec<(String, Arc<dyn ModelClient>)>,
    sets: HashMap<Mode, ClientSet>,
}

impl StaticClientFactory {
    /// Creates a factory producing empty sets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client to every mode.
    #[must_use]
    pub fn with_client(mut self, name: impl Into<String>, client: Arc<dyn ModelClient>) -> Self {
        self.shared.push((name.into(), client));
        self
    }

    /// Uses `set` for its mode.
    #[must_use]
    pub fn with_set(mut self, set: ClientSet) -> Self {
        self.sets.insert(set.mode().clone(), set);
        self
    }
}

#[async_trait]
impl ClientFactory for StaticClientFactory {
    async fn build(&self, mode: &Mode) -> anyhow::Result<ClientSet> {
        if let Some(set) = self.sets.get(mode) {
            return Ok(set.clone());
        }
        Ok(self
            .shared
            .iter()
            .fold(ClientSet::new(mode.clone()), |set, (name, client)| {
                set.with_client(name.clone(), client.clone())
            }))
    }
}
