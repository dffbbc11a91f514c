//! Generic stage backed by one external model call.

use super::retry::{with_retry, RetryConfig};
use super::Stage;
use crate::context::ExecutionContext;
use crate::core::StageOutput;
use crate::errors::{ModelError, StageError};
use crate::extract::{ExpectedShape, StructuredExtractor};
use crate::resources::ModelRequest;
use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Which image, if any, is sent with the model request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageInput {
    /// Text only.
    #[default]
    None,
    /// The refinement base image.
    Base,
    /// The request's reference image.
    Reference,
    /// The newest `image_path` written by an earlier stage.
    LatestOutput,
}

impl ImageInput {
    fn resolve(self, ctx: &ExecutionContext) -> Option<PathBuf> {
        match self {
            Self::None => None,
            Self::Base => ctx.base_image().map(PathBuf::from),
            Self::Reference => ctx.reference_image().map(PathBuf::from),
            Self::LatestOutput => ctx.outputs().latest_str("image_path").map(PathBuf::from),
        }
    }
}

fn placeholder_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{(brief|param:[A-Za-z0-9_]+|output:[A-Za-z0-9_]+)\}").ok())
        .as_ref()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fills `{brief}`, `{param:<key>}` and `{output:<stage>}` placeholders.
///
/// Unknown placeholders render as an empty string.
fn render_prompt(template: &str, ctx: &ExecutionContext) -> String {
    let Some(re) = placeholder_regex() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &Captures<'_>| {
        let key = &caps[1];
        if key == "brief" {
            return ctx.brief().unwrap_or_default().to_string();
        }
        if let Some(param) = key.strip_prefix("param:") {
            return ctx.request().param(param).map(value_text).unwrap_or_default();
        }
        key.strip_prefix("output:")
            .and_then(|stage| ctx.output(stage))
            .map(value_text)
            .unwrap_or_default()
    })
    .into_owned()
}

/// Calls a named client from the job's client set and records its result.
///
/// Text responses are stored under `text`, or parsed into `result` when a
/// structured shape is configured. Image responses are stored under
/// `images` and `image_path`.
#[derive(Debug, Clone)]
pub struct ModelStage {
    name: String,
    client: String,
    model: String,
    prompt_template: String,
    image_input: ImageInput,
    structured: Option<(ExpectedShape, Arc<StructuredExtractor>)>,
    retry: RetryConfig,
}

impl ModelStage {
    /// Creates a stage calling `client` with `model`.
    #[must_use]
    pub fn new(name: impl Into<String>, client: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: client.into(),
            model: model.into(),
            prompt_template: "{brief}".to_string(),
            image_input: ImageInput::None,
            structured: None,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the prompt template.
    #[must_use]
    pub fn with_prompt(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    /// Sets the image sent with the request.
    #[must_use]
    pub fn with_image_input(mut self, input: ImageInput) -> Self {
        self.image_input = input;
        self
    }

    /// Parses text responses into a value of `shape`.
    #[must_use]
    pub fn with_structured_output(
        mut self,
        shape: ExpectedShape,
        extractor: Arc<StructuredExtractor>,
    ) -> Self {
        self.structured = Some((shape, extractor));
        self
    }

    /// Sets the retry policy for the model call.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the model identifier.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Stage for ModelStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StageOutput, StageError> {
        let client = ctx
            .clients()
            .get(&self.client)
            .ok_or_else(|| StageError::MissingClient(self.client.clone()))?;

        let mut request = ModelRequest::new(&self.model, render_prompt(&self.prompt_template, ctx));
        if let Some(image) = self.image_input.resolve(ctx) {
            request = request.with_image(image);
        }

        let token = Arc::clone(ctx.cancel_token());
        let response = with_retry(
            &self.retry,
            &self.name,
            |e: &ModelError| e.is_retryable() && !token.is_cancelled(),
            || {
                let client = Arc::clone(&client);
                let request = request.clone();
                async move { client.generate(request).await }
            },
        )
        .await?;

        let served_by = if response.model.is_empty() {
            self.model.clone()
        } else {
            response.model.clone()
        };
        let mut data = Map::new();
        data.insert("model".to_string(), json!(served_by));

        match (&self.structured, &response.text) {
            (Some((shape, extractor)), Some(text)) => {
                let value = extractor.extract_for_model(&served_by, text, shape, None)?;
                data.insert("result".to_string(), value);
            }
            (Some(_), None) => {
                return Err(ModelError::InvalidResponse(
                    "expected text for structured output".to_string(),
                )
                .into());
            }
            (None, Some(text)) => {
                data.insert("text".to_string(), json!(text));
            }
            (None, None) => {}
        }

        if !response.images.is_empty() {
            let images: Vec<String> = response
                .images
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            data.insert("image_path".to_string(), json!(images[0]));
            data.insert("images".to_string(), json!(images));
        }

        debug!(
            stage = %self.name,
            model = %served_by,
            cost = response.cost,
            images = response.images.len(),
            "Model call finished"
        );

        Ok(StageOutput::new(Value::Object(data))
            .with_cost(response.cost)
            .with_summary(json!({
                "model": served_by,
                "images": response.images.len(),
            })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JobRequest;
    use crate::core::{JobId, Mode};
    use crate::resources::{ClientSet, MockModelClient, ModelResponse};
    use crate::stages::JitterStrategy;
    use mockall::predicate::function;

    fn context(client: MockModelClient, request: JobRequest) -> ExecutionContext {
        let clients = ClientSet::new(Mode::from("generation")).with_client("llm", Arc::new(client));
        ExecutionContext::new(JobId::new(), Mode::from("generation"), request, Arc::new(clients))
    }

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(attempts)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    #[tokio::test]
    async fn test_prompt_rendering_and_text_output() {
        let mut client = MockModelClient::new();
        client
            .expect_generate()
            .with(function(|req: &ModelRequest| req.prompt == "Write about lemonade in bold style"))
            .times(1)
            .returning(|_| Ok(ModelResponse::text("Fresh!").with_cost(0.002)));

        let request = JobRequest::new().with_brief("lemonade").with_param("style", "bold");
        let mut ctx = context(client, request);
        let stage = ModelStage::new("write_caption", "llm", "text-model")
            .with_prompt("Write about {brief} in {param:style} style{param:missing}");

        let output = stage.execute(&mut ctx).await.unwrap();
        assert_eq!(output.data["text"], "Fresh!");
        assert_eq!(output.data["model"], "text-model");
        assert!((output.cost - 0.002).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_structured_output_extracted() {
        let mut client = MockModelClient::new();
        client.expect_generate().returning(|_| {
            Ok(ModelResponse::text("Here you go:\n```json\n{\"headline\": \"Hi\",}\n```"))
        });

        let mut ctx = context(client, JobRequest::new());
        let stage = ModelStage::new("plan_strategy", "llm", "text-model").with_structured_output(
            ExpectedShape::object_with_keys(["headline"]),
            Arc::new(StructuredExtractor::new()),
        );

        let output = stage.execute(&mut ctx).await.unwrap();
        assert_eq!(output.data["result"], json!({"headline": "Hi"}));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let mut client = MockModelClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ModelError::Transport("reset".into())));
        client
            .expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ModelResponse::images(vec![PathBuf::from("/tmp/gen.png")])));

        let mut ctx = context(client, JobRequest::new());
        let stage = ModelStage::new("generate_images", "llm", "image-model").with_retry(fast_retry(3));

        let output = stage.execute(&mut ctx).await.unwrap();
        assert_eq!(output.data["image_path"], "/tmp/gen.png");
    }

    #[tokio::test]
    async fn test_rejected_request_is_not_retried() {
        let mut client = MockModelClient::new();
        client
            .expect_generate()
            .times(1)
            .returning(|_| Err(ModelError::Rejected("policy".into())));

        let mut ctx = context(client, JobRequest::new());
        let stage = ModelStage::new("write_caption", "llm", "text-model").with_retry(fast_retry(5));

        let err = stage.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, StageError::Model(ModelError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_missing_client() {
        let mut ctx = context(MockModelClient::new(), JobRequest::new());
        let stage = ModelStage::new("generate_images", "image", "image-model");

        let err = stage.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, StageError::MissingClient(ref name) if name == "image"));
    }
}
