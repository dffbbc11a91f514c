//! Model client contract and per-mode client sets.

use crate::core::Mode;
use crate::errors::ModelError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A request to an external model API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Model identifier.
    pub model: String,
    /// Rendered prompt.
    pub prompt: String,
    /// Optional input image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    /// Provider specific options.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ModelRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Sets the input image.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Adds a provider option.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// A model API response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Text output, for language models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Image outputs written by the client.
    #[serde(default)]
    pub images: Vec<PathBuf>,
    /// Cost reported for the call.
    #[serde(default)]
    pub cost: f64,
    /// Model that served the call.
    #[serde(default)]
    pub model: String,
}

impl ModelResponse {
    /// Creates a text response.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Creates an image response.
    #[must_use]
    pub fn images(images: Vec<PathBuf>) -> Self {
        Self {
            images,
            ..Self::default()
        }
    }

    /// Sets the cost.
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Sets the serving model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// An external model API.
///
/// Implementations are shared by every concurrent job of a mode and must
/// not keep per-job state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Performs one call.
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// Named clients available to the jobs of one mode.
#[derive(Clone)]
pub struct ClientSet {
    mode: Mode,
    clients: BTreeMap<String, Arc<dyn ModelClient>>,
}

impl ClientSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            clients: BTreeMap::new(),
        }
    }

    /// Adds a client under `name`.
    #[must_use]
    pub fn with_client(mut self, name: impl Into<String>, client: Arc<dyn ModelClient>) -> Self {
        self.clients.insert(name.into(), client);
        self
    }

    /// Returns the mode this set was built for.
    #[must_use]
    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Gets a client by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ModelClient>> {
        self.clients.get(name).cloned()
    }

    /// Client names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    /// Returns the number of clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if the set has no clients.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl fmt::Debug for ClientSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSet")
            .field("mode", &self.mode)
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builds the client set of a mode.
///
/// Construction may read credentials or perform handshakes; it runs once per
/// mode at startup.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Builds the clients for `mode`.
    async fn build(&self, mode: &Mode) -> anyhow::Result<ClientSet>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_client_in_set() {
        let mut mock = MockModelClient::new();
        mock.expect_generate()
            .times(1)
            .returning(|req| Ok(ModelResponse::text(format!("echo {}", req.prompt)).with_cost(0.01)));

        let set = ClientSet::new(Mode::from("caption")).with_client("llm", Arc::new(mock));
        let client = set.get("llm").unwrap();
        let response = client.generate(ModelRequest::new("m", "hi")).await.unwrap();

        assert_eq!(response.text.as_deref(), Some("echo hi"));
        assert!(set.get("image").is_none());
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["llm"]);
    }

    #[test]
    fn test_debug_lists_names_only() {
        let set = ClientSet::new(Mode::from("caption"));
        let text = format!("{set:?}");
        assert!(text.contains("caption"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_request_builder() {
        let req = ModelRequest::new("img-1", "draw")
            .with_image("/tmp/in.png")
            .with_param("strength", 0.4);
        assert_eq!(req.image, Some(PathBuf::from("/tmp/in.png")));
        assert_eq!(req.params["strength"], 0.4);
    }
}
