//! Robust structured-output extraction.
//!
//! Model output that should contain JSON often arrives wrapped in prose,
//! inside fenced blocks, or with small syntax defects. The extractor tries
//! a fixed sequence of strategies and returns the first candidate that
//! matches the expected shape (or passes the caller's fallback validator):
//!
//! 1. [`ExtractionStrategy::FencedBlock`]: contents of a fenced code block.
//! 2. [`ExtractionStrategy::Preprocessed`]: text with conversational
//!    lead-in and trailing commentary removed.
//! 3. [`ExtractionStrategy::TrailingTolerant`]: the first complete value,
//!    ignoring whatever follows it.
//! 4. [`ExtractionStrategy::BracketRepair`]: a balanced bracket span,
//!    parsed after light repair.
//!
//! A per-model override table can reorder the strategies for models with a
//! known failure pattern.

mod repair;
mod strategies;

use crate::config::ExtractionConfig;
use crate::errors::JsonExtractionError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Default number of characters kept in an error preview.
pub const DEFAULT_PREVIEW_CHARS: usize = 200;

/// A fallback acceptance check used when strict shape validation fails.
pub type FallbackValidator = dyn Fn(&Value) -> bool + Send + Sync;

/// One way of recovering a value from model text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// Parse a fenced code block.
    FencedBlock,
    /// Strip wrapper text, then parse.
    Preprocessed,
    /// Parse the first value and ignore trailing data.
    TrailingTolerant,
    /// Parse a balanced bracket span after repair.
    BracketRepair,
}

impl ExtractionStrategy {
    /// The default attempt order.
    pub const DEFAULT_ORDER: [Self; 4] = [
        Self::FencedBlock,
        Self::Preprocessed,
        Self::TrailingTolerant,
        Self::BracketRepair,
    ];

    /// Order for models whose output is known to need repair.
    pub const BRACKET_FIRST: [Self; 4] = [
        Self::BracketRepair,
        Self::FencedBlock,
        Self::Preprocessed,
        Self::TrailingTolerant,
    ];
}

impl fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FencedBlock => write!(f, "fenced_block"),
            Self::Preprocessed => write!(f, "preprocessed"),
            Self::TrailingTolerant => write!(f, "trailing_tolerant"),
            Self::BracketRepair => write!(f, "bracket_repair"),
        }
    }
}

/// What the caller expects to get back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExpectedShape {
    /// Any object or array.
    #[default]
    Any,
    /// A JSON object.
    Object,
    /// A JSON array.
    Array,
    /// An object containing all of these keys.
    ObjectWithKeys(Vec<String>),
}

impl ExpectedShape {
    /// Shorthand for [`ExpectedShape::ObjectWithKeys`].
    #[must_use]
    pub fn object_with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ObjectWithKeys(keys.into_iter().map(Into::into).collect())
    }

    /// Returns true if `value` has this shape.
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Any => value.is_object() || value.is_array(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::ObjectWithKeys(keys) => value
                .as_object()
                .is_some_and(|map| keys.iter().all(|k| map.contains_key(k))),
        }
    }
}

impl fmt::Display for ExpectedShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "object or array"),
            Self::Object => write!(f, "object"),
            Self::Array => write!(f, "array"),
            Self::ObjectWithKeys(keys) => write!(f, "object with keys [{}]", keys.join(", ")),
        }
    }
}

/// Recovers structured values from raw model text.
#[derive(Debug, Clone)]
pub struct StructuredExtractor {
    preview_chars: usize,
    overrides: HashMap<String, Vec<ExtractionStrategy>>,
}

impl Default for StructuredExtractor {
    fn default() -> Self {
        Self {
            preview_chars: DEFAULT_PREVIEW_CHARS,
            overrides: HashMap::new(),
        }
    }
}

impl StructuredExtractor {
    /// Creates an extractor with the default order and no overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an extractor from configuration.
    #[must_use]
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            preview_chars: config.preview_chars,
            overrides: config.model_overrides.clone(),
        }
    }

    /// Sets the preview length used in errors.
    #[must_use]
    pub fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }

    /// Registers a strategy order for a model (or model-name prefix).
    #[must_use]
    pub fn with_model_override(
        mut self,
        model: impl Into<String>,
        order: impl Into<Vec<ExtractionStrategy>>,
    ) -> Self {
        self.overrides.insert(model.into(), order.into());
        self
    }

    /// Returns the strategy order used for `model`.
    ///
    /// An exact override wins over the longest matching prefix.
    #[must_use]
    pub fn strategy_order(&self, model: Option<&str>) -> &[ExtractionStrategy] {
        let Some(model) = model else {
            return &ExtractionStrategy::DEFAULT_ORDER;
        };
        self.overrides
            .get(model)
            .or_else(|| {
                self.overrides
                    .iter()
                    .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
                    .max_by_key(|(prefix, _)| prefix.len())
                    .map(|(_, order)| order)
            })
            .filter(|order| !order.is_empty())
            .map_or(&ExtractionStrategy::DEFAULT_ORDER[..], Vec::as_slice)
    }

    /// Extracts a value using the default strategy order.
    ///
    /// # Errors
    ///
    /// Returns `JsonExtractionError` if no strategy yields an acceptable value.
    pub fn extract(
        &self,
        raw: &str,
        shape: &ExpectedShape,
        validator: Option<&FallbackValidator>,
    ) -> Result<Value, JsonExtractionError> {
        self.extract_with_order(raw, shape, validator, self.strategy_order(None))
    }

    /// Extracts a value using the strategy order configured for `model`.
    ///
    /// # Errors
    ///
    /// Returns `JsonExtractionError` if no strategy yields an acceptable value.
    pub fn extract_for_model(
        &self,
        model: &str,
        raw: &str,
        shape: &ExpectedShape,
        validator: Option<&FallbackValidator>,
    ) -> Result<Value, JsonExtractionError> {
        self.extract_with_order(raw, shape, validator, self.strategy_order(Some(model)))
    }

    /// Extracts a value and deserializes it into `T`.
    ///
    /// # Errors
    ///
    /// Returns `JsonExtractionError` if extraction or deserialization fails.
    pub fn extract_as<T: DeserializeOwned>(
        &self,
        model: Option<&str>,
        raw: &str,
        shape: &ExpectedShape,
    ) -> Result<T, JsonExtractionError> {
        let order = self.strategy_order(model);
        let value = self.extract_with_order(raw, shape, None, order)?;
        serde_json::from_value(value).map_err(|e| {
            let mut err = self.failure(raw, order.to_vec(), shape);
            err.reason = Some(e.to_string());
            err
        })
    }

    fn extract_with_order(
        &self,
        raw: &str,
        shape: &ExpectedShape,
        validator: Option<&FallbackValidator>,
        order: &[ExtractionStrategy],
    ) -> Result<Value, JsonExtractionError> {
        let mut attempted = Vec::with_capacity(order.len());

        for &strategy in order {
            attempted.push(strategy);
            for candidate in strategies::candidates(strategy, raw) {
                if shape.matches(&candidate) {
                    debug!(strategy = %strategy, "Extracted structured output");
                    return Ok(candidate);
                }
                if validator.is_some_and(|accept| accept(&candidate)) {
                    debug!(strategy = %strategy, "Extracted structured output via fallback validator");
                    return Ok(candidate);
                }
            }
        }

        let err = self.failure(raw, attempted, shape);
        warn!(
            expected = %shape,
            attempted = err.attempted.len(),
            "Structured output extraction failed"
        );
        Err(err)
    }

    fn failure(
        &self,
        raw: &str,
        attempted: Vec<ExtractionStrategy>,
        shape: &ExpectedShape,
    ) -> JsonExtractionError {
        JsonExtractionError {
            preview: truncate_preview(raw, self.preview_chars),
            attempted,
            expected: shape.to_string(),
            reason: None,
        }
    }
}

/// Truncates on a character boundary, marking the cut with an ellipsis.
fn truncate_preview(raw: &str, max_chars: usize) -> String {
    match raw.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &raw[..cut]),
        None => raw.to_string(),
    }
}
