//! Engine configuration.
//!
//! The configuration is a JSON document. Every field has a default, so an
//! empty object is a valid config describing the three standard modes.

use crate::errors::GenflowError;
use crate::extract::{ExtractionStrategy, DEFAULT_PREVIEW_CHARS};
use crate::stages::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reserved plan entry marking the conditional slot.
pub const CONDITIONAL_SLOT: &str = "$conditional";

/// Environment variable naming a config file for [`EngineConfig::load`].
pub const CONFIG_PATH_ENV: &str = "GENFLOW_CONFIG";

/// Picks the concrete stage of a conditional slot from a request parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalRoute {
    /// Request parameter to read.
    pub param: String,
    /// Parameter value to stage name.
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    /// Stage used when the parameter is absent or unmapped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ConditionalRoute {
    /// Creates a route reading `param`.
    #[must_use]
    pub fn new(param: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            routes: BTreeMap::new(),
            default: None,
        }
    }

    /// Maps a parameter value to a stage.
    #[must_use]
    pub fn route(mut self, value: impl Into<String>, stage: impl Into<String>) -> Self {
        self.routes.insert(value.into(), stage.into());
        self
    }

    /// Sets the fallback stage.
    #[must_use]
    pub fn with_default(mut self, stage: impl Into<String>) -> Self {
        self.default = Some(stage.into());
        self
    }

    /// Every stage this route can produce.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.routes
            .values()
            .chain(self.default.iter())
            .map(String::as_str)
    }
}

fn default_job_timeout() -> f64 {
    600.0
}

fn default_stage_timeout() -> f64 {
    180.0
}

/// Plan and deadlines of one mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Ordered stage names; [`CONDITIONAL_SLOT`] marks the conditional slot.
    pub stages: Vec<String>,
    /// Routing for the conditional slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional: Option<ConditionalRoute>,
    /// Wall-clock limit for the whole run.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_seconds: f64,
    /// Limit for a single stage call.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_seconds: f64,
}

impl ModeConfig {
    /// Creates a mode with default deadlines.
    #[must_use]
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stages: stages.into_iter().map(Into::into).collect(),
            conditional: None,
            job_timeout_seconds: default_job_timeout(),
            stage_timeout_seconds: default_stage_timeout(),
        }
    }

    /// Sets the conditional route.
    #[must_use]
    pub fn with_conditional(mut self, route: ConditionalRoute) -> Self {
        self.conditional = Some(route);
        self
    }

    /// Sets both deadlines.
    #[must_use]
    pub fn with_timeouts(mut self, job_seconds: f64, stage_seconds: f64) -> Self {
        self.job_timeout_seconds = job_seconds;
        self.stage_timeout_seconds = stage_seconds;
        self
    }

    /// The job deadline.
    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.job_timeout_seconds).unwrap_or(Duration::MAX)
    }

    /// The per-stage deadline.
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.stage_timeout_seconds).unwrap_or(Duration::MAX)
    }
}

fn default_channel_capacity() -> usize {
    256
}

/// Progress channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Buffered messages per job before slow subscribers start lagging.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_preview_chars() -> usize {
    DEFAULT_PREVIEW_CHARS
}

/// Structured-output extraction settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Characters of raw text kept in error previews.
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    /// Model name (or prefix) to strategy order.
    #[serde(default)]
    pub model_overrides: HashMap<String, Vec<ExtractionStrategy>>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            preview_chars: default_preview_chars(),
            model_overrides: HashMap::new(),
        }
    }
}

fn default_text_model() -> String {
    "text-model".to_string()
}

fn default_image_model() -> String {
    "image-model".to_string()
}

/// Models used by the standard stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Model for text stages.
    #[serde(default = "default_text_model")]
    pub text_model: String,
    /// Model for image stages.
    #[serde(default = "default_image_model")]
    pub image_model: String,
    /// Retry policy for model calls.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            text_model: default_text_model(),
            image_model: default_image_model(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_modes() -> BTreeMap<String, ModeConfig> {
    let mut modes = BTreeMap::new();
    modes.insert(
        "generation".to_string(),
        ModeConfig::new(["plan_strategy", "generate_images", "write_caption", "save_outputs"])
            .with_timeouts(600.0, 180.0),
    );
    modes.insert(
        "refinement".to_string(),
        ModeConfig::new(["load_base_image", CONDITIONAL_SLOT, "save_outputs"])
            .with_conditional(
                ConditionalRoute::new("refine_type")
                    .route("subject", "subject_repair")
                    .route("background", "background_repair")
                    .route("palette", "palette_edit"),
            )
            .with_timeouts(300.0, 180.0),
    );
    modes.insert(
        "caption".to_string(),
        ModeConfig::new(["write_caption"]).with_timeouts(120.0, 60.0),
    );
    modes
}

/// Top level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Mode name to plan.
    #[serde(default = "default_modes")]
    pub modes: BTreeMap<String, ModeConfig>,
    /// Progress channel settings.
    #[serde(default)]
    pub progress: ProgressConfig,
    /// Extraction settings.
    #[serde(default)]
    pub extraction: ExtractionConfig,
    /// Models for the standard stages.
    #[serde(default)]
    pub models: ModelsConfig,
    /// Root directory for saved outputs.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            modes: default_modes(),
            progress: ProgressConfig::default(),
            extraction: ExtractionConfig::default(),
            models: ModelsConfig::default(),
            output_dir: default_output_dir(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document and validates it.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::Config` for malformed or invalid documents.
    pub fn from_json_str(json: &str) -> Result<Self, GenflowError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| GenflowError::Config(format!("Invalid config document: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::Io` if the file cannot be read and
    /// `GenflowError::Config` if it is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GenflowError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Loads the file named by `GENFLOW_CONFIG` (or the defaults) and applies
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the named file cannot be loaded.
    pub fn load() -> Result<Self, GenflowError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies `GENFLOW_LOG_LEVEL`, `GENFLOW_LOG_JSON` and
    /// `GENFLOW_OUTPUT_DIR` from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("GENFLOW_LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.logging.level = level;
        }
        if let Some(json) = lookup("GENFLOW_LOG_JSON") {
            self.logging.json = matches!(json.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(dir) = lookup("GENFLOW_OUTPUT_DIR").filter(|v| !v.is_empty()) {
            self.output_dir = PathBuf::from(dir);
        }
    }

    /// Returns a mode's configuration.
    #[must_use]
    pub fn mode(&self, name: &str) -> Option<&ModeConfig> {
        self.modes.get(name)
    }

    /// Adds or replaces a mode.
    #[must_use]
    pub fn with_mode(mut self, name: impl Into<String>, mode: ModeConfig) -> Self {
        self.modes.insert(name.into(), mode);
        self
    }

    /// Sets the output directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Checks value ranges. Plan consistency against the stage registry is
    /// checked when the engine is built.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<(), GenflowError> {
        if self.modes.is_empty() {
            return Err(GenflowError::Config("at least one mode is required".into()));
        }
        for (name, mode) in &self.modes {
            if mode.stages.is_empty() {
                return Err(GenflowError::Config(format!("mode '{name}' has no stages")));
            }
            for (label, seconds) in [
                ("job_timeout_seconds", mode.job_timeout_seconds),
                ("stage_timeout_seconds", mode.stage_timeout_seconds),
            ] {
                if !seconds.is_finite() || seconds <= 0.0 {
                    return Err(GenflowError::Config(format!(
                        "mode '{name}': {label} must be a positive number"
                    )));
                }
            }
        }
        if self.progress.channel_capacity == 0 {
            return Err(GenflowError::Config(
                "progress.channel_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_have_standard_modes() {
        let config = EngineConfig::default();
        assert_eq!(
            config.modes.keys().collect::<Vec<_>>(),
            vec!["caption", "generation", "refinement"]
        );

        let refinement = config.mode("refinement").unwrap();
        assert_eq!(refinement.stages[1], CONDITIONAL_SLOT);
        let route = refinement.conditional.as_ref().unwrap();
        assert_eq!(route.routes["subject"], "subject_repair");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.progress.channel_capacity, 256);
        assert_eq!(config.extraction.preview_chars, 200);
    }

    #[test]
    fn test_parse_custom_mode() {
        let json = r#"{
            "modes": {
                "quick": {
                    "stages": ["a", "$conditional"],
                    "conditional": {"param": "kind", "routes": {"x": "b"}, "default": "c"},
                    "job_timeout_seconds": 5
                }
            },
            "extraction": {"model_overrides": {"flaky": ["bracket_repair", "fenced_block"]}}
        }"#;
        let config = EngineConfig::from_json_str(json).unwrap();
        let quick = config.mode("quick").unwrap();

        assert_eq!(quick.job_timeout(), Duration::from_secs(5));
        assert_eq!(quick.stage_timeout(), Duration::from_secs(180));
        let targets: Vec<_> = quick.conditional.as_ref().unwrap().targets().collect();
        assert_eq!(targets, vec!["b", "c"]);
        assert_eq!(
            config.extraction.model_overrides["flaky"][0],
            ExtractionStrategy::BracketRepair
        );
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let json = r#"{"modes": {"m": {"stages": ["a"], "stage_timeout_seconds": 0}}}"#;
        let err = EngineConfig::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("stage_timeout_seconds"));
    }

    #[test]
    fn test_malformed_document_rejected() {
        let err = EngineConfig::from_json_str("{\"modes\": 3}").unwrap_err();
        assert!(matches!(err, GenflowError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"output_dir": "/data/out", "logging": {{"json": true}}}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/data/out"));
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_missing_file() {
        let err = EngineConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, GenflowError::Io(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config.apply_overrides(|key| match key {
            "GENFLOW_LOG_LEVEL" => Some("genflow=debug".to_string()),
            "GENFLOW_LOG_JSON" => Some("TRUE".to_string()),
            "GENFLOW_OUTPUT_DIR" => Some("/srv/outputs".to_string()),
            _ => None,
        });

        assert_eq!(config.logging.level, "genflow=debug");
        assert!(config.logging.json);
        assert_eq!(config.output_dir, PathBuf::from("/srv/outputs"));
    }
}
