//! Stages every deployment registers: loading the refinement base and
//! persisting final outputs.

use super::Stage;
use crate::context::{ExecutionContext, StageOutputs};
use crate::core::StageOutput;
use crate::errors::StageError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Checks that the job's base image exists and records it.
///
/// Refinement jobs use the resolved parent artifact. Other jobs fall back to
/// the request's reference image.
#[derive(Debug, Clone, Default)]
pub struct LoadBaseImageStage;

impl LoadBaseImageStage {
    /// Registered name.
    pub const NAME: &'static str = "load_base_image";

    /// Creates the stage.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for LoadBaseImageStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StageOutput, StageError> {
        let path = ctx
            .base_image()
            .or_else(|| ctx.reference_image())
            .map(Path::to_path_buf)
            .ok_or_else(|| StageError::MissingInput("base image".to_string()))?;

        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            StageError::failed(format!("Base image {} is not readable: {e}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(StageError::failed(format!(
                "Base image {} is not a file",
                path.display()
            )));
        }

        debug!(path = %path.display(), bytes = metadata.len(), "Loaded base image");
        Ok(StageOutput::new(json!({
            "path": path.display().to_string(),
            "image_path": path.display().to_string(),
            "bytes": metadata.len(),
        }))
        .with_summary(json!({ "bytes": metadata.len() })))
    }
}

/// Copies the newest produced images into the job's output directory and
/// records them as artifacts.
#[derive(Debug, Clone)]
pub struct SaveOutputsStage {
    output_dir: PathBuf,
}

impl SaveOutputsStage {
    /// Registered name.
    pub const NAME: &'static str = "save_outputs";

    /// Creates the stage writing under `output_dir`.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Returns the output root.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

/// Images from the most recent stage that produced any.
///
/// A stage reports images as an `images` array or a single `image_path`.
fn latest_images(outputs: &StageOutputs) -> Vec<PathBuf> {
    for (_, value) in outputs.iter().rev() {
        if let Some(images) = value.get("images").and_then(Value::as_array) {
            let paths: Vec<PathBuf> = images
                .iter()
                .filter_map(Value::as_str)
                .map(PathBuf::from)
                .collect();
            if !paths.is_empty() {
                return paths;
            }
        }
        if let Some(path) = value.get("image_path").and_then(Value::as_str) {
            return vec![PathBuf::from(path)];
        }
    }
    Vec::new()
}

#[async_trait]
impl Stage for SaveOutputsStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<StageOutput, StageError> {
        let mut sources = latest_images(ctx.outputs());
        if sources.is_empty() {
            if let Some(fallback) = ctx.base_image().or_else(|| ctx.reference_image()) {
                sources.push(fallback.to_path_buf());
            }
        }
        if sources.is_empty() {
            return Err(StageError::MissingInput("image to save".to_string()));
        }

        let job_dir = self.output_dir.join(ctx.job_id().to_string());
        tokio::fs::create_dir_all(&job_dir).await?;

        let mut saved = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let ext = source
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("png");
            let dest = job_dir.join(format!("output_{index}.{ext}"));
            tokio::fs::copy(source, &dest).await.map_err(|e| {
                StageError::failed(format!("Failed to save {}: {e}", source.display()))
            })?;
            ctx.record_artifact(dest.clone());
            saved.push(dest.display().to_string());
        }

        let count = saved.len();
        Ok(StageOutput::new(json!({ "artifacts": saved }))
            .with_summary(json!({ "saved": count }))
            .with_message(format!("Saved {count} output(s)")))
    }
}
