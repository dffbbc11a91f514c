//! The standard stage set for the generation, refinement and caption modes.

use super::{ImageInput, LoadBaseImageStage, ModelStage, SaveOutputsStage, StageRegistry};
use crate::config::EngineConfig;
use crate::errors::GenflowError;
use crate::extract::{ExpectedShape, StructuredExtractor};
use std::sync::Arc;

/// Client name for text models.
pub const TEXT_CLIENT: &str = "text";
/// Client name for image models.
pub const IMAGE_CLIENT: &str = "image";

/// Model-backed stages used by the default modes.
///
/// Prompt wording here is a placeholder; deployments register their own
/// stages under the same names to change it.
#[must_use]
pub fn standard_stages(config: &EngineConfig, extractor: &Arc<StructuredExtractor>) -> Vec<ModelStage> {
    let text = &config.models.text_model;
    let image = &config.models.image_model;
    let retry = config.models.retry.clone();

    vec![
        ModelStage::new("plan_strategy", TEXT_CLIENT, text)
            .with_prompt("Plan a visual campaign for: {brief}. Answer as JSON with headline, style and palette.")
            .with_structured_output(
                ExpectedShape::object_with_keys(["headline", "style"]),
                Arc::clone(extractor),
            ),
        ModelStage::new("generate_images", IMAGE_CLIENT, image)
            .with_prompt("{brief}\n{output:plan_strategy}")
            .with_image_input(ImageInput::Reference),
        ModelStage::new("write_caption", TEXT_CLIENT, text)
            .with_prompt("Write a short caption for: {brief}"),
        ModelStage::new("subject_repair", IMAGE_CLIENT, image)
            .with_prompt("Repair the main subject. {param:instructions}")
            .with_image_input(ImageInput::Base),
        ModelStage::new("background_repair", IMAGE_CLIENT, image)
            .with_prompt("Repair the background. {param:instructions}")
            .with_image_input(ImageInput::Base),
        ModelStage::new("palette_edit", IMAGE_CLIENT, image)
            .with_prompt("Recolor using the palette {param:palette}. {param:instructions}")
            .with_image_input(ImageInput::Base),
    ]
    .into_iter()
    .map(|stage| stage.with_retry(retry.clone()))
    .collect()
}

/// A registry holding the built-in stages and [`standard_stages`].
///
/// # Errors
///
/// Never fails for the built-in names; the `Result` mirrors
/// [`StageRegistry::register`].
pub fn standard_registry(
    config: &EngineConfig,
    extractor: &Arc<StructuredExtractor>,
) -> Result<StageRegistry, GenflowError> {
    let mut registry = StageRegistry::new()
        .with_stage(LoadBaseImageStage::new())?
        .with_stage(SaveOutputsStage::new(&config.output_dir))?;
    for stage in standard_stages(config, extractor) {
        registry.register(Arc::new(stage))?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONDITIONAL_SLOT;
    use crate::stages::Stage;

    #[test]
    fn test_standard_registry_covers_default_modes() {
        let config = EngineConfig::default();
        let registry = standard_registry(&config, &Arc::new(StructuredExtractor::new())).unwrap();

        for mode in config.modes.values() {
            for stage in mode.stages.iter().filter(|s| *s != CONDITIONAL_SLOT) {
                assert!(registry.contains(stage), "missing {stage}");
            }
            if let Some(route) = &mode.conditional {
                for target in route.targets() {
                    assert!(registry.contains(target), "missing {target}");
                }
            }
        }
    }

    #[test]
    fn test_models_follow_config() {
        let mut config = EngineConfig::default();
        config.models.image_model = "img-xl".to_string();
        let stages = standard_stages(&config, &Arc::new(StructuredExtractor::new()));

        let palette = stages.iter().find(|s| s.name() == "palette_edit").unwrap();
        assert_eq!(palette.model(), "img-xl");
    }
}
