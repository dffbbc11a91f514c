//! Stage name to implementation lookup.

use super::Stage;
use crate::errors::GenflowError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The closed set of stages a plan may reference.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    stages: BTreeMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage under its own name.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::Config` if the name is already taken.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> Result<(), GenflowError> {
        let name = stage.name().to_string();
        if self.stages.contains_key(&name) {
            return Err(GenflowError::Config(format!(
                "Stage '{name}' is already registered"
            )));
        }
        self.stages.insert(name, stage);
        Ok(())
    }

    /// Registers a stage, builder style.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::Config` if the name is already taken.
    pub fn with_stage<S: Stage + 'static>(mut self, stage: S) -> Result<Self, GenflowError> {
        self.register(Arc::new(stage))?;
        Ok(self)
    }

    /// Registers a stage, replacing and returning any stage with that name.
    pub fn replace(&mut self, stage: Arc<dyn Stage>) -> Option<Arc<dyn Stage>> {
        self.stages.insert(stage.name().to_string(), stage)
    }

    /// Gets a stage by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }

    /// Checks whether a stage is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }

    /// Returns the number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::NoOpStage;

    #[test]
    fn test_register_and_get() {
        let registry = StageRegistry::new()
            .with_stage(NoOpStage::new("a"))
            .unwrap()
            .with_stage(NoOpStage::new("b"))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("a"));
        assert_eq!(registry.get("b").unwrap().name(), "b");
        assert!(registry.get("c").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = StageRegistry::new();
        registry.register(Arc::new(NoOpStage::new("a"))).unwrap();
        let err = registry.register(Arc::new(NoOpStage::new("a"))).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_replace_overrides() {
        let mut registry = StageRegistry::new().with_stage(NoOpStage::new("a")).unwrap();
        assert!(registry.replace(Arc::new(NoOpStage::new("a"))).is_some());
        assert!(registry.replace(Arc::new(NoOpStage::new("b"))).is_none());
        assert_eq!(registry.len(), 2);
    }
}
