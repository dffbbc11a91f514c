//! Ordered stage output map.

use crate::errors::OutputConflictError;
use serde::Serialize;
use serde_json::{Map, Value};

/// Stage name to stage output, in execution order.
///
/// Keys are unique: writing a second output under the same stage name
/// returns an `OutputConflictError`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StageOutputs {
    entries: Map<String, Value>,
}

impl StageOutputs {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a stage's output.
    ///
    /// # Errors
    ///
    /// Returns `OutputConflictError` if the stage already recorded one.
    pub fn insert(&mut self, stage: impl Into<String>, value: Value) -> Result<(), OutputConflictError> {
        let stage = stage.into();
        if self.entries.contains_key(&stage) {
            return Err(OutputConflictError::new(stage));
        }
        self.entries.insert(stage, value);
        Ok(())
    }

    /// Gets a stage's output.
    #[must_use]
    pub fn get(&self, stage: &str) -> Option<&Value> {
        self.entries.get(stage)
    }

    /// Checks if a stage recorded an output.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.entries.contains_key(stage)
    }

    /// Stage names in execution order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entries in execution order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Finds the most recent string value stored under `field` by any stage.
    #[must_use]
    pub fn latest_str(&self, field: &str) -> Option<&str> {
        self.entries
            .values()
            .rev()
            .find_map(|v| v.get(field).and_then(Value::as_str))
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no stage has recorded an output.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the map.
    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_preserves_execution_order() {
        let mut outputs = StageOutputs::new();
        outputs.insert("zeta", json!(1)).unwrap();
        outputs.insert("alpha", json!(2)).unwrap();
        outputs.insert("mid", json!(3)).unwrap();

        let names: Vec<_> = outputs.names().collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_insert_conflict() {
        let mut outputs = StageOutputs::new();
        outputs.insert("caption", json!("a")).unwrap();
        let err = outputs.insert("caption", json!("b")).unwrap_err();

        assert_eq!(err.stage, "caption");
        assert_eq!(outputs.get("caption"), Some(&json!("a")));
    }

    #[test]
    fn test_latest_str_prefers_newest_stage() {
        let mut outputs = StageOutputs::new();
        outputs.insert("generate", json!({"image_path": "/a.png"})).unwrap();
        outputs.insert("caption", json!({"text": "hi"})).unwrap();
        outputs.insert("repair", json!({"image_path": "/b.png"})).unwrap();

        assert_eq!(outputs.latest_str("image_path"), Some("/b.png"));
        assert_eq!(outputs.latest_str("missing"), None);
    }

    #[test]
    fn test_serializes_as_ordered_object() {
        let mut outputs = StageOutputs::new();
        outputs.insert("b", json!(1)).unwrap();
        outputs.insert("a", json!(2)).unwrap();
        assert_eq!(serde_json::to_string(&outputs).unwrap(), r#"{"b":1,"a":2}"#);
    }
}
