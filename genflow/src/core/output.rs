//! The value a stage hands back to the executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The output of a successful stage execution.
///
/// The executor records `data` under the stage's name in the job's ordered
/// output map and adds `cost` to the job total. `summary` is forwarded to
/// progress subscribers on the `completed` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageOutput {
    /// The stage's result.
    #[serde(default)]
    pub data: Value,

    /// Cost incurred by the stage, in provider currency units.
    #[serde(default)]
    pub cost: f64,

    /// Small payload for progress subscribers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,

    /// Human readable completion message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StageOutput {
    /// Creates an output carrying `data`.
    #[must_use]
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Creates an output with no data.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sets the cost.
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Sets the progress summary.
    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<Value>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Sets the completion message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder() {
        let output = StageOutput::new(json!({"caption": "a cat"}))
            .with_cost(0.0125)
            .with_summary(json!({"chars": 5}))
            .with_message("captioned");

        assert_eq!(output.data["caption"], "a cat");
        assert!((output.cost - 0.0125).abs() < f64::EPSILON);
        assert_eq!(output.summary, Some(json!({"chars": 5})));
        assert_eq!(output.message.as_deref(), Some("captioned"));
    }

    #[test]
    fn test_empty_has_null_data_and_zero_cost() {
        let output = StageOutput::empty();
        assert!(output.data.is_null());
        assert!(output.cost.abs() < f64::EPSILON);
    }

    #[test]
    fn test_serialization_skips_absent_fields() {
        let json = serde_json::to_value(StageOutput::new(json!(1))).unwrap();
        assert!(json.get("summary").is_none());
        assert!(json.get("message").is_none());
    }
}
