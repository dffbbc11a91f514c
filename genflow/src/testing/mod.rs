//! Testing utilities for genflow engines.
//!
//! This module provides:
//! - Mock stages, a scripted model client and a static client factory
//! - An in-memory engine fixture

mod fixtures;
mod mocks;

pub use fixtures::{single_mode_config, TestEngine};
pub use mocks::{
    FailingStage, GatedStage, MockStage, RecordedExecution, RecordingStage, ScriptedModelClient,
    SlowStage, StaticClientFactory,
};
