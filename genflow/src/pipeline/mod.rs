//! Stage plans and their execution.
//!
//! This module provides:
//! - Plan resolution per mode, with validation against the stage registry
//! - The conditional slot and its resolvers
//! - The sequential pipeline executor

mod executor;
mod plan;


pub use executor::{PipelineExecutor, RunOutcome};
pub use plan::{ConditionalResolver, ParamRouter, PlanResolver, SlotKind, StageDescriptor, StagePlan};
