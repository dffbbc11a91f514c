//! Per-job state threaded through every stage.
//!
//! This module provides:
//! - The job request as submitted
//! - The ordered, append-only stage output map
//! - The mutable execution context owned by one executor run

mod execution;
mod outputs;
mod request;

pub use execution::ExecutionContext;
pub use outputs::StageOutputs;
pub use request::JobRequest;
