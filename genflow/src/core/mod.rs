//! Core domain model types for genflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Job identifiers and mode names
//! - Job, stage and failure status enums
//! - Stage output with its cost
//! - Progress events and the persisted job record

mod event;
mod ids;
mod output;
mod record;
mod status;

pub use event::{JobSnapshot, ProgressEvent, ProgressMessage, TerminalEvent};
pub use ids::{JobId, Mode};
pub use output::StageOutput;
pub use record::{round_cost, JobRecord, StageProgress};
pub use status::{FailureKind, JobStatus, StageStatus};
