//! # Genflow
//!
//! A pipeline orchestration engine for model-driven content generation.
//!
//! Each job runs an ordered plan of stages chosen by its mode:
//!
//! - **Plans**: modes map to stage lists, validated against the stage registry at startup
//! - **Conditional slots**: one slot per plan may pick its stage from the request
//! - **Detached jobs**: `submit` returns immediately, stages run on a tokio task
//! - **Progress**: subscribers get a snapshot of the job and then live stage events
//! - **Lineage**: refinements resolve the parent artifact they build on
//! - **Structured output**: model text is parsed into JSON through a repair ladder
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use genflow::prelude::*;
//!
//! let engine = Engine::builder()
//!     .config(EngineConfig::load()?)
//!     .client_factory(MyClients::new())
//!     .build()
//!     .await?;
//!
//! let job = engine
//!     .scheduler()
//!     .submit("generation", JobRequest::new().with_brief("summer lemonade"))
//!     .await?;
//!
//! let mut progress = engine.scheduler().subscribe(job).await?;
//! while let Some(message) = progress.next().await {
//!     println!("{message:?}");
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod engine;
pub mod errors;
pub mod extract;
pub mod lineage;
pub mod logging;
pub mod pipeline;
pub mod progress;
pub mod resources;
pub mod scheduler;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        ConditionalRoute, EngineConfig, LoggingConfig, ModeConfig, CONDITIONAL_SLOT,
    };
    pub use crate::context::{ExecutionContext, JobRequest, StageOutputs};
    pub use crate::core::{
        FailureKind, JobId, JobRecord, JobSnapshot, JobStatus, Mode, ProgressEvent,
        ProgressMessage, StageOutput, StageStatus, TerminalEvent,
    };
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::errors::{CancelError, GenflowError, StageError};
    pub use crate::extract::{ExpectedShape, StructuredExtractor};
    pub use crate::lineage::{LineageTracker, ParentRef};
    pub use crate::logging::init_logging;
    pub use crate::pipeline::{ConditionalResolver, PlanResolver, StagePlan};
    pub use crate::progress::ProgressSubscription;
    pub use crate::resources::{ClientFactory, ClientSet, ModelClient, ModelRequest, ModelResponse};
    pub use crate::scheduler::{JobFilter, JobScheduler, JobStore};
    pub use crate::stages::{FnStage, Stage, StageRegistry};
}
