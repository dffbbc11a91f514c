//! Job submission, lifecycle and record storage.

mod job_scheduler;
mod store;

pub use job_scheduler::JobScheduler;
pub use store::{InMemoryJobStore, JobFilter, JobStore};
