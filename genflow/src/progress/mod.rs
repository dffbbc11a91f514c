//! Per-job progress channel with snapshot-then-live subscriptions.

mod channel;

pub use channel::{ProgressChannel, ProgressSubscription};
