//! Shared external model clients.
//!
//! Clients are built once per mode at startup by a [`ClientFactory`] and
//! handed to every job of that mode as a read-only [`ClientSet`].

mod client;
mod pool;

#[cfg(test)]
pub use client::MockModelClient;
pub use client::{ClientFactory, ClientSet, ModelClient, ModelRequest, ModelResponse};
pub use pool::ResourcePool;
