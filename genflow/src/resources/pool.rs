//! Process-wide pool of per-mode client sets.

use super::{ClientFactory, ClientSet};
use crate::core::Mode;
use crate::errors::GenflowError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Pre-built client sets, one per mode.
///
/// Built once at startup and injected into every executor run. Lookups
/// return the same `Arc` for the lifetime of the pool.
#[derive(Debug, Clone, Default)]
pub struct ResourcePool {
    sets: HashMap<Mode, Arc<ClientSet>>,
}

impl ResourcePool {
    /// Builds a client set for every mode, failing on the first error.
    ///
    /// # Errors
    ///
    /// Returns `GenflowError::ResourceInit` naming the mode whose clients
    /// could not be constructed.
    pub async fn initialize<I>(factory: &dyn ClientFactory, modes: I) -> Result<Self, GenflowError>
    where
        I: IntoIterator<Item = Mode>,
    {
        let mut sets = HashMap::new();
        for mode in modes {
            if sets.contains_key(&mode) {
                continue;
            }
            let started = Instant::now();
            let set = match factory.build(&mode).await {
                Ok(set) => set,
                Err(source) => {
                    error!(mode = %mode, error = %source, "Client initialization failed");
                    return Err(GenflowError::ResourceInit { mode, source });
                }
            };
            info!(
                mode = %mode,
                clients = set.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Initialized client set"
            );
            sets.insert(mode, Arc::new(set));
        }
        Ok(Self { sets })
    }

    /// Creates a pool from already built sets.
    #[must_use]
    pub fn from_sets<I>(sets: I) -> Self
    where
        I: IntoIterator<Item = ClientSet>,
    {
        Self {
            sets: sets
                .into_iter()
                .map(|set| (set.mode().clone(), Arc::new(set)))
                .collect(),
        }
    }

    /// Returns the client set for a mode.
    #[must_use]
    pub fn get(&self, mode: &str) -> Option<Arc<ClientSet>> {
        self.sets.get(mode).cloned()
    }

    /// Modes with a client set.
    pub fn modes(&self) -> impl Iterator<Item = &Mode> {
        self.sets.keys()
    }

    /// Returns the number of client sets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Returns true if the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingFactory {
        built: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl ClientFactory for CountingFactory {
        async fn build(&self, mode: &Mode) -> anyhow::Result<ClientSet> {
            self.built.lock().push(mode.to_string());
            if self.fail_on == Some(mode.as_str()) {
                anyhow::bail!("missing credentials for {mode}");
            }
            Ok(ClientSet::new(mode.clone()))
        }
    }

    #[tokio::test]
    async fn test_initialize_builds_each_mode_once() {
        let factory = CountingFactory::default();
        let pool = ResourcePool::initialize(
            &factory,
            ["generation", "caption", "generation"].map(Mode::from),
        )
        .await
        .unwrap();

        assert_eq!(pool.len(), 2);
        assert_eq!(factory.built.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_get_returns_same_instance() {
        let factory = CountingFactory::default();
        let pool = ResourcePool::initialize(&factory, [Mode::from("caption")])
            .await
            .unwrap();

        let first = pool.get("caption").unwrap();
        let second = pool.get("caption").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(pool.get("generation").is_none());
    }

    #[tokio::test]
    async fn test_initialize_fails_fast() {
        let factory = CountingFactory {
            fail_on: Some("generation"),
            ..CountingFactory::default()
        };
        let err = ResourcePool::initialize(
            &factory,
            ["generation", "caption"].map(Mode::from),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, GenflowError::ResourceInit { ref mode, .. } if mode.as_str() == "generation"));
        assert_eq!(*factory.built.lock(), vec!["generation".to_string()]);
    }
}
