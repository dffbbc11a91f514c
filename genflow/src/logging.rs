//! Structured logging setup.

use crate::config::LoggingConfig;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Builds the filter: `RUST_LOG` when set, otherwise the configured level.
fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global tracing subscriber.
///
/// Only the first call has an effect. If another subscriber is already
/// installed (an embedding application, a test harness) it is kept.
pub fn init_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let layer = if config.json {
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .json()
                .with_filter(env_filter(config))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_filter(env_filter(config))
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
            return;
        }

        tracing::info!(level = %config.level, json = config.json, "Logging initialized");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        init_logging(&config);
        init_logging(&LoggingConfig {
            level: "debug".to_string(),
            json: true,
        });
        assert!(LOGGER_INITIALIZED.get().is_some());
    }

    #[test]
    fn test_invalid_level_falls_back() {
        let filter = env_filter(&LoggingConfig {
            level: "[[not a directive".to_string(),
            json: false,
        });
        assert!(!filter.to_string().is_empty());
    }
}
