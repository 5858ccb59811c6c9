//! Logging initialisation.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

use crate::settings::LoggingSettings;

/// Build the level filter: `RUST_LOG` if set, else the configured level.
pub fn env_filter(settings: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(settings: &LoggingSettings) -> Result<(), TryInitError> {
    let fmt_layer = if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().compact().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter(settings))
        .with(fmt_layer)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_is_used() {
        let settings = LoggingSettings {
            level: "herald_broker=debug,warn".into(),
            json: false,
        };
        let filter = env_filter(&settings);
        if std::env::var("RUST_LOG").is_err() {
            assert!(filter.to_string().contains("herald_broker=debug"));
        }
    }

    #[test]
    fn invalid_level_falls_back() {
        let settings = LoggingSettings {
            level: "[[not a filter".into(),
            json: true,
        };
        // Must not panic.
        let _ = env_filter(&settings);
    }
}
