//! Server settings: listener, broker tunables, and logging.
//!
//! Settings are JSON with camelCase keys. Every section is optional in the
//! file; missing keys keep their compiled defaults.

mod errors;
mod loader;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, parse_bool,
    parse_u16_range, parse_u64_range, parse_usize_range, settings_path,
};

use herald_broker::BrokerConfig;
use serde::{Deserialize, Serialize};

/// Top-level settings document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeraldSettings {
    /// HTTP/WebSocket listener.
    pub server: ServerSettings,
    /// Broker tunables and preconfigured channels.
    pub broker: BrokerConfig,
    /// Log output.
    pub logging: LoggingSettings,
}

impl HeraldSettings {
    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            return Err(SettingsError::Invalid(
                "server.maxConnections must be > 0".into(),
            ));
        }
        self.broker.validate()?;
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8090,
            max_connections: 10_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}
