//! Broker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{Priority, validate_channel_name};
use crate::errors::{BrokerError, Result};
use crate::retention::RetentionPolicy;

/// Tunables for a broker instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    /// Interval between heartbeat pings, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Maximum number of events kept per channel.
    pub max_history_per_channel: usize,
    /// Default maximum event age kept per channel, in milliseconds.
    pub retention_window_ms: u64,
    /// Maximum serialized size of a published payload or inbound frame.
    pub max_payload_bytes: usize,
    /// Per-connection outbound buffer size (messages).
    pub send_queue_capacity: usize,
    /// Channels created at startup with explicit metadata.
    pub channels: Vec<ChannelSpec>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            max_history_per_channel: 100,
            retention_window_ms: 3_600_000,
            max_payload_bytes: 1024 * 1024, // 1 MiB
            send_queue_capacity: 256,
            channels: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Retention policy applied to channels without an override.
    pub fn default_retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            window: Duration::from_millis(self.retention_window_ms),
            max_events: self.max_history_per_channel,
        }
    }

    /// Reject values that would make the broker misbehave.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 5] = [
            (self.heartbeat_interval_ms == 0, "heartbeatIntervalMs must be > 0"),
            (self.max_history_per_channel == 0, "maxHistoryPerChannel must be > 0"),
            (self.retention_window_ms == 0, "retentionWindowMs must be > 0"),
            (self.max_payload_bytes == 0, "maxPayloadBytes must be > 0"),
            (self.send_queue_capacity == 0, "sendQueueCapacity must be > 0"),
        ];
        if let Some((_, msg)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(BrokerError::InvalidConfig((*msg).to_owned()));
        }
        for spec in &self.channels {
            validate_channel_name(&spec.name)?;
            if spec.retention_window_ms == Some(0) || spec.max_history == Some(0) {
                return Err(BrokerError::InvalidConfig(format!(
                    "channel '{}' has a zero retention override",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

/// A channel declared up front with explicit metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSpec {
    /// Unique channel name.
    pub name: String,
    /// Delivery priority label.
    #[serde(default)]
    pub priority: Priority,
    /// Per-channel retention window override, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_window_ms: Option<u64>,
    /// Per-channel history cap override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history: Option<usize>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ChannelSpec {
    /// A spec with default priority and no overrides.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: Priority::default(),
            retention_window_ms: None,
            max_history: None,
            description: None,
        }
    }

    /// Resolve this spec's retention policy against broker defaults.
    pub fn retention(&self, defaults: RetentionPolicy) -> RetentionPolicy {
        RetentionPolicy {
            window: self
                .retention_window_ms
                .map_or(defaults.window, Duration::from_millis),
            max_events: self.max_history.unwrap_or(defaults.max_events),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.max_history_per_channel, 100);
        assert_eq!(cfg.retention_window_ms, 3_600_000);
        assert_eq!(cfg.max_payload_bytes, 1024 * 1024);
        assert!(cfg.channels.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialize_uses_camel_case_and_fills_defaults() {
        let json = r#"{"heartbeatIntervalMs":5000,"maxHistoryPerChannel":10}"#;
        let cfg: BrokerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.heartbeat_interval_ms, 5000);
        assert_eq!(cfg.max_history_per_channel, 10);
        assert_eq!(cfg.retention_window_ms, 3_600_000);
    }

    #[test]
    fn zero_heartbeat_rejected() {
        let cfg = BrokerConfig {
            heartbeat_interval_ms: 0,
            ..BrokerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeatIntervalMs"));
    }

    #[test]
    fn zero_history_rejected() {
        let cfg = BrokerConfig {
            max_history_per_channel: 0,
            ..BrokerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_channel_name_rejected() {
        let cfg = BrokerConfig {
            channels: vec![ChannelSpec::named("has spaces")],
            ..BrokerConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(BrokerError::InvalidChannelName { .. })
        ));
    }

    #[test]
    fn channel_spec_overrides_retention() {
        let defaults = BrokerConfig::default().default_retention();
        let spec = ChannelSpec {
            retention_window_ms: Some(1_000),
            ..ChannelSpec::named("compliance-alerts")
        };
        let policy = spec.retention(defaults);
        assert_eq!(policy.window, Duration::from_secs(1));
        assert_eq!(policy.max_events, 100);
    }

    #[test]
    fn channel_spec_parses_priority() {
        let json = r#"{"name":"staffing-events","priority":"critical","maxHistory":5}"#;
        let spec: ChannelSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.priority, Priority::Critical);
        assert_eq!(spec.max_history, Some(5));
        assert!(spec.description.is_none());
    }
}
