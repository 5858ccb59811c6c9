//! Named channels and their subscriber sets.
//!
//! The registry keeps both sides of every subscription consistent: a
//! connection ID is in a channel's subscriber set exactly when that channel is
//! in the connection's subscription map. Both are updated while the registry's
//! write lock is held, so readers never observe one side without the other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::ChannelSpec;
use crate::connection::{Connection, ConnectionRegistry};
use crate::errors::{BrokerError, Result};
use crate::filter::Filter;
use crate::ids::ConnectionId;
use crate::retention::RetentionPolicy;

/// Longest accepted channel name.
pub const MAX_CHANNEL_NAME_LEN: usize = 128;

/// Channel delivery priority.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Must reach operators immediately.
    Critical,
    /// Important.
    High,
    /// Routine.
    #[default]
    Medium,
    /// Informational.
    Low,
}

/// Check a channel name: 1–128 chars of `[A-Za-z0-9._:-]`.
pub fn validate_channel_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name.len() > MAX_CHANNEL_NAME_LEN {
        Some("longer than 128 characters")
    } else if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        Some("only letters, digits, '-', '_', '.' and ':' are allowed")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(BrokerError::InvalidChannelName {
            name: name.to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}

/// A subscriber resolved for fan-out.
#[derive(Clone, Debug, PartialEq)]
pub struct Subscriber {
    /// Subscribed connection.
    pub connection_id: ConnectionId,
    /// Optional payload filter.
    pub filter: Option<Filter>,
}

/// Public snapshot of a channel's metadata.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    /// Channel name.
    pub name: String,
    /// Delivery priority.
    pub priority: Priority,
    /// Current subscriber count.
    pub subscriber_count: usize,
    /// Events published to the channel.
    pub message_count: u64,
    /// Time of the last publish, if any.
    pub last_activity: Option<DateTime<Utc>>,
    /// Whether new subscriptions are accepted.
    pub active: bool,
    /// Maximum event age kept in history.
    pub retention_window_ms: u64,
    /// Maximum events kept in history.
    pub max_history: usize,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

struct Channel {
    name: String,
    priority: Priority,
    retention: RetentionPolicy,
    description: Option<String>,
    subscribers: HashMap<ConnectionId, Option<Filter>>,
    message_count: u64,
    last_activity: Option<DateTime<Utc>>,
    active: bool,
}

impl Channel {
    fn new(name: String, retention: RetentionPolicy) -> Self {
        Self {
            name,
            priority: Priority::default(),
            retention,
            description: None,
            subscribers: HashMap::new(),
            message_count: 0,
            last_activity: None,
            active: true,
        }
    }

    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name.clone(),
            priority: self.priority,
            subscriber_count: self.subscribers.len(),
            message_count: self.message_count,
            last_activity: self.last_activity,
            active: self.active,
            retention_window_ms: duration_ms(self.retention.window),
            max_history: self.retention.max_events,
            description: self.description.clone(),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Registry of named channels.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Channel>>,
    connections: Arc<ConnectionRegistry>,
    defaults: RetentionPolicy,
    clock: SharedClock,
}

impl ChannelRegistry {
    /// Create an empty registry. Channels created lazily get `defaults`.
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        defaults: RetentionPolicy,
        clock: SharedClock,
    ) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            connections,
            defaults,
            clock,
        }
    }

    /// Create a channel with explicit metadata, or update an existing one's
    /// metadata (subscribers and counters are kept).
    pub fn register(&self, spec: &ChannelSpec) -> Result<ChannelInfo> {
        validate_channel_name(&spec.name)?;
        let retention = spec.retention(self.defaults);
        let mut channels = self.channels.write();
        let channel = channels
            .entry(spec.name.clone())
            .or_insert_with(|| Channel::new(spec.name.clone(), retention));
        channel.priority = spec.priority;
        channel.retention = retention;
        channel.description.clone_from(&spec.description);
        debug!(channel = %spec.name, priority = ?spec.priority, "channel registered");
        Ok(channel.info())
    }

    /// Create-or-return a channel with default metadata.
    pub fn ensure_channel(&self, name: &str) -> Result<ChannelInfo> {
        validate_channel_name(name)?;
        if let Some(channel) = self.channels.read().get(name) {
            return Ok(channel.info());
        }
        let mut channels = self.channels.write();
        let channel = channels
            .entry(name.to_owned())
            .or_insert_with(|| Channel::new(name.to_owned(), self.defaults));
        Ok(channel.info())
    }

    /// Subscribe a connection to a channel, creating the channel if unknown.
    /// Re-subscribing replaces the filter. Returns the subscriber count.
    pub fn subscribe(
        &self,
        connection_id: &ConnectionId,
        channel_name: &str,
        filter: Option<Filter>,
    ) -> Result<usize> {
        validate_channel_name(channel_name)?;
        let mut channels = self.channels.write();
        let conn = self
            .connections
            .get(connection_id)
            .filter(|c| !c.is_closed())
            .ok_or_else(|| BrokerError::UnknownConnection(connection_id.clone()))?;
        let channel = channels
            .entry(channel_name.to_owned())
            .or_insert_with(|| Channel::new(channel_name.to_owned(), self.defaults));
        if !channel.active {
            return Err(BrokerError::ChannelInactive(channel_name.to_owned()));
        }
        let _ = channel
            .subscribers
            .insert(connection_id.clone(), filter.clone());
        let _ = conn.subscriptions().insert(channel_name.to_owned(), filter);
        debug!(conn_id = %connection_id, channel = channel_name, "subscribed");
        Ok(channel.subscribers.len())
    }

    /// Remove a subscription. Returns whether one existed; errors if the
    /// channel does not exist.
    pub fn unsubscribe(&self, connection_id: &ConnectionId, channel_name: &str) -> Result<bool> {
        let mut channels = self.channels.write();
        let channel = channels
            .get_mut(channel_name)
            .ok_or_else(|| BrokerError::ChannelNotFound(channel_name.to_owned()))?;
        let removed = channel.subscribers.remove(connection_id).is_some();
        if let Some(conn) = self.connections.get(connection_id) {
            let _ = conn.subscriptions().remove(channel_name);
        }
        if removed {
            debug!(conn_id = %connection_id, channel = channel_name, "unsubscribed");
        }
        Ok(removed)
    }

    /// Unregister a connection and drop it from every channel it held, in one
    /// critical section. Idempotent.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut channels = self.channels.write();
        let conn = self.connections.unregister(connection_id)?;
        let held: Vec<String> = conn.subscriptions().drain().map(|(name, _)| name).collect();
        for name in &held {
            if let Some(channel) = channels.get_mut(name) {
                let _ = channel.subscribers.remove(connection_id);
            }
        }
        info!(conn_id = %connection_id, channels = held.len(), "connection removed from channels");
        Some(conn)
    }

    /// Consistent snapshot of a channel's subscribers.
    pub fn subscribers_of(&self, channel_name: &str) -> Vec<Subscriber> {
        self.channels
            .read()
            .get(channel_name)
            .map(|channel| {
                channel
                    .subscribers
                    .iter()
                    .map(|(id, filter)| Subscriber {
                        connection_id: id.clone(),
                        filter: filter.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Count a publish against a channel (creating it if needed) and return
    /// its retention policy.
    pub fn record_publish(&self, channel_name: &str) -> Result<RetentionPolicy> {
        validate_channel_name(channel_name)?;
        let now = self.clock.now();
        let mut channels = self.channels.write();
        let channel = channels
            .entry(channel_name.to_owned())
            .or_insert_with(|| Channel::new(channel_name.to_owned(), self.defaults));
        channel.message_count += 1;
        channel.last_activity = Some(now);
        Ok(channel.retention)
    }

    /// Stop accepting new subscriptions. Existing subscribers keep receiving.
    pub fn deactivate(&self, channel_name: &str) -> Result<()> {
        self.set_active(channel_name, false)
    }

    /// Accept subscriptions again.
    pub fn reactivate(&self, channel_name: &str) -> Result<()> {
        self.set_active(channel_name, true)
    }

    fn set_active(&self, channel_name: &str, active: bool) -> Result<()> {
        let mut channels = self.channels.write();
        let channel = channels
            .get_mut(channel_name)
            .ok_or_else(|| BrokerError::ChannelNotFound(channel_name.to_owned()))?;
        channel.active = active;
        info!(channel = channel_name, active, "channel state changed");
        Ok(())
    }

    /// Metadata for one channel.
    pub fn get(&self, channel_name: &str) -> Option<ChannelInfo> {
        self.channels.read().get(channel_name).map(Channel::info)
    }

    /// Whether a channel exists.
    pub fn contains(&self, channel_name: &str) -> bool {
        self.channels.read().contains_key(channel_name)
    }

    /// Retention policy for a channel (defaults if unknown).
    pub fn retention_policy(&self, channel_name: &str) -> RetentionPolicy {
        self.channels
            .read()
            .get(channel_name)
            .map_or(self.defaults, |c| c.retention)
    }

    /// Metadata snapshot of every channel, sorted by name.
    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        let mut list: Vec<ChannelInfo> = self.channels.read().values().map(Channel::info).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Names of channels accepting subscriptions, sorted.
    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .read()
            .values()
            .filter(|c| c.active)
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of channels accepting subscriptions.
    pub fn active_count(&self) -> usize {
        self.channels.read().values().filter(|c| c.active).count()
    }
}
