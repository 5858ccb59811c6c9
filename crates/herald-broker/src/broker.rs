//! Broker facade: owns the registries, the retention store, the dispatcher,
//! and the background tasks that drive them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::{ChannelInfo, ChannelRegistry, Priority};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{BrokerConfig, ChannelSpec};
use crate::connection::{Connection, ConnectionRegistry, Outbound};
use crate::dispatcher::Dispatcher;
use crate::errors::{BrokerError, Result};
use crate::event::Event;
use crate::filter::Filter;
use crate::heartbeat::HeartbeatMonitor;
use crate::ids::{ConnectionId, EventId};
use crate::protocol::ServerMessage;
use crate::retention::{HistoryQuery, RetentionStore};
use crate::stats::{BrokerCounters, BrokerStats};

/// History entries returned when a request gives no limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// A running event broker.
pub struct Broker {
    config: BrokerConfig,
    clock: SharedClock,
    connections: Arc<ConnectionRegistry>,
    channels: Arc<ChannelRegistry>,
    retention: Arc<RetentionStore>,
    dispatcher: Arc<Dispatcher>,
    counters: Arc<BrokerCounters>,
}

impl Broker {
    /// Build a broker on the system clock.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a broker on an explicit clock.
    ///
    /// Validates `config` and registers its preconfigured channels. Call
    /// [`start`](Self::start) to begin processing events.
    pub fn with_clock(config: BrokerConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        let connections = Arc::new(ConnectionRegistry::new(clock.clone()));
        let channels = Arc::new(ChannelRegistry::new(
            connections.clone(),
            config.default_retention(),
            clock.clone(),
        ));
        let retention = Arc::new(RetentionStore::new(clock.clone()));
        let counters = Arc::new(BrokerCounters::default());
        let dispatcher = Arc::new(Dispatcher::new(
            channels.clone(),
            connections.clone(),
            retention.clone(),
            counters.clone(),
            clock.clone(),
            config.max_payload_bytes,
        ));
        for spec in &config.channels {
            let _ = channels.register(spec)?;
        }
        Ok(Self {
            config,
            clock,
            connections,
            channels,
            retention,
            dispatcher,
            counters,
        })
    }

    /// Spawn the drain loop and the heartbeat monitor.
    ///
    /// Fails with [`BrokerError::AlreadyRunning`] if called twice.
    pub fn start(&self) -> Result<BrokerHandle> {
        let rx = self.dispatcher.take_receiver()?;
        let cancel = CancellationToken::new();
        let drain = tokio::spawn(Arc::clone(&self.dispatcher).run(rx));
        let heartbeat = tokio::spawn(self.heartbeat_monitor().run(cancel.child_token()));
        info!(
            channels = self.config.channels.len(),
            heartbeat_ms = self.config.heartbeat_interval_ms,
            "broker started"
        );
        Ok(BrokerHandle {
            cancel,
            drain,
            heartbeat,
            dispatcher: self.dispatcher.clone(),
            connections: self.connections.clone(),
            channels: self.channels.clone(),
        })
    }

    // ── Connections ─────────────────────────────────────────────────

    /// Register a new connection and queue its `connection-established`
    /// greeting. The receiver feeds the transport's writer task.
    pub fn connect(
        &self,
        metadata: HashMap<String, String>,
    ) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.config.send_queue_capacity);
        let conn = self.connections.register(tx, metadata);
        let _ = conn.send_json(&ServerMessage::ConnectionEstablished {
            connection_id: conn.id().clone(),
            available_channels: self.channels.active_names(),
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
        });
        (conn, rx)
    }

    /// Remove a connection and all of its subscriptions. Idempotent; returns
    /// whether this call removed it.
    pub fn disconnect(&self, id: &ConnectionId) -> bool {
        self.channels.disconnect(id).is_some()
    }

    /// Record inbound traffic from a connection.
    pub fn mark_activity(&self, id: &ConnectionId) -> bool {
        self.connections.mark_activity(id)
    }

    // ── Channels ────────────────────────────────────────────────────

    /// Subscribe a connection. Returns the channel's subscriber count.
    pub fn subscribe(
        &self,
        id: &ConnectionId,
        channel: &str,
        filter: Option<Filter>,
    ) -> Result<usize> {
        self.channels.subscribe(id, channel, filter)
    }

    /// Unsubscribe a connection. Returns whether it was subscribed.
    pub fn unsubscribe(&self, id: &ConnectionId, channel: &str) -> Result<bool> {
        self.channels.unsubscribe(id, channel)
    }

    /// Create or update a channel from explicit metadata.
    pub fn register_channel(&self, spec: &ChannelSpec) -> Result<ChannelInfo> {
        self.channels.register(spec)
    }

    /// Stop a channel accepting new subscriptions.
    pub fn deactivate_channel(&self, channel: &str) -> Result<()> {
        self.channels.deactivate(channel)
    }

    /// Let a deactivated channel accept subscriptions again.
    pub fn reactivate_channel(&self, channel: &str) -> Result<()> {
        self.channels.reactivate(channel)
    }

    /// Metadata for every channel, sorted by name.
    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        self.channels.list_channels()
    }

    // ── Events ──────────────────────────────────────────────────────

    /// Queue an event for fan-out.
    pub fn publish(
        &self,
        channel: &str,
        payload: Value,
        priority: Option<Priority>,
        publisher: Option<String>,
    ) -> Result<EventId> {
        self.dispatcher.publish(channel, payload, priority, publisher)
    }

    /// Retained events for a channel, oldest first.
    ///
    /// `limit` defaults to [`DEFAULT_HISTORY_LIMIT`] and is clamped to the
    /// channel's history cap. Only events strictly newer than `since` and
    /// inside the channel's current retention policy are returned.
    pub fn history(
        &self,
        channel: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Arc<Event>>> {
        let info = self
            .channels
            .get(channel)
            .ok_or_else(|| BrokerError::ChannelNotFound(channel.to_owned()))?;
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(info.max_history);
        let policy = self.channels.retention_policy(channel);
        Ok(self
            .retention
            .query(channel, policy, &HistoryQuery { since, limit }))
    }

    /// Wait until every event published so far has been fanned out.
    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await;
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Point-in-time statistics.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            active_connections: self.connections.active_count(),
            total_connections: self.connections.total_count(),
            messages_processed: self.counters.messages_processed(),
            errors_count: self.counters.errors(),
            queue_depth: self.counters.queue_depth(),
            channels_active: self.channels.active_count(),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Current time on the broker's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Connection registry.
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Channel registry.
    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    /// Shared counters.
    pub fn counters(&self) -> &Arc<BrokerCounters> {
        &self.counters
    }

    /// A heartbeat monitor over this broker's registries.
    pub fn heartbeat_monitor(&self) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            self.connections.clone(),
            self.channels.clone(),
            self.config.heartbeat_interval(),
        )
    }
}

/// Handle to a started broker's background tasks.
pub struct BrokerHandle {
    cancel: CancellationToken,
    drain: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
    dispatcher: Arc<Dispatcher>,
    connections: Arc<ConnectionRegistry>,
    channels: Arc<ChannelRegistry>,
}

impl BrokerHandle {
    /// Stop the broker.
    ///
    /// Closes the queue, waits up to `drain_timeout` for already-accepted
    /// events to be fanned out, stops the heartbeat monitor, then disconnects
    /// every connection.
    pub async fn shutdown(mut self, drain_timeout: Duration) {
        self.dispatcher.close();
        if tokio::time::timeout(drain_timeout, &mut self.drain).await.is_err() {
            warn!(
                pending = self.dispatcher.queue_depth(),
                "dispatcher did not drain in time, aborting"
            );
            self.drain.abort();
        }

        self.cancel.cancel();
        let _ = self.heartbeat.await;

        let conns = self.connections.snapshot();
        for conn in &conns {
            let _ = self.channels.disconnect(conn.id());
        }
        info!(disconnected = conns.len(), "broker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn broker() -> Broker {
        Broker::new(BrokerConfig::default()).unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Text(text) = frame {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = BrokerConfig {
            heartbeat_interval_ms: 0,
            ..BrokerConfig::default()
        };
        assert!(matches!(
            Broker::new(config),
            Err(BrokerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn preconfigured_channels_are_registered() {
        let mut spec = ChannelSpec::named("compliance-alerts");
        spec.priority = Priority::Critical;
        let config = BrokerConfig {
            channels: vec![spec, ChannelSpec::named("audit")],
            ..BrokerConfig::default()
        };
        let broker = Broker::new(config).unwrap();
        let names: Vec<String> = broker.list_channels().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["audit", "compliance-alerts"]);
        assert_eq!(broker.stats().channels_active, 2);
    }

    #[test]
    fn connect_sends_greeting() {
        let config = BrokerConfig {
            channels: vec![ChannelSpec::named("audit")],
            ..BrokerConfig::default()
        };
        let broker = Broker::new(config).unwrap();
        let (conn, mut rx) = broker.connect(HashMap::new());
        let msgs = drain(&mut rx);
        assert_eq!(
            msgs,
            vec![ServerMessage::ConnectionEstablished {
                connection_id: conn.id().clone(),
                available_channels: vec!["audit".into()],
                heartbeat_interval_ms: 30_000,
            }]
        );
    }

    #[test]
    fn disconnect_is_idempotent() {
        let broker = broker();
        let (conn, _rx) = broker.connect(HashMap::new());
        let _ = broker.subscribe(conn.id(), "c", None).unwrap();
        assert!(broker.disconnect(conn.id()));
        assert!(!broker.disconnect(conn.id()));
        assert_eq!(broker.stats().active_connections, 0);
        assert_eq!(broker.stats().total_connections, 1);
    }

    #[test]
    fn history_of_unknown_channel_fails() {
        let broker = broker();
        let err = broker.history("nowhere", None, None).unwrap_err();
        assert_eq!(err.code(), crate::errors::INVALID_CHANNEL);
    }

    #[test]
    fn published_channel_is_queryable_before_drain() {
        let broker = broker();
        let _ = broker.publish("fresh", json!({"n": 1}), None, None).unwrap();
        assert_eq!(broker.history("fresh", None, None).unwrap(), Vec::new());
        assert!(broker.list_channels().iter().any(|c| c.name == "fresh"));
    }

    #[tokio::test]
    async fn history_uses_current_retention_window() {
        let clock = Arc::new(ManualClock::starting_now());
        let broker = Broker::with_clock(BrokerConfig::default(), clock.clone()).unwrap();
        let _handle = broker.start().unwrap();
        for n in 0..3 {
            let _ = broker.publish("audit", json!({"n": n}), None, None).unwrap();
            clock.advance(Duration::from_secs(10));
        }
        broker.wait_idle().await;
        assert_eq!(broker.history("audit", None, None).unwrap().len(), 3);

        // Shrinking the window hides older events without waiting for a publish.
        let mut spec = ChannelSpec::named("audit");
        spec.retention_window_ms = Some(15_000);
        let _ = broker.register_channel(&spec).unwrap();
        let history = broker.history("audit", None, None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload["n"], 2);
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let broker = broker();
        let _handle = broker.start().unwrap();
        assert!(matches!(broker.start(), Err(BrokerError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn history_limit_defaults_and_clamps() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut spec = ChannelSpec::named("small");
        spec.max_history = Some(3);
        let config = BrokerConfig {
            channels: vec![spec],
            ..BrokerConfig::default()
        };
        let broker = Broker::with_clock(config, clock.clone()).unwrap();
        let _handle = broker.start().unwrap();

        for n in 0..60 {
            let _ = broker.publish("big", json!({"n": n}), None, None).unwrap();
            let _ = broker.publish("small", json!({"n": n}), None, None).unwrap();
            clock.advance(Duration::from_millis(1));
        }
        broker.wait_idle().await;

        let big = broker.history("big", None, None).unwrap();
        assert_eq!(big.len(), DEFAULT_HISTORY_LIMIT);
        assert_eq!(big.last().unwrap().payload["n"], 59);

        let small = broker.history("small", None, Some(100)).unwrap();
        let got: Vec<i64> = small.iter().map(|e| e.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(got, vec![57, 58, 59]);
    }

    #[tokio::test]
    async fn shutdown_drains_then_disconnects() {
        let broker = broker();
        let (conn, mut rx) = broker.connect(HashMap::new());
        let _ = broker.subscribe(conn.id(), "c", None).unwrap();
        let handle = broker.start().unwrap();

        for n in 0..3 {
            let _ = broker.publish("c", json!({"n": n}), None, None).unwrap();
        }
        handle.shutdown(Duration::from_secs(5)).await;

        let events = drain(&mut rx)
            .into_iter()
            .filter(|m| m.type_name() == "event")
            .count();
        assert_eq!(events, 3);
        assert!(conn.is_closed());
        assert!(matches!(
            broker.publish("c", json!({}), None, None),
            Err(BrokerError::DispatcherStopped)
        ));
    }

    #[tokio::test]
    async fn stats_reflect_activity() {
        let broker = broker();
        let _handle = broker.start().unwrap();
        let (a, _rx_a) = broker.connect(HashMap::new());
        let (_b, _rx_b) = broker.connect(HashMap::new());
        let _ = broker.subscribe(a.id(), "c", None).unwrap();
        let _ = broker.publish("c", json!({}), None, None).unwrap();
        broker.wait_idle().await;

        let stats = broker.stats();
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.messages_processed, 1);
        assert_eq!(stats.errors_count, 0);
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.channels_active, 1);
    }
}
