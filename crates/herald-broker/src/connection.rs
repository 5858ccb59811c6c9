//! Live connections and their outbound queues.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::filter::Filter;
use crate::ids::ConnectionId;
use crate::metrics as names;

/// A frame queued for a connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized JSON message.
    Text(Arc<str>),
    /// Transport-level liveness probe.
    Ping,
}

/// Heartbeat state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Liveness {
    /// Traffic seen since the last probe.
    Alive = 0,
    /// Probe sent, no traffic since.
    AwaitingPong = 1,
    /// Missed a full heartbeat cycle; being evicted.
    Dead = 2,
}

impl Liveness {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Alive,
            1 => Self::AwaitingPong,
            _ => Self::Dead,
        }
    }
}

/// One registered client connection.
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    metadata: HashMap<String, String>,
    connected_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    liveness: AtomicU8,
    /// Channel name → filter. Only mutated by the channel registry while it
    /// holds its own lock, which keeps both sides of a subscription in step.
    subscriptions: Mutex<HashMap<String, Option<Filter>>>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    dropped_messages: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Connection {
    fn new(
        id: ConnectionId,
        tx: mpsc::Sender<Outbound>,
        metadata: HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tx,
            metadata,
            connected_at: now,
            last_activity: Mutex::new(now),
            liveness: AtomicU8::new(Liveness::Alive as u8),
            subscriptions: Mutex::new(HashMap::new()),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Metadata supplied at registration (remote address, user agent, ...).
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// When the connection was registered.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Last inbound traffic (or registration time).
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Current heartbeat state.
    pub fn liveness(&self) -> Liveness {
        Liveness::from_u8(self.liveness.load(Ordering::Acquire))
    }

    /// Queue a frame for the writer task.
    ///
    /// Never blocks. Returns `false` if the connection is closed or its buffer
    /// is full, and counts the drop.
    pub fn send(&self, frame: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.tx.try_send(frame).is_ok() {
            let _ = self.messages_sent.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize a message and queue it.
    pub fn send_json<T: Serialize>(&self, message: &T) -> bool {
        match serde_json::to_string(message) {
            Ok(json) => self.send(Outbound::Text(json.into())),
            Err(_) => false,
        }
    }

    /// Record inbound traffic and return to `Alive` (unless already dead).
    pub fn mark_activity(&self, now: DateTime<Utc>) {
        let _ = self.messages_received.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = now;
        let _ = self.liveness.compare_exchange(
            Liveness::AwaitingPong as u8,
            Liveness::Alive as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Advance the heartbeat state machine by one tick.
    ///
    /// `Alive → AwaitingPong` (caller should send a probe) or
    /// `AwaitingPong → Dead`. Returns the new state.
    pub fn advance_liveness(&self) -> Liveness {
        if self
            .liveness
            .compare_exchange(
                Liveness::Alive as u8,
                Liveness::AwaitingPong as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            return Liveness::AwaitingPong;
        }
        let _ = self.liveness.compare_exchange(
            Liveness::AwaitingPong as u8,
            Liveness::Dead as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.liveness()
    }

    /// Channel names this connection is subscribed to, sorted.
    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether this connection is subscribed to `channel`.
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.lock().contains_key(channel)
    }

    pub(crate) fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, Option<Filter>>> {
        self.subscriptions.lock()
    }

    /// Frames successfully queued.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Inbound frames recorded via [`mark_activity`](Self::mark_activity).
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Frames dropped because the buffer was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Whether the connection has been unregistered.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Token cancelled when the connection is unregistered. Transport tasks
    /// select on it to close the socket.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
    }
}

/// Owns every live connection.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    total: AtomicU64,
    clock: SharedClock,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            connections: DashMap::new(),
            total: AtomicU64::new(0),
            clock,
        }
    }

    /// Register a transport and return the new connection.
    pub fn register(
        &self,
        tx: mpsc::Sender<Outbound>,
        metadata: HashMap<String, String>,
    ) -> Arc<Connection> {
        let id = ConnectionId::new();
        let conn = Arc::new(Connection::new(id.clone(), tx, metadata, self.clock.now()));
        let _ = self.connections.insert(id.clone(), conn.clone());
        let _ = self.total.fetch_add(1, Ordering::Relaxed);
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        info!(conn_id = %id, "connection registered");
        conn
    }

    /// Remove a connection and close it. Idempotent.
    ///
    /// Returns the connection if this call removed it. Callers that track
    /// subscriptions must purge them (see `ChannelRegistry::disconnect`).
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(id)?;
        conn.close();
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
        info!(conn_id = %id, sent = conn.messages_sent(), dropped = conn.drop_count(), "connection unregistered");
        Some(conn)
    }

    /// Look up a live connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| c.value().clone())
    }

    /// Queue a frame for a connection. `false` if unknown, closed, or full.
    pub fn send(&self, id: &ConnectionId, frame: Outbound) -> bool {
        let Some(conn) = self.get(id) else {
            debug!(conn_id = %id, "send to unknown connection");
            return false;
        };
        conn.send(frame)
    }

    /// Record inbound traffic for a connection. `false` if unknown.
    pub fn mark_activity(&self, id: &ConnectionId) -> bool {
        match self.get(id) {
            Some(conn) => {
                conn.mark_activity(self.clock.now());
                true
            }
            None => false,
        }
    }

    /// Snapshot of all live connections.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    /// Number of live connections.
    pub fn active_count(&self) -> usize {
        self.connections.len()
    }

    /// Connections ever registered.
    pub fn total_count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}
