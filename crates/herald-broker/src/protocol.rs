//! JSON wire messages.
//!
//! Every message is an object with a kebab-case `type` tag and camelCase
//! fields. Decoding distinguishes malformed input (`message-parse-error`) from
//! well-formed input with an unrecognized type (`unknown-message-type`).

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::Priority;
use crate::errors::ProtocolError;
use crate::event::Event;
use crate::filter::Filter;
use crate::ids::{ConnectionId, EventId};

/// Message types a client may send.
pub const CLIENT_MESSAGE_TYPES: [&str; 5] =
    ["subscribe", "unsubscribe", "get-history", "publish", "ping"];

/// Client → server messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join a channel, optionally filtering its events.
    Subscribe {
        /// Channel name.
        channel: String,
        /// Key/value equality filter over event payloads.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Filter>,
    },
    /// Leave a channel.
    Unsubscribe {
        /// Channel name.
        channel: String,
    },
    /// Fetch retained events.
    GetHistory {
        /// Channel name.
        channel: String,
        /// Maximum events returned.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        /// Only events strictly newer than this.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<HistoryCursor>,
    },
    /// Publish an event.
    Publish {
        /// Channel name.
        channel: String,
        /// Event payload.
        event: Value,
        /// Delivery priority; defaults to the channel's.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<Priority>,
    },
    /// Application-level ping.
    Ping {
        /// Echoed back as `originalTimestamp`.
        #[serde(default)]
        timestamp: Value,
    },
}

/// A `since` bound: epoch milliseconds or an RFC 3339 timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistoryCursor {
    /// Milliseconds since the Unix epoch.
    Millis(i64),
    /// RFC 3339 timestamp.
    Timestamp(DateTime<Utc>),
}

impl HistoryCursor {
    /// The instant this cursor names. Out-of-range millis clamp to the epoch.
    pub fn instant(self) -> DateTime<Utc> {
        match self {
            Self::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            Self::Timestamp(ts) => ts,
        }
    }
}

/// Server → client messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First message on every connection.
    ConnectionEstablished {
        /// Assigned connection ID.
        connection_id: ConnectionId,
        /// Channels accepting subscriptions.
        available_channels: Vec<String>,
        /// Server heartbeat interval.
        heartbeat_interval_ms: u64,
    },
    /// Reply to `subscribe`.
    SubscriptionConfirmed {
        /// Channel name.
        channel: String,
        /// Subscribers after this one joined.
        subscriber_count: usize,
    },
    /// Reply to `unsubscribe`.
    UnsubscriptionConfirmed {
        /// Channel name.
        channel: String,
    },
    /// Reply to `get-history`.
    HistoryResponse {
        /// Channel name.
        channel: String,
        /// Events in chronological order.
        events: Vec<Arc<Event>>,
        /// Number of events returned.
        count: usize,
    },
    /// Reply to `publish`: accepted into the queue.
    PublishConfirmed {
        /// Channel name.
        channel: String,
        /// Assigned event ID.
        event_id: EventId,
    },
    /// Fan-out delivery of a published event.
    Event {
        /// Channel name.
        channel: String,
        /// The event.
        event: Arc<Event>,
        /// Delivery time.
        timestamp: DateTime<Utc>,
    },
    /// Reply to `ping`.
    Pong {
        /// Server time.
        timestamp: DateTime<Utc>,
        /// The client's `timestamp`, echoed.
        original_timestamp: Value,
    },
    /// Protocol or request failure.
    Error {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

impl ServerMessage {
    /// Build an error message.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_owned(),
            message: message.into(),
        }
    }

    /// The wire `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection-established",
            Self::SubscriptionConfirmed { .. } => "subscription-confirmed",
            Self::UnsubscriptionConfirmed { .. } => "unsubscription-confirmed",
            Self::HistoryResponse { .. } => "history-response",
            Self::PublishConfirmed { .. } => "publish-confirmed",
            Self::Event { .. } => "event",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
        }
    }
}

/// Decode one inbound frame.
pub fn parse_client_message(text: &str, max_bytes: usize) -> Result<ClientMessage, ProtocolError> {
    if text.len() > max_bytes {
        return Err(ProtocolError::TooLarge {
            size: text.len(),
            max: max_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Parse(format!("invalid JSON: {e}")))?;
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(ProtocolError::Parse("missing string field 'type'".into()));
    };
    if !CLIENT_MESSAGE_TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_owned()));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Parse(e.to_string()))
}
