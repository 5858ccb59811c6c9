//! Published events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::Priority;
use crate::ids::EventId;

/// An immutable event published to exactly one channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Monotonically increasing identifier.
    pub id: EventId,
    /// Channel the event was published to.
    pub channel: String,
    /// Opaque producer payload.
    pub payload: Value,
    /// Who published it (connection ID or producer name), if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// Delivery priority.
    pub priority: Priority,
    /// Creation time assigned by the broker.
    pub timestamp: DateTime<Utc>,
}
