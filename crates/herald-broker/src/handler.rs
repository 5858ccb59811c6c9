//! Inbound message handling: parses a client frame, applies it to the
//! broker, and produces the reply.

use metrics::counter;
use tracing::{debug, instrument, warn};

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::errors::{BrokerError, MESSAGE_PARSE_ERROR};
use crate::ids::ConnectionId;
use crate::metrics as names;
use crate::protocol::{ClientMessage, ServerMessage, parse_client_message};

/// Allowance for the JSON envelope around a publish payload.
pub const FRAME_OVERHEAD_BYTES: usize = 64 * 1024;

/// Largest inbound frame accepted: the payload limit plus envelope.
pub fn max_frame_bytes(config: &BrokerConfig) -> usize {
    config.max_payload_bytes.saturating_add(FRAME_OVERHEAD_BYTES)
}

/// Result of handling one inbound frame.
#[derive(Debug)]
pub struct HandleResult {
    /// The reply to send back.
    pub response: ServerMessage,
    /// The client message type (empty if the frame could not be parsed).
    pub message_type: &'static str,
}

impl HandleResult {
    /// Whether the reply is an error.
    pub fn is_error(&self) -> bool {
        matches!(self.response, ServerMessage::Error { .. })
    }
}

/// Handle one inbound text frame from `conn_id`.
///
/// Every frame counts as liveness traffic, including malformed ones.
#[instrument(skip_all, fields(conn_id = %conn_id, message_type))]
pub fn handle_message(broker: &Broker, conn_id: &ConnectionId, text: &str) -> HandleResult {
    let _ = broker.mark_activity(conn_id);

    let message = match parse_client_message(text, max_frame_bytes(broker.config())) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "rejected client frame");
            return HandleResult {
                response: protocol_error(broker, e.code(), e.to_string()),
                message_type: "",
            };
        }
    };

    let message_type = client_type_name(&message);
    let _ = tracing::Span::current().record("message_type", message_type);
    debug!("handling client message");

    let response = match message {
        ClientMessage::Subscribe { channel, filter } => {
            match broker.subscribe(conn_id, &channel, filter) {
                Ok(subscriber_count) => ServerMessage::SubscriptionConfirmed {
                    channel,
                    subscriber_count,
                },
                Err(e) => broker_error(broker, &e),
            }
        }
        ClientMessage::Unsubscribe { channel } => match broker.unsubscribe(conn_id, &channel) {
            Ok(_) => ServerMessage::UnsubscriptionConfirmed { channel },
            Err(e) => broker_error(broker, &e),
        },
        ClientMessage::GetHistory {
            channel,
            limit,
            since,
        } => match broker.history(&channel, since.map(|c| c.instant()), limit) {
            Ok(events) => ServerMessage::HistoryResponse {
                channel,
                count: events.len(),
                events,
            },
            Err(e) => broker_error(broker, &e),
        },
        ClientMessage::Publish {
            channel,
            event,
            priority,
        } => match broker.publish(&channel, event, priority, Some(conn_id.to_string())) {
            Ok(event_id) => ServerMessage::PublishConfirmed { channel, event_id },
            Err(e) => broker_error(broker, &e),
        },
        ClientMessage::Ping { timestamp } => ServerMessage::Pong {
            timestamp: broker.now(),
            original_timestamp: timestamp,
        },
    };

    HandleResult {
        response,
        message_type,
    }
}

/// Answer a binary frame that is not valid UTF-8.
pub fn handle_undecodable(broker: &Broker, conn_id: &ConnectionId, len: usize) -> HandleResult {
    let _ = broker.mark_activity(conn_id);
    warn!(conn_id = %conn_id, len, "received non-UTF-8 binary frame");
    HandleResult {
        response: protocol_error(
            broker,
            MESSAGE_PARSE_ERROR,
            format!("binary frame of {len} bytes is not valid UTF-8"),
        ),
        message_type: "",
    }
}

fn client_type_name(message: &ClientMessage) -> &'static str {
    match message {
        ClientMessage::Subscribe { .. } => "subscribe",
        ClientMessage::Unsubscribe { .. } => "unsubscribe",
        ClientMessage::GetHistory { .. } => "get-history",
        ClientMessage::Publish { .. } => "publish",
        ClientMessage::Ping { .. } => "ping",
    }
}

fn broker_error(broker: &Broker, error: &BrokerError) -> ServerMessage {
    debug!(error = %error, "request failed");
    protocol_error(broker, error.code(), error.to_string())
}

fn protocol_error(broker: &Broker, code: &'static str, message: String) -> ServerMessage {
    broker.counters().record_error();
    counter!(names::PROTOCOL_ERRORS_TOTAL, "code" => code).increment(1);
    ServerMessage::error(code, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, ChannelSpec};
    use crate::connection::Outbound;
    use crate::errors::{
        INVALID_CHANNEL, MESSAGE_PARSE_ERROR, PAYLOAD_TOO_LARGE, UNKNOWN_MESSAGE_TYPE,
    };
    use crate::protocol::CLIENT_MESSAGE_TYPES;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn setup() -> (Broker, Arc<crate::connection::Connection>, mpsc::Receiver<Outbound>) {
        let config = BrokerConfig {
            max_payload_bytes: 256,
            channels: vec![ChannelSpec::named("audit")],
            ..BrokerConfig::default()
        };
        let broker = Broker::new(config).unwrap();
        let (conn, rx) = broker.connect(HashMap::new());
        (broker, conn, rx)
    }

    fn error_code(result: &HandleResult) -> &str {
        match &result.response {
            ServerMessage::Error { code, .. } => code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_confirms_with_count() {
        let (broker, conn, _rx) = setup();
        let result = handle_message(&broker, conn.id(), r#"{"type":"subscribe","channel":"audit"}"#);
        assert_eq!(result.message_type, "subscribe");
        assert_eq!(
            result.response,
            ServerMessage::SubscriptionConfirmed {
                channel: "audit".into(),
                subscriber_count: 1
            }
        );
        assert!(conn.is_subscribed("audit"));
    }

    #[test]
    fn subscribe_to_invalid_name_is_invalid_channel() {
        let (broker, conn, _rx) = setup();
        let result = handle_message(&broker, conn.id(), r#"{"type":"subscribe","channel":""}"#);
        assert!(result.is_error());
        assert_eq!(error_code(&result), INVALID_CHANNEL);
    }

    #[test]
    fn subscribe_to_deactivated_channel_is_invalid_channel() {
        let (broker, conn, _rx) = setup();
        broker.deactivate_channel("audit").unwrap();
        let result = handle_message(&broker, conn.id(), r#"{"type":"subscribe","channel":"audit"}"#);
        assert_eq!(error_code(&result), INVALID_CHANNEL);
    }

    #[test]
    fn unsubscribe_confirms_even_when_not_subscribed() {
        let (broker, conn, _rx) = setup();
        let result = handle_message(&broker, conn.id(), r#"{"type":"unsubscribe","channel":"audit"}"#);
        assert_eq!(
            result.response,
            ServerMessage::UnsubscriptionConfirmed {
                channel: "audit".into()
            }
        );
    }

    #[test]
    fn unsubscribe_from_unknown_channel_is_invalid_channel() {
        let (broker, conn, _rx) = setup();
        let result = handle_message(&broker, conn.id(), r#"{"type":"unsubscribe","channel":"ghost"}"#);
        assert_eq!(error_code(&result), INVALID_CHANNEL);
    }

    #[test]
    fn history_of_empty_channel() {
        let (broker, conn, _rx) = setup();
        let result = handle_message(&broker, conn.id(), r#"{"type":"get-history","channel":"audit"}"#);
        assert_eq!(
            result.response,
            ServerMessage::HistoryResponse {
                channel: "audit".into(),
                events: Vec::new(),
                count: 0
            }
        );
    }

    #[test]
    fn history_right_after_publish_to_new_channel() {
        let (broker, conn, _rx) = setup();
        let result = handle_message(
            &broker,
            conn.id(),
            r#"{"type":"publish","channel":"fresh","event":{"n":1}}"#,
        );
        assert_eq!(result.message_type, "publish");
        let result = handle_message(&broker, conn.id(), r#"{"type":"get-history","channel":"fresh"}"#);
        assert_eq!(
            result.response,
            ServerMessage::HistoryResponse {
                channel: "fresh".into(),
                events: Vec::new(),
                count: 0
            }
        );
    }

    #[test]
    fn publish_confirms_with_event_id() {
        let (broker, conn, _rx) = setup();
        let result = handle_message(
            &broker,
            conn.id(),
            r#"{"type":"publish","channel":"audit","event":{"action":"login"}}"#,
        );
        match result.response {
            ServerMessage::PublishConfirmed { channel, event_id } => {
                assert_eq!(channel, "audit");
                assert_eq!(event_id.get(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(broker.stats().queue_depth, 1);
    }

    #[test]
    fn oversize_publish_payload_is_rejected() {
        let (broker, conn, _rx) = setup();
        let frame = json!({
            "type": "publish",
            "channel": "audit",
            "event": {"blob": "x".repeat(300)},
        })
        .to_string();
        let result = handle_message(&broker, conn.id(), &frame);
        assert_eq!(error_code(&result), PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn ping_gets_pong_with_original_timestamp() {
        let (broker, conn, _rx) = setup();
        let result = handle_message(&broker, conn.id(), r#"{"type":"ping","timestamp":"abc"}"#);
        match result.response {
            ServerMessage::Pong {
                original_timestamp, ..
            } => assert_eq!(original_timestamp, json!("abc")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_json_reports_parse_error() {
        let (broker, conn, _rx) = setup();
        let result = handle_message(&broker, conn.id(), "{oops");
        assert_eq!(result.message_type, "");
        assert_eq!(error_code(&result), MESSAGE_PARSE_ERROR);
        assert_eq!(broker.stats().errors_count, 1);
    }

    #[test]
    fn unknown_type_reports_unknown_message_type() {
        let (broker, conn, _rx) = setup();
        let result = handle_message(&broker, conn.id(), r#"{"type":"shout"}"#);
        assert_eq!(error_code(&result), UNKNOWN_MESSAGE_TYPE);
    }

    #[test]
    fn oversize_frame_is_rejected_before_parsing() {
        let (broker, conn, _rx) = setup();
        let frame = "x".repeat(max_frame_bytes(broker.config()) + 1);
        let result = handle_message(&broker, conn.id(), &frame);
        assert_eq!(error_code(&result), PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn undecodable_binary_reports_parse_error() {
        let (broker, conn, _rx) = setup();
        let result = handle_undecodable(&broker, conn.id(), 4);
        assert_eq!(error_code(&result), MESSAGE_PARSE_ERROR);
        assert_eq!(conn.messages_received(), 1);
    }

    #[test]
    fn every_frame_counts_as_activity() {
        let (broker, conn, _rx) = setup();
        let _ = conn.advance_liveness();
        let _ = handle_message(&broker, conn.id(), "garbage");
        assert_eq!(conn.liveness(), crate::connection::Liveness::Alive);
        assert_eq!(conn.messages_received(), 1);
    }

    #[test]
    fn type_names_cover_all_client_messages() {
        let samples = [
            ClientMessage::Subscribe {
                channel: "c".into(),
                filter: None,
            },
            ClientMessage::Unsubscribe { channel: "c".into() },
            ClientMessage::GetHistory {
                channel: "c".into(),
                limit: None,
                since: None,
            },
            ClientMessage::Publish {
                channel: "c".into(),
                event: json!({}),
                priority: None,
            },
            ClientMessage::Ping {
                timestamp: json!(null),
            },
        ];
        let names: Vec<&str> = samples.iter().map(client_type_name).collect();
        assert_eq!(names, CLIENT_MESSAGE_TYPES);
    }
}
