//! WebSocket session lifecycle: handles a single connected client from
//! upgrade through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use herald_broker::Broker;
use herald_broker::connection::{Connection, Outbound};
use herald_broker::handler::{HandleResult, handle_message, handle_undecodable};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::metrics as names;

/// How long the writer may take to flush queued frames after the connection
/// is closed.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Run a WebSocket session for a registered connection.
///
/// 1. Forwards queued frames (greeting, replies, events, pings) to the socket
/// 2. Feeds inbound text/binary frames through the protocol handler
/// 3. Counts any inbound frame, including pongs, as liveness traffic
/// 4. Ends when the client leaves or the broker closes the connection
/// 5. Disconnects the connection from the broker on exit
#[instrument(skip_all, fields(conn_id = %conn.id()))]
pub async fn run_ws_session(
    ws: WebSocket,
    broker: Arc<Broker>,
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<Outbound>,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let closed = conn.closed_token();
    let connection_start = Instant::now();
    info!("client connected");

    let mut writer = tokio::spawn(write_frames(ws_tx, outbound, closed.clone()));

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = closed.cancelled() => {
                debug!("connection closed by broker");
                break;
            }
        };

        let result = match msg {
            Some(Ok(Message::Text(text))) => handle_message(&broker, conn.id(), text.as_str()),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => handle_message(&broker, conn.id(), text),
                Err(_) => handle_undecodable(&broker, conn.id(), data.len()),
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                let _ = broker.mark_activity(conn.id());
                continue;
            }
            Some(Ok(Message::Close(_))) => {
                info!("client sent close frame");
                break;
            }
            Some(Err(e)) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
            None => break,
        };
        reply(&conn, &result);
    }

    // Closing the connection cancels `closed`, which tells the writer to flush.
    let _ = broker.disconnect(conn.id());
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await.is_err() {
        warn!("writer did not finish flushing, aborting");
        writer.abort();
    }

    info!(
        sent = conn.messages_sent(),
        received = conn.messages_received(),
        dropped = conn.drop_count(),
        "client disconnected"
    );
    counter!(names::WS_DISCONNECTIONS_TOTAL).increment(1);
    histogram!(names::WS_CONNECTION_DURATION_SECONDS)
        .record(connection_start.elapsed().as_secs_f64());
}

fn reply(conn: &Connection, result: &HandleResult) {
    if !conn.send_json(&result.response) {
        info!(
            message_type = result.message_type,
            "failed to enqueue reply (buffer full or closed)"
        );
    }
}

/// Forward queued frames to the socket until the queue ends, the socket
/// fails, or the connection is closed. On close, frames already queued are
/// flushed before the close frame.
async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(to_message(frame)).await.is_err() {
                    return;
                }
            }
            () = closed.cancelled() => {
                while let Ok(frame) = outbound.try_recv() {
                    if ws_tx.send(to_message(frame)).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

fn to_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Text(text) => Message::Text(text.as_ref().to_owned().into()),
        Outbound::Ping => Message::Ping(Vec::new().into()),
    }
}
