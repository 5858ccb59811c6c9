//! `HeraldServer`: Axum HTTP + WebSocket front end for the broker.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use herald_broker::channel::{ChannelInfo, Priority};
use herald_broker::errors::INVALID_CHANNEL;
use herald_broker::handler::max_frame_bytes;
use herald_broker::stats::BrokerStats;
use herald_broker::{Broker, BrokerError, EventId};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::health::{self, HealthResponse};
use crate::metrics as names;
use crate::settings::ServerSettings;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The broker.
    pub broker: Arc<Broker>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Concurrent WebSocket connection cap.
    pub max_connections: usize,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The herald server.
pub struct HeraldServer {
    settings: ServerSettings,
    broker: Arc<Broker>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl HeraldServer {
    /// Create a server in front of `broker`.
    pub fn new(settings: ServerSettings, broker: Arc<Broker>) -> Self {
        Self {
            settings,
            broker,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from this Prometheus handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            broker: self.broker.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            max_connections: self.settings.max_connections,
            metrics: self.metrics.clone(),
        };
        let body_limit = max_frame_bytes(self.broker.config());

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .route("/channels", get(channels_handler))
            .route("/channels/{name}/publish", post(publish_handler))
            .route("/channels/{name}/deactivate", post(deactivate_handler))
            .route("/channels/{name}/reactivate", post(reactivate_handler))
            .layer(DefaultBodyLimit::max(body_limit))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown is signalled.
    ///
    /// Returns the bound address and the serving task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                error!(error = %e, "server error");
            }
        });

        info!(%local_addr, "herald server listening");
        Ok((local_addr, handle))
    }

    /// Get the broker.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the listener settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

// ── Errors ──────────────────────────────────────────────────────────

/// JSON error body for HTTP endpoints.
#[derive(Debug, Serialize)]
struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        let status = match &err {
            BrokerError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::InvalidChannelName { .. } | BrokerError::ChannelInactive(_) => {
                StatusCode::BAD_REQUEST
            }
            BrokerError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BrokerError::DispatcherStopped => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

// ── Handlers ────────────────────────────────────────────────────────

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
) -> Response {
    let active = state.broker.connections().active_count();
    if active >= state.max_connections {
        warn!(active, max = state.max_connections, "connection limit reached");
        counter!(names::WS_REJECTED_TOTAL).increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let mut metadata = HashMap::new();
    if let Some(Extension(ConnectInfo(addr))) = connect_info {
        let _ = metadata.insert("remoteAddr".to_owned(), addr.to_string());
    }
    if let Some(agent) = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
    {
        let _ = metadata.insert("userAgent".to_owned(), agent.to_owned());
    }

    let frame_limit = max_frame_bytes(state.broker.config());
    ws.max_message_size(frame_limit)
        .max_frame_size(frame_limit)
        .on_upgrade(move |socket| async move {
            let (conn, outbound) = state.broker.connect(metadata);
            run_ws_session(socket, state.broker, conn, outbound).await;
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let active = state.broker.connections().active_count();
    Json(health::health_check(state.start_time, active))
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<BrokerStats> {
    Json(state.broker.stats())
}

/// GET /channels
async fn channels_handler(State(state): State<AppState>) -> Json<Vec<ChannelInfo>> {
    Json(state.broker.list_channels())
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Body of `POST /channels/{name}/publish`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest {
    event: Value,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    publisher: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishAccepted {
    channel: String,
    event_id: EventId,
}

/// POST /channels/{name}/publish
async fn publish_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishAccepted>), ApiError> {
    match state
        .broker
        .publish(&name, req.event, req.priority, req.publisher)
    {
        Ok(event_id) => {
            counter!(names::HTTP_PUBLISH_TOTAL, "outcome" => "accepted").increment(1);
            Ok((
                StatusCode::ACCEPTED,
                Json(PublishAccepted {
                    channel: name,
                    event_id,
                }),
            ))
        }
        Err(e) => {
            counter!(names::HTTP_PUBLISH_TOTAL, "outcome" => "rejected").increment(1);
            Err(e.into())
        }
    }
}

/// POST /channels/{name}/deactivate
async fn deactivate_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.broker.deactivate_channel(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /channels/{name}/reactivate
async fn reactivate_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.broker.reactivate_channel(&name)?;
    Ok(StatusCode::NO_CONTENT)
}
