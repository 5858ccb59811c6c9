//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// WebSocket sessions closed (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "herald_ws_disconnections_total";
/// WebSocket session duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "herald_ws_connection_duration_seconds";
/// Upgrades refused because the connection cap was reached (counter).
pub const WS_REJECTED_TOTAL: &str = "herald_ws_rejected_total";
/// HTTP publish requests (counter, labels: outcome).
pub const HTTP_PUBLISH_TOTAL: &str = "herald_http_publish_total";

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}
