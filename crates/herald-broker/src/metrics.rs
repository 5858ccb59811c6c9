//! Metric name constants shared by the broker and the server's exporter.

/// Connections ever registered (counter).
pub const CONNECTIONS_TOTAL: &str = "herald_connections_total";
/// Live connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "herald_connections_active";
/// Events accepted by `publish` (counter).
pub const EVENTS_PUBLISHED_TOTAL: &str = "herald_events_published_total";
/// Events processed by the drain loop (counter).
pub const EVENTS_PROCESSED_TOTAL: &str = "herald_events_processed_total";
/// Successful per-subscriber deliveries (counter).
pub const EVENTS_DELIVERED_TOTAL: &str = "herald_events_delivered_total";
/// Failed per-subscriber deliveries (counter).
pub const DELIVERY_FAILURES_TOTAL: &str = "herald_delivery_failures_total";
/// Drain-loop entries that failed internally (counter).
pub const DRAIN_FAILURES_TOTAL: &str = "herald_drain_failures_total";
/// Events evicted from retention (counter).
pub const RETENTION_EVICTIONS_TOTAL: &str = "herald_retention_evictions_total";
/// Connections evicted by the heartbeat monitor (counter).
pub const HEARTBEAT_EVICTIONS_TOTAL: &str = "herald_heartbeat_evictions_total";
/// Protocol errors reported to clients (counter, labels: code).
pub const PROTOCOL_ERRORS_TOTAL: &str = "herald_protocol_errors_total";
/// Events waiting in the dispatcher queue (gauge).
pub const QUEUE_DEPTH: &str = "herald_queue_depth";
