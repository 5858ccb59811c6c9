//! # herald-server
//!
//! Axum HTTP + `WebSocket` front end for the herald event broker.
//!
//! - `WebSocket` gateway: one reader and one writer task per connection
//! - HTTP endpoints: health, stats, channel listing, Prometheus metrics,
//!   producer-side publish, channel administration
//! - Settings: JSON file deep-merged over defaults, then env overrides
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`

#![deny(unsafe_code)]

pub mod health;
pub mod metrics;
pub mod server;
pub mod settings;
pub mod shutdown;
pub mod telemetry;
pub mod websocket;

pub use server::HeraldServer;
pub use settings::HeraldSettings;
