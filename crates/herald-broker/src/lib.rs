//! # herald-broker
//!
//! Real-time event distribution core.
//!
//! - Connection registry: live connections, outbound queues, liveness state
//! - Channel registry: named channels, subscriber sets, per-channel metadata
//! - Filter engine: fail-closed key/value matching against event payloads
//! - Retention store: bounded per-channel history with age and count eviction
//! - Dispatcher: single-writer FIFO drain loop with isolated fan-out failures
//! - Heartbeat monitor: ping/pong liveness and eviction of dead connections
//! - Wire protocol: JSON client/server messages and per-message handling

#![deny(unsafe_code)]

pub mod broker;
pub mod channel;
pub mod clock;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod event;
pub mod filter;
pub mod handler;
pub mod heartbeat;
pub mod ids;
pub mod metrics;
pub mod protocol;
pub mod retention;
pub mod stats;

pub use broker::{Broker, BrokerHandle};
pub use config::{BrokerConfig, ChannelSpec};
pub use errors::{BrokerError, ProtocolError};
pub use event::Event;
pub use ids::{ConnectionId, EventId};
