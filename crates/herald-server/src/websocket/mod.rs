//! WebSocket transport: bridges a socket to a broker connection.

pub mod session;
