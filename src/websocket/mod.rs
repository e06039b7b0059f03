//! WebSocket module for the frame gateway
//!
//! This module handles websocket connections, the client/server
//! protocol, per-connection dispatch and broadcasting.

mod broadcast;
mod connection;
mod protocol;
mod server;

pub use broadcast::Broadcaster;
pub use connection::{Connection, ConnectionState, Flow};
pub use protocol::{ClientMessage, ServerMessage, CAPABILITIES, SERVER_VERSION};
pub use server::WebSocketServer;
