//! Real-time transport: the WebSocket endpoint and the subscriber hub.
//!
//! Frames are JSON text messages, see `codebox_protocol` for their shape.

mod handler;
mod hub;

pub use handler::ws_handler;
pub use hub::{ConnectionId, WsHub, WsSender};
