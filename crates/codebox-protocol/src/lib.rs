//! Wire types for the codebox run protocol.
//!
//! Every frame on the WebSocket is a JSON object of the form
//! `{"event": <name>, "data": {...}}`. Clients send [`ClientCommand`]s and
//! receive [`ServerEvent`]s.

pub mod commands;
pub mod events;

pub use commands::{ClientCommand, StartRequest, StdinRequest, StopRequest};
pub use events::{RunEvent, ServerEvent};
