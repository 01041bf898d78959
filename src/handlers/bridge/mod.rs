//! Browser-facing bridge WebSocket: protocol types and the session driver.

pub mod handler;
pub mod messages;

pub use handler::bridge_ws;
pub use messages::{ClientMessage, ServerMessage};
