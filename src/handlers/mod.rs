//! HTTP and WebSocket request handlers.

pub mod bridge;
pub mod token;
