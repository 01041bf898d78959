//! Realtime voice-to-task bridge.
//!
//! Relays browser audio and text over WebSocket to a streaming AI endpoint,
//! executes the model's function calls against a task service, and injects
//! the results back into the live conversation.

pub mod config;
pub mod core;
pub mod errors;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use errors::{BridgeError, BridgeResult};
pub use state::{AppState, SharedState};
