//! Upstream streaming endpoint: wire events, connection client and
//! reconnection policy.

pub mod client;
pub mod config;
pub mod messages;

pub use client::{AudioBuffer, EventNormalizer, UpstreamClient};
pub use config::BackoffPolicy;
