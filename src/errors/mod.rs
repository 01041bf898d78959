//! Error taxonomy for the bridge.
//!
//! Every failure that can cross a component boundary is a [`BridgeError`]
//! variant. The taxonomy distinguishes three propagation classes:
//!
//! - **Retryable** transport-level failures (`TransientNetwork`) that callers
//!   may retry with backoff.
//! - **Session-fatal** failures (`ProtocolViolation`, `NegotiationTimeout`,
//!   exhausted transport loss) that terminate the session and surface to the
//!   client as a status event.
//! - **Tool-level** failures (`UnknownTool`, `InvalidArguments`,
//!   `ToolExecution`, `ToolTimeout`) that are injected back into the live
//!   conversation as function-call results so the model can inform the user,
//!   rather than killing the session.

use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur anywhere in the session bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The upstream provider rejected our credentials.
    #[error("upstream auth error: {0}")]
    UpstreamAuth(String),

    /// Timeout or connect failure talking to a remote endpoint. Retryable.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The transport closed underneath us.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// A frame failed to parse as a recognized event. Tolerated and dropped,
    /// unless three arrive consecutively. The transport legs count and log
    /// these inline; the variant holds the `malformed_frame` slot in the
    /// client-facing code space.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Repeated malformed frames. Fatal to the session.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Upstream never acknowledged the initial session configuration.
    #[error("negotiation timed out")]
    NegotiationTimeout,

    /// A function call named a tool absent from the registration table.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Arguments failed schema validation; the handler was never invoked.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// A tool handler failed internally.
    #[error("tool '{tool}' failed: {cause}")]
    ToolExecution { tool: String, cause: String },

    /// A tool handler exceeded its execution deadline.
    #[error("tool '{0}' timed out")]
    ToolTimeout(String),

    /// The external task service returned an error.
    #[error("task service error: {0}")]
    TaskService(String),

    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON encoding/decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Whether the caller may retry the operation (with backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::TransientNetwork(_))
    }

    /// Whether this error terminates the session it occurred in.
    ///
    /// Tool-level errors are deliberately non-fatal: they travel back through
    /// the conversation as function-call results.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::ProtocolViolation(_)
                | BridgeError::NegotiationTimeout
                | BridgeError::UpstreamAuth(_)
                | BridgeError::Config(_)
        )
    }

    /// Stable snake_case code used in client-facing status and error events.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::UpstreamAuth(_) => "upstream_auth_error",
            BridgeError::TransientNetwork(_) => "transient_network_error",
            BridgeError::TransportClosed(_) => "transport_closed",
            BridgeError::MalformedFrame(_) => "malformed_frame",
            BridgeError::ProtocolViolation(_) => "protocol_violation",
            BridgeError::NegotiationTimeout => "negotiation_timeout",
            BridgeError::UnknownTool(_) => "unknown_tool",
            BridgeError::InvalidArguments(_) => "invalid_arguments",
            BridgeError::ToolExecution { .. } => "tool_execution_error",
            BridgeError::ToolTimeout(_) => "tool_timeout",
            BridgeError::TaskService(_) => "task_service_error",
            BridgeError::Config(_) => "config_error",
            BridgeError::Serialization(_) => "serialization_error",
        }
    }

    /// Serialize a tool-level error as the JSON payload injected into the
    /// conversation, so the model can relay it conversationally.
    pub fn to_tool_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        })
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            BridgeError::TransientNetwork(e.to_string())
        } else {
            BridgeError::TaskService(e.to_string())
        }
    }
}
