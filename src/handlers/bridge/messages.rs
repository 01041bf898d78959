//! Client-facing WebSocket protocol.
//!
//! Text frames carry typed JSON messages in both directions; binary frames
//! are raw audio and bypass this module entirely.

use serde::{Deserialize, Serialize};

use crate::core::session::SessionState;

/// Upper bound on a client text message. Larger payloads are rejected as
/// malformed rather than forwarded upstream.
pub const MAX_TEXT_LEN: usize = 16 * 1024;

// =============================================================================
// Incoming (client -> bridge)
// =============================================================================

/// Messages the browser client sends over text frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Begin a session, optionally overriding negotiation parameters.
    Start {
        #[serde(default)]
        instructions: Option<String>,
        #[serde(default)]
        voice: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },

    /// Inject a typed user message into the conversation.
    Text { text: String },

    /// Flush buffered audio for transcription (manual turn end).
    Commit,

    /// Discard buffered audio upstream.
    ClearAudio,

    /// Ask the model to respond now.
    CreateResponse,

    /// Interrupt the in-progress response.
    CancelResponse,

    /// Orderly teardown.
    Close,
}

impl ClientMessage {
    /// Cheap structural validation applied after parsing.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ClientMessage::Text { text } => {
                if text.is_empty() {
                    return Err("text must not be empty".into());
                }
                if text.len() > MAX_TEXT_LEN {
                    return Err(format!("text exceeds {MAX_TEXT_LEN} bytes"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Outgoing (bridge -> client)
// =============================================================================

/// Messages the bridge sends back over text frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The session finished negotiation and is live.
    SessionCreated {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Lifecycle transition or notable in-session event, human readable.
    Status {
        state: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// Transcript fragment or final turn text.
    Transcript {
        role: crate::core::session::Role,
        text: String,
        is_final: bool,
    },

    /// The model requested a tool; execution has started.
    FunctionCall { call_id: String, name: String },

    /// A tool finished; its result was injected into the conversation.
    FunctionResult { call_id: String, ok: bool },

    /// An error the client should surface. Fatal errors are followed by
    /// `closing` and socket closure.
    Error { code: String, message: String },

    /// The session is going away.
    Closing { reason: String },
}

impl ServerMessage {
    pub fn status(state: SessionState, detail: impl Into<String>) -> Self {
        ServerMessage::Status {
            state,
            detail: Some(detail.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_with_overrides() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "start", "voice": "alloy"}"#).unwrap();
        match msg {
            ClientMessage::Start { voice, model, .. } => {
                assert_eq!(voice.as_deref(), Some("alloy"));
                assert!(model.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_parse_bare_commands() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type": "commit"}"#).unwrap(),
            ClientMessage::Commit
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type": "close"}"#).unwrap(),
            ClientMessage::Close
        ));
    }

    #[test]
    fn test_unknown_type_is_parse_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "restart"}"#).is_err());
    }

    #[test]
    fn test_text_validation() {
        let empty = ClientMessage::Text { text: String::new() };
        assert!(empty.validate().is_err());

        let oversized = ClientMessage::Text {
            text: "x".repeat(MAX_TEXT_LEN + 1),
        };
        assert!(oversized.validate().is_err());

        let ok = ClientMessage::Text {
            text: "add milk to my list".into(),
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_server_message_tags() {
        let json = serde_json::to_string(&ServerMessage::FunctionCall {
            call_id: "c1".into(),
            name: "create_task".into(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"function_call""#));

        let json = serde_json::to_string(&ServerMessage::status(
            SessionState::Active,
            "negotiated",
        ))
        .unwrap();
        assert!(json.contains(r#""state":"active""#));
    }
}
