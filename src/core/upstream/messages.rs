//! Upstream realtime wire events.
//!
//! JSON event types exchanged with the streaming AI endpoint over WebSocket.
//! Only the events the bridge actually sends or reacts to are modeled;
//! anything else the server emits deserializes to [`ServerEvent::Unknown`]
//! and is traced, not treated as a malformed frame.
//!
//! Client events (sent upstream): `session.update`,
//! `input_audio_buffer.append` / `.commit` / `.clear`,
//! `conversation.item.create` (function_call_output), `response.create`,
//! `response.cancel`.

use base64::prelude::*;
use serde::{Deserialize, Serialize};

// =============================================================================
// Session negotiation payloads
// =============================================================================

/// Session settings sent during negotiation (`session.update`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionSettings>,
    /// Declared tool schemas the model may call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSchema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

/// Input transcription settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    /// Transcription model (e.g., "whisper-1").
    pub model: String,
}

/// Flat tool schema as the realtime endpoint expects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Always "function".
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

// =============================================================================
// Conversation items
// =============================================================================

/// A conversation item created by the bridge.
///
/// Only the two shapes the bridge produces are supported: a user text
/// message and a `function_call_output` carrying a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ConversationItem {
    /// A user text message item.
    pub fn user_text(text: &str) -> Self {
        Self {
            kind: "message".to_string(),
            role: Some("user".to_string()),
            content: Some(vec![ContentPart {
                kind: "input_text".to_string(),
                text: Some(text.to_string()),
            }]),
            call_id: None,
            name: None,
            output: None,
        }
    }

    /// A function call output item correlated by call id.
    pub fn function_output(call_id: &str, output: &str) -> Self {
        Self {
            kind: "function_call_output".to_string(),
            role: None,
            content: None,
            call_id: Some(call_id.to_string()),
            name: None,
            output: Some(output.to_string()),
        }
    }
}

/// Content part within a conversation item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

// =============================================================================
// Client events (bridge -> upstream)
// =============================================================================

/// Events the bridge sends upstream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded audio.
        audio: String,
    },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    /// Build an audio append event from raw frame bytes.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(data),
        }
    }
}

// =============================================================================
// Server events (upstream -> bridge)
// =============================================================================

/// Events the bridge reacts to from upstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: UpstreamApiError },

    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: u64,
    },

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: u64,
    },

    /// Final transcript of the user's committed audio.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        item_id: Option<String>,
        transcript: String,
    },

    /// Output item added to a response. For `function_call` items this
    /// carries the call id and the function name; the arguments arrive
    /// later on `FunctionCallArgumentsDone`.
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: OutputItem },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        arguments: String,
    },

    #[serde(rename = "response.text.delta")]
    TextDelta { delta: String },

    #[serde(rename = "response.text.done")]
    TextDone { text: String },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone { transcript: String },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Option<ResponseInfo>,
    },

    /// Any event type the bridge has no use for.
    #[serde(other)]
    Unknown,
}

/// Error payload from the upstream API.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamApiError {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

/// Session info echoed back on creation/update acknowledgments.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Minimal response info from `response.done`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Output item within a response.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_update_tag() {
        let event = ClientEvent::SessionUpdate {
            session: SessionSettings {
                instructions: Some("You manage tasks.".into()),
                voice: Some("verse".into()),
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"session.update""#));
        assert!(json.contains("You manage tasks."));
        // Unset options must not appear on the wire.
        assert!(!json.contains("input_audio_format"));
    }

    #[test]
    fn test_function_output_item() {
        let event = ClientEvent::ConversationItemCreate {
            item: ConversationItem::function_output("c1", r#"{"status":"ok"}"#),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"conversation.item.create""#));
        assert!(json.contains(r#""type":"function_call_output""#));
        assert!(json.contains(r#""call_id":"c1""#));
    }

    #[test]
    fn test_audio_append_roundtrip() {
        let data = [0u8, 1, 2, 3];
        match ClientEvent::audio_append(&data) {
            ClientEvent::InputAudioBufferAppend { audio } => {
                assert_eq!(BASE64_STANDARD.decode(audio).unwrap(), data);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_function_call_arguments_done_parses() {
        let json = r#"{
            "type": "response.function_call_arguments.done",
            "response_id": "resp_1",
            "item_id": "item_1",
            "output_index": 0,
            "call_id": "c1",
            "arguments": "{\"title\":\"Buy milk\"}"
        }"#;
        match serde_json::from_str::<ServerEvent>(json).unwrap() {
            ServerEvent::FunctionCallArgumentsDone { call_id, arguments } => {
                assert_eq!(call_id, "c1");
                assert!(arguments.contains("Buy milk"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_unrecognized_event_is_unknown_not_error() {
        let json = r#"{"type": "rate_limits.updated", "rate_limits": []}"#;
        assert!(matches!(
            serde_json::from_str::<ServerEvent>(json).unwrap(),
            ServerEvent::Unknown
        ));
    }

    #[test]
    fn test_error_event_parses() {
        let json = r#"{
            "type": "error",
            "error": {"type": "invalid_request_error", "message": "bad session"}
        }"#;
        match serde_json::from_str::<ServerEvent>(json).unwrap() {
            ServerEvent::Error { error } => assert_eq!(error.message, "bad session"),
            _ => panic!("wrong variant"),
        }
    }
}
