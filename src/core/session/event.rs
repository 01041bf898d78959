//! Internal session event model.
//!
//! Both transport legs normalize their wire traffic into [`Event`] values
//! before anything reaches the state machine, so the machine never sees
//! provider JSON or socket frames and can be tested without either.

use std::fmt;

use serde::Serialize;

// =============================================================================
// Lifecycle states
// =============================================================================

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Upstream transport is being established.
    Connecting,
    /// Transport is open; waiting for the configuration acknowledgment.
    Negotiating,
    /// Fully negotiated; audio, transcripts and tool calls flow.
    Active,
    /// Audio intake paused while a buffer commit awaits its ack.
    Suspended,
    /// Teardown under way; in-flight tool calls may still finish.
    Closing,
    /// Terminal. Nothing is delivered past this point.
    Closed,
    /// Terminal failure state.
    Error,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Active => "active",
            SessionState::Suspended => "suspended",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Speaker roles
// =============================================================================

/// Who produced a transcript fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// A normalized event fed to the session state machine.
///
/// Variants cover both upstream traffic and local stimuli (client requests,
/// timer expiries, tool completions). One queue per session serializes them.
#[derive(Debug, Clone)]
pub enum Event {
    /// Upstream transport finished its handshake.
    TransportOpen,

    /// Upstream acknowledged the session configuration.
    NegotiationAck {
        upstream_session_id: String,
        model: Option<String>,
    },

    /// Upstream acknowledged a buffered-audio commit.
    AudioCommitted,

    /// Server-side voice activity detection fired.
    SpeechStarted { audio_start_ms: u64 },
    SpeechStopped { audio_end_ms: u64 },

    /// Incremental transcript fragment.
    TranscriptDelta { role: Role, text: String },

    /// Final transcript for one turn of the given role.
    TranscriptFinal { role: Role, text: String },

    /// The model requested a tool invocation. Name and arguments have
    /// already been joined by call id on the upstream leg.
    FunctionCallRequest {
        call_id: String,
        name: String,
        arguments: String,
    },

    /// A dispatched tool finished (successfully or not). The payload is the
    /// JSON to inject into the conversation either way.
    ToolOutcome {
        call_id: String,
        ok: bool,
        payload: serde_json::Value,
    },

    /// The model finished generating a response.
    ResponseDone,

    /// Upstream reported an error event.
    UpstreamError {
        code: Option<String>,
        message: String,
    },

    /// The upstream transport closed.
    TransportClosed { reason: String },

    /// The client asked to flush accumulated audio.
    ClientCommit,

    /// The client sent a text message.
    ClientText { text: String },

    /// The client asked for teardown.
    ClientClose,

    /// The negotiation deadline expired without an ack.
    NegotiationDeadline,

    /// The closing grace period expired with calls still in flight.
    ClosingDeadline,
}

impl Event {
    /// Short label used in the session event log and trace output.
    pub fn label(&self) -> &'static str {
        match self {
            Event::TransportOpen => "transport_open",
            Event::NegotiationAck { .. } => "negotiation_ack",
            Event::AudioCommitted => "audio_committed",
            Event::SpeechStarted { .. } => "speech_started",
            Event::SpeechStopped { .. } => "speech_stopped",
            Event::TranscriptDelta { .. } => "transcript_delta",
            Event::TranscriptFinal { .. } => "transcript_final",
            Event::FunctionCallRequest { .. } => "function_call_request",
            Event::ToolOutcome { .. } => "tool_outcome",
            Event::ResponseDone => "response_done",
            Event::UpstreamError { .. } => "upstream_error",
            Event::TransportClosed { .. } => "transport_closed",
            Event::ClientCommit => "client_commit",
            Event::ClientText { .. } => "client_text",
            Event::ClientClose => "client_close",
            Event::NegotiationDeadline => "negotiation_deadline",
            Event::ClosingDeadline => "closing_deadline",
        }
    }
}
