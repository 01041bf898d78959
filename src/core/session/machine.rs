//! Session state machine.
//!
//! A [`SessionMachine`] consumes normalized [`Event`]s and returns the
//! [`Action`]s the driver must perform. It owns all per-session mutable
//! state (lifecycle phase, pending tool-call table, transcript buffers) and
//! touches no sockets, so every transition is directly testable.
//!
//! Lifecycle: `Connecting -> Negotiating -> Active <-> Suspended -> Closing
//! -> Closed`, with `Error` as the failure terminal. All mutation flows
//! through [`SessionMachine::handle`], which the driver calls from a single
//! per-session queue.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::core::session::event::{Event, Role, SessionState};
use crate::core::upstream::messages::{ClientEvent, ConversationItem, SessionSettings};
use crate::errors::BridgeError;
use crate::handlers::bridge::messages::ServerMessage;

/// Bounded ordered log of recent events, kept for debugging.
const MAX_EVENT_LOG: usize = 256;

/// Side effects the driver executes after a transition.
#[derive(Debug, Clone)]
pub enum Action {
    /// Encode and send an event on the upstream socket.
    SendUpstream(ClientEvent),
    /// Encode and send a message on the client socket.
    SendClient(ServerMessage),
    /// Hand a tool call to the dispatcher; its outcome comes back as
    /// [`Event::ToolOutcome`].
    Dispatch {
        call_id: String,
        name: String,
        arguments: String,
    },
    /// Start the negotiation ack deadline.
    ArmNegotiationDeadline,
    /// Start the closing grace deadline.
    ArmClosingDeadline,
    /// Tear both transports down.
    Close { reason: String },
}

/// A tool call awaiting its outcome.
#[derive(Debug, Clone)]
struct PendingCall {
    name: String,
}

/// Per-session state machine.
pub struct SessionMachine {
    id: String,
    state: SessionState,
    /// Configuration sent during negotiation.
    settings: SessionSettings,
    /// Names the dispatcher can actually serve. Requests outside this set
    /// are answered with an error result without dispatching.
    known_tools: HashSet<String>,
    /// In-flight tool calls, keyed by call id.
    pending: HashMap<String, PendingCall>,
    /// Every call id ever observed, for duplicate suppression.
    seen_calls: HashSet<String>,
    /// Working transcript per role, cleared on each final.
    transcripts: HashMap<Role, String>,
    event_log: VecDeque<&'static str>,
}

impl SessionMachine {
    pub fn new(id: String, settings: SessionSettings, known_tools: HashSet<String>) -> Self {
        Self {
            id,
            state: SessionState::Connecting,
            settings,
            known_tools,
            pending: HashMap::new(),
            seen_calls: HashSet::new(),
            transcripts: HashMap::new(),
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of tool calls currently in flight.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Recent event labels, oldest first.
    pub fn recent_events(&self) -> impl Iterator<Item = &&'static str> {
        self.event_log.iter()
    }

    /// Whether audio frames should currently be forwarded upstream.
    ///
    /// Audio is refused (dropped with a warn at the call site) outside
    /// `Active`; `Suspended` waits for the commit ack first.
    pub fn accepts_audio(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Process one event, returning the actions to perform in order.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        self.log_event(&event);
        if self.state.is_terminal() {
            // Nothing is delivered past Closed/Error, including late tool
            // outcomes.
            debug!(session_id = %self.id, event = event.label(), "event after terminal state, discarded");
            return Vec::new();
        }
        match event {
            Event::TransportOpen => self.on_transport_open(),
            Event::NegotiationAck {
                upstream_session_id,
                model,
            } => self.on_negotiation_ack(upstream_session_id, model),
            Event::NegotiationDeadline => self.on_negotiation_deadline(),
            Event::AudioCommitted => self.on_audio_committed(),
            Event::SpeechStarted { audio_start_ms } => {
                vec![Action::SendClient(ServerMessage::status(
                    self.state,
                    format!("speech_started at {audio_start_ms}ms"),
                ))]
            }
            Event::SpeechStopped { audio_end_ms } => {
                vec![Action::SendClient(ServerMessage::status(
                    self.state,
                    format!("speech_stopped at {audio_end_ms}ms"),
                ))]
            }
            Event::TranscriptDelta { role, text } => self.on_transcript_delta(role, text),
            Event::TranscriptFinal { role, text } => self.on_transcript_final(role, text),
            Event::FunctionCallRequest {
                call_id,
                name,
                arguments,
            } => self.on_function_call(call_id, name, arguments),
            Event::ToolOutcome {
                call_id,
                ok,
                payload,
            } => self.on_tool_outcome(call_id, ok, payload),
            Event::ResponseDone => Vec::new(),
            Event::UpstreamError { code, message } => self.on_upstream_error(code, message),
            Event::TransportClosed { reason } => self.on_transport_closed(reason),
            Event::ClientCommit => self.on_client_commit(),
            Event::ClientText { text } => self.on_client_text(text),
            Event::ClientClose => self.on_client_close(),
            Event::ClosingDeadline => self.on_closing_deadline(),
        }
    }

    // -------------------------------------------------------------------------
    // Negotiation
    // -------------------------------------------------------------------------

    fn on_transport_open(&mut self) -> Vec<Action> {
        if self.state != SessionState::Connecting {
            warn!(session_id = %self.id, state = %self.state, "unexpected transport open");
            return Vec::new();
        }
        self.state = SessionState::Negotiating;
        vec![
            Action::SendUpstream(ClientEvent::SessionUpdate {
                session: self.settings.clone(),
            }),
            Action::ArmNegotiationDeadline,
            Action::SendClient(ServerMessage::status(self.state, "negotiating")),
        ]
    }

    fn on_negotiation_ack(&mut self, upstream_id: String, model: Option<String>) -> Vec<Action> {
        match self.state {
            SessionState::Negotiating => {
                self.state = SessionState::Active;
                debug!(session_id = %self.id, upstream_id = %upstream_id, "session negotiated");
                vec![Action::SendClient(ServerMessage::SessionCreated {
                    session_id: self.id.clone(),
                    model,
                })]
            }
            // Later session.updated acks carry nothing new.
            _ => Vec::new(),
        }
    }

    fn on_negotiation_deadline(&mut self) -> Vec<Action> {
        if self.state != SessionState::Negotiating {
            return Vec::new();
        }
        self.state = SessionState::Error;
        let err = BridgeError::NegotiationTimeout;
        vec![
            Action::SendClient(ServerMessage::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
            Action::Close {
                reason: "negotiation timed out".into(),
            },
        ]
    }

    // -------------------------------------------------------------------------
    // Audio commit round trip
    // -------------------------------------------------------------------------

    fn on_client_commit(&mut self) -> Vec<Action> {
        match self.state {
            SessionState::Active => {
                self.state = SessionState::Suspended;
                vec![
                    Action::SendUpstream(ClientEvent::InputAudioBufferCommit),
                    Action::SendClient(ServerMessage::status(self.state, "commit in flight")),
                ]
            }
            SessionState::Suspended => {
                warn!(session_id = %self.id, "commit while a commit is already in flight, ignored");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_audio_committed(&mut self) -> Vec<Action> {
        if self.state != SessionState::Suspended {
            return Vec::new();
        }
        self.state = SessionState::Active;
        vec![Action::SendClient(ServerMessage::status(
            self.state,
            "audio committed",
        ))]
    }

    // -------------------------------------------------------------------------
    // Transcripts and text
    // -------------------------------------------------------------------------

    fn on_transcript_delta(&mut self, role: Role, text: String) -> Vec<Action> {
        self.transcripts.entry(role).or_default().push_str(&text);
        vec![Action::SendClient(ServerMessage::Transcript {
            role,
            text,
            is_final: false,
        })]
    }

    fn on_transcript_final(&mut self, role: Role, text: String) -> Vec<Action> {
        self.transcripts.remove(&role);
        vec![Action::SendClient(ServerMessage::Transcript {
            role,
            text,
            is_final: true,
        })]
    }

    fn on_client_text(&mut self, text: String) -> Vec<Action> {
        if !matches!(self.state, SessionState::Active | SessionState::Suspended) {
            warn!(session_id = %self.id, state = %self.state, "text before session is live, dropped");
            return Vec::new();
        }
        vec![
            Action::SendUpstream(ClientEvent::ConversationItemCreate {
                item: ConversationItem::user_text(&text),
            }),
            Action::SendUpstream(ClientEvent::ResponseCreate),
        ]
    }

    // -------------------------------------------------------------------------
    // Tool calls
    // -------------------------------------------------------------------------

    fn on_function_call(&mut self, call_id: String, name: String, arguments: String) -> Vec<Action> {
        if self.state == SessionState::Closing {
            warn!(session_id = %self.id, call_id = %call_id, "tool request during teardown, discarded");
            return Vec::new();
        }
        if !matches!(self.state, SessionState::Active | SessionState::Suspended) {
            return Vec::new();
        }
        // Call ids are unique for the session lifetime. A repeat is a
        // provider hiccup, not a second execution request.
        if !self.seen_calls.insert(call_id.clone()) {
            warn!(session_id = %self.id, call_id = %call_id, "duplicate call id, ignored");
            return Vec::new();
        }

        if !self.known_tools.contains(&name) {
            let err = BridgeError::UnknownTool(name.clone());
            warn!(session_id = %self.id, call_id = %call_id, tool = %name, "unknown tool requested");
            return self.inject_result(&call_id, false, err.to_tool_payload());
        }

        self.pending
            .insert(call_id.clone(), PendingCall { name: name.clone() });
        vec![
            Action::SendClient(ServerMessage::FunctionCall {
                call_id: call_id.clone(),
                name: name.clone(),
            }),
            Action::Dispatch {
                call_id,
                name,
                arguments,
            },
        ]
    }

    fn on_tool_outcome(
        &mut self,
        call_id: String,
        ok: bool,
        payload: serde_json::Value,
    ) -> Vec<Action> {
        let Some(call) = self.pending.remove(&call_id) else {
            debug!(session_id = %self.id, call_id = %call_id, "outcome for unknown or expired call, discarded");
            return Vec::new();
        };
        debug!(
            session_id = %self.id,
            call_id = %call_id,
            tool = %call.name,
            ok,
            "tool finished"
        );
        let mut actions = self.inject_result(&call_id, ok, payload);
        if self.state == SessionState::Closing && self.pending.is_empty() {
            self.state = SessionState::Closed;
            actions.push(Action::Close {
                reason: "client requested close".into(),
            });
        }
        actions
    }

    /// Inject a tool result into the conversation. The resume control event
    /// follows the result with nothing in between.
    fn inject_result(
        &mut self,
        call_id: &str,
        ok: bool,
        payload: serde_json::Value,
    ) -> Vec<Action> {
        vec![
            Action::SendUpstream(ClientEvent::ConversationItemCreate {
                item: ConversationItem::function_output(call_id, &payload.to_string()),
            }),
            Action::SendUpstream(ClientEvent::ResponseCreate),
            Action::SendClient(ServerMessage::FunctionResult {
                call_id: call_id.to_string(),
                ok,
            }),
        ]
    }

    // -------------------------------------------------------------------------
    // Errors and teardown
    // -------------------------------------------------------------------------

    fn on_upstream_error(&mut self, code: Option<String>, message: String) -> Vec<Action> {
        let code = code.unwrap_or_else(|| "upstream_error".to_string());
        if self.state == SessionState::Negotiating {
            // Negotiation cannot proceed past a provider rejection.
            self.state = SessionState::Error;
            return vec![
                Action::SendClient(ServerMessage::Error {
                    code,
                    message: message.clone(),
                }),
                Action::Close { reason: message },
            ];
        }
        vec![Action::SendClient(ServerMessage::Error { code, message })]
    }

    fn on_transport_closed(&mut self, reason: String) -> Vec<Action> {
        let was_closing = self.state == SessionState::Closing;
        self.state = SessionState::Closed;
        self.pending.clear();
        if was_closing {
            return vec![Action::Close { reason }];
        }
        vec![
            Action::SendClient(ServerMessage::status(
                self.state,
                format!("upstream closed: {reason}"),
            )),
            Action::Close { reason },
        ]
    }

    fn on_client_close(&mut self) -> Vec<Action> {
        match self.state {
            SessionState::Closing => Vec::new(),
            _ if self.pending.is_empty() => {
                self.state = SessionState::Closed;
                vec![
                    Action::SendClient(ServerMessage::Closing {
                        reason: "client requested close".into(),
                    }),
                    Action::Close {
                        reason: "client requested close".into(),
                    },
                ]
            }
            _ => {
                // Let in-flight calls finish within the grace period.
                self.state = SessionState::Closing;
                vec![
                    Action::SendClient(ServerMessage::Closing {
                        reason: "client requested close".into(),
                    }),
                    Action::ArmClosingDeadline,
                ]
            }
        }
    }

    fn on_closing_deadline(&mut self) -> Vec<Action> {
        if self.state != SessionState::Closing {
            return Vec::new();
        }
        let abandoned = self.pending.len();
        self.pending.clear();
        self.state = SessionState::Closed;
        warn!(session_id = %self.id, abandoned, "closing grace expired with calls in flight");
        vec![Action::Close {
            reason: "closing grace expired".into(),
        }]
    }

    fn log_event(&mut self, event: &Event) {
        if self.event_log.len() == MAX_EVENT_LOG {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> SessionMachine {
        let tools: HashSet<String> = ["create_task", "list_tasks"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        SessionMachine::new("s1".into(), SessionSettings::default(), tools)
    }

    fn active_machine() -> SessionMachine {
        let mut m = machine();
        m.handle(Event::TransportOpen);
        m.handle(Event::NegotiationAck {
            upstream_session_id: "up1".into(),
            model: None,
        });
        assert_eq!(m.state(), SessionState::Active);
        m
    }

    #[test]
    fn test_negotiation_happy_path() {
        let mut m = machine();
        let actions = m.handle(Event::TransportOpen);
        assert_eq!(m.state(), SessionState::Negotiating);
        assert!(matches!(
            actions[0],
            Action::SendUpstream(ClientEvent::SessionUpdate { .. })
        ));
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, Action::ArmNegotiationDeadline))
        );

        let actions = m.handle(Event::NegotiationAck {
            upstream_session_id: "up1".into(),
            model: Some("gpt-4o-realtime-preview".into()),
        });
        assert_eq!(m.state(), SessionState::Active);
        assert!(matches!(
            actions[0],
            Action::SendClient(ServerMessage::SessionCreated { .. })
        ));
    }

    #[test]
    fn test_negotiation_deadline_is_fatal() {
        let mut m = machine();
        m.handle(Event::TransportOpen);
        let actions = m.handle(Event::NegotiationDeadline);
        assert_eq!(m.state(), SessionState::Error);
        assert!(matches!(
            &actions[0],
            Action::SendClient(ServerMessage::Error { code, .. }) if code == "negotiation_timeout"
        ));
        assert!(actions.iter().any(|a| matches!(a, Action::Close { .. })));
    }

    #[test]
    fn test_deadline_after_ack_is_noop() {
        let mut m = active_machine();
        assert!(m.handle(Event::NegotiationDeadline).is_empty());
        assert_eq!(m.state(), SessionState::Active);
    }

    #[test]
    fn test_commit_round_trip() {
        let mut m = active_machine();
        let actions = m.handle(Event::ClientCommit);
        assert_eq!(m.state(), SessionState::Suspended);
        assert!(!m.accepts_audio());
        assert!(matches!(
            actions[0],
            Action::SendUpstream(ClientEvent::InputAudioBufferCommit)
        ));

        m.handle(Event::AudioCommitted);
        assert_eq!(m.state(), SessionState::Active);
        assert!(m.accepts_audio());
    }

    #[test]
    fn test_result_injection_order() {
        let mut m = active_machine();
        m.handle(Event::FunctionCallRequest {
            call_id: "c1".into(),
            name: "create_task".into(),
            arguments: "{}".into(),
        });
        assert_eq!(m.pending_calls(), 1);

        let actions = m.handle(Event::ToolOutcome {
            call_id: "c1".into(),
            ok: true,
            payload: serde_json::json!({"status": "ok"}),
        });
        assert_eq!(m.pending_calls(), 0);
        // Resume control event immediately follows the result item.
        assert!(matches!(
            actions[0],
            Action::SendUpstream(ClientEvent::ConversationItemCreate { .. })
        ));
        assert!(matches!(
            actions[1],
            Action::SendUpstream(ClientEvent::ResponseCreate)
        ));
    }

    #[test]
    fn test_duplicate_call_id_ignored() {
        let mut m = active_machine();
        let first = m.handle(Event::FunctionCallRequest {
            call_id: "c1".into(),
            name: "create_task".into(),
            arguments: "{}".into(),
        });
        assert!(first.iter().any(|a| matches!(a, Action::Dispatch { .. })));

        let second = m.handle(Event::FunctionCallRequest {
            call_id: "c1".into(),
            name: "create_task".into(),
            arguments: "{}".into(),
        });
        assert!(second.is_empty());
        assert_eq!(m.pending_calls(), 1);
    }

    #[test]
    fn test_same_tool_distinct_ids_both_dispatch() {
        let mut m = active_machine();
        for id in ["c1", "c2"] {
            let actions = m.handle(Event::FunctionCallRequest {
                call_id: id.into(),
                name: "create_task".into(),
                arguments: r#"{"title": "Buy milk"}"#.into(),
            });
            assert!(actions.iter().any(|a| matches!(a, Action::Dispatch { .. })));
        }
        assert_eq!(m.pending_calls(), 2);
    }

    #[test]
    fn test_unknown_tool_keeps_session_active() {
        let mut m = active_machine();
        let actions = m.handle(Event::FunctionCallRequest {
            call_id: "c1".into(),
            name: "launch_rocket".into(),
            arguments: "{}".into(),
        });
        assert_eq!(m.state(), SessionState::Active);
        assert_eq!(m.pending_calls(), 0);
        // Error result injected without any dispatch.
        assert!(!actions.iter().any(|a| matches!(a, Action::Dispatch { .. })));
        assert!(matches!(
            actions[0],
            Action::SendUpstream(ClientEvent::ConversationItemCreate { .. })
        ));
        assert!(matches!(
            actions[1],
            Action::SendUpstream(ClientEvent::ResponseCreate)
        ));
    }

    #[test]
    fn test_close_with_no_pending_is_immediate() {
        let mut m = active_machine();
        let actions = m.handle(Event::ClientClose);
        assert_eq!(m.state(), SessionState::Closed);
        assert!(actions.iter().any(|a| matches!(a, Action::Close { .. })));
    }

    #[test]
    fn test_close_waits_for_pending_then_finishes() {
        let mut m = active_machine();
        m.handle(Event::FunctionCallRequest {
            call_id: "c1".into(),
            name: "list_tasks".into(),
            arguments: "{}".into(),
        });
        let actions = m.handle(Event::ClientClose);
        assert_eq!(m.state(), SessionState::Closing);
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, Action::ArmClosingDeadline))
        );

        let actions = m.handle(Event::ToolOutcome {
            call_id: "c1".into(),
            ok: true,
            payload: serde_json::json!({"tasks": []}),
        });
        assert_eq!(m.state(), SessionState::Closed);
        // Last result still delivered, then teardown.
        assert!(matches!(
            actions[0],
            Action::SendUpstream(ClientEvent::ConversationItemCreate { .. })
        ));
        assert!(matches!(actions.last(), Some(Action::Close { .. })));
    }

    #[test]
    fn test_closing_deadline_abandons_pending() {
        let mut m = active_machine();
        m.handle(Event::FunctionCallRequest {
            call_id: "c1".into(),
            name: "list_tasks".into(),
            arguments: "{}".into(),
        });
        m.handle(Event::ClientClose);
        m.handle(Event::ClosingDeadline);
        assert_eq!(m.state(), SessionState::Closed);
        assert_eq!(m.pending_calls(), 0);

        // Late outcome after Closed is discarded outright.
        let late = m.handle(Event::ToolOutcome {
            call_id: "c1".into(),
            ok: true,
            payload: serde_json::json!({}),
        });
        assert!(late.is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut m = active_machine();
        m.handle(Event::ClientClose);
        assert_eq!(m.state(), SessionState::Closed);
        assert!(m.handle(Event::ClientClose).is_empty());
        assert_eq!(m.state(), SessionState::Closed);
    }

    #[test]
    fn test_upstream_error_during_negotiation_is_fatal() {
        let mut m = machine();
        m.handle(Event::TransportOpen);
        let actions = m.handle(Event::UpstreamError {
            code: Some("invalid_request_error".into()),
            message: "bad session config".into(),
        });
        assert_eq!(m.state(), SessionState::Error);
        assert!(actions.iter().any(|a| matches!(a, Action::Close { .. })));
    }

    #[test]
    fn test_upstream_error_while_active_is_reported_not_fatal() {
        let mut m = active_machine();
        let actions = m.handle(Event::UpstreamError {
            code: None,
            message: "buffer too small".into(),
        });
        assert_eq!(m.state(), SessionState::Active);
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0],
            Action::SendClient(ServerMessage::Error { .. })
        ));
    }

    #[test]
    fn test_event_log_is_bounded() {
        let mut m = active_machine();
        for _ in 0..(MAX_EVENT_LOG * 2) {
            m.handle(Event::ResponseDone);
        }
        assert_eq!(m.recent_events().count(), MAX_EVENT_LOG);
    }
}
