//! Client WebSocket leg and per-session driver.
//!
//! One task pair per browser connection: a sender task draining the outbound
//! message queue, and the driver below, which owns the state machine and
//! multiplexes client frames, upstream events, tool outcomes and deadline
//! timers through a single `select!` loop. The driver doubles as the
//! reconnection supervisor: upstream loss while the client is still here
//! rebuilds a brand-new session behind exponential backoff.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::session::event::{Event, SessionState};
use crate::core::session::machine::{Action, SessionMachine};
use crate::core::upstream::client::UpstreamClient;
use crate::core::upstream::config::BackoffPolicy;
use crate::core::upstream::messages::{ClientEvent, SessionSettings, TranscriptionSettings};
use crate::errors::BridgeError;
use crate::handlers::bridge::messages::{ClientMessage, ServerMessage};
use crate::state::SharedState;

/// Consecutive malformed client frames tolerated before the session is
/// terminated.
const MALFORMED_FRAME_LIMIT: u32 = 3;

/// How a driven session ended, from the supervisor's point of view.
#[derive(Debug)]
enum SessionOutcome {
    /// The client socket went away or asked to close.
    Finished,
    /// The upstream transport was lost while the client is still here.
    UpstreamLost(String),
    /// Unrecoverable failure; no reconnection.
    Fatal,
}

/// `GET /v1/realtime/ws` upgrade entry point.
pub async fn bridge_ws(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let connection_id = Uuid::new_v4().to_string();
    let cancel = state.sessions.register(&connection_id);
    info!(connection_id = %connection_id, "bridge connection opened");

    let (sink, stream) = socket.split();
    let (client_tx, client_rx) = mpsc::channel::<ServerMessage>(1024);
    let sender = tokio::spawn(client_sender(sink, client_rx));

    run_session(stream, &client_tx, &state, &cancel).await;

    drop(client_tx);
    let _ = sender.await;
    cancel.cancel();
    state.sessions.deregister(&connection_id);
    info!(connection_id = %connection_id, "bridge connection closed");
}

/// Drain the outbound queue onto the socket, then close it.
async fn client_sender(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerMessage>,
) {
    while let Some(message) = rx.recv().await {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to encode client message");
                continue;
            }
        };
        if sink.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn run_session(
    mut stream: SplitStream<WebSocket>,
    client_tx: &mpsc::Sender<ServerMessage>,
    state: &SharedState,
    cancel: &CancellationToken,
) {
    // The first text frame must be `start`; everything else waits.
    let Some(start) = await_start(&mut stream, client_tx, cancel).await else {
        return;
    };

    let config = &state.config;
    let model = start.model.unwrap_or_else(|| config.realtime_model.clone());
    let settings = SessionSettings {
        modalities: Some(vec!["text".into(), "audio".into()]),
        instructions: start.instructions.or_else(|| config.instructions.clone()),
        voice: Some(start.voice.unwrap_or_else(|| config.voice.clone())),
        input_audio_format: Some("pcm16".into()),
        output_audio_format: Some("pcm16".into()),
        input_audio_transcription: Some(TranscriptionSettings {
            model: "whisper-1".into(),
        }),
        tools: Some(state.dispatcher.registry().schemas()),
        tool_choice: Some("auto".into()),
    };
    let known_tools = state.dispatcher.registry().names();

    let backoff = BackoffPolicy::default();
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let (events_tx, mut events_rx) = mpsc::channel::<Event>(1024);
        let leg_cancel = cancel.child_token();
        let upstream = match UpstreamClient::connect(
            &config.openai_api_key,
            &model,
            events_tx.clone(),
            config.max_buffered_audio_frames,
            leg_cancel.clone(),
        )
        .await
        {
            Ok(upstream) => upstream,
            Err(e) if e.is_retryable() && !cancel.is_cancelled() => {
                attempt += 1;
                let delay = backoff.delay_for(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "upstream connect failed, retrying");
                let _ = client_tx
                    .send(ServerMessage::status(
                        SessionState::Connecting,
                        format!("reconnect attempt {attempt}"),
                    ))
                    .await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
            Err(e) => {
                let _ = client_tx
                    .send(ServerMessage::Error {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    })
                    .await;
                let _ = client_tx
                    .send(ServerMessage::Closing {
                        reason: "upstream unavailable".into(),
                    })
                    .await;
                return;
            }
        };
        attempt = 0;

        // Every (re)connection is a brand-new session: fresh id, fresh
        // machine, nothing carried over.
        let session_id = Uuid::new_v4().to_string();
        let mut machine = SessionMachine::new(session_id.clone(), settings.clone(), known_tools.clone());
        let outcome = drive(
            &mut stream,
            client_tx,
            state,
            &mut machine,
            &upstream,
            &events_tx,
            &mut events_rx,
            &leg_cancel,
        )
        .await;
        leg_cancel.cancel();
        debug!(session_id = %session_id, outcome = ?outcome, "session ended");

        match outcome {
            SessionOutcome::UpstreamLost(reason) if !cancel.is_cancelled() => {
                attempt = 1;
                let delay = backoff.delay_for(attempt);
                let _ = client_tx
                    .send(ServerMessage::status(
                        SessionState::Connecting,
                        format!("upstream lost ({reason}), reconnecting; partial transcripts discarded"),
                    ))
                    .await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            _ => return,
        }
    }
}

/// Start-message overrides extracted from the first frame.
struct StartRequest {
    instructions: Option<String>,
    voice: Option<String>,
    model: Option<String>,
}

async fn await_start(
    stream: &mut SplitStream<WebSocket>,
    client_tx: &mpsc::Sender<ServerMessage>,
    cancel: &CancellationToken,
) -> Option<StartRequest> {
    let mut malformed = 0u32;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return None,
            frame = stream.next() => frame,
        };
        match frame {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return None,
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::Start {
                        instructions,
                        voice,
                        model,
                    }) => {
                        return Some(StartRequest {
                            instructions,
                            voice,
                            model,
                        });
                    }
                    Ok(other) => {
                        malformed = 0;
                        warn!(message = ?other, "message before start, dropped");
                    }
                    Err(e) => {
                        malformed += 1;
                        warn!(streak = malformed, error = %e, "malformed client frame dropped");
                        if malformed >= MALFORMED_FRAME_LIMIT {
                            send_violation(client_tx).await;
                            return None;
                        }
                    }
                }
            }
            Some(Ok(_)) => {
                // Audio before start has no session to land in.
                warn!("binary frame before start, dropped");
            }
        }
    }
}

async fn send_violation(client_tx: &mpsc::Sender<ServerMessage>) {
    let err = BridgeError::ProtocolViolation(format!(
        "{MALFORMED_FRAME_LIMIT} consecutive malformed frames"
    ));
    let _ = client_tx
        .send(ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        })
        .await;
    let _ = client_tx
        .send(ServerMessage::Closing {
            reason: "protocol violation".into(),
        })
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    stream: &mut SplitStream<WebSocket>,
    client_tx: &mpsc::Sender<ServerMessage>,
    state: &SharedState,
    machine: &mut SessionMachine,
    upstream: &UpstreamClient,
    events_tx: &mpsc::Sender<Event>,
    events_rx: &mut mpsc::Receiver<Event>,
    cancel: &CancellationToken,
) -> SessionOutcome {
    let mut malformed = 0u32;
    let mut client_requested_close = false;
    let mut protocol_violation = false;
    let mut transport_lost: Option<String> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                upstream.shutdown();
                return SessionOutcome::Finished;
            }

            event = events_rx.recv() => {
                let Some(event) = event else {
                    return SessionOutcome::UpstreamLost("event queue closed".into());
                };
                match &event {
                    Event::TransportClosed { reason } => transport_lost = Some(reason.clone()),
                    Event::UpstreamError { code: Some(code), .. } if code == "protocol_violation" => {
                        protocol_violation = true;
                    }
                    Event::ClientClose => client_requested_close = true,
                    _ => {}
                }
                let actions = machine.handle(event);
                if let Some(outcome) = execute(
                    actions, client_tx, state, machine, upstream, events_tx, cancel,
                    client_requested_close, protocol_violation, &transport_lost,
                )
                .await
                {
                    return outcome;
                }
            }

            frame = stream.next() => {
                let frame = match frame {
                    None | Some(Err(_)) => {
                        // Client gone, nothing left to deliver to.
                        upstream.shutdown();
                        let _ = machine.handle(Event::ClientClose);
                        return SessionOutcome::Finished;
                    }
                    Some(Ok(frame)) => frame,
                };
                match frame {
                    Message::Binary(data) => {
                        if machine.accepts_audio() {
                            upstream.push_audio(data);
                        } else {
                            warn!(state = %machine.state(), "audio frame outside active state, dropped");
                        }
                    }
                    Message::Text(text) => {
                        let parsed = serde_json::from_str::<ClientMessage>(text.as_str())
                            .map_err(|e| e.to_string())
                            .and_then(|m| m.validate().map(|_| m));
                        match parsed {
                            Ok(message) => {
                                malformed = 0;
                                if let Some(outcome) = handle_client_message(
                                    message, client_tx, state, machine, upstream, events_tx,
                                    cancel, &mut client_requested_close, &transport_lost,
                                )
                                .await
                                {
                                    return outcome;
                                }
                            }
                            Err(e) => {
                                malformed += 1;
                                warn!(streak = malformed, error = %e, "malformed client frame dropped");
                                if malformed >= MALFORMED_FRAME_LIMIT {
                                    send_violation(client_tx).await;
                                    upstream.shutdown();
                                    return SessionOutcome::Fatal;
                                }
                            }
                        }
                    }
                    Message::Close(_) => {
                        client_requested_close = true;
                        let actions = machine.handle(Event::ClientClose);
                        if let Some(outcome) = execute(
                            actions, client_tx, state, machine, upstream, events_tx, cancel,
                            client_requested_close, protocol_violation, &transport_lost,
                        )
                        .await
                        {
                            return outcome;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_client_message(
    message: ClientMessage,
    client_tx: &mpsc::Sender<ServerMessage>,
    state: &SharedState,
    machine: &mut SessionMachine,
    upstream: &UpstreamClient,
    events_tx: &mpsc::Sender<Event>,
    cancel: &CancellationToken,
    client_requested_close: &mut bool,
    transport_lost: &Option<String>,
) -> Option<SessionOutcome> {
    let event = match message {
        ClientMessage::Start { .. } => {
            warn!("duplicate start, ignored");
            return None;
        }
        ClientMessage::Text { text } => Event::ClientText { text },
        ClientMessage::Commit => Event::ClientCommit,
        ClientMessage::ClearAudio => {
            let _ = upstream.send(ClientEvent::InputAudioBufferClear).await;
            return None;
        }
        ClientMessage::CreateResponse => {
            let _ = upstream.send(ClientEvent::ResponseCreate).await;
            return None;
        }
        ClientMessage::CancelResponse => {
            let _ = upstream.send(ClientEvent::ResponseCancel).await;
            return None;
        }
        ClientMessage::Close => {
            *client_requested_close = true;
            Event::ClientClose
        }
    };
    let actions = machine.handle(event);
    execute(
        actions,
        client_tx,
        state,
        machine,
        upstream,
        events_tx,
        cancel,
        *client_requested_close,
        false,
        transport_lost,
    )
    .await
}

/// Execute a transition's actions. Returns the outcome if one of them ends
/// the session.
#[allow(clippy::too_many_arguments)]
async fn execute(
    actions: Vec<Action>,
    client_tx: &mpsc::Sender<ServerMessage>,
    state: &SharedState,
    machine: &SessionMachine,
    upstream: &UpstreamClient,
    events_tx: &mpsc::Sender<Event>,
    cancel: &CancellationToken,
    client_requested_close: bool,
    protocol_violation: bool,
    transport_lost: &Option<String>,
) -> Option<SessionOutcome> {
    for action in actions {
        match action {
            Action::SendUpstream(event) => {
                // A dead upstream surfaces as TransportClosed on the event
                // queue; dropping the send here is fine.
                let _ = upstream.send(event).await;
            }
            Action::SendClient(message) => {
                if client_tx.send(message).await.is_err() {
                    upstream.shutdown();
                    return Some(SessionOutcome::Finished);
                }
            }
            Action::Dispatch {
                call_id,
                name,
                arguments,
            } => {
                let dispatcher = state.dispatcher.clone();
                let tx = events_tx.clone();
                tokio::spawn(async move {
                    let outcome = match dispatcher.invoke(&name, &arguments).await {
                        Ok(payload) => Event::ToolOutcome {
                            call_id,
                            ok: true,
                            payload,
                        },
                        Err(e) => Event::ToolOutcome {
                            call_id,
                            ok: false,
                            payload: e.to_tool_payload(),
                        },
                    };
                    let _ = tx.send(outcome).await;
                });
            }
            Action::ArmNegotiationDeadline => {
                arm_deadline(
                    events_tx.clone(),
                    cancel.clone(),
                    state.config.negotiation_timeout,
                    Event::NegotiationDeadline,
                );
            }
            Action::ArmClosingDeadline => {
                arm_deadline(
                    events_tx.clone(),
                    cancel.clone(),
                    state.config.closing_grace,
                    Event::ClosingDeadline,
                );
            }
            Action::Close { reason } => {
                upstream.shutdown();
                let outcome = if machine.state() == SessionState::Error || protocol_violation {
                    SessionOutcome::Fatal
                } else if client_requested_close {
                    SessionOutcome::Finished
                } else if let Some(lost) = transport_lost {
                    SessionOutcome::UpstreamLost(lost.clone())
                } else {
                    SessionOutcome::Finished
                };
                debug!(reason = %reason, "session close action");
                return Some(outcome);
            }
        }
    }
    None
}

/// Fire an event after a delay unless the session is torn down first. The
/// machine ignores stale deadline events, so no disarming is needed.
fn arm_deadline(
    events_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    delay: std::time::Duration,
    event: Event,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                let _ = events_tx.send(event).await;
            }
        }
    });
}
