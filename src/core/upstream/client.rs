//! Upstream WebSocket leg.
//!
//! Connects to the realtime streaming endpoint, normalizes its wire events
//! into the internal [`Event`] model and carries outbound traffic. Audio
//! frames go through a bounded [`AudioBuffer`] so a slow upstream never
//! grows memory without limit; when the buffer is full the oldest frame is
//! dropped and counted.
//!
//! Transport loss is always surfaced as [`Event::TransportClosed`] on the
//! event queue, never as a panic or a stray error return, so the session
//! driver can decide whether to reconnect.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::session::event::{Event, Role};
use crate::core::upstream::config::{REALTIME_BETA_HEADER, REALTIME_WS_URL, UPSTREAM_IDLE_TIMEOUT};
use crate::core::upstream::messages::{ClientEvent, ServerEvent};
use crate::errors::{BridgeError, BridgeResult};

/// Consecutive malformed frames tolerated before the connection is
/// considered violated.
const MALFORMED_FRAME_LIMIT: u32 = 3;

// =============================================================================
// Audio backpressure buffer
// =============================================================================

/// Bounded queue of audio frames awaiting upstream send.
///
/// Overflow drops the **oldest** frame: for live speech, recency beats
/// completeness. Drops are counted and logged, never fatal.
pub struct AudioBuffer {
    frames: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl AudioBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    /// Queue a frame, evicting the oldest on overflow.
    pub fn push(&self, frame: Bytes) {
        {
            let mut frames = self.frames.lock();
            while frames.len() >= self.capacity.max(1) {
                frames.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped_total = total, "backpressure drop: audio buffer full");
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<Bytes> {
        self.frames.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Total frames dropped to backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

// =============================================================================
// Event normalization
// =============================================================================

/// Folds wire events into internal events.
///
/// Function calls arrive in two pieces: the name on
/// `response.output_item.added` and the arguments on
/// `response.function_call_arguments.done`. The normalizer joins them by
/// call id and emits a single [`Event::FunctionCallRequest`].
#[derive(Default)]
pub struct EventNormalizer {
    pending_names: HashMap<String, String>,
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize one wire event; `None` means nothing reaches the machine.
    pub fn normalize(&mut self, wire: ServerEvent) -> Option<Event> {
        match wire {
            ServerEvent::Error { error } => Some(Event::UpstreamError {
                code: error.code.or(Some(error.kind)),
                message: error.message,
            }),
            ServerEvent::SessionCreated { session } | ServerEvent::SessionUpdated { session } => {
                Some(Event::NegotiationAck {
                    upstream_session_id: session.id,
                    model: session.model,
                })
            }
            ServerEvent::InputAudioBufferCommitted { .. } => Some(Event::AudioCommitted),
            ServerEvent::SpeechStarted { audio_start_ms } => {
                Some(Event::SpeechStarted { audio_start_ms })
            }
            ServerEvent::SpeechStopped { audio_end_ms } => {
                Some(Event::SpeechStopped { audio_end_ms })
            }
            ServerEvent::InputTranscriptionCompleted { transcript, .. } => {
                Some(Event::TranscriptFinal {
                    role: Role::User,
                    text: transcript,
                })
            }
            ServerEvent::OutputItemAdded { item } => {
                if item.kind == "function_call" {
                    if let (Some(call_id), Some(name)) = (item.call_id, item.name) {
                        self.pending_names.insert(call_id, name);
                    }
                }
                None
            }
            ServerEvent::FunctionCallArgumentsDone { call_id, arguments } => {
                match self.pending_names.remove(&call_id) {
                    Some(name) => Some(Event::FunctionCallRequest {
                        call_id,
                        name,
                        arguments,
                    }),
                    None => {
                        warn!(call_id = %call_id, "arguments for a call without a name, dropped");
                        None
                    }
                }
            }
            ServerEvent::TextDelta { delta } | ServerEvent::AudioTranscriptDelta { delta } => {
                Some(Event::TranscriptDelta {
                    role: Role::Assistant,
                    text: delta,
                })
            }
            ServerEvent::TextDone { text } => Some(Event::TranscriptFinal {
                role: Role::Assistant,
                text,
            }),
            ServerEvent::AudioTranscriptDone { transcript } => Some(Event::TranscriptFinal {
                role: Role::Assistant,
                text: transcript,
            }),
            ServerEvent::ResponseDone { .. } => Some(Event::ResponseDone),
            ServerEvent::Unknown => None,
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Handle to a live upstream connection.
///
/// Dropping the handle does not tear the tasks down; call [`shutdown`] or
/// cancel the token passed at connect time.
///
/// [`shutdown`]: UpstreamClient::shutdown
pub struct UpstreamClient {
    outbound: mpsc::Sender<ClientEvent>,
    audio: Arc<AudioBuffer>,
    cancel: CancellationToken,
}

impl UpstreamClient {
    /// Connect and spawn the reader/writer tasks.
    ///
    /// `events` receives [`Event::TransportOpen`] once the handshake
    /// completes and [`Event::TransportClosed`] exactly once at the end of
    /// the connection's life, whatever the cause.
    pub async fn connect(
        api_key: &str,
        model: &str,
        events: mpsc::Sender<Event>,
        audio_capacity: usize,
        cancel: CancellationToken,
    ) -> BridgeResult<Self> {
        let url = format!("{REALTIME_WS_URL}?model={model}");
        let request = http::Request::builder()
            .uri(&url)
            .header("Host", "api.openai.com")
            .header("Authorization", format!("Bearer {api_key}"))
            .header(REALTIME_BETA_HEADER.0, REALTIME_BETA_HEADER.1)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .body(())
            .map_err(|e| BridgeError::Config(format!("invalid upstream request: {e}")))?;

        let (stream, _response) = connect_async(request).await.map_err(map_connect_error)?;
        debug!(model = %model, "upstream connected");

        let (mut write, mut read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientEvent>(1024);
        let audio = AudioBuffer::new(audio_capacity);

        events
            .send(Event::TransportOpen)
            .await
            .map_err(|_| BridgeError::TransportClosed("session queue gone".into()))?;

        // Writer: buffered audio is flushed before the next control event, so
        // a commit never overtakes the frames it covers.
        let writer_audio = audio.clone();
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                while let Some(frame) = writer_audio.pop() {
                    let event = ClientEvent::audio_append(&frame);
                    if send_event(&mut write, &event).await.is_err() {
                        return;
                    }
                }
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                    event = outbound_rx.recv() => {
                        let Some(event) = event else { return };
                        if send_event(&mut write, &event).await.is_err() {
                            return;
                        }
                    }
                    _ = writer_audio.wait() => {}
                }
            }
        });

        // Reader: parse, normalize, forward. Always ends with exactly one
        // TransportClosed.
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut normalizer = EventNormalizer::new();
            let mut malformed_streak = 0u32;
            let reason = loop {
                let message = tokio::select! {
                    _ = reader_cancel.cancelled() => break "cancelled".to_string(),
                    message = tokio::time::timeout(UPSTREAM_IDLE_TIMEOUT, read.next()) => message,
                };
                let message = match message {
                    Err(_) => break format!("idle for {}s", UPSTREAM_IDLE_TIMEOUT.as_secs()),
                    Ok(None) => break "stream ended".to_string(),
                    Ok(Some(Err(e))) => break format!("read error: {e}"),
                    Ok(Some(Ok(message))) => message,
                };
                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<ServerEvent>(text.as_str()) {
                            Ok(wire) => {
                                malformed_streak = 0;
                                if let Some(event) = normalizer.normalize(wire) {
                                    if events.send(event).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                malformed_streak += 1;
                                warn!(streak = malformed_streak, error = %e, "malformed upstream frame dropped");
                                if malformed_streak >= MALFORMED_FRAME_LIMIT {
                                    let violation = BridgeError::ProtocolViolation(format!(
                                        "{MALFORMED_FRAME_LIMIT} consecutive malformed frames"
                                    ));
                                    let _ = events
                                        .send(Event::UpstreamError {
                                            code: Some(violation.code().to_string()),
                                            message: violation.to_string(),
                                        })
                                        .await;
                                    break "protocol violation".to_string();
                                }
                            }
                        }
                    }
                    Message::Close(frame) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by upstream".to_string());
                    }
                    // Binary audio output and ping/pong are not bridged.
                    _ => trace!("ignoring non-text upstream frame"),
                }
            };
            let _ = events.send(Event::TransportClosed { reason }).await;
        });

        Ok(Self {
            outbound: outbound_tx,
            audio,
            cancel,
        })
    }

    /// Send a control event upstream.
    pub async fn send(&self, event: ClientEvent) -> BridgeResult<()> {
        self.outbound
            .send(event)
            .await
            .map_err(|_| BridgeError::TransportClosed("upstream writer gone".into()))
    }

    /// Queue an audio frame for upstream delivery.
    pub fn push_audio(&self, frame: Bytes) {
        self.audio.push(frame);
    }

    /// Frames dropped to backpressure so far.
    pub fn audio_dropped(&self) -> u64 {
        self.audio.dropped()
    }

    /// Tear the connection down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn send_event<S>(write: &mut S, event: &ClientEvent) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to encode upstream event");
            return Ok(());
        }
    };
    write.send(Message::Text(json.into())).await.map_err(|_| ())
}

fn map_connect_error(e: tungstenite::Error) -> BridgeError {
    match e {
        tungstenite::Error::Http(response) if response.status().as_u16() == 401 || response.status().as_u16() == 403 => {
            BridgeError::UpstreamAuth(format!("handshake rejected: {}", response.status()))
        }
        other => BridgeError::TransientNetwork(format!("upstream connect failed: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::upstream::messages::{OutputItem, UpstreamApiError};

    #[test]
    fn test_audio_buffer_drops_oldest_on_overflow() {
        let buffer = AudioBuffer::new(2);
        buffer.push(Bytes::from_static(b"a"));
        buffer.push(Bytes::from_static(b"b"));
        buffer.push(Bytes::from_static(b"c"));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped(), 1);
        assert_eq!(buffer.pop().unwrap(), Bytes::from_static(b"b"));
        assert_eq!(buffer.pop().unwrap(), Bytes::from_static(b"c"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_audio_buffer_stays_bounded_at_zero_capacity() {
        // Capacity 0 is clamped to a single slot rather than disabling the
        // bound.
        let buffer = AudioBuffer::new(0);
        for _ in 0..100 {
            buffer.push(Bytes::from_static(b"frame"));
        }
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.dropped(), 99);
    }

    #[test]
    fn test_normalizer_joins_function_call_pieces() {
        let mut n = EventNormalizer::new();
        let first = n.normalize(ServerEvent::OutputItemAdded {
            item: OutputItem {
                kind: "function_call".into(),
                call_id: Some("c1".into()),
                name: Some("create_task".into()),
            },
        });
        assert!(first.is_none());

        let second = n.normalize(ServerEvent::FunctionCallArgumentsDone {
            call_id: "c1".into(),
            arguments: r#"{"title": "Buy milk"}"#.into(),
        });
        match second {
            Some(Event::FunctionCallRequest { call_id, name, arguments }) => {
                assert_eq!(call_id, "c1");
                assert_eq!(name, "create_task");
                assert!(arguments.contains("Buy milk"));
            }
            other => panic!("expected FunctionCallRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_normalizer_drops_arguments_without_name() {
        let mut n = EventNormalizer::new();
        let out = n.normalize(ServerEvent::FunctionCallArgumentsDone {
            call_id: "orphan".into(),
            arguments: "{}".into(),
        });
        assert!(out.is_none());
    }

    #[test]
    fn test_normalizer_maps_transcripts_by_role() {
        let mut n = EventNormalizer::new();
        match n.normalize(ServerEvent::InputTranscriptionCompleted {
            item_id: None,
            transcript: "add milk".into(),
        }) {
            Some(Event::TranscriptFinal { role: Role::User, text }) => assert_eq!(text, "add milk"),
            other => panic!("unexpected {other:?}"),
        }
        match n.normalize(ServerEvent::AudioTranscriptDelta { delta: "Sure".into() }) {
            Some(Event::TranscriptDelta {
                role: Role::Assistant,
                ..
            }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_normalizer_surfaces_upstream_errors() {
        let mut n = EventNormalizer::new();
        match n.normalize(ServerEvent::Error {
            error: UpstreamApiError {
                kind: "invalid_request_error".into(),
                code: None,
                message: "boom".into(),
            },
        }) {
            Some(Event::UpstreamError { code, message }) => {
                assert_eq!(code.as_deref(), Some("invalid_request_error"));
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
