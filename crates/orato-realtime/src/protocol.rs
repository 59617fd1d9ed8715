//! Inbound protocol decoding and outbound payload builders.
//!
//! The wire carries JSON text frames. `decode` turns one frame into a typed
//! [`ServerEvent`]; unknown types are logged and dropped so new server events
//! never break the client. [`EventRouter`] sits between the transport and the
//! rest of the engine: it detects response boundaries, discards frames tagged
//! with a cancelled response, and settles the pending-setup future that
//! separates "socket open" from "session usable".
//!
//! Both the original and the revised event names are accepted
//! (`response.audio.delta` / `response.output_audio.delta`, etc.).

use crate::error::{SessionError, SessionResult};
use crate::playback::PlaybackEngine;
use crate::state::SessionState;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Session configuration acknowledged; the session is usable.
    SessionReady,
    /// The model started generating a response.
    ResponseCreated { response_id: String },
    /// One PCM16 audio delta for the given response.
    AudioDelta { bytes: Vec<u8>, response_id: String },
    /// One transcript text delta for the given response.
    TranscriptDelta { text: String, response_id: String },
    /// No further audio will arrive for the current response.
    AudioDone,
    /// The response finished; carries its output items.
    ResponseComplete { outputs: Vec<ResponseOutput> },
    /// An assistant message item was added to the conversation.
    AssistantItemAdded { item_id: String },
    /// Server-side VAD heard the user start speaking.
    UserSpeechStarted { item_id: String },
    /// Server-side VAD heard the user stop speaking.
    UserSpeechStopped { item_id: String },
    /// The input audio buffer was committed; a response will follow.
    InputCommitted { item_id: String },
    /// Transcription of the user's utterance completed.
    UserTranscriptCompleted { item_id: String, transcript: String },
    /// Transcription of the user's utterance failed.
    UserTranscriptFailed { item_id: String, message: String },
    /// Server error frame.
    ErrorFrame { code: String, message: String },
    /// Anything we do not understand; dropped after logging.
    Unknown { event_type: String },
}

/// One item of a completed response's output.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutput {
    Message { item_id: String },
    FunctionCall {
        name: String,
        call_id: String,
        arguments: String,
    },
}

fn str_field(obj: &Value, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Parse one raw frame into a typed event.
pub fn decode(raw: &str) -> SessionResult<ServerEvent> {
    let obj: Value = serde_json::from_str(raw)
        .map_err(|e| SessionError::Protocol(format!("malformed frame: {}", e)))?;
    let event_type = obj
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    // High-frequency delta events would drown the log.
    if !event_type.ends_with(".delta") {
        debug!("received event type: {}", event_type);
    }

    let event = match event_type.as_str() {
        "session.updated" => ServerEvent::SessionReady,
        "response.created" => {
            let response_id = obj
                .get("response")
                .map(|r| str_field(r, "id"))
                .unwrap_or_default();
            ServerEvent::ResponseCreated { response_id }
        }
        "response.audio.delta" | "response.output_audio.delta" => {
            let b64 = str_field(&obj, "delta");
            let bytes = B64
                .decode(b64.as_bytes())
                .map_err(|e| SessionError::Protocol(format!("audio delta decode: {}", e)))?;
            ServerEvent::AudioDelta {
                bytes,
                response_id: str_field(&obj, "response_id"),
            }
        }
        "response.audio_transcript.delta" | "response.output_audio_transcript.delta" => {
            ServerEvent::TranscriptDelta {
                text: str_field(&obj, "delta"),
                response_id: str_field(&obj, "response_id"),
            }
        }
        "response.audio.done" | "response.output_audio.done" => ServerEvent::AudioDone,
        "response.done" => {
            let outputs = obj
                .get("response")
                .and_then(|r| r.get("output"))
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(parse_output_item).collect())
                .unwrap_or_default();
            ServerEvent::ResponseComplete { outputs }
        }
        "response.output_item.added" => {
            // Only assistant message items matter here; they are what a later
            // truncate targets.
            match obj.get("item") {
                Some(item)
                    if str_field(item, "type") == "message"
                        && str_field(item, "role") == "assistant" =>
                {
                    ServerEvent::AssistantItemAdded {
                        item_id: str_field(item, "id"),
                    }
                }
                _ => ServerEvent::Unknown { event_type },
            }
        }
        "input_audio_buffer.speech_started" => ServerEvent::UserSpeechStarted {
            item_id: str_field(&obj, "item_id"),
        },
        "input_audio_buffer.speech_stopped" => ServerEvent::UserSpeechStopped {
            item_id: str_field(&obj, "item_id"),
        },
        "input_audio_buffer.committed" => ServerEvent::InputCommitted {
            item_id: str_field(&obj, "item_id"),
        },
        "conversation.item.input_audio_transcription.completed" => {
            ServerEvent::UserTranscriptCompleted {
                item_id: str_field(&obj, "item_id"),
                transcript: str_field(&obj, "transcript"),
            }
        }
        "conversation.item.input_audio_transcription.failed" => {
            let message = obj
                .get("error")
                .map(|e| str_field(e, "message"))
                .unwrap_or_default();
            ServerEvent::UserTranscriptFailed {
                item_id: str_field(&obj, "item_id"),
                message,
            }
        }
        "error" => {
            let (code, message) = match obj.get("error") {
                Some(e) => (str_field(e, "code"), str_field(e, "message")),
                None => (String::new(), String::new()),
            };
            ServerEvent::ErrorFrame { code, message }
        }
        _ => ServerEvent::Unknown { event_type },
    };
    Ok(event)
}

fn parse_output_item(item: &Value) -> Option<ResponseOutput> {
    match item.get("type").and_then(Value::as_str) {
        Some("function_call") => Some(ResponseOutput::FunctionCall {
            name: str_field(item, "name"),
            call_id: str_field(item, "call_id"),
            arguments: str_field(item, "arguments"),
        }),
        Some("message") => Some(ResponseOutput::Message {
            item_id: str_field(item, "id"),
        }),
        _ => None,
    }
}

/// Server errors that occur in normal operation and carry no signal.
/// A cancel racing the end of generation, or a truncate landing after the
/// audio already ended, both come back as errors we can ignore.
fn is_harmless_error(code: &str, message: &str) -> bool {
    code == "response_cancel_not_active"
        || (code == "invalid_value" && message.contains("already shorter than"))
}

/// Routes decoded events: boundary detection, cancelled-response filtering,
/// and the pending-setup future.
pub struct EventRouter {
    engine: Arc<PlaybackEngine>,
    state: Arc<SessionState>,
    last_response_id: Option<String>,
    pending_setup: Option<oneshot::Sender<SessionResult<()>>>,
}

impl EventRouter {
    /// Create a router; the receiver resolves once the session is usable
    /// (SessionReady) or fails if an error or close arrives first.
    pub fn new(
        engine: Arc<PlaybackEngine>,
        state: Arc<SessionState>,
    ) -> (Self, oneshot::Receiver<SessionResult<()>>) {
        let (tx, rx) = oneshot::channel();
        let router = Self {
            engine,
            state,
            last_response_id: None,
            pending_setup: Some(tx),
        };
        (router, rx)
    }

    /// Decode and route one raw frame. Returns `None` when the frame was
    /// consumed here (unknown, cancelled, harmless error, setup settlement).
    pub fn process(&mut self, raw: &str) -> SessionResult<Option<ServerEvent>> {
        let event = decode(raw)?;
        match &event {
            ServerEvent::SessionReady => {
                if let Some(tx) = self.pending_setup.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            ServerEvent::ResponseCreated { response_id } => {
                // Early boundary signal: reset playback accounting before the
                // first chunk of the new response can arrive.
                if !response_id.is_empty() {
                    self.note_boundary(response_id);
                }
            }
            ServerEvent::AudioDelta { response_id, .. } => {
                if self.is_cancelled(response_id) {
                    debug!("dropping audio delta of cancelled response");
                    return Ok(None);
                }
                self.note_boundary(response_id);
            }
            ServerEvent::TranscriptDelta { response_id, .. } => {
                if self.is_cancelled(response_id) {
                    debug!("dropping transcript delta of cancelled response");
                    return Ok(None);
                }
            }
            ServerEvent::ErrorFrame { code, message } => {
                if is_harmless_error(code, message) {
                    debug!("harmless server error {}: {}", code, message);
                    return Ok(None);
                }
                if let Some(tx) = self.pending_setup.take() {
                    let _ = tx.send(Err(SessionError::Server {
                        code: code.clone(),
                        message: message.clone(),
                    }));
                    return Ok(None);
                }
            }
            ServerEvent::Unknown { event_type } => {
                debug!("unknown event type dropped: {}", event_type);
                return Ok(None);
            }
            _ => {}
        }
        Ok(Some(event))
    }

    /// Fail the pending-setup future from outside (transport closed or failed
    /// before the session became usable). Returns whether setup was pending.
    pub fn fail_setup(&mut self, reason: &str) -> bool {
        match self.pending_setup.take() {
            Some(tx) => {
                let _ = tx.send(Err(SessionError::Transport(reason.to_string())));
                true
            }
            None => false,
        }
    }

    /// Whether the setup future is still unresolved.
    pub fn setup_pending(&self) -> bool {
        self.pending_setup.is_some()
    }

    /// The response currently streaming (last boundary seen).
    pub fn current_response_id(&self) -> Option<&str> {
        self.last_response_id.as_deref()
    }

    fn is_cancelled(&self, response_id: &str) -> bool {
        !response_id.is_empty()
            && self.state.cancelled_response_id().as_deref() == Some(response_id)
    }

    fn note_boundary(&mut self, response_id: &str) {
        if self.last_response_id.as_deref() != Some(response_id) {
            debug!(
                "response boundary: {:?} -> {}",
                self.last_response_id, response_id
            );
            self.engine.on_response_boundary();
            self.last_response_id = Some(response_id.to_string());
            self.state
                .set_current_response_id(Some(response_id.to_string()));
        }
    }
}

// ---- Outbound payload builders ------------------------------------------

/// `conversation.item.create` carrying user text.
pub fn user_text_item(text: &str) -> String {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": "user",
            "content": [{ "type": "input_text", "text": text }],
        },
    })
    .to_string()
}

/// `conversation.item.create` carrying a tool result.
pub fn function_call_output(call_id: &str, output: &str) -> String {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "function_call_output",
            "call_id": call_id,
            "output": output,
        },
    })
    .to_string()
}

/// `response.create` — request generation for the conversation so far.
pub fn response_create() -> String {
    json!({ "type": "response.create" }).to_string()
}

/// `response.cancel` — stop the in-flight generation.
pub fn response_cancel() -> String {
    json!({ "type": "response.cancel" }).to_string()
}

/// `conversation.item.truncate` — bound stored history to what was heard.
pub fn item_truncate(item_id: &str, audio_end_ms: u64) -> String {
    json!({
        "type": "conversation.item.truncate",
        "item_id": item_id,
        "content_index": 0,
        "audio_end_ms": audio_end_ms,
    })
    .to_string()
}

/// `input_audio_buffer.append` — stream captured PCM16 to the server.
pub fn input_audio_append(pcm: &[u8]) -> String {
    json!({
        "type": "input_audio_buffer.append",
        "audio": B64.encode(pcm),
    })
    .to_string()
}
