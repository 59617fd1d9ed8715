//! **RealtimeSession** — the top-level coordination layer.
//!
//! Owns the transport task, the event loop, the playback engine and the turn
//! machine, and wires barge-in across them. Every executor the engine needs
//! is constructed here and torn down with the session; there is no ambient
//! global state.
//!
//! Event flow: transport frames go through the [`EventRouter`] and land in a
//! single dispatch function; playback lifecycle and turn transitions arrive
//! on their own channels in the same loop. The embedding application watches
//! one [`SessionEvent`] stream.

use crate::error::{SessionError, SessionResult};
use crate::interrupt::InterruptCoordinator;
use crate::playback::{PlaybackConfig, PlaybackEngine, PlaybackEvent};
use crate::protocol::{self, EventRouter, ResponseOutput, ServerEvent};
use crate::sink::AudioSink;
use crate::state::SessionState;
use crate::tools::ToolExecutor;
use crate::transport::{self, TransportEvent, TransportHandle};
use crate::turn::{TurnEvent, TurnHooks, TurnMachine, TurnState};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Server-side turn detection for the user's audio input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
        idle_timeout_ms: Option<u32>,
    },
    SemanticVad {
        eagerness: String,
    },
    /// Client drives turn taking itself (external recognizer mode).
    Disabled,
}

/// Server-side transcription of the user's audio input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
    pub language: Option<String>,
    pub prompt: Option<String>,
}

/// Configuration for a realtime session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Websocket endpoint, including the model query parameter.
    pub url: String,
    /// Bearer key attached to the connection headers.
    pub api_key: String,
    /// Additional connection headers.
    pub extra_headers: Vec<(String, String)>,
    pub voice: String,
    pub speed: f32,
    pub temperature: f32,
    pub instructions: String,
    /// Tool definitions advertised to the model.
    pub tools: Vec<Value>,
    pub turn_detection: TurnDetection,
    pub transcription: Option<TranscriptionConfig>,
    pub playback: PlaybackConfig,
    /// Upper bound on waiting for the session to become usable.
    pub setup_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime?model=gpt-realtime".to_string(),
            api_key: String::new(),
            extra_headers: Vec::new(),
            voice: "alloy".to_string(),
            speed: 1.0,
            temperature: 0.8,
            instructions: String::new(),
            tools: Vec::new(),
            turn_detection: TurnDetection::ServerVad {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 500,
                idle_timeout_ms: None,
            },
            transcription: None,
            playback: PlaybackConfig::default(),
            setup_timeout: Duration::from_secs(15),
        }
    }
}

impl SessionConfig {
    /// Build from environment: `OPENAI_API_KEY` (required), `REALTIME_API_URL`,
    /// `REALTIME_VOICE`, `REALTIME_INSTRUCTIONS`.
    pub fn from_env() -> SessionResult<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .or_else(|_| std::env::var("REALTIME_API_KEY"))
            .map_err(|_| {
                SessionError::Config(
                    "the realtime session requires OPENAI_API_KEY or REALTIME_API_KEY".to_string(),
                )
            })?;
        let mut config = Self {
            api_key,
            ..Self::default()
        };
        if let Ok(url) = std::env::var("REALTIME_API_URL") {
            config.url = url;
        }
        if let Ok(voice) = std::env::var("REALTIME_VOICE") {
            config.voice = voice;
        }
        if let Ok(instructions) = std::env::var("REALTIME_INSTRUCTIONS") {
            config.instructions = instructions;
        }
        Ok(config)
    }

    /// Connection headers for the websocket upgrade.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key),
            ),
            ("OpenAI-Beta".to_string(), "realtime=v1".to_string()),
        ];
        headers.extend(self.extra_headers.iter().cloned());
        headers
    }

    /// The `session.update` payload configuring voice, instructions, formats,
    /// turn detection, transcription and tools.
    pub fn session_update_payload(&self) -> String {
        let mut session = json!({
            "voice": self.voice,
            "speed": self.speed,
            "temperature": self.temperature,
            "output_audio_format": "pcm16",
            "instructions": self.instructions,
            "tools": self.tools,
        });

        let turn_detection = match &self.turn_detection {
            TurnDetection::ServerVad {
                threshold,
                prefix_padding_ms,
                silence_duration_ms,
                idle_timeout_ms,
            } => {
                let mut td = json!({
                    "type": "server_vad",
                    "create_response": true,
                    "interrupt_response": true,
                    "threshold": threshold,
                    "prefix_padding_ms": prefix_padding_ms,
                    "silence_duration_ms": silence_duration_ms,
                });
                if let Some(idle) = idle_timeout_ms {
                    td["idle_timeout_ms"] = json!(idle);
                }
                Some(td)
            }
            TurnDetection::SemanticVad { eagerness } => Some(json!({
                "type": "semantic_vad",
                "create_response": true,
                "interrupt_response": true,
                "eagerness": eagerness,
            })),
            TurnDetection::Disabled => None,
        };

        match turn_detection {
            Some(td) => {
                session["turn_detection"] = td;
                session["input_audio_format"] = json!("pcm16");
                if let Some(t) = &self.transcription {
                    let mut transcription = json!({ "model": t.model });
                    if let Some(lang) = &t.language {
                        transcription["language"] = json!(lang);
                    }
                    if let Some(prompt) = &t.prompt {
                        transcription["prompt"] = json!(prompt);
                    }
                    session["input_audio_transcription"] = transcription;
                }
            }
            // External recognizer mode: the server must not segment turns.
            None => session["turn_detection"] = Value::Null,
        }

        json!({ "type": "session.update", "session": session }).to_string()
    }
}

/// Why the session is being closed; diagnostic value only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    UserDisconnect,
    SessionRestart,
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session is configured and usable.
    Ready,
    /// A turn-state transition was applied.
    TurnChanged(TurnEvent),
    /// Streaming transcript of the assistant's speech.
    AssistantTranscriptDelta { response_id: String, text: String },
    /// Server-side VAD heard the user start speaking.
    UserSpeechStarted { item_id: String },
    /// Transcription of the user's utterance.
    UserTranscript { item_id: String, transcript: String },
    UserTranscriptFailed { item_id: String, message: String },
    /// The model asked for a tool to run.
    ToolCallRequested { name: String, call_id: String },
    /// A server error that did not end the session.
    ServerError { code: String, message: String },
    /// The transport closed or failed; no reconnect is attempted.
    Disconnected { reason: String },
}

/// A connected realtime voice session.
pub struct RealtimeSession {
    config: SessionConfig,
    state: Arc<SessionState>,
    engine: Arc<PlaybackEngine>,
    turns: Arc<TurnMachine>,
    transport: TransportHandle,
    interrupts: InterruptCoordinator,
    event_loop: tokio::task::JoinHandle<()>,
}

impl RealtimeSession {
    /// Connect, configure the session and wait until it is usable.
    ///
    /// Resolves only after the server acknowledged the configuration; a
    /// server error, transport failure or timeout before that aborts the
    /// whole connect as one terminal error.
    pub async fn connect(
        config: SessionConfig,
        hooks: Box<dyn TurnHooks>,
        tools: Arc<dyn ToolExecutor>,
        sink: Arc<dyn AudioSink>,
    ) -> SessionResult<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let state = Arc::new(SessionState::new());
        let (engine, playback_rx) = PlaybackEngine::new(config.playback.clone(), sink);
        let engine = Arc::new(engine);
        let (turns, turn_rx) = TurnMachine::new(hooks);
        let turns = Arc::new(turns);

        let (transport, transport_rx) =
            transport::connect(&config.url, &config.request_headers()).await?;

        let (router, setup_rx) = EventRouter::new(Arc::clone(&engine), Arc::clone(&state));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let worker = SessionWorker {
            transport: transport.clone(),
            router,
            state: Arc::clone(&state),
            engine: Arc::clone(&engine),
            turns: Arc::clone(&turns),
            tools,
            events_tx,
            session_update: config.session_update_payload(),
        };
        let event_loop = tokio::spawn(worker.run(transport_rx, playback_rx, turn_rx));

        match tokio::time::timeout(config.setup_timeout, setup_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                transport.close(1000, "setup failed");
                return Err(e);
            }
            Ok(Err(_)) => {
                transport.close(1000, "setup failed");
                return Err(SessionError::Transport(
                    "connection ended before the session became usable".to_string(),
                ));
            }
            Err(_) => {
                transport.close(1000, "setup timeout");
                return Err(SessionError::Transport(format!(
                    "session setup timed out after {:?}",
                    config.setup_timeout
                )));
            }
        }

        let interrupts = InterruptCoordinator::new(
            transport.clone(),
            Arc::clone(&state),
            Arc::clone(&engine),
            Arc::clone(&turns),
        );

        info!("realtime session ready");
        let session = Self {
            config,
            state,
            engine,
            turns,
            transport,
            interrupts,
            event_loop,
        };
        Ok((session, events_rx))
    }

    /// Submit a user text utterance and request a response.
    pub fn send_user_text(&self, text: &str) -> SessionResult<()> {
        if !self.transport.send(&protocol::user_text_item(text)) {
            return Err(SessionError::Transport(
                "could not send user message, channel not open".to_string(),
            ));
        }
        self.request_response()?;
        self.turns.utterance_submitted();
        Ok(())
    }

    /// Ask the model to generate a response for the conversation so far.
    pub fn request_response(&self) -> SessionResult<()> {
        if !self.transport.send(&protocol::response_create()) {
            return Err(SessionError::Transport(
                "could not request response, channel not open".to_string(),
            ));
        }
        self.state.mark_response_requested();
        Ok(())
    }

    /// Stream one captured PCM16 chunk to the server's input buffer.
    pub fn send_audio_chunk(&self, pcm: &[u8]) -> SessionResult<()> {
        if !self.transport.send(&protocol::input_audio_append(pcm)) {
            return Err(SessionError::Transport(
                "could not send audio chunk, channel not open".to_string(),
            ));
        }
        Ok(())
    }

    /// Re-send the session configuration after settings changed.
    pub fn update_session(&mut self, config: SessionConfig) -> SessionResult<()> {
        let payload = config.session_update_payload();
        if !self.transport.send(&payload) {
            return Err(SessionError::Transport(
                "could not update session, channel not open".to_string(),
            ));
        }
        self.config = config;
        Ok(())
    }

    /// Barge in on the assistant.
    pub fn interrupt(&self) {
        self.interrupts.interrupt();
    }

    /// Barge in and suppress listening afterwards.
    pub fn interrupt_and_mute(&self) {
        self.interrupts.interrupt_and_mute();
    }

    pub fn mute(&self) {
        self.turns.mute();
    }

    pub fn unmute(&self) {
        self.turns.unmute();
    }

    /// Current conversation turn state.
    pub fn turn_state(&self) -> TurnState {
        self.turns.state()
    }

    /// Whether response audio is currently playing.
    pub fn is_speaking(&self) -> bool {
        self.engine.is_playing()
    }

    /// Close the session and tear down its tasks.
    pub async fn shutdown(self, kind: DisconnectKind) {
        let reason = match kind {
            DisconnectKind::UserDisconnect => "user disconnect",
            DisconnectKind::SessionRestart => "session restart",
        };
        info!("shutting down session: {}", reason);
        self.transport.close(1000, reason);
        self.engine.interrupt_now();
        if tokio::time::timeout(Duration::from_secs(1), self.event_loop)
            .await
            .is_err()
        {
            warn!("event loop did not end in time");
        }
    }
}

/// The session's single dispatch point: all transport, playback and turn
/// events funnel through here, on one task.
struct SessionWorker {
    transport: TransportHandle,
    router: EventRouter,
    state: Arc<SessionState>,
    engine: Arc<PlaybackEngine>,
    turns: Arc<TurnMachine>,
    tools: Arc<dyn ToolExecutor>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    session_update: String,
}

impl SessionWorker {
    async fn run(
        mut self,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
        mut turn_rx: mpsc::UnboundedReceiver<TurnEvent>,
    ) {
        loop {
            tokio::select! {
                ev = transport_rx.recv() => match ev {
                    Some(TransportEvent::Open) => {
                        debug!("transport open, configuring session");
                        if !self.transport.send(&self.session_update) {
                            self.router
                                .fail_setup("could not send session configuration");
                        }
                    }
                    Some(TransportEvent::Message(text)) => self.handle_frame(&text),
                    Some(TransportEvent::Closed { code, reason }) => {
                        self.handle_disconnect(&format!("closed ({}): {}", code, reason));
                        break;
                    }
                    Some(TransportEvent::Failure(message)) => {
                        self.handle_disconnect(&message);
                        break;
                    }
                    None => break,
                },
                ev = playback_rx.recv() => match ev {
                    Some(ev) => self.handle_playback(ev),
                    None => break,
                },
                ev = turn_rx.recv() => match ev {
                    Some(ev) => {
                        let _ = self.events_tx.send(SessionEvent::TurnChanged(ev));
                    }
                    None => break,
                },
            }
        }
        debug!("session event loop ended");
    }

    fn handle_frame(&mut self, raw: &str) {
        match self.router.process(raw) {
            Ok(Some(event)) => self.handle_server_event(event),
            Ok(None) => {}
            Err(e) => {
                if self.router.setup_pending() {
                    self.router.fail_setup(&e.to_string());
                } else {
                    warn!("dropping undecodable frame: {}", e);
                    let _ = self.events_tx.send(SessionEvent::ServerError {
                        code: "protocol_error".to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionReady => {
                self.turns.session_ready();
                let _ = self.events_tx.send(SessionEvent::Ready);
            }
            ServerEvent::ResponseCreated { response_id } => {
                debug!("response generating: {}", response_id);
                self.state.set_generating(true);
            }
            ServerEvent::AudioDelta { bytes, .. } => {
                if let Some(ms) = self.state.take_first_chunk_latency_ms() {
                    info!("first audio chunk {} ms after response request", ms);
                }
                self.turns.response_audio_started();
                self.engine.add_chunk(&bytes);
                self.engine.start_if_needed();
            }
            ServerEvent::TranscriptDelta { text, response_id } => {
                let _ = self.events_tx.send(SessionEvent::AssistantTranscriptDelta {
                    response_id,
                    text,
                });
            }
            ServerEvent::AudioDone => self.engine.mark_response_done(),
            ServerEvent::ResponseComplete { outputs } => {
                self.handle_response_complete(outputs)
            }
            ServerEvent::AssistantItemAdded { item_id } => {
                self.state.set_last_assistant_item_id(Some(item_id));
            }
            ServerEvent::UserSpeechStarted { item_id } => {
                let _ = self
                    .events_tx
                    .send(SessionEvent::UserSpeechStarted { item_id });
            }
            ServerEvent::UserSpeechStopped { item_id } => {
                debug!("user speech stopped: {}", item_id);
            }
            ServerEvent::InputCommitted { item_id } => {
                // The server accepted the utterance and will generate.
                debug!("input committed: {}", item_id);
                self.state.mark_response_requested();
                self.turns.utterance_submitted();
            }
            ServerEvent::UserTranscriptCompleted {
                item_id,
                transcript,
            } => {
                let _ = self.events_tx.send(SessionEvent::UserTranscript {
                    item_id,
                    transcript,
                });
            }
            ServerEvent::UserTranscriptFailed { item_id, message } => {
                warn!("user transcript failed for {}: {}", item_id, message);
                let _ = self
                    .events_tx
                    .send(SessionEvent::UserTranscriptFailed { item_id, message });
            }
            ServerEvent::ErrorFrame { code, message } => {
                warn!("server error {}: {}", code, message);
                let _ = self
                    .events_tx
                    .send(SessionEvent::ServerError { code, message });
            }
            ServerEvent::Unknown { event_type } => {
                debug!("unhandled event type: {}", event_type);
            }
        }
    }

    fn handle_response_complete(&mut self, outputs: Vec<ResponseOutput>) {
        self.state.set_generating(false);

        let mut function_calls = Vec::new();
        for output in outputs {
            match output {
                ResponseOutput::FunctionCall {
                    name,
                    call_id,
                    arguments,
                } => function_calls.push((name, call_id, arguments)),
                ResponseOutput::Message { item_id } => {
                    debug!("assistant message complete: {}", item_id);
                }
            }
        }

        if function_calls.is_empty() {
            // This response settles any outstanding tool-call expectation.
            self.state.set_follow_up_expected(false);
            if !self.engine.is_playing() {
                self.turns.response_settled();
            }
            return;
        }

        self.state.set_follow_up_expected(true);
        for (name, call_id, arguments) in function_calls {
            info!("tool call requested: {} ({})", name, call_id);
            let _ = self.events_tx.send(SessionEvent::ToolCallRequested {
                name: name.clone(),
                call_id: call_id.clone(),
            });

            let tools = Arc::clone(&self.tools);
            let transport = self.transport.clone();
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let exec_name = name.clone();
                let result = tokio::task::spawn_blocking(move || {
                    tools.execute(&exec_name, &arguments)
                })
                .await
                .unwrap_or_else(|e| {
                    json!({ "error": format!("tool execution failed: {}", e) }).to_string()
                });

                if !transport.send(&protocol::function_call_output(&call_id, &result)) {
                    warn!("could not send tool result for {}", call_id);
                    return;
                }
                state.mark_response_requested();
                if !transport.send(&protocol::response_create()) {
                    warn!("could not request follow-up response after {}", name);
                }
            });
        }
    }

    fn handle_playback(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Started => debug!("playback started"),
            PlaybackEvent::Finished => {
                let follow_up =
                    self.state.follow_up_expected() || self.state.is_generating();
                self.turns.playback_finished(follow_up);
            }
        }
    }

    fn handle_disconnect(&mut self, reason: &str) {
        if self.router.fail_setup(reason) {
            return;
        }
        warn!("transport lost: {}", reason);
        let _ = self.events_tx.send(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_payload_with_server_vad() {
        let config = SessionConfig {
            voice: "cedar".to_string(),
            instructions: "Be brief.".to_string(),
            ..Default::default()
        };
        let v: Value = serde_json::from_str(&config.session_update_payload()).unwrap();
        assert_eq!(v["type"], "session.update");
        let session = &v["session"];
        assert_eq!(session["voice"], "cedar");
        assert_eq!(session["output_audio_format"], "pcm16");
        assert_eq!(session["instructions"], "Be brief.");
        assert_eq!(session["turn_detection"]["type"], "server_vad");
        assert_eq!(session["turn_detection"]["create_response"], true);
        assert_eq!(session["turn_detection"]["interrupt_response"], true);
        assert_eq!(session["input_audio_format"], "pcm16");
    }

    #[test]
    fn session_update_payload_without_turn_detection() {
        let config = SessionConfig {
            turn_detection: TurnDetection::Disabled,
            ..Default::default()
        };
        let v: Value = serde_json::from_str(&config.session_update_payload()).unwrap();
        assert!(v["session"]["turn_detection"].is_null());
        assert!(v["session"].get("input_audio_transcription").is_none());
    }

    #[test]
    fn session_update_payload_with_transcription() {
        let config = SessionConfig {
            transcription: Some(TranscriptionConfig {
                model: "whisper-1".to_string(),
                language: Some("de".to_string()),
                prompt: None,
            }),
            ..Default::default()
        };
        let v: Value = serde_json::from_str(&config.session_update_payload()).unwrap();
        let t = &v["session"]["input_audio_transcription"];
        assert_eq!(t["model"], "whisper-1");
        assert_eq!(t["language"], "de");
        assert!(t.get("prompt").is_none());
    }

    #[test]
    fn request_headers_carry_bearer_key() {
        let config = SessionConfig {
            api_key: "sk-test".to_string(),
            ..Default::default()
        };
        let headers = config.request_headers();
        assert!(headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v == "Bearer sk-test"));
        assert!(headers.iter().any(|(k, _)| k == "OpenAI-Beta"));
    }

    fn test_worker() -> (
        SessionWorker,
        mpsc::UnboundedReceiver<crate::transport::TransportCommand>,
        mpsc::UnboundedReceiver<SessionEvent>,
        Arc<SessionState>,
        Arc<TurnMachine>,
    ) {
        let (transport, command_rx) = TransportHandle::loopback();
        let state = Arc::new(SessionState::new());
        let sink = Arc::new(crate::sink::PlaceholderSink::new());
        let (engine, _playback_rx) = PlaybackEngine::new(PlaybackConfig::default(), sink);
        let engine = Arc::new(engine);
        let (turns, _turn_rx) = TurnMachine::new(Box::new(crate::turn::NoopHooks));
        let turns = Arc::new(turns);
        let (router, _setup_rx) = EventRouter::new(Arc::clone(&engine), Arc::clone(&state));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = SessionWorker {
            transport,
            router,
            state: Arc::clone(&state),
            engine,
            turns: Arc::clone(&turns),
            tools: Arc::new(crate::tools::PlaceholderToolExecutor),
            events_tx,
            session_update: SessionConfig::default().session_update_payload(),
        };
        (worker, command_rx, events_rx, state, turns)
    }

    fn audio_delta_frame(response_id: &str) -> String {
        use base64::engine::general_purpose::STANDARD as B64;
        use base64::Engine as _;
        json!({
            "type": "response.audio.delta",
            "response_id": response_id,
            "delta": B64.encode([0u8; 480]),
        })
        .to_string()
    }

    #[tokio::test]
    async fn tool_call_flow_returns_to_thinking_then_listening() {
        let (mut worker, mut command_rx, _events_rx, state, turns) = test_worker();

        worker.handle_frame(r#"{"type":"session.updated","session":{}}"#);
        assert_eq!(turns.state(), TurnState::Listening);

        turns.utterance_submitted();
        worker.handle_frame(r#"{"type":"response.created","response":{"id":"resp_a"}}"#);
        assert!(state.is_generating());

        worker.handle_frame(&audio_delta_frame("resp_a"));
        assert_eq!(turns.state(), TurnState::Speaking);

        worker.handle_frame(
            &json!({
                "type": "response.done",
                "response": { "output": [{
                    "type": "function_call",
                    "name": "get_weather",
                    "call_id": "call_1",
                    "arguments": "{}",
                }]},
            })
            .to_string(),
        );
        assert!(state.follow_up_expected());

        // The tool runs off-loop; give it a moment, then the result and the
        // follow-up request must be on the wire.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut types = Vec::new();
        while let Ok(cmd) = command_rx.try_recv() {
            if let crate::transport::TransportCommand::Send(text) = cmd {
                let v: Value = serde_json::from_str(&text).unwrap();
                types.push(v["type"].as_str().unwrap_or_default().to_string());
            }
        }
        assert!(types.contains(&"conversation.item.create".to_string()));
        assert!(types.contains(&"response.create".to_string()));

        // First response's audio finishes while the follow-up is pending.
        worker.handle_playback(PlaybackEvent::Finished);
        assert_eq!(turns.state(), TurnState::Thinking);

        // The follow-up answer speaks and settles the conversation.
        worker.handle_frame(r#"{"type":"response.created","response":{"id":"resp_b"}}"#);
        worker.handle_frame(&audio_delta_frame("resp_b"));
        assert_eq!(turns.state(), TurnState::Speaking);
        worker.handle_frame(r#"{"type":"response.done","response":{"output":[]}}"#);
        assert!(!state.follow_up_expected());
        worker.handle_playback(PlaybackEvent::Finished);
        assert_eq!(turns.state(), TurnState::Listening);
    }

    #[tokio::test]
    async fn text_only_response_settles_back_to_listening() {
        let (mut worker, _command_rx, _events_rx, _state, turns) = test_worker();

        worker.handle_frame(r#"{"type":"session.updated","session":{}}"#);
        turns.utterance_submitted();
        assert_eq!(turns.state(), TurnState::Thinking);

        worker.handle_frame(
            &json!({
                "type": "response.done",
                "response": { "output": [{
                    "type": "message", "id": "item_1", "role": "assistant",
                }]},
            })
            .to_string(),
        );
        assert_eq!(turns.state(), TurnState::Listening);
    }

    #[test]
    fn idle_timeout_only_present_when_set() {
        let mut config = SessionConfig::default();
        let v: Value = serde_json::from_str(&config.session_update_payload()).unwrap();
        assert!(v["session"]["turn_detection"].get("idle_timeout_ms").is_none());

        config.turn_detection = TurnDetection::ServerVad {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            idle_timeout_ms: Some(30_000),
        };
        let v: Value = serde_json::from_str(&config.session_update_payload()).unwrap();
        assert_eq!(v["session"]["turn_detection"]["idle_timeout_ms"], 30_000);
    }
}
