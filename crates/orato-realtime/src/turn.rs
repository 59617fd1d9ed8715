//! Conversation turn-taking state machine.
//!
//! Exactly one state at any instant. Any thread may request a transition, but
//! requests serialize behind one lock and side-effect hooks always fire from
//! the applying thread in a fixed order: stop the outgoing state's effects,
//! apply the new state, start the incoming state's effects. Reversing that
//! order risks capture overlapping with playback (echo/feedback).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// The four live conversation states plus an explicit mute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Not yet connected / session not usable.
    Idle,
    /// Capturing the user.
    Listening,
    /// A response was requested; waiting for it.
    Thinking,
    /// Streaming response audio to the user.
    Speaking,
    /// Listening explicitly suppressed.
    Muted,
}

/// Side effects owned by external collaborators, invoked synchronously at
/// the transition point. Default impls are no-ops so callers only wire what
/// they have.
pub trait TurnHooks: Send + Sync {
    /// Begin audio capture / recognition (entering LISTENING).
    fn start_listening(&self) {}
    /// Stop audio capture (leaving LISTENING).
    fn stop_listening(&self) {}
    /// Start the expressive gesture loop (entering SPEAKING).
    fn start_speaking(&self) {}
    /// Stop the expressive gesture loop (leaving SPEAKING).
    fn stop_speaking(&self) {}
}

/// Hooks that do nothing. Useful for headless sessions and tests.
#[derive(Debug, Default)]
pub struct NoopHooks;

impl TurnHooks for NoopHooks {}

/// One applied state change.
#[derive(Debug, Clone, Serialize)]
pub struct TurnEvent {
    pub from: TurnState,
    pub to: TurnState,
    pub timestamp: DateTime<Utc>,
}

/// Serializes turn transitions and drives the side-effect hooks.
pub struct TurnMachine {
    state: Mutex<TurnState>,
    hooks: Box<dyn TurnHooks>,
    event_tx: mpsc::UnboundedSender<TurnEvent>,
}

impl TurnMachine {
    /// Create a machine starting in IDLE.
    pub fn new(hooks: Box<dyn TurnHooks>) -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let machine = Self {
            state: Mutex::new(TurnState::Idle),
            hooks,
            event_tx,
        };
        (machine, event_rx)
    }

    /// Current state.
    pub fn state(&self) -> TurnState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Session became usable: IDLE -> LISTENING.
    pub fn session_ready(&self) {
        self.apply_if(|s| s == TurnState::Idle, TurnState::Listening);
    }

    /// The user's utterance was submitted and a response requested:
    /// LISTENING -> THINKING.
    pub fn utterance_submitted(&self) {
        self.apply_if(|s| s == TurnState::Listening, TurnState::Thinking);
    }

    /// First audio chunk of a response arrived: THINKING -> SPEAKING.
    /// Returns whether the transition was applied, so callers observe exactly
    /// one SPEAKING entry per response.
    pub fn response_audio_started(&self) -> bool {
        self.apply_if(|s| s == TurnState::Thinking, TurnState::Speaking)
    }

    /// Playback finished. With a follow-up expected (e.g. after a tool call)
    /// the conversation goes back to THINKING, otherwise to LISTENING.
    pub fn playback_finished(&self, follow_up_expected: bool) {
        let next = if follow_up_expected {
            TurnState::Thinking
        } else {
            TurnState::Listening
        };
        self.apply_if(|s| s == TurnState::Speaking, next);
    }

    /// A response completed without ever producing audio: THINKING -> LISTENING.
    pub fn response_settled(&self) {
        self.apply_if(|s| s == TurnState::Thinking, TurnState::Listening);
    }

    /// Explicit mute from any state. Idempotent.
    pub fn mute(&self) {
        self.apply_if(|s| s != TurnState::Muted, TurnState::Muted);
    }

    /// Leave MUTED and resume listening.
    pub fn unmute(&self) {
        self.apply_if(|s| s == TurnState::Muted, TurnState::Listening);
    }

    /// Forced transition to LISTENING (barge-in), bypassing the normal
    /// ordering. Valid from any state; idempotent.
    pub fn force_listening(&self) {
        info!("forced transition to listening");
        self.apply_if(|s| s != TurnState::Listening, TurnState::Listening);
    }

    /// Apply `next` while holding the lock, when `pred` accepts the current
    /// state. Hooks fire inside the critical section so transitions are
    /// totally ordered even under concurrent requests.
    fn apply_if(&self, pred: impl Fn(TurnState) -> bool, next: TurnState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let prev = *state;
        if prev == next || !pred(prev) {
            return false;
        }

        // Stop the outgoing state's side effects first.
        match prev {
            TurnState::Listening => self.hooks.stop_listening(),
            TurnState::Speaking => self.hooks.stop_speaking(),
            _ => {}
        }

        *state = next;
        debug!("turn state: {:?} -> {:?}", prev, next);

        // Then start the incoming state's side effects.
        match next {
            TurnState::Listening => self.hooks.start_listening(),
            TurnState::Speaking => self.hooks.start_speaking(),
            _ => {}
        }

        let _ = self.event_tx.send(TurnEvent {
            from: prev,
            to: next,
            timestamp: Utc::now(),
        });
        true
    }
}
