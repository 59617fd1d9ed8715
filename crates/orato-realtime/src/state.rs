//! Shared session bookkeeping crossing the engine's threads.
//!
//! The network task, the barge-in path and the session event loop all read
//! and write these few flags; everything else in the engine stays owned by a
//! single thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Flags and correlation ids shared across the session's threads.
#[derive(Default)]
pub struct SessionState {
    /// A response is currently being generated server-side.
    generating: AtomicBool,
    /// A follow-up response is expected (e.g. after a tool call), so a
    /// finished playback returns to THINKING instead of LISTENING.
    expecting_follow_up: AtomicBool,
    /// First-chunk latency for the current response was already logged.
    latency_logged: AtomicBool,
    current_response_id: Mutex<Option<String>>,
    cancelled_response_id: Mutex<Option<String>>,
    last_assistant_item_id: Mutex<Option<String>>,
    response_requested_at: Mutex<Option<Instant>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::Acquire)
    }

    pub fn set_generating(&self, value: bool) {
        self.generating.store(value, Ordering::Release);
    }

    /// Whether a follow-up response is still expected.
    pub fn follow_up_expected(&self) -> bool {
        self.expecting_follow_up.load(Ordering::Acquire)
    }

    /// Set on a tool-call response; cleared by the final answer (or an
    /// interrupt).
    pub fn set_follow_up_expected(&self, value: bool) {
        self.expecting_follow_up.store(value, Ordering::Release);
    }

    pub fn current_response_id(&self) -> Option<String> {
        self.current_response_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_current_response_id(&self, id: Option<String>) {
        *self
            .current_response_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = id;
    }

    pub fn cancelled_response_id(&self) -> Option<String> {
        self.cancelled_response_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_cancelled_response_id(&self, id: Option<String>) {
        *self
            .cancelled_response_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = id;
    }

    pub fn last_assistant_item_id(&self) -> Option<String> {
        self.last_assistant_item_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_last_assistant_item_id(&self, id: Option<String>) {
        *self
            .last_assistant_item_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = id;
    }

    /// Stamp the moment a response was requested; resets latency logging.
    pub fn mark_response_requested(&self) {
        *self
            .response_requested_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.latency_logged.store(false, Ordering::Release);
    }

    /// Milliseconds from the response request to now, reported once: returns
    /// `Some` only for the first call after each `mark_response_requested`.
    pub fn take_first_chunk_latency_ms(&self) -> Option<u128> {
        if self.latency_logged.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.response_requested_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|at| at.elapsed().as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_up_flag_set_and_cleared() {
        let state = SessionState::new();
        assert!(!state.follow_up_expected());
        state.set_follow_up_expected(true);
        assert!(state.follow_up_expected());
        state.set_follow_up_expected(false);
        assert!(!state.follow_up_expected());
    }

    #[test]
    fn latency_reported_once_per_request() {
        let state = SessionState::new();
        assert!(state.take_first_chunk_latency_ms().is_none());

        state.mark_response_requested();
        assert!(state.take_first_chunk_latency_ms().is_some());
        assert!(state.take_first_chunk_latency_ms().is_none());

        state.mark_response_requested();
        assert!(state.take_first_chunk_latency_ms().is_some());
    }
}
