//! Barge-in coordination.
//!
//! Interrupting the assistant mid-utterance touches every part of the engine
//! in a fixed order: cancel the in-flight generation, truncate the spoken
//! history to exactly what was audibly played, hard-stop the playback engine,
//! and force the turn machine back to listening. The truncate step is what
//! keeps the model's memory honest — without it the model believes the user
//! heard speech that was never played.

use crate::playback::PlaybackEngine;
use crate::protocol;
use crate::state::SessionState;
use crate::transport::TransportHandle;
use crate::turn::TurnMachine;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Orchestrates barge-in across transport, playback and turn state.
pub struct InterruptCoordinator {
    transport: TransportHandle,
    state: Arc<SessionState>,
    engine: Arc<PlaybackEngine>,
    turns: Arc<TurnMachine>,
}

impl InterruptCoordinator {
    pub fn new(
        transport: TransportHandle,
        state: Arc<SessionState>,
        engine: Arc<PlaybackEngine>,
        turns: Arc<TurnMachine>,
    ) -> Self {
        Self {
            transport,
            state,
            engine,
            turns,
        }
    }

    /// Interrupt the assistant. Safe to call with no active response and no
    /// known assistant item; each step simply skips. Idempotent and callable
    /// from any thread.
    pub fn interrupt(&self) {
        let generating = self.state.is_generating();
        let playing = self.engine.is_playing();
        debug!(
            "interrupt: generating={}, playing={}",
            generating, playing
        );

        if generating {
            if !self.transport.send(&protocol::response_cancel()) {
                warn!("could not send response.cancel, channel not open");
            }
            self.state
                .set_cancelled_response_id(self.state.current_response_id());
            self.state.set_generating(false);
            debug!("sent response.cancel for active generation");
        }

        // Truncate only when something was actually being generated or
        // played; a stale item id after a finished turn needs no bounding.
        if let Some(item_id) = self.state.last_assistant_item_id() {
            if generating || playing {
                let played_ms = self.engine.estimated_position_ms();
                info!(
                    "truncating item {} at {} ms of played audio",
                    item_id, played_ms
                );
                if !self
                    .transport
                    .send(&protocol::item_truncate(&item_id, played_ms))
                {
                    warn!("could not send conversation.item.truncate");
                }
            }
        }

        self.state.set_follow_up_expected(false);
        self.engine.interrupt_now();
        self.turns.force_listening();
    }

    /// Interrupt and suppress listening afterwards.
    pub fn interrupt_and_mute(&self) {
        self.interrupt();
        self.turns.mute();
    }
}
