//! # Orato Realtime - Voice Session Engine
//!
//! This crate implements the realtime voice side of an embodied assistant:
//! a persistent websocket session to a cloud conversational model, duplex
//! PCM16 audio, turn taking, and mid-utterance barge-in with honest
//! truncation of what the user actually heard.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                       RealtimeSession                          │
//! │  ┌────────────┐   ┌──────────────┐   ┌──────────────────┐     │
//! │  │ Transport  │ → │ EventRouter  │ → │ PlaybackEngine   │     │
//! │  │ (ws task)  │   │ (decode +    │   │ (10ms frames,    │     │
//! │  └────────────┘   │  boundaries) │   │  carry, pool)    │     │
//! │        ↑          └──────┬───────┘   └────────┬─────────┘     │
//! │        │                 ↓                    ↓                │
//! │  ┌─────┴──────────┐  ┌────────────┐   ┌──────────────┐        │
//! │  │ Interrupt      │  │ TurnMachine│ ← │ playback     │        │
//! │  │ Coordinator    │→ │ (4 states) │   │ finished     │        │
//! │  └────────────────┘  └────────────┘   └──────────────┘        │
//! └────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod interrupt;
pub mod playback;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod sink;
pub mod state;
pub mod tools;
pub mod transport;
pub mod turn;

pub use error::{SessionError, SessionResult};
pub use interrupt::InterruptCoordinator;
pub use playback::{PlaybackConfig, PlaybackEngine, PlaybackEvent};
pub use pool::BufferPool;
pub use protocol::{EventRouter, ResponseOutput, ServerEvent};
pub use session::{
    DisconnectKind, RealtimeSession, SessionConfig, SessionEvent, TranscriptionConfig,
    TurnDetection,
};
pub use sink::{AudioSink, CpalSink, PlaceholderSink, WriteOutcome};
pub use state::SessionState;
pub use tools::{PlaceholderToolExecutor, ToolExecutor};
pub use transport::{TransportEvent, TransportHandle};
pub use turn::{NoopHooks, TurnEvent, TurnHooks, TurnMachine, TurnState};
