//! Integration scenarios for the playback engine and the barge-in path.
//!
//! Everything here runs against in-memory sinks, so no audio hardware or
//! live endpoint is needed.

use orato_realtime::{
    AudioSink, InterruptCoordinator, PlaybackConfig, PlaybackEngine, PlaybackEvent,
    PlaceholderSink, SessionState, TransportHandle, TurnMachine, TurnState, WriteOutcome,
};
use orato_realtime::error::SessionResult;
use orato_realtime::transport::TransportCommand;
use orato_realtime::turn::NoopHooks;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(pred: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    pred()
}

fn drain_events(rx: &mut tokio::sync::mpsc::UnboundedReceiver<PlaybackEvent>) -> Vec<PlaybackEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

/// Ten 20ms chunks (960 bytes at 24kHz) drain as 10ms-aligned writes with no
/// trailing partial flush.
#[test]
fn aligned_chunks_drain_as_whole_frames() {
    let sink = Arc::new(PlaceholderSink::new());
    let (engine, mut rx) =
        PlaybackEngine::new(PlaybackConfig::default(), Arc::clone(&sink) as _);

    for _ in 0..10 {
        engine.add_chunk(&[0x11u8; 960]);
    }
    engine.start_if_needed();
    engine.mark_response_done();

    assert!(wait_until(|| !engine.is_playing(), Duration::from_secs(3)));
    let events = drain_events(&mut rx);
    assert!(events.contains(&PlaybackEvent::Started));
    assert!(events.contains(&PlaybackEvent::Finished));

    let writes = sink.writes();
    assert_eq!(writes.len(), 20);
    assert!(writes.iter().all(|w| w.len() == 480));
}

/// Misaligned chunks still produce only whole-frame writes, plus at most one
/// final partial flush.
#[test]
fn misaligned_chunks_keep_frame_alignment() {
    let sink = Arc::new(PlaceholderSink::new());
    let (engine, _rx) =
        PlaybackEngine::new(PlaybackConfig::default(), Arc::clone(&sink) as _);

    // 6 x 700 bytes = 4200 bytes = 8 whole frames + 360 leftover bytes.
    // Marking done before playback starts also exercises the drain kick for
    // short responses below the start threshold.
    for _ in 0..6 {
        engine.add_chunk(&[0x22u8; 700]);
    }
    engine.mark_response_done();
    assert!(wait_until(|| !engine.is_playing(), Duration::from_secs(3)));

    let writes = sink.writes();
    assert!(!writes.is_empty());
    let (last, whole) = writes.split_last().unwrap();
    assert!(whole.iter().all(|w| w.len() == 480));
    assert!(last.len() <= 480);
    let total: usize = writes.iter().map(|w| w.len()).sum();
    assert_eq!(total, 6 * 700);
}

/// A response boundary flushes the previous response's carry before the new
/// response's first chunk is written: no two responses are ever spliced.
#[test]
fn boundary_discards_carry_between_responses() {
    let config = PlaybackConfig {
        min_start_chunks: 1,
        ..Default::default()
    };
    let sink = Arc::new(PlaceholderSink::new());
    let (engine, mut rx) = PlaybackEngine::new(config, Arc::clone(&sink) as _);

    // Response A: one misaligned chunk leaves 220 carry bytes.
    engine.add_chunk(&[0xAAu8; 700]);
    engine.start_if_needed();
    assert!(wait_until(|| sink.writes().len() == 1, Duration::from_secs(3)));

    // Response B's first chunk arrives before A's done event (the race).
    engine.on_response_boundary();
    engine.add_chunk(&[0xBBu8; 480]);
    assert!(wait_until(|| sink.writes().len() == 2, Duration::from_secs(3)));

    engine.mark_response_done();
    assert!(wait_until(|| !engine.is_playing(), Duration::from_secs(3)));
    assert!(drain_events(&mut rx).contains(&PlaybackEvent::Finished));

    let writes = sink.writes();
    // No third write: A's carry was discarded, B was already aligned.
    assert_eq!(writes.len(), 2);
    assert!(writes[0].iter().all(|&b| b == 0xAA));
    assert_eq!(writes[1].len(), 480);
    assert!(writes[1].iter().all(|&b| b == 0xBB));
}

/// Position is rebased at every boundary so truncation accounting refers to
/// the current response only.
#[test]
fn position_resets_at_boundary() {
    let sink = Arc::new(PlaceholderSink::new());
    let (engine, _rx) =
        PlaybackEngine::new(PlaybackConfig::default(), Arc::clone(&sink) as _);

    sink.start().unwrap();
    sink.write(&[0u8; 4800]).unwrap(); // 100ms at 24kHz
    assert_eq!(engine.estimated_position_ms(), 100);

    engine.on_response_boundary();
    assert_eq!(engine.estimated_position_ms(), 0);
}

/// A sink whose writes block while `gated` is set; releasing happens through
/// the engine's own stop path. Lets a test freeze playback mid-response.
struct GatedSink {
    writes: Mutex<Vec<Vec<u8>>>,
    played: AtomicU64,
    running: AtomicBool,
    gated: AtomicBool,
}

impl GatedSink {
    fn new() -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            played: AtomicU64::new(0),
            running: AtomicBool::new(false),
            gated: AtomicBool::new(false),
        }
    }

    fn gate(&self) {
        self.gated.store(true, Ordering::Release);
    }
}

impl AudioSink for GatedSink {
    fn start(&self) -> SessionResult<()> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn write(&self, pcm: &[u8]) -> SessionResult<WriteOutcome> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.gated.load(Ordering::Acquire) {
            if !self.running.load(Ordering::Acquire) {
                return Ok(WriteOutcome::Stopped);
            }
            if Instant::now() > deadline {
                return Ok(WriteOutcome::Dropped);
            }
            thread::sleep(Duration::from_millis(1));
        }
        if !self.running.load(Ordering::Acquire) {
            return Ok(WriteOutcome::Stopped);
        }
        let frames = (pcm.len() / 2) as u64;
        self.writes.lock().unwrap().push(pcm.to_vec());
        self.played.fetch_add(frames, Ordering::AcqRel);
        Ok(WriteOutcome::Accepted(frames))
    }

    fn frames_played(&self) -> u64 {
        self.played.load(Ordering::Acquire)
    }

    fn pause(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn flush(&self) {}

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

fn truncate_command(commands: &[TransportCommand]) -> Option<Value> {
    commands.iter().find_map(|cmd| match cmd {
        TransportCommand::Send(text) => {
            let v: Value = serde_json::from_str(text).ok()?;
            (v["type"] == "conversation.item.truncate").then_some(v)
        }
        _ => None,
    })
}

/// Mid-stream barge-in: 1200ms played, five chunks still queued. The truncate
/// message carries exactly the played milliseconds, the queue is purged, and
/// the playback thread stops within the join timeout.
#[test]
fn interrupt_truncates_at_played_position() {
    let sink = Arc::new(GatedSink::new());
    let (engine, _rx) =
        PlaybackEngine::new(PlaybackConfig::default(), Arc::clone(&sink) as _);
    let engine = Arc::new(engine);

    // 10 x 120ms of audio = 1200ms, all frame-aligned.
    for _ in 0..10 {
        engine.add_chunk(&[0x33u8; 5760]);
    }
    engine.start_if_needed();
    assert!(wait_until(
        || sink.frames_played() == 28_800,
        Duration::from_secs(3)
    ));

    // Freeze the device, then let five more chunks pile up.
    sink.gate();
    for _ in 0..5 {
        engine.add_chunk(&[0x44u8; 480]);
    }

    let (transport, mut command_rx) = TransportHandle::loopback();
    let state = Arc::new(SessionState::new());
    state.set_generating(true);
    state.set_current_response_id(Some("resp_b".to_string()));
    state.set_last_assistant_item_id(Some("item_b".to_string()));
    let (turns, _turn_rx) = TurnMachine::new(Box::new(NoopHooks));
    let turns = Arc::new(turns);
    let coordinator = InterruptCoordinator::new(
        transport,
        Arc::clone(&state),
        Arc::clone(&engine),
        Arc::clone(&turns),
    );

    coordinator.interrupt();

    assert!(wait_until(|| !engine.is_playing(), Duration::from_secs(1)));
    assert_eq!(engine.queued(), 0);
    assert_eq!(turns.state(), TurnState::Listening);
    assert_eq!(state.cancelled_response_id().as_deref(), Some("resp_b"));

    let mut commands = Vec::new();
    while let Ok(cmd) = command_rx.try_recv() {
        commands.push(cmd);
    }
    let truncate = truncate_command(&commands).expect("truncate message sent");
    assert_eq!(truncate["item_id"], "item_b");
    assert_eq!(truncate["audio_end_ms"], 1200);

    // Nothing queued after the gate ever reached the device.
    assert!(sink
        .writes
        .lock()
        .unwrap()
        .iter()
        .all(|w| w.iter().all(|&b| b == 0x33)));
}

/// Interrupt from SPEAKING always forces LISTENING, even with a follow-up
/// response expected.
#[test]
fn interrupt_overrides_follow_up_expectation() {
    let sink = Arc::new(PlaceholderSink::new());
    let (engine, _rx) = PlaybackEngine::new(PlaybackConfig::default(), sink);
    let engine = Arc::new(engine);
    let (transport, _command_rx) = TransportHandle::loopback();
    let state = Arc::new(SessionState::new());
    let (turns, _turn_rx) = TurnMachine::new(Box::new(NoopHooks));
    let turns = Arc::new(turns);

    turns.session_ready();
    turns.utterance_submitted();
    assert!(turns.response_audio_started());
    assert_eq!(turns.state(), TurnState::Speaking);
    state.set_follow_up_expected(true);

    let coordinator = InterruptCoordinator::new(
        transport,
        Arc::clone(&state),
        Arc::clone(&engine),
        Arc::clone(&turns),
    );
    coordinator.interrupt();

    assert_eq!(turns.state(), TurnState::Listening);
    assert!(!state.follow_up_expected());
}

/// Repeated interrupts are safe with nothing active.
#[test]
fn interrupt_is_idempotent() {
    let sink = Arc::new(PlaceholderSink::new());
    let (engine, _rx) = PlaybackEngine::new(PlaybackConfig::default(), sink);
    let engine = Arc::new(engine);
    let (transport, _command_rx) = TransportHandle::loopback();
    let state = Arc::new(SessionState::new());
    let (turns, _turn_rx) = TurnMachine::new(Box::new(NoopHooks));
    let turns = Arc::new(turns);
    let coordinator =
        InterruptCoordinator::new(transport, state, Arc::clone(&engine), Arc::clone(&turns));

    coordinator.interrupt();
    coordinator.interrupt();
    coordinator.interrupt();
    assert_eq!(turns.state(), TurnState::Listening);
    assert!(!engine.is_playing());
}
