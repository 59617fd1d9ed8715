//! **AudioPlaybackEngine** — jitter-buffered, frame-aligned PCM streaming.
//!
//! Audio deltas arrive from the network in arbitrary sizes; the engine queues
//! them (bounded, drop-oldest), writes fixed 10 ms frames to the output sink
//! from a single dedicated thread, and keeps any sub-frame remainder as a
//! carry between writes. A response boundary clears the carry and rebases the
//! playback position, so truncation accounting is always relative to the
//! utterance currently being spoken.
//!
//! Only the playback thread ever touches the sink's write path; producers
//! hand off chunks through the bounded queue and never block.

use crate::pool::BufferPool;
use crate::sink::{AudioSink, WriteOutcome};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Configuration for the playback engine
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// PCM16 mono sample rate in Hz (default: 24000)
    pub sample_rate: u32,

    /// Bounded chunk queue capacity, several seconds of audio (default: 150)
    pub queue_capacity: usize,

    /// Minimum buffered chunks before playback starts, avoids initial
    /// underflow stutter (default: 6, ~60ms at 10ms frames)
    pub min_start_chunks: usize,

    /// Idle buffers kept in the pool (default: 50)
    pub pool_capacity: usize,

    /// Upper bound on waiting for the sink to drain written frames (default: 1.5s)
    pub drain_timeout: Duration,

    /// Upper bound on joining the playback thread during an interrupt (default: 200ms)
    pub join_timeout: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            queue_capacity: 150,
            min_start_chunks: 6,
            pool_capacity: 50,
            drain_timeout: Duration::from_millis(1500),
            join_timeout: Duration::from_millis(200),
        }
    }
}

/// Lifecycle events emitted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The playback thread started for a buffered response.
    Started,
    /// The playback thread finished (drained, interrupted, or device failure).
    Finished,
}

/// Park interval while the queue is starved.
const STARVED_PARK: Duration = Duration::from_millis(5);

struct Shared {
    queue: Mutex<VecDeque<Vec<u8>>>,
    pool: BufferPool,
    playing: AtomicBool,
    response_done: AtomicBool,
    stop_requested: AtomicBool,
    /// Bumped whenever the carry must be discarded (boundary, done, interrupt).
    /// The playback thread owns the carry bytes; this counter is how other
    /// threads invalidate them without sharing the buffer itself.
    carry_epoch: AtomicU64,
    /// Sink frames-played captured at the current response's start.
    baseline_frames: AtomicU64,
    /// Cumulative frames handed to the sink, never reset (drain target).
    frames_submitted: AtomicU64,
    sample_rate: AtomicU32,
}

/// Buffers, aligns and streams PCM16 audio to an [`AudioSink`].
pub struct PlaybackEngine {
    config: PlaybackConfig,
    shared: Arc<Shared>,
    sink: Arc<dyn AudioSink>,
    play_thread: Mutex<Option<thread::JoinHandle<()>>>,
    event_tx: mpsc::UnboundedSender<PlaybackEvent>,
}

impl PlaybackEngine {
    /// Create an engine writing to the given sink.
    pub fn new(
        config: PlaybackConfig,
        sink: Arc<dyn AudioSink>,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
            pool: BufferPool::new(config.pool_capacity),
            playing: AtomicBool::new(false),
            response_done: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            carry_epoch: AtomicU64::new(0),
            baseline_frames: AtomicU64::new(0),
            frames_submitted: AtomicU64::new(0),
            sample_rate: AtomicU32::new(config.sample_rate),
        });
        let engine = Self {
            config,
            shared,
            sink,
            play_thread: Mutex::new(None),
            event_tx,
        };
        (engine, event_rx)
    }

    /// Enqueue one PCM16 chunk. Never blocks: at capacity, exactly one oldest
    /// chunk is evicted back to the pool before the new one is accepted.
    pub fn add_chunk(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut buf = self.shared.pool.acquire(data.len());
        buf.copy_from_slice(data);

        let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.config.queue_capacity {
            if let Some(dropped) = queue.pop_front() {
                self.shared.pool.release(dropped);
            }
            warn!("playback queue full, dropped oldest chunk");
        }
        queue.push_back(buf);
    }

    /// Start the playback thread once enough audio is buffered. Idempotent:
    /// a second call while already playing is a no-op.
    pub fn start_if_needed(&self) {
        if self.shared.playing.load(Ordering::Acquire) {
            return;
        }
        if self.queued() < self.config.min_start_chunks {
            return;
        }
        self.spawn_play_thread();
    }

    /// Signal that no further chunks will arrive for the current response.
    /// The loop drains queue and carry, then stops. The carry is invalidated
    /// immediately so a delayed next response can never splice onto it.
    pub fn mark_response_done(&self) {
        self.shared.response_done.store(true, Ordering::Release);
        self.shared.carry_epoch.fetch_add(1, Ordering::AcqRel);
        // A short final response may never have reached the start threshold;
        // drain whatever is queued.
        if !self.shared.playing.load(Ordering::Acquire) && self.queued() > 0 {
            self.spawn_play_thread();
        }
    }

    /// Called when a new response id is detected on the wire, before any of
    /// its chunks are enqueued. Clears the carry and rebases the playback
    /// position on the sink's current frames-played count.
    pub fn on_response_boundary(&self) {
        self.shared.carry_epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.response_done.store(false, Ordering::Release);
        self.shared
            .baseline_frames
            .store(self.sink.frames_played(), Ordering::Release);
        debug!("response boundary: carry cleared, position rebased");
    }

    /// Hard stop: purge the queue back to the pool, invalidate the carry,
    /// halt the sink and join the playback thread within a bounded timeout.
    pub fn interrupt_now(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.response_done.store(true, Ordering::Release);
        self.shared.carry_epoch.fetch_add(1, Ordering::AcqRel);

        self.drain_queue_to_pool();
        self.shared.pool.purge();

        self.sink.pause();
        self.sink.flush();
        self.sink.stop();

        let handle = self
            .play_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + self.config.join_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(
                    "playback thread did not stop within {:?}, detaching",
                    self.config.join_timeout
                );
            }
        }

        // The flush discarded frames that were already counted as submitted;
        // reconcile so later drain waits do not chase audio that will never
        // play.
        self.shared
            .frames_submitted
            .store(self.sink.frames_played(), Ordering::Release);
    }

    /// Milliseconds of the current response audibly played so far, clamped
    /// to zero. Used for truncation accounting after a barge-in.
    pub fn estimated_position_ms(&self) -> u64 {
        let played = self.sink.frames_played();
        let baseline = self.shared.baseline_frames.load(Ordering::Acquire);
        let rate = self.shared.sample_rate.load(Ordering::Acquire) as u64;
        if rate == 0 {
            return 0;
        }
        played.saturating_sub(baseline) * 1000 / rate
    }

    /// Whether the playback thread is currently running.
    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    /// Chunks currently queued (diagnostics).
    pub fn queued(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Reconfigure the sample rate. Only honored while stopped; the sink must
    /// be rebuilt at the same rate by the caller.
    pub fn set_sample_rate(&self, hz: u32) {
        if hz == 0 || self.shared.playing.load(Ordering::Acquire) {
            warn!("ignoring sample rate change to {} while playing", hz);
            return;
        }
        self.shared.sample_rate.store(hz, Ordering::Release);
    }

    fn drain_queue_to_pool(&self) {
        let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(buf) = queue.pop_front() {
            self.shared.pool.release(buf);
        }
    }

    fn spawn_play_thread(&self) {
        if self
            .shared
            .playing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.shared.stop_requested.store(false, Ordering::Release);
        let _ = self.event_tx.send(PlaybackEvent::Started);

        let shared = Arc::clone(&self.shared);
        let sink = Arc::clone(&self.sink);
        let drain_timeout = self.config.drain_timeout;
        let event_tx = self.event_tx.clone();

        let spawned = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || play_loop(shared, sink, drain_timeout, event_tx));
        match spawned {
            Ok(handle) => {
                *self
                    .play_thread
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(handle);
            }
            Err(e) => {
                error!("failed to spawn playback thread: {}", e);
                self.shared.playing.store(false, Ordering::Release);
                let _ = self.event_tx.send(PlaybackEvent::Finished);
            }
        }
    }
}

/// The dedicated playback loop: single writer to the sink.
fn play_loop(
    shared: Arc<Shared>,
    sink: Arc<dyn AudioSink>,
    drain_timeout: Duration,
    event_tx: mpsc::UnboundedSender<PlaybackEvent>,
) {
    let mut device_failed = false;
    if let Err(e) = sink.start() {
        error!("output device start failed: {}", e);
        device_failed = true;
    }

    let rate = shared.sample_rate.load(Ordering::Acquire);
    // 10ms frames: sample_rate / 100 samples, two bytes each.
    let mut frame_bytes = (rate as usize / 100) * 2;
    if frame_bytes == 0 {
        frame_bytes = 480;
    }

    let mut carry: Vec<u8> = Vec::with_capacity(frame_bytes);
    let mut carry_epoch = shared.carry_epoch.load(Ordering::Acquire);

    while !device_failed && !shared.stop_requested.load(Ordering::Acquire) {
        let chunk = {
            let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.pop_front()
        };
        match chunk {
            Some(data) => {
                let epoch = shared.carry_epoch.load(Ordering::Acquire);
                if epoch != carry_epoch {
                    carry.clear();
                    carry_epoch = epoch;
                }

                // Prepend any leftover sub-frame bytes from the last write.
                let buf = if carry.is_empty() {
                    data
                } else {
                    let mut combined = shared.pool.acquire(carry.len() + data.len());
                    combined[..carry.len()].copy_from_slice(&carry);
                    combined[carry.len()..].copy_from_slice(&data);
                    carry.clear();
                    shared.pool.release(data);
                    combined
                };

                let written =
                    write_aligned_frames(&shared, sink.as_ref(), &buf, frame_bytes, &mut device_failed);

                // Store the remainder as the new carry unless a boundary
                // invalidated it while we were writing.
                let remainder = &buf[written..];
                if !remainder.is_empty()
                    && shared.carry_epoch.load(Ordering::Acquire) == carry_epoch
                {
                    carry.clear();
                    carry.extend_from_slice(remainder);
                }
                shared.pool.release(buf);
            }
            None => {
                if shared.response_done.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(STARVED_PARK);
            }
        }
    }

    if !device_failed && !shared.stop_requested.load(Ordering::Acquire) {
        // Final partial-frame flush, then wait for the device to finish
        // draining everything already written.
        if !carry.is_empty() && shared.carry_epoch.load(Ordering::Acquire) == carry_epoch {
            match sink.write(&carry) {
                Ok(WriteOutcome::Accepted(frames)) => {
                    shared.frames_submitted.fetch_add(frames, Ordering::AcqRel);
                }
                Ok(_) => {}
                Err(e) => warn!("final carry flush failed: {}", e),
            }
        }
        let target = shared.frames_submitted.load(Ordering::Acquire);
        let deadline = Instant::now() + drain_timeout;
        while sink.frames_played() < target
            && !shared.stop_requested.load(Ordering::Acquire)
        {
            if Instant::now() >= deadline {
                warn!("drain timeout reached before device caught up");
                break;
            }
            thread::sleep(STARVED_PARK);
        }
    }
    sink.stop();

    // Cleanup: everything back to the pool, pool purged between responses.
    {
        let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(buf) = queue.pop_front() {
            shared.pool.release(buf);
        }
    }
    shared.pool.purge();
    shared.response_done.store(false, Ordering::Release);
    shared.playing.store(false, Ordering::Release);
    info!("playback finished");
    let _ = event_tx.send(PlaybackEvent::Finished);
}

/// Write whole frames from `buf`; returns the byte offset consumed.
fn write_aligned_frames(
    shared: &Shared,
    sink: &dyn AudioSink,
    buf: &[u8],
    frame_bytes: usize,
    device_failed: &mut bool,
) -> usize {
    let mut offset = 0;
    while buf.len() - offset >= frame_bytes {
        if shared.stop_requested.load(Ordering::Acquire) {
            break;
        }
        match sink.write(&buf[offset..offset + frame_bytes]) {
            Ok(WriteOutcome::Accepted(frames)) => {
                shared.frames_submitted.fetch_add(frames, Ordering::AcqRel);
                offset += frame_bytes;
            }
            Ok(WriteOutcome::Stopped) => {
                if shared.stop_requested.load(Ordering::Acquire) {
                    break;
                }
                // Sink paused underneath us; brief park before retrying.
                thread::sleep(Duration::from_millis(2));
            }
            Ok(WriteOutcome::Dropped) => {
                // The sink discarded the frame; move past it and keep the
                // submitted count honest by not counting it.
                warn!("sink dropped one frame under sustained backpressure");
                offset += frame_bytes;
            }
            Err(e) => {
                error!("output device write failed: {}", e);
                *device_failed = true;
                break;
            }
        }
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionResult;
    use crate::sink::PlaceholderSink;

    fn test_config() -> PlaybackConfig {
        PlaybackConfig {
            queue_capacity: 4,
            min_start_chunks: 2,
            ..Default::default()
        }
    }

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

    #[test]
    fn add_chunk_evicts_exactly_one_oldest_at_capacity() {
        let sink = Arc::new(PlaceholderSink::new());
        let (engine, _rx) = PlaybackEngine::new(test_config(), sink);

        for _ in 0..4 {
            engine.add_chunk(&[1u8; 512]);
        }
        assert_eq!(engine.queued(), 4);

        engine.add_chunk(&[2u8; 512]);
        assert_eq!(engine.queued(), 4);
    }

    #[test]
    fn start_below_threshold_is_a_no_op() {
        let sink = Arc::new(PlaceholderSink::new());
        let (engine, _rx) = PlaybackEngine::new(test_config(), sink);

        engine.add_chunk(&[0u8; 480]);
        engine.start_if_needed();
        assert!(!engine.is_playing());
    }

    #[test]
    fn start_if_needed_is_idempotent() {
        let sink = Arc::new(PlaceholderSink::new());
        let (engine, mut rx) = PlaybackEngine::new(test_config(), Arc::clone(&sink) as _);

        engine.add_chunk(&[0u8; 960]);
        engine.add_chunk(&[0u8; 960]);
        engine.start_if_needed();
        engine.start_if_needed();
        engine.start_if_needed();

        engine.mark_response_done();
        assert!(wait_until(|| !engine.is_playing(), Duration::from_secs(2)));

        let mut started = 0;
        while let Ok(ev) = rx.try_recv() {
            if ev == PlaybackEvent::Started {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[test]
    fn short_response_drains_on_done_without_threshold() {
        let sink = Arc::new(PlaceholderSink::new());
        let (engine, _rx) = PlaybackEngine::new(test_config(), Arc::clone(&sink) as _);

        engine.add_chunk(&[0u8; 480]);
        engine.mark_response_done();
        assert!(wait_until(
            || sink.frames_played() == 240,
            Duration::from_secs(2)
        ));
        assert!(wait_until(|| !engine.is_playing(), Duration::from_secs(2)));
    }

    #[test]
    fn position_is_relative_to_response_baseline() {
        let sink = Arc::new(PlaceholderSink::new());
        let (engine, _rx) = PlaybackEngine::new(PlaybackConfig::default(), Arc::clone(&sink) as _);

        // 24kHz: 24 frames per millisecond.
        sink.start().unwrap();
        sink.write(&[0u8; 960]).unwrap();
        assert_eq!(engine.estimated_position_ms(), 20);

        engine.on_response_boundary();
        assert_eq!(engine.estimated_position_ms(), 0);

        sink.write(&[0u8; 480]).unwrap();
        assert_eq!(engine.estimated_position_ms(), 10);
    }

    #[test]
    fn interrupt_purges_queue_and_stops() {
        let sink = Arc::new(PlaceholderSink::new());
        let (engine, _rx) = PlaybackEngine::new(test_config(), Arc::clone(&sink) as _);

        engine.add_chunk(&[0u8; 512]);
        engine.add_chunk(&[0u8; 512]);
        engine.interrupt_now();
        assert_eq!(engine.queued(), 0);
        assert!(!engine.is_playing());
    }

    /// Sink that holds accepted audio as pending until it is observed, so a
    /// flush can discard frames that were accepted but never played — the
    /// behavior of a real buffered device.
    #[derive(Default)]
    struct LossySink {
        pending: AtomicU64,
        played: AtomicU64,
        running: AtomicBool,
    }

    impl AudioSink for LossySink {
        fn start(&self) -> SessionResult<()> {
            self.running.store(true, Ordering::Release);
            Ok(())
        }

        fn write(&self, pcm: &[u8]) -> SessionResult<WriteOutcome> {
            if !self.running.load(Ordering::Acquire) {
                return Ok(WriteOutcome::Stopped);
            }
            let frames = (pcm.len() / 2) as u64;
            self.pending.fetch_add(frames, Ordering::AcqRel);
            Ok(WriteOutcome::Accepted(frames))
        }

        fn frames_played(&self) -> u64 {
            let settled = self.pending.swap(0, Ordering::AcqRel);
            self.played.fetch_add(settled, Ordering::AcqRel) + settled
        }

        fn pause(&self) {
            self.running.store(false, Ordering::Release);
        }

        fn flush(&self) {
            self.pending.store(0, Ordering::Release);
        }

        fn stop(&self) {
            self.running.store(false, Ordering::Release);
        }
    }

    #[test]
    fn drain_after_interrupt_does_not_wait_for_flushed_audio() {
        let config = PlaybackConfig {
            min_start_chunks: 1,
            drain_timeout: Duration::from_secs(3),
            ..Default::default()
        };
        let sink = Arc::new(LossySink::default());
        let (engine, _rx) = PlaybackEngine::new(config, Arc::clone(&sink) as _);

        // Response A is accepted by the device but flushed away unplayed by
        // the barge-in.
        engine.add_chunk(&[0u8; 4800]);
        engine.start_if_needed();
        assert!(wait_until(|| engine.queued() == 0, Duration::from_secs(2)));
        engine.interrupt_now();
        assert!(!engine.is_playing());

        // Response B must finish as soon as its own audio has played, not
        // after chasing A's discarded frames into the drain timeout.
        engine.on_response_boundary();
        engine.add_chunk(&[0u8; 4800]);
        let begun = Instant::now();
        engine.mark_response_done();
        assert!(wait_until(|| !engine.is_playing(), Duration::from_secs(2)));
        assert!(begun.elapsed() < Duration::from_secs(1));
    }
}
