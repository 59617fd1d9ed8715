//! **AudioSink** — the output device seam for the playback engine.
//!
//! The engine only needs fixed-size frame writes and a monotonically
//! increasing frames-played counter; everything device-specific lives behind
//! this trait. `CpalSink` is the production implementation (default output
//! device via CPAL); `PlaceholderSink` plays instantly into memory for
//! headless runs and tests.

use crate::error::{SessionError, SessionResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Result of one sink write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Frames accepted for playback.
    Accepted(u64),
    /// The sink is stopped or paused; nothing was taken. Retry after the
    /// caller's own stop state has been checked.
    Stopped,
    /// The device stayed saturated past the write budget and the frame was
    /// discarded. Callers must move past it, never retry it.
    Dropped,
}

/// Output sink for PCM16 mono audio.
///
/// `write` accepts one frame (or the final partial frame) and may block only
/// up to a bounded internal budget; the [`WriteOutcome`] says whether the
/// frame was taken, refused (stopped/paused), or discarded. `frames_played`
/// never decreases and never resets for the lifetime of the sink. `stop` is
/// resumable: a later `start` begins consuming again.
pub trait AudioSink: Send + Sync {
    /// Begin (or resume) consuming buffered audio.
    fn start(&self) -> SessionResult<()>;

    /// Write PCM16 bytes.
    fn write(&self, pcm: &[u8]) -> SessionResult<WriteOutcome>;

    /// Monotonic count of frames the device has played so far.
    fn frames_played(&self) -> u64;

    /// Stop consuming; buffered audio is kept.
    fn pause(&self);

    /// Drop all buffered, not-yet-played audio.
    fn flush(&self);

    /// Halt playback. Buffer state is untouched; `start` resumes.
    fn stop(&self);
}

/// How long `write` may wait for device-side headroom before giving up.
const WRITE_BUDGET: Duration = Duration::from_millis(500);

struct CpalShared {
    /// Mono samples waiting for the device callback.
    samples: Mutex<VecDeque<i16>>,
    frames_played: AtomicU64,
    running: AtomicBool,
    shutdown: AtomicBool,
    /// Device-side buffering cap in samples (~300ms).
    max_buffered: usize,
}

/// Default-output-device sink. A dedicated thread owns the CPAL stream
/// (`cpal::Stream` is not `Send`); the callback drains a shared sample queue
/// and counts what it actually consumed.
pub struct CpalSink {
    shared: Arc<CpalShared>,
    device_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CpalSink {
    /// Open the default output device at the given sample rate.
    pub fn new(sample_rate: u32) -> SessionResult<Self> {
        let shared = Arc::new(CpalShared {
            samples: Mutex::new(VecDeque::new()),
            frames_played: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            max_buffered: (sample_rate as usize) * 300 / 1000,
        });

        let (init_tx, init_rx) = std::sync::mpsc::channel::<SessionResult<()>>();
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("audio-device".to_string())
            .spawn(move || run_device_thread(thread_shared, sample_rate, init_tx))
            .map_err(|e| SessionError::AudioDevice(e.to_string()))?;

        match init_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(Self {
                shared,
                device_thread: Mutex::new(Some(handle)),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::AudioDevice(
                "output device did not initialize in time".to_string(),
            )),
        }
    }

    fn buffered(&self) -> usize {
        self.shared
            .samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl AudioSink for CpalSink {
    fn start(&self) -> SessionResult<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(SessionError::AudioDevice("sink released".to_string()));
        }
        self.shared.running.store(true, Ordering::Release);
        Ok(())
    }

    fn write(&self, pcm: &[u8]) -> SessionResult<WriteOutcome> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Ok(WriteOutcome::Stopped);
        }
        let incoming = pcm.len() / 2;

        // Bounded wait for headroom so a stalled device can never hang the
        // playback loop.
        let start = Instant::now();
        while self.buffered() + incoming > self.shared.max_buffered {
            if !self.shared.running.load(Ordering::Acquire)
                || self.shared.shutdown.load(Ordering::Acquire)
            {
                return Ok(WriteOutcome::Stopped);
            }
            if start.elapsed() > WRITE_BUDGET {
                warn!("output device write budget exceeded, dropping frame");
                return Ok(WriteOutcome::Dropped);
            }
            thread::sleep(Duration::from_millis(2));
        }
        if !self.shared.running.load(Ordering::Acquire) {
            return Ok(WriteOutcome::Stopped);
        }

        let mut samples = self
            .shared
            .samples
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for chunk in pcm.chunks_exact(2) {
            samples.push_back(i16::from_le_bytes([chunk[0], chunk[1]]));
        }
        Ok(WriteOutcome::Accepted(incoming as u64))
    }

    fn frames_played(&self) -> u64 {
        self.shared.frames_played.load(Ordering::Acquire)
    }

    fn pause(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    fn flush(&self) {
        self.shared
            .samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        let handle = self
            .device_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Owns the CPAL stream for the sink's whole lifetime. The callback pops
/// mono samples and duplicates them to stereo (many devices reject mono).
fn run_device_thread(
    shared: Arc<CpalShared>,
    sample_rate: u32,
    init_tx: std::sync::mpsc::Sender<SessionResult<()>>,
) {
    let host = cpal::default_host();
    let device = match host.default_output_device() {
        Some(d) => d,
        None => {
            let _ = init_tx.send(Err(SessionError::AudioDevice(
                "no output device available".to_string(),
            )));
            return;
        }
    };
    info!(
        "output device: {} ({} Hz)",
        device.name().unwrap_or_else(|_| "unknown".to_string()),
        sample_rate
    );

    let config = cpal::StreamConfig {
        channels: 2,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let cb_shared = Arc::clone(&shared);
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut consumed: u64 = 0;
            let mut samples = cb_shared
                .samples
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let running = cb_shared.running.load(Ordering::Acquire);
            for frame in data.chunks_mut(2) {
                let value = if running { samples.pop_front() } else { None };
                match value {
                    Some(s) => {
                        let v = s as f32 / 32768.0;
                        frame[0] = v;
                        frame[1] = v;
                        consumed += 1;
                    }
                    None => {
                        frame[0] = 0.0;
                        frame[1] = 0.0;
                    }
                }
            }
            drop(samples);
            if consumed > 0 {
                cb_shared.frames_played.fetch_add(consumed, Ordering::AcqRel);
            }
        },
        |err| warn!("output stream error: {}", err),
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = init_tx.send(Err(e.into()));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = init_tx.send(Err(e.into()));
        return;
    }
    let _ = init_tx.send(Ok(()));

    // Keep the stream alive until the sink is dropped.
    while !shared.shutdown.load(Ordering::Acquire) {
        thread::park_timeout(Duration::from_millis(250));
    }
}

/// In-memory sink: records every write and "plays" it instantly. Use when no
/// audio hardware is present (CI, headless hosts) or to inspect frame
/// alignment in tests.
#[derive(Default)]
pub struct PlaceholderSink {
    writes: Mutex<Vec<Vec<u8>>>,
    frames_played: AtomicU64,
    running: AtomicBool,
}

impl PlaceholderSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write accepted so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl AudioSink for PlaceholderSink {
    fn start(&self) -> SessionResult<()> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn write(&self, pcm: &[u8]) -> SessionResult<WriteOutcome> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(WriteOutcome::Stopped);
        }
        let frames = (pcm.len() / 2) as u64;
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pcm.to_vec());
        self.frames_played.fetch_add(frames, Ordering::AcqRel);
        Ok(WriteOutcome::Accepted(frames))
    }

    fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Acquire)
    }

    fn pause(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn flush(&self) {}

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}
