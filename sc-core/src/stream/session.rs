//! One streaming session: its configuration, counters and capture loop.
//!
//! A [`StreamSession`] is shared (`Arc`) between the engine's session map
//! and the session's capture thread. Counters are atomics so stats reads
//! never wait on the capture thread; the configuration sits behind its own
//! small lock.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ScError;
use crate::stream::capture::ScreenCapture;
use crate::stream::delta::{DEFAULT_BLOCK_SIZE, DeltaDetector};
use crate::stream::encoder::{EncoderSettings, EncoderStats, FrameEncoder};
use crate::stream::types::RawScreenFrame;

/// Longest single wait on the capture primitive, so stop requests are
/// observed promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ── StreamConfig ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    pub display_id: u32,
    pub max_fps: u32,
    /// 0–100; 100 is lossless.
    pub quality: u8,
    pub use_delta: bool,
    pub use_lossy: bool,
    pub capture_cursor: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            display_id: 0,
            max_fps: 30,
            quality: 80,
            use_delta: true,
            use_lossy: true,
            capture_cursor: true,
        }
    }
}

impl StreamConfig {
    pub fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            quality: self.quality.min(100),
            use_lossy: self.use_lossy,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.max_fps.clamp(1, 120)))
    }
}

// ── SessionState ─────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl From<u8> for SessionState {
    fn from(v: u8) -> Self {
        match v {
            0 => SessionState::Created,
            1 => SessionState::Running,
            2 => SessionState::Stopping,
            _ => SessionState::Stopped,
        }
    }
}

// ── StreamStats ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub session_id: String,
    pub state: SessionState,
    pub frames_encoded: u64,
    pub bytes_encoded: u64,
    pub fps: u32,
    pub compression_ratio: f64,
    pub average_encode_ms: f64,
    pub config: StreamConfig,
}

// ── StreamSession ────────────────────────────────────────────────

pub struct StreamSession {
    id: String,
    config: Mutex<StreamConfig>,
    config_changed: AtomicBool,
    running: AtomicBool,
    refresh: AtomicBool,
    state: AtomicU8,
    frames: AtomicU64,
    bytes: AtomicU64,
    fps: AtomicU32,
    encoder_stats: Mutex<EncoderStats>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    pub fn new(id: String, config: StreamConfig) -> Self {
        Self {
            id,
            config: Mutex::new(config),
            config_changed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            refresh: AtomicBool::new(false),
            state: AtomicU8::new(SessionState::Created as u8),
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            fps: AtomicU32::new(0),
            encoder_stats: Mutex::new(EncoderStats::default()),
            thread: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> StreamConfig {
        *lock(&self.config)
    }

    /// Replace the configuration; the capture thread picks it up before
    /// its next frame.
    pub fn set_config(&self, config: StreamConfig) {
        *lock(&self.config) = config;
        self.config_changed.store(true, Ordering::SeqCst);
    }

    /// Encode the next processed frame in full.
    pub fn request_refresh(&self) {
        self.refresh.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_running(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Running);
    }

    pub(crate) fn attach_thread(&self, handle: JoinHandle<()>) {
        *lock(&self.thread) = Some(handle);
    }

    /// Ask the capture thread to stop. Does not wait.
    pub fn signal_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if self.state() != SessionState::Stopped {
            self.set_state(SessionState::Stopping);
        }
    }

    /// Wait for the capture thread to exit.
    pub fn join(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(session = %self.id, "capture thread panicked");
            }
        }
        self.set_state(SessionState::Stopped);
    }

    pub fn stats(&self) -> StreamStats {
        let encoder = *lock(&self.encoder_stats);
        StreamStats {
            session_id: self.id.clone(),
            state: self.state(),
            frames_encoded: self.frames.load(Ordering::Relaxed),
            bytes_encoded: self.bytes.load(Ordering::Relaxed),
            fps: self.fps.load(Ordering::Relaxed),
            compression_ratio: encoder.compression_ratio,
            average_encode_ms: encoder.average_encode_ms,
            config: self.config(),
        }
    }
}

// ── FpsCounter ───────────────────────────────────────────────────

/// Frames-per-second over windows of at least one second.
#[derive(Debug, Clone)]
pub struct FpsCounter {
    window_start: Instant,
    frames: u64,
}

impl FpsCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            frames: 0,
        }
    }

    /// Count one frame. Returns a new rate once a full second has passed.
    pub fn record(&mut self, now: Instant) -> Option<u32> {
        self.frames += 1;
        let elapsed_ms = now.duration_since(self.window_start).as_millis() as u64;
        if elapsed_ms < 1000 {
            return None;
        }
        let fps = (self.frames * 1000 / elapsed_ms) as u32;
        self.frames = 0;
        self.window_start = now;
        Some(fps)
    }
}

// ── FramePipeline ────────────────────────────────────────────────

/// Delta detection + encoding + serialization for one session.
pub struct FramePipeline {
    detector: DeltaDetector,
    encoder: FrameEncoder,
    use_delta: bool,
    sequence: u32,
    started: Instant,
    fps: FpsCounter,
}

impl FramePipeline {
    pub fn new(config: &StreamConfig) -> Self {
        let now = Instant::now();
        Self {
            detector: DeltaDetector::new(DEFAULT_BLOCK_SIZE),
            encoder: FrameEncoder::new(config.encoder_settings()),
            use_delta: config.use_delta,
            sequence: 0,
            started: now,
            fps: FpsCounter::new(now),
        }
    }

    pub fn reconfigure(&mut self, config: &StreamConfig) {
        self.encoder.reconfigure(config.encoder_settings());
        self.use_delta = config.use_delta;
    }

    /// Process one raw frame for `session`.
    ///
    /// Returns the serialized frame, or `None` when nothing changed.
    pub fn process(
        &mut self,
        raw: &RawScreenFrame,
        session: &StreamSession,
    ) -> Result<Option<Bytes>, ScError> {
        if !raw.is_consistent() {
            return Err(ScError::Encoding("captured buffer shorter than frame".into()));
        }
        let force_full = session.refresh.swap(false, Ordering::SeqCst) || !self.use_delta;
        let delta = self.detector.detect(raw, force_full);
        if delta.is_empty() {
            return Ok(None);
        }

        let timestamp_ms = raw.timestamp.saturating_duration_since(self.started).as_millis() as u32;
        let frame = self.encoder.encode(&delta, raw, self.sequence, timestamp_ms)?;
        let bytes = frame.encode()?;
        self.sequence = self.sequence.wrapping_add(1);

        session.frames.fetch_add(1, Ordering::Relaxed);
        session.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        if let Some(fps) = self.fps.record(Instant::now()) {
            session.fps.store(fps, Ordering::Relaxed);
        }
        *lock(&session.encoder_stats) = self.encoder.stats();

        Ok(Some(bytes))
    }
}

// ── Capture loop ─────────────────────────────────────────────────

/// Body of a session's capture thread. Runs until the running flag drops
/// or the capture fails.
pub(crate) fn run_capture(
    session: Arc<StreamSession>,
    mut capture: Box<dyn ScreenCapture>,
    mut deliver: impl FnMut(&str, Bytes),
) {
    let mut pipeline = FramePipeline::new(&session.config());
    debug!(session = %session.id, "capture loop started");

    while session.is_running() {
        let loop_start = Instant::now();
        if session.config_changed.swap(false, Ordering::SeqCst) {
            pipeline.reconfigure(&session.config());
        }
        let interval = session.config().frame_interval();

        let raw = match capture.next_frame(interval.min(POLL_INTERVAL)) {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                warn!(session = %session.id, "capture failed: {e}");
                break;
            }
        };

        match pipeline.process(&raw, &session) {
            Ok(Some(bytes)) => deliver(&session.id, bytes),
            Ok(None) => {}
            Err(e) => warn!(session = %session.id, "dropping frame: {e}"),
        }

        pace(&session, loop_start, interval);
    }

    session.running.store(false, Ordering::SeqCst);
    debug!(session = %session.id, "capture loop finished");
}

/// Sleep out the rest of the frame interval in short slices.
fn pace(session: &StreamSession, loop_start: Instant, interval: Duration) {
    while session.is_running() {
        let elapsed = loop_start.elapsed();
        if elapsed >= interval {
            break;
        }
        std::thread::sleep((interval - elapsed).min(Duration::from_millis(20)));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::types::PixelFormat;
    use crate::stream::wire::{EncodedFrame, RectFlags};

    fn frame(fill: u8) -> RawScreenFrame {
        RawScreenFrame::packed(128, 128, PixelFormat::Bgra8, vec![fill; 128 * 128 * 4])
    }

    #[test]
    fn fps_is_computed_after_one_second() {
        let t0 = Instant::now();
        let mut fps = FpsCounter::new(t0);
        for i in 1..30 {
            assert_eq!(fps.record(t0 + Duration::from_millis(i * 30)), None);
        }
        // 30th frame at 1200 ms: 30 * 1000 / 1200 = 25.
        assert_eq!(fps.record(t0 + Duration::from_millis(1200)), Some(25));
        assert_eq!(fps.record(t0 + Duration::from_millis(1300)), None);
    }

    #[test]
    fn first_frame_full_then_static_frame_suppressed() {
        let session = StreamSession::new("s".into(), StreamConfig::default());
        let mut pipeline = FramePipeline::new(&session.config());

        let first = pipeline.process(&frame(1), &session).unwrap().unwrap();
        let decoded = EncodedFrame::decode(&first).unwrap();
        assert_eq!(decoded.sequence, 0);
        assert!(decoded.rects[0].flags.contains(RectFlags::KEYFRAME));

        assert!(pipeline.process(&frame(1), &session).unwrap().is_none());
        let stats = session.stats();
        assert_eq!(stats.frames_encoded, 1);
        assert_eq!(stats.bytes_encoded, first.len() as u64);
    }

    #[test]
    fn refresh_forces_keyframe_and_sequence_advances() {
        let session = StreamSession::new("s".into(), StreamConfig::default());
        let mut pipeline = FramePipeline::new(&session.config());
        let _ = pipeline.process(&frame(1), &session).unwrap();

        session.request_refresh();
        let bytes = pipeline.process(&frame(1), &session).unwrap().unwrap();
        let decoded = EncodedFrame::decode(&bytes).unwrap();
        assert_eq!(decoded.sequence, 1);
        assert!(decoded.is_keyframe());
        // Refresh is one-shot.
        assert!(pipeline.process(&frame(1), &session).unwrap().is_none());
    }

    #[test]
    fn delta_disabled_sends_every_frame_in_full() {
        let config = StreamConfig {
            use_delta: false,
            ..StreamConfig::default()
        };
        let session = StreamSession::new("s".into(), config);
        let mut pipeline = FramePipeline::new(&config);
        assert!(pipeline.process(&frame(1), &session).unwrap().is_some());
        assert!(pipeline.process(&frame(1), &session).unwrap().is_some());
    }

    #[test]
    fn state_transitions() {
        let session = StreamSession::new("s".into(), StreamConfig::default());
        assert_eq!(session.state(), SessionState::Created);
        session.mark_running();
        assert_eq!(session.state(), SessionState::Running);
        session.signal_stop();
        assert_eq!(session.state(), SessionState::Stopping);
        session.join();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!session.is_running());
    }

    #[test]
    fn frame_interval_is_clamped() {
        let zero = StreamConfig {
            max_fps: 0,
            ..StreamConfig::default()
        };
        assert_eq!(zero.frame_interval(), Duration::from_millis(1000));
        assert_eq!(StreamConfig::default().frame_interval(), Duration::from_millis(33));
    }
}
