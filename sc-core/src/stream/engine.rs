//! The streaming engine: session registry and single-shot screenshots.
//!
//! Every session runs on its own OS thread. The capture is opened on that
//! thread and the outcome reported back before `start_stream` returns, so
//! a failed open never leaves a session behind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, mpsc as std_mpsc};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ScError;
use crate::stream::capture::CaptureBackend;
use crate::stream::encoder;
use crate::stream::session::{StreamConfig, StreamSession, StreamStats, run_capture};
use crate::stream::types::DisplayInfo;

/// Prefix of every generated session id.
pub const SESSION_PREFIX: &str = "stream-";

/// Upper bound on the single-frame wait of a screenshot.
pub const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(1);

// ── FrameSink ────────────────────────────────────────────────────

/// Receives serialized frames from capture threads.
///
/// Called on the capture thread; implementations must not block.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, session_id: &str, frame: Bytes);
}

/// Frames become `(session id, bytes)` messages. A full queue drops the
/// frame; the next delta or refresh catches the viewer up.
impl FrameSink for mpsc::Sender<(String, Bytes)> {
    fn deliver(&self, session_id: &str, frame: Bytes) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.try_send((session_id.to_string(), frame)) {
            debug!(session = %session_id, "frame queue full, dropping frame");
        }
    }
}

// ── Screenshot ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub width: u32,
    pub height: u32,
    pub format: &'static str,
    #[serde(skip)]
    pub data: Vec<u8>,
}

// ── StreamEngine ─────────────────────────────────────────────────

pub struct StreamEngine {
    backend: Arc<dyn CaptureBackend>,
    sessions: Mutex<HashMap<String, Arc<StreamSession>>>,
    next_id: AtomicU64,
}

impl StreamEngine {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn get_displays(&self) -> Vec<DisplayInfo> {
        self.backend.displays()
    }

    /// Start capturing `config.display_id`; frames go to `sink`.
    ///
    /// Blocks until the capture thread has opened (or failed to open) the
    /// display. Returns the new session id.
    pub fn start_stream(&self, config: StreamConfig, sink: Arc<dyn FrameSink>) -> Result<String, ScError> {
        if !self.backend.has_permission() {
            return Err(ScError::Capability("screen capture permission not granted".into()));
        }

        let id = format!("{SESSION_PREFIX}{:x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = Arc::new(StreamSession::new(id.clone(), config));
        session.mark_running();

        let (opened_tx, opened_rx) = std_mpsc::sync_channel::<Result<(), ScError>>(1);
        let backend = Arc::clone(&self.backend);
        let thread_session = Arc::clone(&session);
        let handle = std::thread::Builder::new()
            .name(format!("capture-{id}"))
            .spawn(move || {
                let capture = match backend.open(config.display_id, config.capture_cursor) {
                    Ok(capture) => {
                        let _ = opened_tx.send(Ok(()));
                        capture
                    }
                    Err(e) => {
                        let _ = opened_tx.send(Err(e));
                        return;
                    }
                };
                run_capture(thread_session, capture, |id, frame| sink.deliver(id, frame));
            })?;
        session.attach_thread(handle);

        let opened = opened_rx
            .recv()
            .unwrap_or_else(|_| Err(ScError::Capability("capture thread exited during startup".into())));
        if let Err(e) = opened {
            session.signal_stop();
            session.join();
            warn!(session = %id, "stream start failed: {e}");
            return Err(e);
        }

        lock(&self.sessions).insert(id.clone(), session);
        info!(session = %id, display = config.display_id, "stream started");
        Ok(id)
    }

    /// Stop one session. Unknown ids are ignored; returns whether a
    /// session was stopped.
    pub fn stop_stream(&self, id: &str) -> bool {
        let session = lock(&self.sessions).remove(id);
        match session {
            Some(session) => {
                session.signal_stop();
                session.join();
                info!(session = %id, "stream stopped");
                true
            }
            None => false,
        }
    }

    /// Signal every session, then join them all. Returns how many stopped.
    pub fn stop_all_streams(&self) -> usize {
        let sessions: Vec<Arc<StreamSession>> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.signal_stop();
        }
        for session in &sessions {
            session.join();
        }
        if !sessions.is_empty() {
            info!("stopped {} streams", sessions.len());
        }
        sessions.len()
    }

    pub fn update_config(&self, id: &str, config: StreamConfig) -> Result<(), ScError> {
        let session = self.session(id)?;
        if config.display_id != session.config().display_id {
            warn!(session = %id, "display change ignored for a running stream");
        }
        session.set_config(StreamConfig {
            display_id: session.config().display_id,
            ..config
        });
        Ok(())
    }

    pub fn request_refresh(&self, id: &str) -> Result<(), ScError> {
        self.session(id)?.request_refresh();
        Ok(())
    }

    pub fn get_stream_stats(&self, id: &str) -> Result<StreamStats, ScError> {
        Ok(self.session(id)?.stats())
    }

    pub fn active_sessions(&self) -> Vec<String> {
        lock(&self.sessions).keys().cloned().collect()
    }

    /// One JPEG of `display_id`, independent of any running session.
    pub fn capture_screenshot(&self, display_id: u32, quality: u8) -> Result<Screenshot, ScError> {
        if !self.backend.has_permission() {
            return Err(ScError::Capability("screen capture permission not granted".into()));
        }
        let mut capture = self.backend.open(display_id, true)?;
        let deadline = Instant::now() + SCREENSHOT_TIMEOUT;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ScError::Timeout(SCREENSHOT_TIMEOUT));
            }
            if let Some(frame) = capture.next_frame(remaining)? {
                let rgb = frame.region_rgb(0, 0, frame.width, frame.height);
                let data = encoder::jpeg(rgb, frame.width, frame.height, quality)?;
                return Ok(Screenshot {
                    width: frame.width,
                    height: frame.height,
                    format: "jpeg",
                    data,
                });
            }
        }
    }

    fn session(&self, id: &str) -> Result<Arc<StreamSession>, ScError> {
        lock(&self.sessions)
            .get(id)
            .cloned()
            .ok_or_else(|| ScError::SessionNotFound(id.to_string()))
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.stop_all_streams();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::capture::ScreenCapture;
    use crate::stream::types::{PixelFormat, RawScreenFrame};
    use crate::stream::wire::EncodedFrame;

    /// Serves the same frame forever.
    struct FakeCapture;

    impl ScreenCapture for FakeCapture {
        fn next_frame(&mut self, _timeout: Duration) -> Result<Option<RawScreenFrame>, ScError> {
            std::thread::sleep(Duration::from_millis(2));
            Ok(Some(RawScreenFrame::packed(
                64,
                64,
                PixelFormat::Bgra8,
                vec![0x40; 64 * 64 * 4],
            )))
        }
    }

    struct FakeBackend {
        permission: bool,
        fail_open: bool,
    }

    impl CaptureBackend for FakeBackend {
        fn displays(&self) -> Vec<DisplayInfo> {
            vec![DisplayInfo {
                id: 0,
                name: "fake".into(),
                width: 64,
                height: 64,
                is_primary: true,
                synthetic: false,
            }]
        }
        fn has_permission(&self) -> bool {
            self.permission
        }
        fn open(&self, _id: u32, _cursor: bool) -> Result<Box<dyn ScreenCapture>, ScError> {
            if self.fail_open {
                Err(ScError::Capability("no duplication".into()))
            } else {
                Ok(Box::new(FakeCapture))
            }
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<(String, Bytes)>>);

    impl FrameSink for Collect {
        fn deliver(&self, session_id: &str, frame: Bytes) {
            self.0.lock().unwrap().push((session_id.to_string(), frame));
        }
    }

    fn engine(permission: bool, fail_open: bool) -> StreamEngine {
        StreamEngine::new(Arc::new(FakeBackend {
            permission,
            fail_open,
        }))
    }

    fn fast() -> StreamConfig {
        StreamConfig {
            max_fps: 100,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn ids_are_unique_and_never_reused() {
        let engine = engine(true, false);
        let sink = Arc::new(Collect::default());
        let a = engine.start_stream(fast(), sink.clone()).unwrap();
        assert!(engine.stop_stream(&a));
        let b = engine.start_stream(fast(), sink.clone()).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(SESSION_PREFIX));
        assert_eq!(engine.active_sessions(), vec![b.clone()]);
        engine.stop_all_streams();
    }

    #[test]
    fn static_screen_emits_one_keyframe() {
        let engine = engine(true, false);
        let sink = Arc::new(Collect::default());
        let id = engine.start_stream(fast(), sink.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(150));

        let stats = engine.get_stream_stats(&id).unwrap();
        assert_eq!(stats.frames_encoded, 1);

        engine.request_refresh(&id).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        engine.stop_stream(&id);

        let frames = sink.0.lock().unwrap();
        assert_eq!(frames.len(), 2);
        for (sid, bytes) in frames.iter() {
            assert_eq!(sid, &id);
            assert!(EncodedFrame::decode(bytes).unwrap().is_keyframe());
        }
    }

    #[test]
    fn stop_is_idempotent_and_isolated() {
        let engine = engine(true, false);
        let sink = Arc::new(Collect::default());
        let a = engine.start_stream(fast(), sink.clone()).unwrap();
        let b = engine.start_stream(fast(), sink.clone()).unwrap();

        assert!(!engine.stop_stream("stream-ffff"));
        assert!(engine.stop_stream(&a));
        assert!(!engine.stop_stream(&a));
        assert!(engine.get_stream_stats(&b).is_ok());
        assert!(matches!(
            engine.get_stream_stats(&a),
            Err(ScError::SessionNotFound(_))
        ));
        assert_eq!(engine.stop_all_streams(), 1);
        assert_eq!(engine.stop_all_streams(), 0);
    }

    #[test]
    fn update_config_applies_in_place() {
        let engine = engine(true, false);
        let id = engine.start_stream(fast(), Arc::new(Collect::default())).unwrap();
        let new = StreamConfig {
            quality: 100,
            display_id: 3,
            ..fast()
        };
        engine.update_config(&id, new).unwrap();
        let stats = engine.get_stream_stats(&id).unwrap();
        assert_eq!(stats.config.quality, 100);
        assert_eq!(stats.config.display_id, 0);
        assert!(engine.update_config("nope", new).is_err());
        engine.stop_all_streams();
    }

    #[test]
    fn start_fails_without_permission_or_capture() {
        let sink: Arc<dyn FrameSink> = Arc::new(Collect::default());
        let denied = engine(false, false);
        assert!(matches!(
            denied.start_stream(fast(), sink.clone()),
            Err(ScError::Capability(_))
        ));

        let broken = engine(true, true);
        assert!(broken.start_stream(fast(), sink).is_err());
        assert!(broken.active_sessions().is_empty());
    }

    #[test]
    fn screenshot_is_jpeg() {
        let engine = engine(true, false);
        let shot = engine.capture_screenshot(0, 70).unwrap();
        assert_eq!((shot.width, shot.height), (64, 64));
        assert_eq!(&shot.data[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn channel_sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel::<(String, Bytes)>(1);
        tx.deliver("s", Bytes::from_static(b"1"));
        tx.deliver("s", Bytes::from_static(b"2"));
        assert_eq!(rx.recv().await.unwrap().1, Bytes::from_static(b"1"));
        assert!(rx.try_recv().is_err());
    }
}
