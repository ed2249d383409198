//! Screen streaming.
//!
//! ```text
//! CaptureBackend::open ─► ScreenCapture ─► DeltaDetector ─► FrameEncoder
//!        (per session, own thread)                              │
//!                                          FrameSink ◄─ EncodedFrame::encode
//! ```
//!
//! | Module    | Purpose                                              |
//! |-----------|------------------------------------------------------|
//! | `types`   | Raw frames, pixel formats, display descriptors       |
//! | `capture` | Capture capability traits, DXGI and headless backends |
//! | `delta`   | Tile-level change detection                          |
//! | `encoder` | JPEG / zstd / raw rectangle encoding                 |
//! | `pointer` | Drawing the mouse pointer into captured frames       |
//! | `wire`    | Binary frame format and stream codec                 |
//! | `session` | Per-session config, counters and capture loop        |
//! | `engine`  | Session registry, screenshots                        |

pub mod capture;
pub mod delta;
pub mod encoder;
pub mod engine;
pub mod pointer;
pub mod session;
pub mod types;
pub mod wire;

pub use capture::{CaptureBackend, HeadlessBackend, ScreenCapture, platform_backend};
pub use delta::{Block, DeltaDetector, DeltaFrame};
pub use encoder::{EncoderSettings, EncoderStats, FrameEncoder};
pub use engine::{FrameSink, Screenshot, StreamEngine};
pub use session::{SessionState, StreamConfig, StreamSession, StreamStats};
pub use types::{DisplayInfo, PixelFormat, RawScreenFrame};
pub use wire::{EncodedFrame, EncodingTag, FrameCodec, FrameRect, RectFlags};
