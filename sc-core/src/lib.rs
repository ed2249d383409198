//! # sc-core
//!
//! Core library of the ScreenControl agent.
//!
//! This crate contains:
//! - **Control channel**: `ControlChannel` WebSocket client with registration,
//!   heartbeats, request handling and `ReconnectBackoff`
//! - **Dispatch**: `CommandDispatcher` routing requests to local handlers or
//!   the tray app's `GuiBridge`
//! - **Streaming**: `StreamEngine` capture sessions, delta detection, frame
//!   encoding and the binary `FrameCodec`
//! - **Update**: `UpdateManager` state machine with verified downloads and
//!   script-based installation
//! - **Error**: `ScError`, the `thiserror`-based error type used everywhere

pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod machine;
pub mod schedule;
pub mod stream;
pub mod task;
pub mod update;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use config::{ConnectionConfig, http_base_url};
pub use control::{
    ChannelConfig, CommandHandler, ConnectionPhase, ControlChannel, ControlConnectionState,
    ControlEvent, ControlMessage, ReconnectBackoff, Registration, UpdateFlag, reconnect_delay,
};
pub use dispatch::{CommandDispatcher, GuiBridge, TrayBridge};
pub use error::ScError;
pub use machine::MachineInfo;
pub use schedule::CronSchedule;
pub use stream::{
    CaptureBackend, DisplayInfo, EncodedFrame, FrameCodec, FrameSink, StreamConfig, StreamEngine,
    StreamStats, platform_backend,
};
pub use task::RequestPool;
pub use update::{
    HttpUpdateSource, InstallLayout, Installer, Platform, ScriptInstaller, UpdateConfig,
    UpdateEvent, UpdateManager, UpdateStatus,
};
