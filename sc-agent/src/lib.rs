//! # sc-agent: ScreenControl Agent Service
//!
//! Long-running process that keeps a WebSocket control connection to the
//! ScreenControl control plane, executes the commands it receives,
//! streams the screen on request and installs agent updates.
//!
//! ## Modes
//!
//! - **Console**: Run in the foreground (default).
//! - **Service**: Run under the Windows SCM (`--service`); on Linux and
//!   macOS the console mode is run by systemd or launchd.
//! - **Install / Uninstall**: Register or remove the Windows service.

pub mod config;
pub mod logging;
pub mod service;

#[cfg(target_os = "windows")]
pub mod win_service;
