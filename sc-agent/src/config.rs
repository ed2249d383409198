//! Configuration for the agent service.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sc_core::schedule::CronSchedule;
use sc_core::stream::StreamConfig;
use sc_core::update::{Platform, UpdateConfig};
use sc_core::ScError;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub streaming: StreamingConfig,
    pub update: UpdateSection,
    pub bridge: BridgeConfig,
    pub logging: LoggingConfig,
}

/// Control-plane connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Fallback WebSocket URL when the connection file has none.
    pub url: String,
    /// JSON connection file written by the tray app / console.
    pub connection_file: String,
    /// Used when the connection file does not say.
    pub connect_on_startup: bool,
    /// Overrides the hostname as machine name.
    pub agent_name: String,
    pub heartbeat_interval_secs: u64,
    pub handshake_timeout_secs: u64,
}

/// Defaults for `stream_start` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub max_fps: u32,
    pub quality: u8,
    pub use_delta: bool,
    pub use_lossy: bool,
    pub capture_cursor: bool,
    /// Frames buffered between capture threads and the socket.
    pub frame_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSection {
    pub enabled: bool,
    pub channel: String,
    pub check_interval_heartbeats: u32,
    pub failure_cooldown_secs: u64,
    pub auto_install: bool,
    /// Five-field cron expression; empty means any time.
    pub install_window: String,
    /// Empty means the platform default.
    pub staging_dir: String,
}

/// Loopback bridge to the tray app.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub port: u16,
    pub timeout_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connection_file: default_connection_file(),
            connect_on_startup: true,
            agent_name: String::new(),
            heartbeat_interval_secs: 30,
            handshake_timeout_secs: 15,
        }
    }
}

fn default_connection_file() -> String {
    match Platform::current() {
        Platform::Windows => r"C:\ProgramData\ScreenControl\connection.json",
        Platform::MacOs => "/Library/Application Support/ScreenControl/connection.json",
        Platform::Linux => "/etc/screencontrol/connection.json",
    }
    .into()
}

impl Default for StreamingConfig {
    fn default() -> Self {
        let stream = StreamConfig::default();
        Self {
            max_fps: stream.max_fps,
            quality: stream.quality,
            use_delta: stream.use_delta,
            use_lossy: stream.use_lossy,
            capture_cursor: stream.capture_cursor,
            frame_queue: 32,
        }
    }
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: "stable".into(),
            check_interval_heartbeats: 60,
            failure_cooldown_secs: 600,
            auto_install: true,
            install_window: String::new(),
            staging_dir: String::new(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: sc_core::dispatch::bridge::DEFAULT_BRIDGE_PORT,
            timeout_secs: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl AgentConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn connection_file(&self) -> PathBuf {
        PathBuf::from(&self.server.connection_file)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.server.heartbeat_interval_secs.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.server.handshake_timeout_secs.max(1))
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.timeout_secs.max(1))
    }

    pub fn stream_defaults(&self) -> StreamConfig {
        StreamConfig {
            display_id: 0,
            max_fps: self.streaming.max_fps,
            quality: self.streaming.quality.min(100),
            use_delta: self.streaming.use_delta,
            use_lossy: self.streaming.use_lossy,
            capture_cursor: self.streaming.capture_cursor,
        }
    }

    /// Build the update manager configuration. Fails on a bad install
    /// window expression.
    pub fn to_update_config(&self, current_version: &str) -> Result<UpdateConfig, ScError> {
        let mut config = UpdateConfig::new(current_version);
        config.channel = self.update.channel.clone();
        config.check_interval_heartbeats = self.update.check_interval_heartbeats.max(1);
        config.failure_cooldown = Duration::from_secs(self.update.failure_cooldown_secs);
        config.auto_install = self.update.auto_install;
        if !self.update.install_window.trim().is_empty() {
            config.install_window = Some(CronSchedule::parse(&self.update.install_window)?);
        }
        if !self.update.staging_dir.trim().is_empty() {
            config.staging_dir = PathBuf::from(&self.update.staging_dir);
        }
        Ok(config)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes_every_section() {
        let text = toml::to_string_pretty(&AgentConfig::default()).unwrap();
        for section in ["[server]", "[streaming]", "[update]", "[bridge]", "[logging]"] {
            assert!(text.contains(section), "missing {section}");
        }
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: AgentConfig = toml::from_str(
            r#"
            [server]
            url = "wss://cp.example.com/ws"

            [update]
            auto_install = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.url, "wss://cp.example.com/ws");
        assert_eq!(cfg.server.heartbeat_interval_secs, 30);
        assert!(!cfg.update.auto_install);
        assert_eq!(cfg.update.check_interval_heartbeats, 60);
        assert_eq!(cfg.bridge.port, 3459);
    }

    #[test]
    fn update_config_parses_window() {
        let mut cfg = AgentConfig::default();
        cfg.update.install_window = "0 2 * * 1-5".into();
        cfg.update.staging_dir = "/tmp/sc-updates".into();
        let update = cfg.to_update_config("1.2.3").unwrap();
        assert!(update.install_window.is_some());
        assert_eq!(update.staging_dir, PathBuf::from("/tmp/sc-updates"));
        assert_eq!(update.failure_cooldown, Duration::from_secs(600));

        cfg.update.install_window = "not cron".into();
        assert!(cfg.to_update_config("1.2.3").is_err());
    }

    #[test]
    fn missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AgentConfig::load(&dir.path().join("absent.toml"));
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn stream_defaults_clamp_quality() {
        let mut cfg = AgentConfig::default();
        cfg.streaming.quality = 200;
        assert_eq!(cfg.stream_defaults().quality, 100);
    }
}
