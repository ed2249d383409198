//! Agent service core logic.
//!
//! Wires the control channel, dispatcher, streaming engine and update
//! manager together and runs the reconnect loop. Can run in either
//! console or Windows service mode.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use sc_core::stream::wire::tag_session;
use sc_core::update::{InstallLayout, Platform, ScriptInstaller};
use sc_core::{
    ChannelConfig, CommandDispatcher, ConnectionConfig, ControlChannel, ControlConnectionState,
    ControlEvent, HttpUpdateSource, MachineInfo, ReconnectBackoff, Registration, StreamEngine,
    TrayBridge, UpdateEvent, UpdateManager, http_base_url, platform_backend,
};

use crate::config::AgentConfig;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Why [`AgentService::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Stopped,
    /// An install script took over; the process must exit.
    UpdateHandedOff { version: String },
}

// ── AgentService ─────────────────────────────────────────────────

/// The top-level agent service.
///
/// Owns every component for one run and keeps the control connection
/// alive until stopped.
pub struct AgentService {
    config: AgentConfig,
    running: Arc<AtomicBool>,
}

impl AgentService {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task, a signal handler or the Windows SCM handler.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run until stopped or until an update is handed off.
    pub async fn run(&self) -> Result<RunOutcome, Box<dyn std::error::Error>> {
        self.running.store(true, Ordering::SeqCst);

        let connection = ConnectionConfig::load(&self.config.connection_file()).unwrap_or_else(|e| {
            warn!("unreadable connection file: {e}");
            None
        });
        let server_url =
            ConnectionConfig::resolve_server_url(connection.as_ref(), &self.config.server.url)
                .ok_or("no server URL configured")?;
        let connect_on_startup = connection
            .as_ref()
            .map_or(self.config.server.connect_on_startup, |c| c.connect_on_startup);
        info!(%server_url, connect_on_startup, "control plane");

        // ── Components ──────────────────────────────────────────
        let machine = MachineInfo::collect();
        let engine = Arc::new(StreamEngine::new(platform_backend()));
        let (frame_tx, frame_rx) = mpsc::channel::<(String, Bytes)>(self.config.streaming.frame_queue.max(1));

        let platform = Platform::current();
        let mut layout = InstallLayout::for_platform(platform);
        if let Ok(exe) = std::env::current_exe() {
            layout.binary_path = exe;
        }
        let (updates, update_rx) = UpdateManager::new(
            self.config.to_update_config(AGENT_VERSION)?,
            Arc::new(HttpUpdateSource::new(&http_base_url(&server_url)?, Duration::from_secs(30))?),
            Arc::new(ScriptInstaller::new(platform, layout)),
        );

        let dispatcher = CommandDispatcher::new(
            Arc::new(TrayBridge::new(self.config.bridge.port, self.config.bridge_timeout())),
            Arc::clone(&engine),
            Arc::clone(&updates),
            Arc::new(frame_tx),
            machine.clone(),
            AGENT_VERSION,
        )
        .with_stream_defaults(self.config.stream_defaults());

        let agent_name = connection
            .as_ref()
            .and_then(|c| c.agent_name.clone())
            .or_else(|| Some(self.config.server.agent_name.clone()).filter(|n| !n.is_empty()));
        let mut registration = Registration::from_machine(machine, agent_name, AGENT_VERSION);
        if let Some(c) = &connection {
            registration.license_id = c.license_id.clone();
            registration.customer_id = c.customer_id.clone();
        }

        let (channel, mut events) = ControlChannel::new(
            ControlConnectionState::new(&server_url, connect_on_startup),
            Arc::new(dispatcher),
        );
        let mut channel_config = ChannelConfig::new(&server_url, registration);
        channel_config.heartbeat_interval = self.config.heartbeat_interval();
        channel_config.handshake_timeout = self.config.handshake_timeout();

        let forwarder = tokio::spawn(forward_frames(channel.clone(), frame_rx));
        let handed_off = Arc::new(std::sync::Mutex::new(None));
        let update_watch = tokio::spawn(watch_updates(
            update_rx,
            Arc::clone(&self.running),
            Arc::clone(&handed_off),
        ));

        // ── Main loop ────────────────────────────────────────────
        if !connect_on_startup {
            info!("connect on startup disabled; idle until stopped");
            wait_for_stop(&self.running).await;
        }

        let mut backoff = ReconnectBackoff::new();
        let mut attempted = false;
        while self.is_running() {
            if channel.is_connected() {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => self.on_control_event(event, &updates),
                        None => break,
                    },
                    _ = wait_for_stop(&self.running) => break,
                }
                continue;
            }

            if !attempted {
                attempted = true;
                if let Err(e) = channel.connect(channel_config.clone()).await {
                    warn!("connect failed: {e}");
                }
                continue;
            }

            let delay = backoff.current_delay();
            info!(attempt = backoff.attempt() + 1, ?delay, "reconnecting");
            if !sleep_unless_stopped(&self.running, delay).await {
                break;
            }
            backoff.record_failure();
            channel.set_reconnect_attempts(backoff.attempt());
            if channel.reconnect().await {
                backoff.reset();
                channel.set_reconnect_attempts(0);
            }
        }

        // ── Shutdown ─────────────────────────────────────────────
        info!("shutting down");
        self.running.store(false, Ordering::SeqCst);
        channel.disconnect();
        let stopped = tokio::task::spawn_blocking(move || engine.stop_all_streams())
            .await
            .unwrap_or(0);
        if stopped > 0 {
            info!("stopped {stopped} stream session(s)");
        }
        forwarder.abort();
        update_watch.abort();

        let outcome = match handed_off.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        Ok(match outcome {
            Some(version) => RunOutcome::UpdateHandedOff { version },
            None => RunOutcome::Stopped,
        })
    }

    fn on_control_event(&self, event: ControlEvent, updates: &Arc<UpdateManager>) {
        match event {
            ControlEvent::Connectivity(true) => info!("control channel up"),
            ControlEvent::Connectivity(false) => warn!("control channel down"),
            ControlEvent::Status {
                agent_id,
                license_status,
            } => info!(%agent_id, license = %license_status, "status"),
            ControlEvent::Heartbeat(flag) => {
                if self.config.update.enabled && updates.on_heartbeat(flag) {
                    debug!(?flag, "update cycle started");
                }
            }
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────

/// Send session frames as binary messages while connected.
async fn forward_frames(channel: ControlChannel, mut frames: mpsc::Receiver<(String, Bytes)>) {
    while let Some((session, frame)) = frames.recv().await {
        if !channel.is_connected() {
            continue;
        }
        match tag_session(&session, &frame) {
            Ok(message) => {
                if let Err(e) = channel.try_send_binary(message) {
                    debug!(%session, "frame dropped: {e}");
                }
            }
            Err(e) => warn!(%session, "cannot tag frame: {e}"),
        }
    }
}

/// Log update progress; stop the service on hand-off.
async fn watch_updates(
    mut events: mpsc::UnboundedReceiver<UpdateEvent>,
    running: Arc<AtomicBool>,
    handed_off: Arc<std::sync::Mutex<Option<String>>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            UpdateEvent::StatusChanged(status) => debug!(%status, "update status"),
            UpdateEvent::Progress { downloaded, total } => debug!(downloaded, total, "update download"),
            UpdateEvent::HandedOff { version } => {
                info!(%version, "update handed off; exiting");
                match handed_off.lock() {
                    Ok(mut slot) => *slot = Some(version),
                    Err(e) => error!("hand-off state poisoned: {e}"),
                }
                running.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
}

/// Resolves when `running` becomes false.
async fn wait_for_stop(running: &Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Sleep for `delay`; returns `false` if stopped first.
async fn sleep_unless_stopped(running: &Arc<AtomicBool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => running.load(Ordering::SeqCst),
        _ = wait_for_stop(running) => false,
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_handle_works() {
        let svc = AgentService::new(AgentConfig::default());
        assert!(!svc.is_running());
        svc.stop_handle().store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn run_without_server_url_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.server.connection_file = dir.path().join("none.json").display().to_string();
        let err = AgentService::new(config).run().await.unwrap_err();
        assert_eq!(err.to_string(), "no server URL configured");
    }

    #[tokio::test]
    async fn stop_interrupts_backoff_sleep() {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(false, Ordering::SeqCst);
        });
        assert!(!sleep_unless_stopped(&running, Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn hand_off_stops_the_service() {
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let slot = Arc::new(std::sync::Mutex::new(None));
        tx.send(UpdateEvent::HandedOff {
            version: "2.0.0".into(),
        })
        .unwrap();
        watch_updates(rx, Arc::clone(&running), Arc::clone(&slot)).await;
        assert!(!running.load(Ordering::SeqCst));
        assert_eq!(slot.lock().unwrap().as_deref(), Some("2.0.0"));
    }
}
