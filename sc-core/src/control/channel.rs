//! The control channel: one logical connection to the control plane.
//!
//! A live connection is three Tokio tasks sharing one cancellation token:
//!
//! - **writer**: drains the outbound queue into the WebSocket and emits a
//!   transport-level ping frame every `ping_interval`;
//! - **reader**: parses inbound envelopes, spawns request handlers on the
//!   [`RequestPool`] and forwards acknowledgements as [`ControlEvent`]s;
//! - **heartbeat**: sends `heartbeat` and application `ping` messages, one
//!   at a time.
//!
//! Any transport error tears the link down and emits
//! `ControlEvent::Connectivity(false)`. Retrying is the caller's job.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::message::{ControlMessage, Registration, ServerConfig, UpdateFlag};
use crate::control::state::ControlConnectionState;
use crate::error::ScError;
use crate::machine;
use crate::task::RequestPool;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Outbound queue depth per connection.
const OUTBOUND_CAPACITY: usize = 256;

// ── Public types ─────────────────────────────────────────────────

/// Parameters for [`ControlChannel::connect`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// `ws://` or `wss://` URL of the control plane.
    pub server_url: String,
    /// Sent once per connection as `register`.
    pub registration: Registration,
    /// Period of `heartbeat` messages (the server may override it).
    pub heartbeat_interval: Duration,
    /// Period of WebSocket ping frames.
    pub ping_interval: Duration,
    /// Period of application-level `ping` messages.
    pub keepalive_interval: Duration,
    /// Deadline for opening the transport and receiving `registered`.
    pub handshake_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(server_url: impl Into<String>, registration: Registration) -> Self {
        Self {
            server_url: server_url.into(),
            registration,
            heartbeat_interval: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(45),
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

/// Notifications emitted by the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// The connection went up (`true`) or down (`false`).
    Connectivity(bool),
    /// Registration or license status changed.
    Status {
        agent_id: String,
        license_status: String,
    },
    /// Update hint from a `heartbeat_ack`; one event per acknowledgement.
    Heartbeat(UpdateFlag),
}

/// Resolves inbound requests. Implemented by the command dispatcher.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle `method`; `Err` carries the message for the `error` field.
    async fn handle(&self, method: &str, params: Value) -> Result<Value, String>;
}

// ── ControlChannel ───────────────────────────────────────────────

/// Cheaply cloneable handle to the process-wide control connection.
#[derive(Clone)]
pub struct ControlChannel {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<ControlConnectionState>,
    connected: AtomicBool,
    link: Mutex<Option<Link>>,
    last_config: Mutex<Option<ChannelConfig>>,
    generation: AtomicU64,
    handler: Arc<dyn CommandHandler>,
    events: mpsc::UnboundedSender<ControlEvent>,
    requests: RequestPool,
}

struct Link {
    generation: u64,
    outbound: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
}

impl ControlChannel {
    /// Create a disconnected channel. Events are delivered on the returned
    /// receiver for the lifetime of the channel.
    pub fn new(
        state: ControlConnectionState,
        handler: Arc<dyn CommandHandler>,
    ) -> (Self, mpsc::UnboundedReceiver<ControlEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let channel = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                connected: AtomicBool::new(false),
                link: Mutex::new(None),
                last_config: Mutex::new(None),
                generation: AtomicU64::new(0),
                handler,
                events,
                requests: RequestPool::new(),
            }),
        };
        (channel, events_rx)
    }

    /// Non-blocking status read.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Snapshot of the connection state.
    pub fn state(&self) -> ControlConnectionState {
        lock(&self.shared.state).clone()
    }

    /// Store the main loop's reconnect counter for status reporting.
    pub fn set_reconnect_attempts(&self, attempts: u32) {
        lock(&self.shared.state).reconnect_attempts = attempts;
    }

    /// Number of request handlers still running.
    pub fn in_flight_requests(&self) -> usize {
        self.shared.requests.len()
    }

    /// Open the transport, register, and start the connection tasks.
    ///
    /// Fails with a transport error if the server cannot be reached and
    /// with a protocol error if the first reply is not `registered`.
    pub async fn connect(&self, config: ChannelConfig) -> Result<(), ScError> {
        // A fresh connect replaces any previous link.
        self.disconnect();
        *lock(&self.shared.last_config) = Some(config.clone());
        {
            let mut state = lock(&self.shared.state);
            state.server_url = config.server_url.clone();
            state.phase.force_disconnect();
            state.phase.begin_connect()?;
        }

        match self.handshake(&config).await {
            Ok((ws, agent_id, license_status, server_config)) => {
                self.start_link(ws, &config, agent_id, license_status, server_config)
            }
            Err(e) => {
                lock(&self.shared.state).mark_disconnected();
                Err(e)
            }
        }
    }

    /// Re-run [`connect`](Self::connect) with the last configuration.
    pub async fn reconnect(&self) -> bool {
        let config = lock(&self.shared.last_config).clone();
        let Some(config) = config else {
            warn!("reconnect requested before any connect");
            return false;
        };
        match self.connect(config).await {
            Ok(()) => true,
            Err(e) => {
                warn!("reconnect failed: {e}");
                false
            }
        }
    }

    /// Tear the connection down. Idempotent and non-blocking: it only
    /// flips flags and cancels tasks, which finish on their own.
    pub fn disconnect(&self) {
        let link = lock(&self.shared.link).take();
        if let Some(link) = link {
            info!("disconnecting from control plane");
            self.shared.teardown(link);
        }
    }

    /// Queue a text message on the live connection.
    pub async fn send(&self, message: &ControlMessage) -> Result<(), ScError> {
        let outbound = self.outbound()?;
        outbound.send(WsMessage::Text(message.to_json()?)).await?;
        Ok(())
    }

    /// Queue a binary message without waiting; dropped when the queue is
    /// full. Safe to call from non-async threads.
    pub fn try_send_binary(&self, data: Vec<u8>) -> Result<(), ScError> {
        let outbound = self.outbound()?;
        outbound.try_send(WsMessage::Binary(data)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ScError::Transport("outbound queue full".into()),
            mpsc::error::TrySendError::Closed(_) => ScError::ChannelClosed,
        })
    }

    // ── Internal ─────────────────────────────────────────────────

    fn outbound(&self) -> Result<mpsc::Sender<WsMessage>, ScError> {
        lock(&self.shared.link)
            .as_ref()
            .map(|l| l.outbound.clone())
            .ok_or_else(|| ScError::Transport("not connected".into()))
    }

    async fn handshake(
        &self,
        config: &ChannelConfig,
    ) -> Result<(WsStream, String, String, Option<ServerConfig>), ScError> {
        let deadline = Instant::now() + config.handshake_timeout;

        let (mut ws, _) = tokio::time::timeout_at(deadline, connect_async(config.server_url.as_str()))
            .await
            .map_err(|_| ScError::Timeout(config.handshake_timeout))?
            .map_err(|e| ScError::Transport(format!("connect {}: {e}", config.server_url)))?;

        lock(&self.shared.state).phase.begin_register()?;
        let register = ControlMessage::Register(config.registration.clone());
        ws.send(WsMessage::Text(register.to_json()?)).await?;
        debug!("register sent");

        loop {
            let next = tokio::time::timeout_at(deadline, ws.next())
                .await
                .map_err(|_| ScError::Timeout(config.handshake_timeout))?;
            match next {
                None | Some(Ok(WsMessage::Close(_))) => {
                    return Err(ScError::Transport("closed during registration".into()));
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(WsMessage::Text(text))) => {
                    return match ControlMessage::parse(&text)? {
                        ControlMessage::Registered {
                            agent_id,
                            license_status,
                            config,
                        } => Ok((ws, agent_id, license_status, config)),
                        other => {
                            let _ = ws.close(None).await;
                            Err(ScError::Protocol(format!(
                                "expected registered, got {}",
                                other.kind()
                            )))
                        }
                    };
                }
                // Transport pings and stray binary frames do not count.
                Some(Ok(_)) => continue,
            }
        }
    }

    fn start_link(
        &self,
        ws: WsStream,
        config: &ChannelConfig,
        agent_id: String,
        license_status: String,
        server_config: Option<ServerConfig>,
    ) -> Result<(), ScError> {
        let heartbeat_interval = server_config
            .and_then(|c| c.heartbeat_interval)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(config.heartbeat_interval);

        {
            let mut state = lock(&self.shared.state);
            state.phase.complete_register()?;
            state.mark_registered(agent_id.clone(), license_status.clone());
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let cancel = CancellationToken::new();
        let (sink, source) = ws.split();

        tokio::spawn(writer_task(
            Arc::clone(&self.shared),
            generation,
            sink,
            outbound_rx,
            config.ping_interval,
            cancel.clone(),
        ));
        tokio::spawn(reader_task(
            Arc::clone(&self.shared),
            generation,
            source,
            outbound.clone(),
            cancel.clone(),
        ));
        tokio::spawn(heartbeat_task(
            heartbeat_interval,
            config.keepalive_interval,
            outbound.clone(),
            cancel.clone(),
        ));

        *lock(&self.shared.link) = Some(Link {
            generation,
            outbound,
            cancel,
        });
        self.shared.connected.store(true, Ordering::SeqCst);

        info!(agent_id = %agent_id, license = %license_status, "registered with control plane");
        self.shared.emit(ControlEvent::Connectivity(true));
        self.shared.emit(ControlEvent::Status {
            agent_id,
            license_status,
        });
        Ok(())
    }
}

impl Shared {
    fn emit(&self, event: ControlEvent) {
        let _ = self.events.send(event);
    }

    /// Drop the link of `generation` if it is still the current one.
    fn link_lost(&self, generation: u64, reason: &str) {
        let link = {
            let mut guard = lock(&self.link);
            match guard.as_ref() {
                Some(l) if l.generation == generation => guard.take(),
                _ => None,
            }
        };
        if let Some(link) = link {
            warn!("control connection lost: {reason}");
            self.teardown(link);
        }
    }

    fn teardown(&self, link: Link) {
        link.cancel.cancel();
        let aborted = self.requests.abort_all();
        if aborted > 0 {
            debug!("aborted {aborted} in-flight requests");
        }
        lock(&self.state).mark_disconnected();
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(ControlEvent::Connectivity(false));
        }
    }

    fn handle_text(self: &Arc<Self>, text: &str, outbound: &mpsc::Sender<WsMessage>) {
        let message = match ControlMessage::parse(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("dropping inbound message: {e}");
                return;
            }
        };

        match message {
            ControlMessage::HeartbeatAck {
                license_status,
                update_flag,
            } => {
                self.refresh_license(license_status);
                self.emit(ControlEvent::Heartbeat(UpdateFlag::from_wire(update_flag)));
            }
            ControlMessage::Request { id, method, params } => {
                debug!(request = %id, method = %method, "request received");
                let handler = Arc::clone(&self.handler);
                let outbound = outbound.clone();
                let request_id = id.clone();
                self.requests.spawn(id, async move {
                    let outcome = handler.handle(&method, params).await;
                    if let Err(e) = &outcome {
                        debug!(request = %request_id, "request failed: {e}");
                    }
                    let reply = ControlMessage::response(request_id.clone(), outcome);
                    match reply.to_json() {
                        Ok(text) => {
                            if outbound.send(WsMessage::Text(text)).await.is_err() {
                                debug!(request = %request_id, "connection gone before response");
                            }
                        }
                        Err(e) => warn!(request = %request_id, "cannot encode response: {e}"),
                    }
                });
            }
            ControlMessage::Ping { timestamp } => {
                let pong = ControlMessage::Pong { timestamp };
                if let Ok(text) = pong.to_json() {
                    let _ = outbound.try_send(WsMessage::Text(text));
                }
            }
            ControlMessage::Pong { .. } => debug!("pong received"),
            ControlMessage::Registered {
                agent_id,
                license_status,
                ..
            } => {
                lock(&self.state).mark_registered(agent_id.clone(), license_status.clone());
                self.emit(ControlEvent::Status {
                    agent_id,
                    license_status,
                });
            }
            other => warn!("unexpected {} message from server", other.kind()),
        }
    }

    fn refresh_license(&self, license_status: String) {
        if license_status.is_empty() {
            return;
        }
        let changed = {
            let mut state = lock(&self.state);
            if state.license_status == license_status {
                None
            } else {
                state.license_status = license_status.clone();
                Some(state.agent_id.clone().unwrap_or_default())
            }
        };
        if let Some(agent_id) = changed {
            info!(license = %license_status, "license status changed");
            self.emit(ControlEvent::Status {
                agent_id,
                license_status,
            });
        }
    }
}

// ── Connection tasks ─────────────────────────────────────────────

async fn writer_task(
    shared: Arc<Shared>,
    generation: u64,
    mut sink: WsSink,
    mut outbound_rx: mpsc::Receiver<WsMessage>,
    ping_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
            msg = outbound_rx.recv() => match msg {
                Some(msg) => sink.send(msg).await,
                None => break,
            },
            _ = ping.tick() => sink.send(WsMessage::Ping(Vec::new())).await,
        };
        if let Err(e) = result {
            shared.link_lost(generation, &format!("write failed: {e}"));
            break;
        }
    }
}

async fn reader_task(
    shared: Arc<Shared>,
    generation: u64,
    mut source: WsSource,
    outbound: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = source.next() => next,
        };
        match next {
            Some(Ok(WsMessage::Text(text))) => shared.handle_text(&text, &outbound),
            Some(Ok(WsMessage::Close(_))) | None => {
                shared.link_lost(generation, "closed by server");
                break;
            }
            Some(Ok(WsMessage::Binary(data))) => {
                debug!("ignoring {} byte binary message", data.len());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                shared.link_lost(generation, &format!("read failed: {e}"));
                break;
            }
        }
    }
}

async fn heartbeat_task(
    heartbeat_interval: Duration,
    keepalive_interval: Duration,
    outbound: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    let mut keepalive =
        tokio::time::interval_at(Instant::now() + keepalive_interval, keepalive_interval);
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = heartbeat.tick() => {
                let sensors = tokio::task::spawn_blocking(|| {
                    (machine::power_state(), machine::is_screen_locked())
                })
                .await;
                let (power_state, is_screen_locked) = sensors.unwrap_or(("unknown", false));
                ControlMessage::Heartbeat {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    power_state: power_state.to_string(),
                    is_screen_locked,
                }
            }
            _ = keepalive.tick() => ControlMessage::Ping {
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        };
        let Ok(text) = message.to_json() else { continue };
        if outbound.send(WsMessage::Text(text)).await.is_err() {
            break;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::message::FingerprintWire;

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        async fn handle(&self, method: &str, params: Value) -> Result<Value, String> {
            Ok(serde_json::json!({ "method": method, "params": params }))
        }
    }

    fn registration() -> Registration {
        Registration {
            machine_id: "m".into(),
            machine_name: "n".into(),
            os_type: "linux".into(),
            os_version: "6".into(),
            arch: "x86_64".into(),
            agent_version: "0.0.0".into(),
            license_id: None,
            customer_id: None,
            fingerprint: FingerprintWire {
                hostname: "h".into(),
                cpu_model: "c".into(),
                mac_addresses: vec![],
            },
        }
    }

    #[tokio::test]
    async fn disconnect_twice_is_safe() {
        let (channel, mut events) =
            ControlChannel::new(ControlConnectionState::default(), Arc::new(Echo));
        channel.disconnect();
        channel.disconnect();
        assert!(!channel.is_connected());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn reconnect_without_config_is_false() {
        let (channel, _events) =
            ControlChannel::new(ControlConnectionState::default(), Arc::new(Echo));
        assert!(!channel.reconnect().await);
    }

    #[tokio::test]
    async fn connect_refused_is_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let (channel, _events) =
            ControlChannel::new(ControlConnectionState::default(), Arc::new(Echo));
        let mut config = ChannelConfig::new(format!("ws://127.0.0.1:{port}/ws"), registration());
        config.handshake_timeout = Duration::from_secs(2);
        let err = channel.connect(config).await.unwrap_err();
        assert!(err.is_transport(), "unexpected {err:?}");
        assert!(!channel.is_connected());
        assert!(channel.state().phase.is_disconnected());
        assert!(channel.try_send_binary(vec![1]).is_err());
    }
}
