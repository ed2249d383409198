//! Routing of control-plane requests.
//!
//! GUI methods go to the tray app over the loopback bridge; everything
//! else is answered here. Whatever a handler does, the caller receives a
//! JSON value: the result, or `{"error": message}`.

pub mod bridge;
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::control::channel::CommandHandler;
use crate::error::ScError;
use crate::machine::MachineInfo;
use crate::stream::{FrameSink, StreamConfig, StreamEngine};
use crate::update::UpdateManager;

pub use bridge::{GuiBridge, TrayBridge};

/// Methods proxied to the tray app.
pub const GUI_METHODS: &[&str] = &[
    "click",
    "double_click",
    "right_click",
    "type_text",
    "press_key",
    "scroll",
    "move_mouse",
    "screenshot",
    "focus_window",
    "list_windows",
    "get_clipboard",
    "set_clipboard",
];

/// Methods handled in-process.
pub const LOCAL_METHODS: &[&str] = &[
    "ping",
    "tools_list",
    "system_info",
    "system_action",
    "shell_exec",
    "fs_list",
    "fs_read",
    "fs_write",
    "fs_copy",
    "fs_delete",
    "list_drives",
    "stream_displays",
    "stream_start",
    "stream_stop",
    "stream_configure",
    "stream_refresh",
    "stream_stats",
    "stream_screenshot",
    "update_status",
    "update_check",
    "update_download",
    "update_apply",
    "update_cancel",
    "tray_endpoint",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionArgs {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsArgs {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigureArgs {
    session_id: String,
    #[serde(default)]
    config: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ScreenshotArgs {
    display_id: u32,
    quality: u8,
}

impl Default for ScreenshotArgs {
    fn default() -> Self {
        Self {
            display_id: 0,
            quality: 80,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EndpointArgs {
    path: String,
    #[serde(default)]
    body: String,
}

pub struct CommandDispatcher {
    bridge: Arc<dyn GuiBridge>,
    engine: Arc<StreamEngine>,
    updates: Arc<UpdateManager>,
    sink: Arc<dyn FrameSink>,
    stream_defaults: StreamConfig,
    machine: MachineInfo,
    agent_version: String,
}

impl CommandDispatcher {
    pub fn new(
        bridge: Arc<dyn GuiBridge>,
        engine: Arc<StreamEngine>,
        updates: Arc<UpdateManager>,
        sink: Arc<dyn FrameSink>,
        machine: MachineInfo,
        agent_version: impl Into<String>,
    ) -> Self {
        Self {
            bridge,
            engine,
            updates,
            sink,
            stream_defaults: StreamConfig::default(),
            machine,
            agent_version: agent_version.into(),
        }
    }

    /// Base configuration that `stream_start` params are laid over.
    pub fn with_stream_defaults(mut self, defaults: StreamConfig) -> Self {
        self.stream_defaults = defaults;
        self
    }

    /// Run `method` and always produce a JSON value.
    pub async fn dispatch(&self, method: &str, params: Value) -> Value {
        match self.handle(method, params).await {
            Ok(value) => value,
            Err(message) => json!({ "error": message }),
        }
    }

    async fn route(&self, method: &str, params: Value) -> Result<Value, ScError> {
        use self::local::params as parse;

        if GUI_METHODS.contains(&method) {
            return self.bridge.call_tool(method, params).await;
        }

        match method {
            "ping" => Ok(json!({ "pong": true, "timestamp": Utc::now().timestamp_millis() })),
            "tools_list" => Ok(tools_list()),
            "system_info" => Ok(local::system_info(&self.machine, &self.agent_version)),
            "system_action" => local::system_action(parse(method, params)?),
            "shell_exec" => local::shell_exec(parse(method, params)?).await,
            "fs_list" => local::fs_list(parse(method, params)?).await,
            "fs_read" => local::fs_read(parse(method, params)?).await,
            "fs_write" => local::fs_write(parse(method, params)?).await,
            "fs_copy" => local::fs_copy(parse(method, params)?).await,
            "fs_delete" => local::fs_delete(parse(method, params)?).await,
            "list_drives" => Ok(local::list_drives()),

            "stream_displays" => {
                let engine = Arc::clone(&self.engine);
                let displays = blocking(move || Ok(engine.get_displays())).await?;
                Ok(json!({ "displays": displays }))
            }
            "stream_start" => {
                let patch: serde_json::Map<String, Value> = parse(method, params)?;
                let config = overlay(method, self.stream_defaults, patch)?;
                let engine = Arc::clone(&self.engine);
                let sink = Arc::clone(&self.sink);
                let id = blocking(move || engine.start_stream(config, sink)).await?;
                Ok(json!({ "sessionId": id, "config": config }))
            }
            "stream_stop" => {
                let args: SessionArgs = parse(method, params)?;
                let engine = Arc::clone(&self.engine);
                let id = args.session_id.clone();
                let stopped = blocking(move || Ok(engine.stop_stream(&id))).await?;
                Ok(json!({ "sessionId": args.session_id, "stopped": stopped }))
            }
            "stream_configure" => {
                let args: ConfigureArgs = parse(method, params)?;
                let current = self.engine.get_stream_stats(&args.session_id)?.config;
                let config = overlay(method, current, args.config)?;
                self.engine.update_config(&args.session_id, config)?;
                Ok(json!({ "sessionId": args.session_id, "config": config }))
            }
            "stream_refresh" => {
                let args: SessionArgs = parse(method, params)?;
                self.engine.request_refresh(&args.session_id)?;
                Ok(json!({ "sessionId": args.session_id, "refresh": true }))
            }
            "stream_stats" => {
                let args: StatsArgs = parse(method, params)?;
                match args.session_id {
                    Some(id) => Ok(serde_json::to_value(self.engine.get_stream_stats(&id)?)?),
                    None => {
                        let stats: Vec<_> = self
                            .engine
                            .active_sessions()
                            .iter()
                            .filter_map(|id| self.engine.get_stream_stats(id).ok())
                            .collect();
                        Ok(json!({ "sessions": stats }))
                    }
                }
            }
            "stream_screenshot" => {
                let args: ScreenshotArgs = parse(method, params)?;
                let engine = Arc::clone(&self.engine);
                let shot =
                    blocking(move || engine.capture_screenshot(args.display_id, args.quality)).await?;
                Ok(json!({
                    "width": shot.width,
                    "height": shot.height,
                    "format": shot.format,
                    "data": BASE64.encode(&shot.data),
                }))
            }

            "update_status" => Ok(serde_json::to_value(self.updates.state())?),
            "update_check" => {
                self.updates.check_for_update().await?;
                Ok(serde_json::to_value(self.updates.state())?)
            }
            "update_download" => {
                self.updates.start_download()?;
                Ok(json!({ "started": true }))
            }
            "update_apply" => {
                self.updates.start_apply()?;
                Ok(json!({ "started": true }))
            }
            "update_cancel" => Ok(json!({ "cancelled": self.updates.cancel_download() })),

            "tray_endpoint" => {
                let args: EndpointArgs = parse(method, params)?;
                let body = self.bridge.call_endpoint(&args.path, args.body).await?;
                Ok(json!({ "body": body }))
            }

            _ => Err(ScError::Dispatch(format!("Unknown method: {method}"))),
        }
    }
}

#[async_trait]
impl CommandHandler for CommandDispatcher {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, String> {
        debug!(%method, "dispatching");
        self.route(method, params).await.map_err(|e| {
            warn!(%method, "command failed: {e}");
            e.to_string()
        })
    }
}

/// `base` with the fields present in `patch` replaced.
fn overlay(
    method: &str,
    base: StreamConfig,
    patch: serde_json::Map<String, Value>,
) -> Result<StreamConfig, ScError> {
    let mut merged = serde_json::to_value(base)?;
    if let Some(fields) = merged.as_object_mut() {
        fields.extend(patch);
    }
    local::params(method, merged)
}

fn tools_list() -> Value {
    let gui = GUI_METHODS.iter().map(|m| json!({ "name": m, "kind": "gui" }));
    let local = LOCAL_METHODS.iter().map(|m| json!({ "name": m, "kind": "local" }));
    json!({ "tools": gui.chain(local).collect::<Vec<_>>() })
}

async fn blocking<T, F>(f: F) -> Result<T, ScError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ScError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ScError::Other(format!("worker task failed: {e}")))?
}
