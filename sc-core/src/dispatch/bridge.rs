//! Loopback RPC to the GUI-bridge companion (the tray app).
//!
//! The agent runs as a service without access to the interactive desktop,
//! so GUI-affecting commands are POSTed to the tray app on a fixed local
//! port. Any transport failure or non-200 status reads as "unavailable".

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ScError;

/// Default loopback port of the tray app.
pub const DEFAULT_BRIDGE_PORT: u16 = 3459;

pub const TRAY_UNAVAILABLE: &str = "Tray app unavailable";
pub const TRAY_INVALID_RESPONSE: &str = "Invalid response from tray app";

#[async_trait]
pub trait GuiBridge: Send + Sync {
    /// Tool-style call: `{method, params}` in, JSON out.
    async fn call_tool(&self, method: &str, params: Value) -> Result<Value, ScError>;

    /// Endpoint-style call: `body` forwarded verbatim to `path`, reply
    /// returned verbatim.
    async fn call_endpoint(&self, path: &str, body: String) -> Result<String, ScError>;
}

/// HTTP client for the tray app on `127.0.0.1`.
#[derive(Debug, Clone)]
pub struct TrayBridge {
    client: Client,
    base_url: String,
}

impl TrayBridge {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self::with_base_url(&format!("http://127.0.0.1:{port}"), timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post(&self, path: &str, request: reqwest::RequestBuilder) -> Result<String, ScError> {
        let resp = request.send().await.map_err(|e| {
            debug!("tray bridge {path} unreachable: {e}");
            ScError::Dispatch(TRAY_UNAVAILABLE.into())
        })?;
        if resp.status() != StatusCode::OK {
            debug!("tray bridge {path} returned {}", resp.status());
            return Err(ScError::Dispatch(TRAY_UNAVAILABLE.into()));
        }
        resp.text()
            .await
            .map_err(|_| ScError::Dispatch(TRAY_UNAVAILABLE.into()))
    }
}

#[async_trait]
impl GuiBridge for TrayBridge {
    async fn call_tool(&self, method: &str, params: Value) -> Result<Value, ScError> {
        let url = format!("{}/tool", self.base_url);
        let request = self.client.post(&url).json(&json!({ "method": method, "params": params }));
        let body = self.post("/tool", request).await?;

        let value: Value =
            serde_json::from_str(&body).map_err(|_| ScError::Dispatch(TRAY_INVALID_RESPONSE.into()))?;
        // The tray reports handler failures in-band.
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            return Err(ScError::Dispatch(error.to_string()));
        }
        Ok(value)
    }

    async fn call_endpoint(&self, path: &str, body: String) -> Result<String, ScError> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        self.post(&path, request).await
    }
}
