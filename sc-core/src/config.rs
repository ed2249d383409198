//! Persisted connection configuration.
//!
//! The connection file is written by the administration console / tray
//! app and only read here. When it is missing or carries no URL the agent
//! falls back to the URL from its general configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ScError;

/// Contents of the JSON connection file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    /// Control-plane WebSocket URL (`ws://` or `wss://`).
    pub server_url: Option<String>,
    /// Connect as soon as the agent starts.
    pub connect_on_startup: bool,
    /// Human-readable machine name override.
    pub agent_name: Option<String>,
    /// License identifier sent with `register`.
    pub license_id: Option<String>,
    /// Customer identifier sent with `register`.
    pub customer_id: Option<String>,
}

impl ConnectionConfig {
    /// Read the connection file. A missing file yields `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>, ScError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Pick the server URL: the connection file wins, then `fallback`.
    pub fn resolve_server_url(file: Option<&Self>, fallback: &str) -> Option<String> {
        file.and_then(|c| c.server_url.as_deref())
            .filter(|u| !u.trim().is_empty())
            .or(Some(fallback).filter(|u| !u.trim().is_empty()))
            .map(str::to_string)
    }
}

/// Derive the HTTP(S) base URL of the control plane from its WebSocket URL.
///
/// `wss://host:8443/ws/agent` becomes `https://host:8443`.
pub fn http_base_url(server_url: &str) -> Result<String, ScError> {
    let mut url = Url::parse(server_url)
        .map_err(|e| ScError::Other(format!("invalid server url {server_url}: {e}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => return Err(ScError::Other(format!("unsupported url scheme: {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| ScError::Other(format!("cannot rewrite scheme of {server_url}")))?;
    url.set_path("");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.as_str().trim_end_matches('/').to_string())
}
