//! Domain-specific error types for the ScreenControl agent.
//!
//! All fallible operations return `Result<T, ScError>`.
//! Variants are grouped by the failure class that decides how the caller
//! reacts: transport failures feed the reconnect loop, capability failures
//! surface as an empty result, verification/installation failures move the
//! update state machine to `Failed`, and dispatch failures become a
//! structured `{error}` response.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the agent core.
#[derive(Debug, Error)]
pub enum ScError {
    // ── Transport Errors ─────────────────────────────────────────
    /// The control-plane connection could not be opened or was dropped.
    #[error("transport error: {0}")]
    Transport(String),

    /// The TCP/IO layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An HTTP request (manifest, download, tray bridge) failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Protocol Errors ──────────────────────────────────────────
    /// A message violated the control protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A binary frame failed validation.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Capability Errors ────────────────────────────────────────
    /// Screen capture is not permitted or not supported here.
    #[error("capability unavailable: {0}")]
    Capability(String),

    /// Frame encoding failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// No stream session exists for the given identifier.
    #[error("unknown stream session: {0}")]
    SessionNotFound(String),

    // ── Update Errors ────────────────────────────────────────────
    /// The downloaded package does not match the manifest.
    #[error("verification failed: {0}")]
    Verification(String),

    /// The platform installer could not hand off the update.
    #[error("installation failed: {0}")]
    Installation(String),

    /// The update manager is not in a state that allows the operation.
    #[error("invalid update state: {0}")]
    InvalidState(String),

    /// The download was cancelled by the caller.
    #[error("download cancelled")]
    Cancelled,

    // ── Dispatch Errors ──────────────────────────────────────────
    /// A command could not be resolved or its handler failed.
    #[error("{0}")]
    Dispatch(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl ScError {
    /// Returns `true` for failures that should feed the reconnect loop.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ScError::Transport(_) | ScError::Io(_) | ScError::ChannelClosed | ScError::Timeout(_)
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for ScError {
    fn from(s: String) -> Self {
        ScError::Other(s)
    }
}

impl From<&str> for ScError {
    fn from(s: &str) -> Self {
        ScError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ScError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ScError::ChannelClosed
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ScError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ScError::Transport(e.to_string())
    }
}

impl From<fs_extra::error::Error> for ScError {
    fn from(e: fs_extra::error::Error) -> Self {
        ScError::Other(format!("copy failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = ScError::MalformedFrame("truncated rectangle");
        assert!(e.to_string().contains("truncated"));

        let e = ScError::Verification("sha256 mismatch".into());
        assert!(e.to_string().contains("sha256"));
    }

    #[test]
    fn dispatch_error_is_bare_message() {
        let e = ScError::Dispatch("Unknown method: nope".into());
        assert_eq!(e.to_string(), "Unknown method: nope");
    }

    #[test]
    fn from_string() {
        let e: ScError = "something broke".into();
        assert!(matches!(e, ScError::Other(_)));
    }

    #[test]
    fn from_io_is_transport() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: ScError = io_err.into();
        assert!(matches!(e, ScError::Io(_)));
        assert!(e.is_transport());
        assert!(!ScError::Cancelled.is_transport());
    }
}
