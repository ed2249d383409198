//! Update state machine values and the release manifest.

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the update manager currently is.
///
/// ```text
/// Idle -> Checking -> Available | UpToDate
/// Available -> Downloading -> Downloaded -> Installing -> (process exits)
/// any step -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    #[default]
    Idle,
    Checking,
    Available,
    UpToDate,
    Downloading,
    Downloaded,
    Installing,
    Failed,
}

impl UpdateStatus {
    /// A worker owns the state while in one of these.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Checking | Self::Downloading | Self::Installing)
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Checking => "CHECKING",
            Self::Available => "AVAILABLE",
            Self::UpToDate => "UP_TO_DATE",
            Self::Downloading => "DOWNLOADING",
            Self::Downloaded => "DOWNLOADED",
            Self::Installing => "INSTALLING",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A release as described by the update server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub version: String,
    #[serde(default)]
    pub channel: String,
    /// Package size in bytes; 0 when unknown.
    #[serde(default)]
    pub size: u64,
    /// Hex SHA-256 of the package.
    pub sha256: String,
    pub filename: String,
    #[serde(default)]
    pub release_notes: Option<String>,
    /// Absolute, or relative to the control plane's HTTP base.
    pub download_url: String,
    #[serde(default)]
    pub forced: bool,
}

/// Snapshot served to `update_status`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateState {
    pub status: UpdateStatus,
    pub current_version: String,
    pub available: Option<UpdateInfo>,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub downloaded_path: Option<PathBuf>,
    pub last_error: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub failed_at: Option<Instant>,
}

impl UpdateState {
    pub fn new(current_version: impl Into<String>) -> Self {
        Self {
            current_version: current_version.into(),
            ..Default::default()
        }
    }

    /// Download progress in percent, when the total is known.
    pub fn progress_percent(&self) -> Option<u8> {
        (self.total_bytes > 0)
            .then(|| (self.downloaded_bytes.saturating_mul(100) / self.total_bytes).min(100) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parses_camel_case() {
        let info: UpdateInfo = serde_json::from_str(
            r#"{"version":"1.4.0","channel":"stable","size":10,"sha256":"ab",
                "filename":"agent.tar.gz","releaseNotes":"fixes",
                "downloadUrl":"/downloads/agent.tar.gz","forced":true}"#,
        )
        .unwrap();
        assert_eq!(info.version, "1.4.0");
        assert_eq!(info.release_notes.as_deref(), Some("fixes"));
        assert!(info.forced);
    }

    #[test]
    fn optional_manifest_fields_default() {
        let info: UpdateInfo = serde_json::from_str(
            r#"{"version":"2.0","sha256":"ab","filename":"f","downloadUrl":"u"}"#,
        )
        .unwrap();
        assert_eq!(info.size, 0);
        assert!(!info.forced);
    }

    #[test]
    fn status_serializes_screaming() {
        assert_eq!(serde_json::to_value(UpdateStatus::UpToDate).unwrap(), "UP_TO_DATE");
        assert_eq!(UpdateStatus::UpToDate.to_string(), "UP_TO_DATE");
    }

    #[test]
    fn last_check_serializes_as_rfc3339() {
        let mut s = UpdateState::new("1.0.0");
        s.last_check = Some(DateTime::parse_from_rfc3339("2026-10-19T08:30:00Z").unwrap().with_timezone(&Utc));
        s.failed_at = Some(Instant::now());
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["lastCheck"], "2026-10-19T08:30:00Z");
        assert_eq!(v["currentVersion"], "1.0.0");
        assert!(v.get("failedAt").is_none());
    }

    #[test]
    fn progress() {
        let mut s = UpdateState::new("1.0.0");
        assert_eq!(s.progress_percent(), None);
        s.total_bytes = 200;
        s.downloaded_bytes = 50;
        assert_eq!(s.progress_percent(), Some(25));
    }
}
