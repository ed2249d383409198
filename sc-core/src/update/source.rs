//! Where manifests and packages come from.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::error::ScError;
use crate::update::status::UpdateInfo;

pub type PackageStream = Pin<Box<dyn Stream<Item = Result<Bytes, ScError>> + Send>>;

/// Parameters of a manifest query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestQuery {
    pub platform: String,
    pub arch: String,
    pub channel: String,
    pub current_version: String,
}

#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Latest release for the query, or `None` when the server has nothing.
    async fn fetch_manifest(&self, query: &ManifestQuery) -> Result<Option<UpdateInfo>, ScError>;

    /// Open the package body as a chunk stream.
    async fn open_package(&self, info: &UpdateInfo) -> Result<PackageStream, ScError>;
}

/// Manifest at `GET {base}/api/updates/latest?platform=&arch=&channel=&currentVersion=`.
pub struct HttpUpdateSource {
    base: Url,
    client: Client,
}

impl HttpUpdateSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ScError> {
        let base = Url::parse(base_url)
            .map_err(|e| ScError::Other(format!("invalid update base url {base_url}: {e}")))?;
        // No overall timeout on the client: package downloads can be long.
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Ok(Self { base, client })
    }

    fn manifest_url(&self, query: &ManifestQuery) -> Result<Url, ScError> {
        let mut url = self
            .base
            .join("/api/updates/latest")
            .map_err(|e| ScError::Other(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("platform", &query.platform)
            .append_pair("arch", &query.arch)
            .append_pair("channel", &query.channel)
            .append_pair("currentVersion", &query.current_version);
        Ok(url)
    }

    fn package_url(&self, info: &UpdateInfo) -> Result<Url, ScError> {
        self.base
            .join(&info.download_url)
            .map_err(|e| ScError::Other(format!("invalid download url {}: {e}", info.download_url)))
    }
}

#[async_trait]
impl UpdateSource for HttpUpdateSource {
    async fn fetch_manifest(&self, query: &ManifestQuery) -> Result<Option<UpdateInfo>, ScError> {
        let url = self.manifest_url(query)?;
        debug!(%url, "fetching update manifest");
        let resp = self.client.get(url).send().await?;
        match resp.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            _ => {
                let resp = resp.error_for_status()?;
                let body = resp.bytes().await?;
                Ok(Some(serde_json::from_slice(&body)?))
            }
        }
    }

    async fn open_package(&self, info: &UpdateInfo) -> Result<PackageStream, ScError> {
        let url = self.package_url(info)?;
        debug!(%url, "downloading update package");
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(Box::pin(resp.bytes_stream().map(|chunk| chunk.map_err(ScError::from))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> HttpUpdateSource {
        HttpUpdateSource::new("https://cp.example.com:8443", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn manifest_url_carries_query() {
        let url = source()
            .manifest_url(&ManifestQuery {
                platform: "linux".into(),
                arch: "x86_64".into(),
                channel: "stable".into(),
                current_version: "1.0.0".into(),
            })
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://cp.example.com:8443/api/updates/latest?platform=linux&arch=x86_64&channel=stable&currentVersion=1.0.0"
        );
    }

    #[test]
    fn package_url_resolves_relative_and_absolute() {
        let mut info = UpdateInfo {
            version: "1.1.0".into(),
            channel: "stable".into(),
            size: 0,
            sha256: String::new(),
            filename: "agent.tar.gz".into(),
            release_notes: None,
            download_url: "/downloads/agent.tar.gz".into(),
            forced: false,
        };
        assert_eq!(
            source().package_url(&info).unwrap().as_str(),
            "https://cp.example.com:8443/downloads/agent.tar.gz"
        );
        info.download_url = "https://cdn.example.com/a.tar.gz".into();
        assert_eq!(source().package_url(&info).unwrap().host_str(), Some("cdn.example.com"));
    }
}
