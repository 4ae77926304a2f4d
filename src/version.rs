use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::{config::Channel, error::VersionError};

const MANIFEST_URL: &str = "https://launchermeta.mojang.com/mc/game/version_manifest.json";

/// Immutable description of one published server version.
///
/// Two descriptors are the same version iff their ids match; the download
/// locator and checksum are treated as metadata.
#[derive(Debug, Clone)]
pub struct VersionDescriptor {
    pub id: String,
    pub kind: Channel,
    pub download_url: String,
    pub sha1: Option<String>,
}

impl PartialEq for VersionDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for VersionDescriptor {}

/// Capability for querying the latest published version and fetching its
/// server jar. Pure query; retry policy belongs to the caller.
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn fetch_latest(&self, channel: Channel) -> Result<VersionDescriptor, VersionError>;

    /// Downloads the descriptor's server jar to `dest`, verifying the SHA-1
    /// when the descriptor carries one. Callers treat `dest` as a staging
    /// path and rename it into place themselves.
    async fn download_to(
        &self,
        descriptor: &VersionDescriptor,
        dest: &Path,
    ) -> Result<(), VersionError>;
}

#[derive(Debug, Deserialize)]
struct Manifest {
    latest: ManifestLatest,
    versions: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestLatest {
    release: String,
    snapshot: String,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct VersionDetail {
    downloads: VersionDownloads,
}

#[derive(Debug, Deserialize)]
struct VersionDownloads {
    server: Option<DownloadEntry>,
}

#[derive(Debug, Deserialize)]
struct DownloadEntry {
    sha1: String,
    url: String,
}

/// [`VersionSource`] backed by the Mojang launcher metadata service.
///
/// Resolution is two-stage: the top manifest names the latest id per channel
/// and links a per-version document, which carries the server jar URL and
/// its SHA-1.
pub struct MojangVersionSource {
    client: reqwest::Client,
    manifest_url: String,
}

impl MojangVersionSource {
    pub fn new() -> Self {
        Self::with_manifest_url(MANIFEST_URL)
    }

    pub fn with_manifest_url(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            manifest_url: url.into(),
        }
    }
}

impl Default for MojangVersionSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VersionSource for MojangVersionSource {
    async fn fetch_latest(&self, channel: Channel) -> Result<VersionDescriptor, VersionError> {
        debug!(url = %self.manifest_url, "fetching version manifest");

        let manifest: Manifest = self
            .client
            .get(&self.manifest_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| VersionError::Parse(e.to_string()))?;

        let latest_id = match channel {
            Channel::Release => manifest.latest.release,
            Channel::Snapshot => manifest.latest.snapshot,
        };

        let entry = manifest
            .versions
            .into_iter()
            .find(|v| v.id == latest_id)
            .ok_or(VersionError::MissingChannel(latest_id.clone()))?;

        let detail: VersionDetail = self
            .client
            .get(&entry.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| VersionError::Parse(e.to_string()))?;

        let server = detail
            .downloads
            .server
            .ok_or_else(|| VersionError::Parse(format!("{latest_id} has no server download")))?;

        info!(id = %latest_id, "resolved latest version");

        Ok(VersionDescriptor {
            id: latest_id,
            kind: channel,
            download_url: server.url,
            sha1: Some(server.sha1),
        })
    }

    async fn download_to(
        &self,
        descriptor: &VersionDescriptor,
        dest: &Path,
    ) -> Result<(), VersionError> {
        info!(id = %descriptor.id, url = %descriptor.download_url, "downloading server jar");

        let bytes = self
            .client
            .get(&descriptor.download_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        if let Some(expected) = &descriptor.sha1 {
            let mut hasher = Sha1::new();
            hasher.update(&bytes);
            let actual = hex::encode(hasher.finalize());
            if &actual != expected {
                return Err(VersionError::ChecksumMismatch {
                    path: dest.to_path_buf(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| VersionError::Write {
                path: dest.to_path_buf(),
                source: e,
            })?;
        file.write_all(&bytes)
            .await
            .map_err(|e| VersionError::Write {
                path: dest.to_path_buf(),
                source: e,
            })?;
        file.flush().await.map_err(|e| VersionError::Write {
            path: dest.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_equality_is_by_id() {
        let a = VersionDescriptor {
            id: "1.21.4".to_string(),
            kind: Channel::Release,
            download_url: "https://a.example/server.jar".to_string(),
            sha1: Some("aaaa".to_string()),
        };
        let b = VersionDescriptor {
            id: "1.21.4".to_string(),
            kind: Channel::Release,
            download_url: "https://b.example/server.jar".to_string(),
            sha1: None,
        };
        assert_eq!(a, b);
    }

    #[test]
    fn manifest_deserializes() {
        let json = r#"{
            "latest": {"release": "1.21.4", "snapshot": "25w05a"},
            "versions": [
                {"id": "25w05a", "type": "snapshot", "url": "https://example/25w05a.json"},
                {"id": "1.21.4", "type": "release", "url": "https://example/1.21.4.json"}
            ]
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.latest.release, "1.21.4");
        assert_eq!(manifest.versions.len(), 2);
    }

    #[test]
    fn version_detail_deserializes() {
        let json = r#"{
            "downloads": {
                "server": {"sha1": "abc123", "size": 1, "url": "https://example/server.jar"},
                "client": {"sha1": "def456", "size": 1, "url": "https://example/client.jar"}
            }
        }"#;
        let detail: VersionDetail = serde_json::from_str(json).unwrap();
        let server = detail.downloads.server.unwrap();
        assert_eq!(server.sha1, "abc123");
    }
}
