//! Artifact download

use std::time::Duration;

use async_trait::async_trait;
use node_api::UpgradeDirective;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use crate::errors::FleetError;
use crate::filesys::file::File;

/// Download failure, classified for the retry policy
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network trouble or a non-4xx error status; worth retrying
    #[error("transient download failure: {0}")]
    Transient(String),

    /// The server refused the request; retrying will not help
    #[error("download refused: {0}")]
    Permanent(String),

    /// Writing the staged file failed
    #[error("staging failed: {0}")]
    Local(String),
}

/// Fetches a versioned artifact into a local file
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Download `url` into `dest`, returning the number of bytes written
    async fn fetch(&self, url: &str, dest: &File) -> Result<u64, FetchError>;
}

/// Artifact path relative to a download endpoint
pub fn artifact_path(version: &str, platform: &str) -> String {
    format!("downloads/fleetup/{version}/fleetup-{version}-{platform}")
}

/// Artifact location under the download endpoint for a version and platform
pub fn artifact_url(base_url: &str, version: &str, platform: &str) -> Result<Url, FleetError> {
    let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;
    Ok(base.join(&artifact_path(version, platform))?)
}

/// The URL a directive should be downloaded from.
///
/// An explicit `artifact_url` wins; otherwise the URL is derived from the
/// configured download endpoint, target version and platform.
pub fn resolve_download_url(
    directive: &UpgradeDirective,
    download_base_url: &str,
    platform: &str,
) -> Result<String, FleetError> {
    if !directive.artifact_url.is_empty() {
        let url = Url::parse(&directive.artifact_url)?;
        return Ok(url.to_string());
    }

    Ok(artifact_url(download_base_url, &directive.target_version, platform)?.to_string())
}

/// HTTP artifact fetcher
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
}

impl HttpArtifactFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FleetError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(&self, url: &str, dest: &File) -> Result<u64, FetchError> {
        debug!("GET {} -> {:?}", url, dest.path());

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(FetchError::Permanent(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!("{} returned {}", url, status)));
        }

        if let Some(parent) = dest.path().parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::Local(e.to_string()))?;
        }
        let mut file = tokio::fs::File::create(dest.path())
            .await
            .map_err(|e| FetchError::Local(e.to_string()))?;

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::Local(e.to_string()))?;
            written += chunk.len() as u64;
        }

        file.sync_all()
            .await
            .map_err(|e| FetchError::Local(e.to_string()))?;

        Ok(written)
    }
}
