//! Artifact checksums and signatures served next to the binaries

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use node_api::ArtifactSignature;

use crate::campaign::artifacts::{
    parse_checksum_file, parse_signature_file, ArtifactRef, ArtifactSource,
};
use crate::errors::FleetError;
use crate::http::client::HttpClient;
use crate::node::artifact::{artifact_path, artifact_url};

impl HttpClient {
    /// Fetch the published SHA-256 of an artifact
    pub async fn get_artifact_checksum(
        &self,
        version: &str,
        platform: &str,
    ) -> Result<String, FleetError> {
        let path = format!("/{}.sha256", artifact_path(version, platform));
        let contents = self.get_text(&path, None).await?;
        parse_checksum_file(&contents)
    }

    /// Fetch the detached signature of an artifact
    pub async fn get_artifact_signature(
        &self,
        version: &str,
        platform: &str,
        key_id: &str,
    ) -> Result<ArtifactSignature, FleetError> {
        let path = format!("/{}.sig", artifact_path(version, platform));
        let contents = self.get_text(&path, None).await?;
        parse_signature_file(key_id, &contents)
    }
}

/// Artifact source backed by the download endpoint, caching resolved digests
pub struct HttpArtifactSource {
    client: HttpClient,
    signing_key_id: Option<String>,
    cache: RwLock<HashMap<(String, String), ArtifactRef>>,
}

impl HttpArtifactSource {
    pub fn new(
        base_url: &str,
        signing_key_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self, FleetError> {
        Ok(Self {
            client: HttpClient::new(base_url, timeout)?,
            signing_key_id,
            cache: RwLock::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn resolve(&self, version: &str, platform: &str) -> Result<ArtifactRef, FleetError> {
        let key = (version.to_string(), platform.to_string());
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(&key) {
                return Ok(hit.clone());
            }
        }

        let checksum_hex = self
            .client
            .get_artifact_checksum(version, platform)
            .await
            .map_err(|e| {
                FleetError::ArtifactError(format!(
                    "no checksum for {} ({}): {}",
                    version, platform, e
                ))
            })?;
        let signature = match self.signing_key_id.as_deref() {
            Some(key_id) => Some(
                self.client
                    .get_artifact_signature(version, platform, key_id)
                    .await
                    .map_err(|e| {
                        FleetError::ArtifactError(format!(
                            "no signature for {} ({}): {}",
                            version, platform, e
                        ))
                    })?,
            ),
            None => None,
        };
        let url = artifact_url(self.client.base_url(), version, platform)?.to_string();
        debug!("Resolved artifact {} -> {}", url, checksum_hex);

        let artifact = ArtifactRef {
            url,
            checksum_hex,
            signature,
        };
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, artifact.clone());
        Ok(artifact)
    }
}
