//! Artifact source
//!
//! Resolves where a node downloads a version from, the digest it must
//! verify against and, for signed releases, the publisher signature.

use async_trait::async_trait;
use node_api::ArtifactSignature;

use crate::errors::FleetError;

/// Download location and expected digest of one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub url: String,
    pub checksum_hex: String,
    pub signature: Option<ArtifactSignature>,
}

#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn resolve(&self, version: &str, platform: &str) -> Result<ArtifactRef, FleetError>;
}

/// Parse a `sha256sum`-style checksum file (`<hex>  <name>` or just `<hex>`)
pub fn parse_checksum_file(contents: &str) -> Result<String, FleetError> {
    let digest = contents
        .split_whitespace()
        .next()
        .ok_or_else(|| FleetError::ArtifactError("checksum file is empty".to_string()))?;

    match hex::decode(digest) {
        Ok(bytes) if bytes.len() == 32 => Ok(digest.to_ascii_lowercase()),
        _ => Err(FleetError::ArtifactError(format!(
            "'{}' is not a SHA-256 digest",
            digest
        ))),
    }
}

/// Parse a detached signature file holding the base64 signature
pub fn parse_signature_file(key_id: &str, contents: &str) -> Result<ArtifactSignature, FleetError> {
    let signature = contents
        .split_whitespace()
        .next()
        .ok_or_else(|| FleetError::ArtifactError("signature file is empty".to_string()))?;

    Ok(ArtifactSignature {
        key_id: key_id.to_string(),
        signature: signature.to_string(),
    })
}
