//! Artifact signature verification
//!
//! Publishers sign release artifacts with Ed25519. A node that trusts at
//! least one key refuses to install anything without a valid signature from
//! one of them; the SHA-256 digest alone only proves the download is intact.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, VerifyingKey};
use node_api::ArtifactSignature;
use tracing::debug;

use crate::errors::FleetError;

/// Trusted publisher keys by key id
#[derive(Debug, Default)]
pub struct SignatureVerifier {
    keys: HashMap<String, VerifyingKey>,
}

impl SignatureVerifier {
    /// Verifier that trusts no keys and accepts unsigned artifacts
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build from base64-encoded 32-byte public keys
    pub fn from_base64_keys(keys: &HashMap<String, String>) -> Result<Self, FleetError> {
        let mut parsed = HashMap::new();
        for (key_id, encoded) in keys {
            let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
                FleetError::ConfigError(format!("trusted key {}: invalid base64: {}", key_id, e))
            })?;
            let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
                FleetError::ConfigError(format!("trusted key {}: expected 32 bytes", key_id))
            })?;
            let key = VerifyingKey::from_bytes(&bytes).map_err(|e| {
                FleetError::ConfigError(format!("trusted key {}: {}", key_id, e))
            })?;
            parsed.insert(key_id.clone(), key);
        }
        Ok(Self { keys: parsed })
    }

    /// Whether unsigned artifacts are refused
    pub fn is_enforced(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Check `data` against the directive's signature
    pub fn verify(
        &self,
        data: &[u8],
        signature: Option<&ArtifactSignature>,
    ) -> Result<(), FleetError> {
        if !self.is_enforced() {
            return Ok(());
        }

        let signature = signature
            .ok_or_else(|| FleetError::ArtifactError("artifact is not signed".to_string()))?;

        let key = self.keys.get(&signature.key_id).ok_or_else(|| {
            FleetError::ArtifactError(format!("signing key {} is not trusted", signature.key_id))
        })?;

        let bytes = STANDARD.decode(signature.signature.trim()).map_err(|e| {
            FleetError::ArtifactError(format!("signature is not valid base64: {}", e))
        })?;
        let parsed = Signature::from_slice(&bytes)
            .map_err(|e| FleetError::ArtifactError(format!("malformed signature: {}", e)))?;

        key.verify_strict(data, &parsed).map_err(|_| {
            FleetError::ArtifactError(format!(
                "signature verification failed for key {}",
                signature.key_id
            ))
        })?;

        debug!("Artifact signature verified with key {}", signature.key_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn publisher() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn verifier() -> SignatureVerifier {
        let public = STANDARD.encode(publisher().verifying_key().to_bytes());
        SignatureVerifier::from_base64_keys(&HashMap::from([("release".to_string(), public)]))
            .unwrap()
    }

    fn sign(data: &[u8]) -> ArtifactSignature {
        ArtifactSignature {
            key_id: "release".to_string(),
            signature: STANDARD.encode(publisher().sign(data).to_bytes()),
        }
    }

    #[test]
    fn accepts_valid_signature() {
        let verifier = verifier();
        assert!(verifier.is_enforced());
        assert!(verifier.verify(b"fleetup 2.0.0", Some(&sign(b"fleetup 2.0.0"))).is_ok());
    }

    #[test]
    fn rejects_tampered_artifact() {
        let err = verifier()
            .verify(b"fleetup 6.6.6", Some(&sign(b"fleetup 2.0.0")))
            .unwrap_err();
        assert!(err.to_string().contains("verification failed"));
    }

    #[test]
    fn rejects_unsigned_and_unknown_keys() {
        let verifier = verifier();
        assert!(verifier.verify(b"data", None).is_err());

        let mut foreign = sign(b"data");
        foreign.key_id = "someone-else".to_string();
        assert!(verifier
            .verify(b"data", Some(&foreign))
            .unwrap_err()
            .to_string()
            .contains("not trusted"));
    }

    #[test]
    fn disabled_verifier_accepts_anything() {
        assert!(SignatureVerifier::disabled().verify(b"data", None).is_ok());
    }

    #[test]
    fn rejects_malformed_keys() {
        let keys = HashMap::from([("short".to_string(), STANDARD.encode([1u8; 16]))]);
        assert!(matches!(
            SignatureVerifier::from_base64_keys(&keys),
            Err(FleetError::ConfigError(_))
        ));
    }
}
