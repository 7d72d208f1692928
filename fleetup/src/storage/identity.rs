//! Node identity file management

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::errors::FleetError;
use crate::filesys::file::File;

/// Identity issued to this node by the registration service
#[derive(Debug, Deserialize)]
pub struct NodeIdentity {
    /// Unique node ID
    pub node_id: String,

    /// Bearer credential presented with every outcome report
    #[serde(deserialize_with = "deserialize_secret")]
    pub token: SecretString,

    /// Artifact platform key, e.g. "linux-amd64"
    #[serde(default = "default_platform")]
    pub platform: String,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(SecretString::from(raw))
}

/// Platform key of the running build
pub fn default_platform() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("{}-{}", std::env::consts::OS, arch)
}

/// Assert that the node has been registered and load its identity
pub async fn assert_registered(identity_file: &File) -> Result<NodeIdentity, FleetError> {
    if !identity_file.exists().await {
        return Err(FleetError::NodeNotRegistered(
            "Identity file does not exist".to_string(),
        ));
    }

    let identity: NodeIdentity = identity_file.read_json().await.map_err(|e| {
        FleetError::NodeNotRegistered(format!("Failed to read identity file: {}", e))
    })?;

    if identity.node_id.is_empty() {
        return Err(FleetError::NodeNotRegistered("Node ID is empty".to_string()));
    }

    if identity.token.expose_secret().is_empty() {
        return Err(FleetError::NodeNotRegistered(
            "Node token is empty".to_string(),
        ));
    }

    Ok(identity)
}
