//! Fleet inventory
//!
//! Nodes are registered by an external service that writes the inventory
//! file. Only a SHA-256 of each node's bearer token is kept.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::FleetError;
use crate::filesys::file::File;
use crate::utils::{digests_match, sha256_hex};

/// A registered node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetNode {
    pub node_id: String,
    /// Artifact platform key, e.g. "linux-amd64"
    pub platform: String,
    /// Base URL of the node's directive API
    pub endpoint: String,
    /// Hex SHA-256 of the node's bearer token
    pub token_sha256: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    nodes: Vec<FleetNode>,
}

/// Registered nodes keyed by id
#[derive(Debug, Default)]
pub struct Inventory {
    nodes: Vec<FleetNode>,
    index: HashMap<String, usize>,
}

impl Inventory {
    pub fn new(nodes: Vec<FleetNode>) -> Result<Self, FleetError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if node.node_id.is_empty() {
                return Err(FleetError::ConfigError(format!(
                    "inventory entry {} has an empty node_id",
                    i
                )));
            }
            if index.insert(node.node_id.clone(), i).is_some() {
                return Err(FleetError::ConfigError(format!(
                    "node {} is listed twice in the inventory",
                    node.node_id
                )));
            }
        }
        Ok(Self { nodes, index })
    }

    /// Load the inventory file; a missing file is an empty fleet
    pub async fn load(file: &File) -> Result<Self, FleetError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        let contents: InventoryFile = file.read_json().await?;
        Self::new(contents.nodes)
    }

    pub fn nodes(&self) -> &[FleetNode] {
        &self.nodes
    }

    pub fn get(&self, node_id: &str) -> Option<&FleetNode> {
        self.index.get(node_id).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check a bearer token against the node on record
    pub fn authenticate(&self, node_id: &str, token: &str) -> Result<&FleetNode, FleetError> {
        let node = self
            .get(node_id)
            .ok_or_else(|| FleetError::Unauthorized(format!("unknown node {}", node_id)))?;

        if token.is_empty() || !digests_match(&node.token_sha256, &sha256_hex(token.as_bytes())) {
            return Err(FleetError::Unauthorized(format!(
                "token does not match node {}",
                node_id
            )));
        }

        Ok(node)
    }
}
