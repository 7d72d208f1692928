//! Node API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a directive moves a node forward or back to a known-good version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    #[default]
    Upgrade,
    Downgrade,
}

/// Instruction for a single node to move to a target version.
///
/// Immutable once issued. `directive_id` is unique per dispatch attempt so a
/// node can detect re-delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeDirective {
    pub directive_id: String,
    pub node_id: String,
    pub target_version: String,
    /// Empty when the node should derive the URL from its download endpoint
    #[serde(default)]
    pub artifact_url: String,
    pub expected_checksum_hex: String,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub kind: DirectiveKind,
    /// Publisher signature over the artifact bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<ArtifactSignature>,
}

/// Detached Ed25519 signature of an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSignature {
    /// Which trusted publisher key signed the artifact
    pub key_id: String,
    /// Base64-encoded 64-byte signature
    pub signature: String,
}

impl UpgradeDirective {
    /// Issue a new directive with a fresh id
    pub fn issue(
        node_id: &str,
        target_version: &str,
        artifact_url: &str,
        expected_checksum_hex: &str,
        kind: DirectiveKind,
    ) -> Self {
        Self {
            directive_id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            target_version: target_version.to_string(),
            artifact_url: artifact_url.to_string(),
            expected_checksum_hex: expected_checksum_hex.to_string(),
            issued_at: Utc::now(),
            kind,
            signature: None,
        }
    }
}

/// Terminal (or pending) result of a directive on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Success,
    Failed,
    /// The upgrade failed and the node restored its previous binary
    RolledBack,
    /// The node-local rollback failed; an operator has to step in
    ManualInterventionRequired,
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Classification attached to a failed outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network or server trouble that exhausted its retry budget
    Transient,
    /// The artifact source refused the request (4xx)
    Permanent,
    /// Checksum mismatch; possible tampering
    Integrity,
    /// Restart, verification or filesystem failure on the node
    Operational,
    /// Restoring the previous binary failed
    RollbackFailed,
    /// The coordinator could not deliver the directive
    Unreachable,
    /// The node refused the directive (busy, duplicate or stale)
    Rejected,
    /// No report arrived before the phase window closed
    Expired,
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Transient)
    }
}

/// Outcome report sent by a node once a directive reaches a terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub directive_id: String,
    pub node_id: String,
    pub outcome: Outcome,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
}

/// Node response to a pushed directive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectiveAck {
    pub directive_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
