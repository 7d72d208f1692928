//! Persisted node upgrade state
//!
//! The node keeps a single active record plus a bounded history of directive
//! ids it has seen. Every transition is written to disk before the next step
//! runs so an interrupted upgrade can be recovered after a restart.
//!
//! A terminal record the coordinator has not acknowledged moves to the outbox
//! when the next directive is accepted, so no outcome is lost to a newer one.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use node_api::{
    ArtifactSignature, DirectiveKind, FailureClass, Outcome, OutcomeReport, UpgradeDirective,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::FleetError;
use crate::filesys::file::File;
use crate::node::fsm::{UpgradeFsm, UpgradeState};

/// Directive ids remembered for duplicate detection
const SEEN_HISTORY: usize = 256;

/// Progress of the directive a node is working on (or last worked on)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpgradeState {
    pub directive_id: String,
    pub kind: DirectiveKind,
    pub target_version: String,
    pub expected_checksum_hex: String,
    pub download_url: String,
    #[serde(default)]
    pub signature: Option<ArtifactSignature>,
    pub issued_at: DateTime<Utc>,

    pub phase: UpgradeState,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub failure_class: Option<FailureClass>,

    /// Version the service reported before its binary was replaced
    #[serde(default)]
    pub previous_version: Option<String>,

    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Outcome,

    /// Whether the coordinator acknowledged the terminal outcome
    #[serde(default)]
    pub reported: bool,
}

impl NodeUpgradeState {
    /// Fresh record for an accepted directive
    pub fn accepted(directive: &UpgradeDirective, download_url: String) -> Self {
        Self {
            directive_id: directive.directive_id.clone(),
            kind: directive.kind,
            target_version: directive.target_version.clone(),
            expected_checksum_hex: directive.expected_checksum_hex.clone(),
            download_url,
            signature: directive.signature.clone(),
            issued_at: directive.issued_at,
            phase: UpgradeState::Idle,
            attempts: 0,
            last_error: None,
            failure_class: None,
            previous_version: None,
            started_at: Utc::now(),
            completed_at: None,
            outcome: Outcome::Pending,
            reported: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Copy the FSM's progress into the record
    pub fn record_progress(&mut self, fsm: &UpgradeFsm) {
        self.phase = fsm.state();
        self.attempts = fsm.attempts();
        self.last_error = fsm.last_error().map(str::to_string);
        self.failure_class = fsm.failure_class();
        self.outcome = fsm.outcome();
        if fsm.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }

    /// FSM positioned where this record left off
    pub fn to_fsm(&self) -> UpgradeFsm {
        UpgradeFsm::resume(
            self.phase,
            self.attempts,
            self.last_error.clone(),
            self.failure_class,
        )
    }

    pub fn to_report(&self, node_id: &str) -> OutcomeReport {
        OutcomeReport {
            directive_id: self.directive_id.clone(),
            node_id: node_id.to_string(),
            outcome: self.outcome,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            completed_at: self.completed_at.unwrap_or_else(Utc::now),
            failure_class: self.failure_class,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    current: Option<NodeUpgradeState>,

    #[serde(default)]
    seen: VecDeque<String>,

    /// Issue time of the newest accepted directive
    #[serde(default)]
    newest_issued_at: Option<DateTime<Utc>>,

    /// Earlier terminal records still waiting for acknowledgement, oldest first
    #[serde(default)]
    outbox: VecDeque<NodeUpgradeState>,
}

/// File-backed store for the node's upgrade state
pub struct UpgradeStateStore {
    file: File,
    inner: Mutex<PersistedState>,
}

impl UpgradeStateStore {
    /// Load persisted state, starting empty when none exists
    pub async fn open(file: File) -> Result<Self, FleetError> {
        let state = if file.exists().await {
            file.read_json().await.map_err(|e| {
                FleetError::StorageError(format!(
                    "failed to read upgrade state {:?}: {}",
                    file.path(),
                    e
                ))
            })?
        } else {
            PersistedState::default()
        };

        Ok(Self {
            file,
            inner: Mutex::new(state),
        })
    }

    /// Accept a directive as the node's single active upgrade.
    ///
    /// Rejects re-delivered directive ids, directives issued before the
    /// newest accepted one, and anything arriving while an upgrade is still
    /// running.
    pub async fn try_begin(
        &self,
        directive: &UpgradeDirective,
        download_url: String,
    ) -> Result<NodeUpgradeState, FleetError> {
        let mut state = self.inner.lock().await;

        if state.seen.iter().any(|id| id == &directive.directive_id) {
            return Err(FleetError::DirectiveRejected(format!(
                "directive {} was already received",
                directive.directive_id
            )));
        }

        if let Some(current) = state.current.as_ref().filter(|c| !c.is_terminal()) {
            return Err(FleetError::DirectiveRejected(format!(
                "upgrade {} is still in progress ({:?})",
                current.directive_id, current.phase
            )));
        }

        if let Some(newest) = state.newest_issued_at {
            if directive.issued_at < newest {
                return Err(FleetError::DirectiveRejected(format!(
                    "directive {} is stale (issued {}, newest accepted {})",
                    directive.directive_id, directive.issued_at, newest
                )));
            }
        }

        let record = NodeUpgradeState::accepted(directive, download_url);

        if let Some(previous) = state.current.take().filter(|c| !c.reported) {
            info!(
                directive = %previous.directive_id,
                "Queueing unacknowledged outcome behind directive {}",
                directive.directive_id
            );
            state.outbox.push_back(previous);
        }

        state.seen.push_back(directive.directive_id.clone());
        while state.seen.len() > SEEN_HISTORY {
            state.seen.pop_front();
        }
        state.newest_issued_at = Some(directive.issued_at);
        state.current = Some(record.clone());
        self.file.write_json(&*state).await?;

        Ok(record)
    }

    /// Persist progress of the active record
    pub async fn update(&self, record: &NodeUpgradeState) -> Result<(), FleetError> {
        let mut state = self.inner.lock().await;

        match state.current.as_ref() {
            Some(current) if current.directive_id == record.directive_id => {}
            _ => {
                return Err(FleetError::StorageError(format!(
                    "directive {} is not the active upgrade",
                    record.directive_id
                )))
            }
        }

        debug!(
            "Persisting {} at {:?} (attempts {})",
            record.directive_id, record.phase, record.attempts
        );
        state.current = Some(record.clone());
        self.file.write_json(&*state).await
    }

    pub async fn current(&self) -> Option<NodeUpgradeState> {
        self.inner.lock().await.current.clone()
    }

    /// Oldest terminal record the coordinator has not acknowledged yet
    pub async fn unreported(&self) -> Option<NodeUpgradeState> {
        let state = self.inner.lock().await;
        state.outbox.front().cloned().or_else(|| {
            state
                .current
                .clone()
                .filter(|c| c.is_terminal() && !c.reported)
        })
    }

    pub async fn mark_reported(&self, directive_id: &str) -> Result<(), FleetError> {
        let mut state = self.inner.lock().await;

        if let Some(pos) = state.outbox.iter().position(|r| r.directive_id == directive_id) {
            state.outbox.remove(pos);
        } else {
            match state.current.as_mut() {
                Some(current) if current.directive_id == directive_id => {
                    current.reported = true;
                }
                _ => return Ok(()),
            }
        }
        self.file.write_json(&*state).await
    }
}
