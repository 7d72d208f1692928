//! Finite state machine for a single-node binary upgrade
//!
//! The happy path is linear:
//! `Idle → Downloading → Verifying → BackingUp → Replacing → Restarting →
//! VerifyingRunning → Completed`. Failures before the binary is replaced end in
//! `Failed`; failures after it enter `RollingBack`, which ends in `RolledBack`
//! or, if restoring fails, `ManualInterventionRequired`.

use node_api::{FailureClass, Outcome};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upgrade state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeState {
    Idle,
    Downloading,
    Verifying,
    BackingUp,
    Replacing,
    Restarting,
    VerifyingRunning,
    RollingBack,
    Completed,
    RolledBack,
    Failed,
    ManualInterventionRequired,
}

impl UpgradeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpgradeState::Completed
                | UpgradeState::RolledBack
                | UpgradeState::Failed
                | UpgradeState::ManualInterventionRequired
        )
    }

    /// Outcome reported for this state
    pub fn outcome(&self) -> Outcome {
        match self {
            UpgradeState::Completed => Outcome::Success,
            UpgradeState::RolledBack => Outcome::RolledBack,
            UpgradeState::Failed => Outcome::Failed,
            UpgradeState::ManualInterventionRequired => Outcome::ManualInterventionRequired,
            _ => Outcome::Pending,
        }
    }
}

/// Upgrade event
#[derive(Debug, Clone)]
pub enum UpgradeEvent {
    /// Accept a directive and begin downloading
    Start,

    /// Artifact staged
    Downloaded,

    /// A transient download failure with retry budget left
    DownloadRetry(String),

    /// Download gave up
    DownloadFailed { error: String, class: FailureClass },

    /// Staged digest matched
    ChecksumVerified,

    /// Staged digest differed
    ChecksumMismatch(String),

    BackupCreated,
    BackupFailed(String),

    Replaced,
    ReplaceFailed(String),

    Restarted,
    RestartFailed(String),

    /// Service active and reporting the target version
    RunningVerified,
    RunningCheckFailed(String),

    RollbackSucceeded,
    RollbackFailed(String),

    /// Unrecoverable error outside the modelled failures
    Abort(String),
}

/// Invalid transition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid transition from {from:?} on {event}")]
pub struct FsmError {
    pub from: UpgradeState,
    pub event: String,
}

/// Upgrade FSM
#[derive(Debug, Clone)]
pub struct UpgradeFsm {
    state: UpgradeState,
    attempts: u32,
    last_error: Option<String>,
    failure_class: Option<FailureClass>,
}

impl UpgradeFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            state: UpgradeState::Idle,
            attempts: 0,
            last_error: None,
            failure_class: None,
        }
    }

    /// Rebuild an FSM from persisted progress
    pub fn resume(
        state: UpgradeState,
        attempts: u32,
        last_error: Option<String>,
        failure_class: Option<FailureClass>,
    ) -> Self {
        Self {
            state,
            attempts,
            last_error,
            failure_class,
        }
    }

    pub fn state(&self) -> UpgradeState {
        self.state
    }

    /// Download attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn failure_class(&self) -> Option<FailureClass> {
        self.failure_class
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn outcome(&self) -> Outcome {
        self.state.outcome()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: UpgradeEvent) -> Result<UpgradeState, FsmError> {
        use UpgradeEvent as E;
        use UpgradeState as S;

        let new_state = match (self.state, &event) {
            (S::Idle, E::Start) => {
                self.attempts = 1;
                S::Downloading
            }

            (S::Downloading, E::Downloaded) => S::Verifying,
            (S::Downloading, E::DownloadRetry(err)) => {
                self.last_error = Some(err.clone());
                self.attempts += 1;
                S::Downloading
            }
            (S::Downloading, E::DownloadFailed { error, class }) => {
                self.fail(error.clone(), *class);
                S::Failed
            }

            (S::Verifying, E::ChecksumVerified) => S::BackingUp,
            (S::Verifying, E::ChecksumMismatch(err)) => {
                self.fail(err.clone(), FailureClass::Integrity);
                S::Failed
            }

            (S::BackingUp, E::BackupCreated) => S::Replacing,
            (S::BackingUp, E::BackupFailed(err)) => {
                self.fail(err.clone(), FailureClass::Operational);
                S::Failed
            }

            (S::Replacing, E::Replaced) => S::Restarting,
            (S::Replacing, E::ReplaceFailed(err)) => {
                self.fail(err.clone(), FailureClass::Operational);
                S::Failed
            }

            (S::Restarting, E::Restarted) => S::VerifyingRunning,
            (S::Restarting, E::RestartFailed(err)) => {
                self.fail(err.clone(), FailureClass::Operational);
                S::RollingBack
            }

            (S::VerifyingRunning, E::RunningVerified) => {
                self.last_error = None;
                S::Completed
            }
            (S::VerifyingRunning, E::RunningCheckFailed(err)) => {
                self.fail(err.clone(), FailureClass::Operational);
                S::RollingBack
            }

            (S::RollingBack, E::RollbackSucceeded) => S::RolledBack,
            (S::RollingBack, E::RollbackFailed(err)) => {
                let combined = match self.last_error.take() {
                    Some(cause) => format!("{}; rollback failed: {}", cause, err),
                    None => format!("rollback failed: {}", err),
                };
                self.fail(combined, FailureClass::RollbackFailed);
                S::ManualInterventionRequired
            }

            // Unrecoverable errors: nothing destructive has happened before
            // Replacing completes, so those states fail outright.
            (
                S::Downloading | S::Verifying | S::BackingUp | S::Replacing,
                E::Abort(err),
            ) => {
                self.fail(err.clone(), FailureClass::Operational);
                S::Failed
            }
            (S::Restarting | S::VerifyingRunning, E::Abort(err)) => {
                self.fail(err.clone(), FailureClass::Operational);
                S::RollingBack
            }
            (S::RollingBack, E::Abort(err)) => {
                self.fail(err.clone(), FailureClass::RollbackFailed);
                S::ManualInterventionRequired
            }

            (from, event) => {
                return Err(FsmError {
                    from,
                    event: format!("{:?}", event),
                });
            }
        };

        self.state = new_state;
        Ok(new_state)
    }

    fn fail(&mut self, error: String, class: FailureClass) {
        self.last_error = Some(error);
        self.failure_class = Some(class);
    }
}

impl Default for UpgradeFsm {
    fn default() -> Self {
        Self::new()
    }
}
