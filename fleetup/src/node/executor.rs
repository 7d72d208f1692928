//! Upgrade executor
//!
//! Drives an accepted directive through the upgrade FSM. Each state maps to
//! one step that performs the side effect and returns the event describing
//! how it went; the record is persisted after every transition.

use std::sync::Arc;
use std::time::Duration;

use node_api::FailureClass;
use tracing::{debug, error, info, warn};

use crate::errors::FleetError;
use crate::filesys::file::File;
use crate::node::artifact::{ArtifactFetcher, FetchError};
use crate::node::fsm::{UpgradeEvent, UpgradeFsm, UpgradeState};
use crate::node::service::ServiceManager;
use crate::node::signature::SignatureVerifier;
use crate::node::state::{NodeUpgradeState, UpgradeStateStore};
use crate::storage::layout::UpgradeDir;
use crate::utils::{calc_exp_backoff, digests_match, CooldownOptions};

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Download attempts before a transient failure is final
    pub download_attempts: u32,
    pub download_backoff: CooldownOptions,
    /// Wait between a restart and checking the running instance
    pub settle_delay: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            download_attempts: 3,
            download_backoff: CooldownOptions {
                base_delay: Duration::from_secs(2),
                ..Default::default()
            },
            settle_delay: Duration::from_secs(5),
        }
    }
}

/// Upgrade executor
pub struct UpgradeExecutor {
    settings: ExecutorSettings,
    installed: File,
    work: UpgradeDir,
    fetcher: Arc<dyn ArtifactFetcher>,
    service: Arc<dyn ServiceManager>,
    store: Arc<UpgradeStateStore>,
    verifier: Arc<SignatureVerifier>,
}

impl UpgradeExecutor {
    pub fn new(
        settings: ExecutorSettings,
        installed: File,
        work: UpgradeDir,
        fetcher: Arc<dyn ArtifactFetcher>,
        service: Arc<dyn ServiceManager>,
        store: Arc<UpgradeStateStore>,
    ) -> Self {
        Self {
            settings,
            installed,
            work,
            fetcher,
            service,
            store,
            verifier: Arc::new(SignatureVerifier::disabled()),
        }
    }

    /// Require artifacts to carry a signature from one of the trusted keys
    pub fn with_verifier(mut self, verifier: Arc<SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Run an accepted directive to a terminal state
    pub async fn execute(&self, mut record: NodeUpgradeState) -> NodeUpgradeState {
        info!(
            directive = %record.directive_id,
            target = %record.target_version,
            kind = ?record.kind,
            "Starting upgrade"
        );

        let mut fsm = record.to_fsm();
        self.drive(&mut fsm, &mut record).await;
        record
    }

    /// Finish an upgrade that was interrupted by a restart of this process.
    ///
    /// Nothing destructive has happened before `Replacing`, so those states
    /// fail. An interrupted replace is judged by the installed binary's
    /// digest. A restart that was issued is assumed to have happened and only
    /// verified, as is an interrupted rollback.
    pub async fn recover(&self, mut record: NodeUpgradeState) -> NodeUpgradeState {
        use UpgradeState as S;

        if record.is_terminal() {
            return record;
        }

        warn!(
            directive = %record.directive_id,
            phase = ?record.phase,
            "Recovering interrupted upgrade"
        );

        let mut fsm = record.to_fsm();
        let event = match record.phase {
            S::Idle | S::Downloading | S::Verifying | S::BackingUp => Some(UpgradeEvent::Abort(
                "interrupted before the binary was replaced".to_string(),
            )),
            S::Replacing => Some(self.check_replaced(&record).await),
            S::Restarting => Some(UpgradeEvent::Restarted),
            S::RollingBack => Some(self.confirm_rollback(record.previous_version.as_deref()).await),
            _ => None,
        };

        if let Some(event) = event {
            self.apply(&mut fsm, &mut record, event).await;
        }
        self.drive(&mut fsm, &mut record).await;
        record
    }

    async fn drive(&self, fsm: &mut UpgradeFsm, record: &mut NodeUpgradeState) {
        use UpgradeState as S;

        while !fsm.is_terminal() {
            let event = match fsm.state() {
                S::Idle => UpgradeEvent::Start,
                S::Downloading => self.download(record, fsm.attempts()).await,
                S::Verifying => self.verify(record).await,
                S::BackingUp => self.backup(record).await,
                S::Replacing => self.replace().await,
                S::Restarting => self.restart().await,
                S::VerifyingRunning => self.verify_running(&record.target_version).await,
                S::RollingBack => self.roll_back(record.previous_version.as_deref()).await,
                _ => break,
            };
            self.apply(fsm, record, event).await;
        }

        self.finish(record).await;
    }

    async fn apply(&self, fsm: &mut UpgradeFsm, record: &mut NodeUpgradeState, event: UpgradeEvent) {
        let from = fsm.state();

        if let Err(e) = fsm.process(event) {
            error!(directive = %record.directive_id, "{}", e);
            if fsm.process(UpgradeEvent::Abort(e.to_string())).is_err() {
                *fsm = UpgradeFsm::resume(
                    UpgradeState::Failed,
                    fsm.attempts(),
                    Some(e.to_string()),
                    Some(FailureClass::Operational),
                );
            }
        }

        debug!(
            directive = %record.directive_id,
            "{:?} -> {:?}",
            from,
            fsm.state()
        );

        record.record_progress(fsm);
        if let Err(e) = self.store.update(record).await {
            warn!(directive = %record.directive_id, "Failed to persist upgrade state: {}", e);
        }
    }

    async fn download(&self, record: &NodeUpgradeState, attempt: u32) -> UpgradeEvent {
        let staged = self.work.staged_binary();

        match self.fetcher.fetch(&record.download_url, &staged).await {
            Ok(bytes) => {
                info!(
                    directive = %record.directive_id,
                    "Downloaded {} bytes from {}",
                    bytes,
                    record.download_url
                );
                UpgradeEvent::Downloaded
            }
            Err(FetchError::Transient(err)) if attempt < self.settings.download_attempts => {
                let delay =
                    calc_exp_backoff(&self.settings.download_backoff, attempt.saturating_sub(1));
                warn!(
                    directive = %record.directive_id,
                    "Download attempt {} failed: {}. Retrying in {:?}",
                    attempt,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                UpgradeEvent::DownloadRetry(err)
            }
            Err(FetchError::Transient(err)) => UpgradeEvent::DownloadFailed {
                error: format!("{} (gave up after {} attempts)", err, attempt),
                class: FailureClass::Transient,
            },
            Err(FetchError::Permanent(err)) => UpgradeEvent::DownloadFailed {
                error: err,
                class: FailureClass::Permanent,
            },
            Err(FetchError::Local(err)) => UpgradeEvent::Abort(err),
        }
    }

    async fn verify(&self, record: &NodeUpgradeState) -> UpgradeEvent {
        let staged = self.work.staged_binary();

        match staged.sha256_hex().await {
            Ok(actual) if digests_match(&record.expected_checksum_hex, &actual) => {}
            Ok(actual) => {
                return UpgradeEvent::ChecksumMismatch(format!(
                    "checksum mismatch: expected {}, got {}",
                    record.expected_checksum_hex.trim(),
                    actual
                ))
            }
            Err(e) => return UpgradeEvent::Abort(format!("failed to hash staged artifact: {}", e)),
        }

        if !self.verifier.is_enforced() {
            return UpgradeEvent::ChecksumVerified;
        }

        let data = match staged.read_bytes().await {
            Ok(data) => data,
            Err(e) => return UpgradeEvent::Abort(format!("failed to read staged artifact: {}", e)),
        };
        match self.verifier.verify(&data, record.signature.as_ref()) {
            Ok(()) => UpgradeEvent::ChecksumVerified,
            Err(e) => UpgradeEvent::ChecksumMismatch(e.to_string()),
        }
    }

    async fn backup(&self, record: &mut NodeUpgradeState) -> UpgradeEvent {
        if !self.installed.exists().await {
            return UpgradeEvent::BackupFailed(format!(
                "installed binary {:?} not found",
                self.installed.path()
            ));
        }

        match self.service.running_version().await {
            Ok(version) => record.previous_version = Some(version),
            Err(e) => warn!(
                directive = %record.directive_id,
                "Could not read the current version: {}", e
            ),
        }

        match self.installed.copy_to(&self.work.backup_binary()).await {
            Ok(_) => UpgradeEvent::BackupCreated,
            Err(e) => UpgradeEvent::BackupFailed(format!("failed to back up binary: {}", e)),
        }
    }

    async fn replace(&self) -> UpgradeEvent {
        // Stage next to the installed binary so the final rename stays on one
        // filesystem.
        let incoming = self.installed.sibling("incoming");

        let result: Result<(), FleetError> = async {
            self.work.staged_binary().copy_to(&incoming).await?;
            incoming.set_executable().await?;
            incoming.rename_over(&self.installed).await
        }
        .await;

        match result {
            Ok(()) => UpgradeEvent::Replaced,
            Err(e) => {
                let _ = incoming.delete().await;
                UpgradeEvent::ReplaceFailed(format!("failed to replace binary: {}", e))
            }
        }
    }

    async fn check_replaced(&self, record: &NodeUpgradeState) -> UpgradeEvent {
        match self.installed.sha256_hex().await {
            Ok(actual) if digests_match(&record.expected_checksum_hex, &actual) => {
                UpgradeEvent::Replaced
            }
            _ => UpgradeEvent::ReplaceFailed("interrupted while replacing the binary".to_string()),
        }
    }

    async fn restart(&self) -> UpgradeEvent {
        match self.service.restart().await {
            Ok(()) => UpgradeEvent::Restarted,
            Err(e) => UpgradeEvent::RestartFailed(e.to_string()),
        }
    }

    async fn verify_running(&self, target_version: &str) -> UpgradeEvent {
        tokio::time::sleep(self.settings.settle_delay).await;

        match self.service.is_active().await {
            Ok(true) => {}
            Ok(false) => {
                return UpgradeEvent::RunningCheckFailed(
                    "service is not active after restart".to_string(),
                )
            }
            Err(e) => return UpgradeEvent::RunningCheckFailed(e.to_string()),
        }

        match self.service.running_version().await {
            Ok(version) if version == target_version => UpgradeEvent::RunningVerified,
            Ok(version) => UpgradeEvent::RunningCheckFailed(format!(
                "service reports version {}, expected {}",
                version, target_version
            )),
            Err(e) => UpgradeEvent::RunningCheckFailed(e.to_string()),
        }
    }

    async fn roll_back(&self, previous_version: Option<&str>) -> UpgradeEvent {
        let backup = self.work.backup_binary();
        if !backup.exists().await {
            return UpgradeEvent::RollbackFailed("no backup binary to restore".to_string());
        }

        let restore = self.installed.sibling("restore");
        let restored: Result<(), FleetError> = async {
            backup.copy_to(&restore).await?;
            restore.rename_over(&self.installed).await
        }
        .await;

        if let Err(e) = restored {
            let _ = restore.delete().await;
            return UpgradeEvent::RollbackFailed(format!("failed to restore backup: {}", e));
        }

        if let Err(e) = self.service.restart().await {
            return UpgradeEvent::RollbackFailed(e.to_string());
        }

        self.confirm_rollback(previous_version).await
    }

    async fn confirm_rollback(&self, previous_version: Option<&str>) -> UpgradeEvent {
        tokio::time::sleep(self.settings.settle_delay).await;

        match self.service.is_active().await {
            Ok(true) => {}
            Ok(false) => {
                return UpgradeEvent::RollbackFailed(
                    "service is not active after restoring the backup".to_string(),
                )
            }
            Err(e) => return UpgradeEvent::RollbackFailed(e.to_string()),
        }

        let Some(expected) = previous_version else {
            return UpgradeEvent::RollbackSucceeded;
        };

        match self.service.running_version().await {
            Ok(version) if version == expected => UpgradeEvent::RollbackSucceeded,
            Ok(version) => UpgradeEvent::RollbackFailed(format!(
                "restored service reports version {}, expected {}",
                version, expected
            )),
            Err(e) => UpgradeEvent::RollbackFailed(e.to_string()),
        }
    }

    async fn finish(&self, record: &NodeUpgradeState) {
        // The backup stays on disk when an operator has to restore by hand.
        let cleanup = if record.phase == UpgradeState::ManualInterventionRequired {
            self.work.staged_binary().delete().await
        } else {
            self.work.cleanup().await
        };
        if let Err(e) = cleanup {
            warn!(directive = %record.directive_id, "Failed to clean up upgrade files: {}", e);
        }

        match record.phase {
            UpgradeState::Completed => info!(
                directive = %record.directive_id,
                "Upgrade to {} completed",
                record.target_version
            ),
            phase => warn!(
                directive = %record.directive_id,
                outcome = ?record.outcome,
                "Upgrade ended in {:?}: {}",
                phase,
                record.last_error.as_deref().unwrap_or("no error recorded")
            ),
        }
    }
}
