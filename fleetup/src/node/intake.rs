//! Directive intake
//!
//! Validates pushed directives, claims the single upgrade slot and runs the
//! executor in the background. The outcome is reported as soon as the run
//! ends; the reporter worker retries anything that could not be delivered.

use std::sync::Arc;

use node_api::UpgradeDirective;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::errors::FleetError;
use crate::node::artifact::resolve_download_url;
use crate::node::executor::UpgradeExecutor;
use crate::node::reporting::{flush_outcome, OutcomeReporter};
use crate::node::state::{NodeUpgradeState, UpgradeStateStore};

/// Directive intake for one node
pub struct UpgradeIntake {
    node_id: String,
    platform: String,
    download_base_url: String,
    store: Arc<UpgradeStateStore>,
    executor: Arc<UpgradeExecutor>,
    reporter: Arc<dyn OutcomeReporter>,
    running: Mutex<Option<JoinHandle<()>>>,
}

impl UpgradeIntake {
    pub fn new(
        node_id: String,
        platform: String,
        download_base_url: String,
        store: Arc<UpgradeStateStore>,
        executor: Arc<UpgradeExecutor>,
        reporter: Arc<dyn OutcomeReporter>,
    ) -> Self {
        Self {
            node_id,
            platform,
            download_base_url,
            store,
            executor,
            reporter,
            running: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<UpgradeStateStore> {
        &self.store
    }

    /// Accept a directive and start executing it
    pub async fn accept(&self, directive: UpgradeDirective) -> Result<NodeUpgradeState, FleetError> {
        self.validate(&directive)?;

        // A retried delivery of the directive already on record is not a new
        // upgrade.
        if let Some(current) = self.store.current().await {
            if current.directive_id == directive.directive_id {
                info!(directive = %current.directive_id, "Directive re-delivered");
                return Ok(current);
            }
        }

        let download_url =
            resolve_download_url(&directive, &self.download_base_url, &self.platform)
                .map_err(|e| FleetError::InvalidDirective(e.to_string()))?;

        let record = self.store.try_begin(&directive, download_url).await?;
        info!(
            directive = %record.directive_id,
            target = %record.target_version,
            "Directive accepted"
        );

        self.spawn(record.clone(), false).await;
        Ok(record)
    }

    /// Resume an upgrade left unfinished by a previous process
    pub async fn recover(&self) -> Option<NodeUpgradeState> {
        let current = self.store.current().await?;
        if current.is_terminal() {
            return None;
        }

        self.spawn(current.clone(), true).await;
        Some(current)
    }

    /// Wait for the running upgrade, if any, to finish
    pub async fn wait_idle(&self) {
        let handle = self.running.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Upgrade task ended abnormally: {}", e);
            }
        }
    }

    fn validate(&self, directive: &UpgradeDirective) -> Result<(), FleetError> {
        if directive.node_id != self.node_id {
            return Err(FleetError::InvalidDirective(format!(
                "directive is addressed to {}, this node is {}",
                directive.node_id, self.node_id
            )));
        }

        if directive.target_version.trim().is_empty() {
            return Err(FleetError::InvalidDirective(
                "target_version is empty".to_string(),
            ));
        }

        match hex::decode(directive.expected_checksum_hex.trim()) {
            Ok(digest) if digest.len() == 32 => Ok(()),
            _ => Err(FleetError::InvalidDirective(
                "expected_checksum_hex is not a SHA-256 hex digest".to_string(),
            )),
        }
    }

    async fn spawn(&self, record: NodeUpgradeState, recovering: bool) {
        let executor = self.executor.clone();
        let store = self.store.clone();
        let reporter = self.reporter.clone();
        let node_id = self.node_id.clone();

        let handle = tokio::spawn(async move {
            if recovering {
                executor.recover(record).await;
            } else {
                executor.execute(record).await;
            }

            if let Err(e) = flush_outcome(&store, reporter.as_ref(), &node_id).await {
                warn!("Outcome report failed, will retry: {}", e);
            }
        });

        *self.running.lock().await = Some(handle);
    }
}
