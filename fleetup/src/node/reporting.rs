//! Outcome delivery to the coordinator

use async_trait::async_trait;
use node_api::OutcomeReport;
use tracing::info;

use crate::errors::FleetError;
use crate::node::state::UpgradeStateStore;

/// Sends terminal outcomes to the coordinator
#[async_trait]
pub trait OutcomeReporter: Send + Sync {
    async fn report(&self, report: &OutcomeReport) -> Result<(), FleetError>;
}

/// Report every terminal outcome the coordinator has not acknowledged yet,
/// oldest first.
///
/// Returns `true` when at least one report was delivered.
pub async fn flush_outcome(
    store: &UpgradeStateStore,
    reporter: &dyn OutcomeReporter,
    node_id: &str,
) -> Result<bool, FleetError> {
    let mut delivered = false;

    while let Some(record) = store.unreported().await {
        let report = record.to_report(node_id);
        reporter.report(&report).await?;
        store.mark_reported(&record.directive_id).await?;

        info!(
            directive = %record.directive_id,
            outcome = ?report.outcome,
            "Outcome reported"
        );
        delivered = true;
    }

    Ok(delivered)
}
