//! Directive dispatch
//!
//! A bounded pool of delivery tasks. Tasks resolve the artifact, deliver the
//! directive with a small retry budget and write failures into the tracker.
//! They never touch campaign state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use node_api::{DirectiveKind, FailureClass, UpgradeDirective};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::campaign::artifacts::ArtifactSource;
use crate::campaign::inventory::FleetNode;
use crate::tracker::{PhaseKey, ProgressTracker};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Delivery failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Network error or server-side failure; retried
    #[error("node unreachable: {0}")]
    Unreachable(String),

    /// The node refused the directive; never retried
    #[error("directive rejected: {0}")]
    Rejected(String),
}

/// Delivers a directive to one node
#[async_trait]
pub trait NodeDispatcher: Send + Sync {
    async fn dispatch(&self, node: &FleetNode, directive: &UpgradeDirective)
        -> Result<(), DispatchError>;
}

/// A directive waiting for a dispatch slot
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub campaign_id: String,
    pub phase: PhaseKey,
    pub node: FleetNode,
    pub version: String,
    pub kind: DirectiveKind,
    pub directive_id: String,
}

impl DispatchJob {
    pub fn new(
        campaign_id: &str,
        phase: PhaseKey,
        node: FleetNode,
        version: &str,
        kind: DirectiveKind,
    ) -> Self {
        Self {
            campaign_id: campaign_id.to_string(),
            phase,
            node,
            version: version.to_string(),
            kind,
            directive_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Dispatch pool options
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Global cap on deliveries in flight
    pub max_concurrent: usize,
    /// Delivery attempts before a node counts as unreachable
    pub attempts: u32,
    pub cooldown: CooldownOptions,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            attempts: 3,
            cooldown: CooldownOptions::default(),
        }
    }
}

/// Bounded dispatch pool
pub struct DispatchPool {
    options: DispatchOptions,
    dispatcher: Arc<dyn NodeDispatcher>,
    artifacts: Arc<dyn ArtifactSource>,
    tracker: Arc<ProgressTracker>,
    tasks: JoinSet<()>,
}

impl DispatchPool {
    pub fn new(
        options: DispatchOptions,
        dispatcher: Arc<dyn NodeDispatcher>,
        artifacts: Arc<dyn ArtifactSource>,
        tracker: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            options,
            dispatcher,
            artifacts,
            tracker,
            tasks: JoinSet::new(),
        }
    }

    /// Free delivery slots
    pub fn capacity(&self) -> usize {
        self.options.max_concurrent.saturating_sub(self.tasks.len())
    }

    /// Register the directive as pending and start delivering it
    pub fn submit(&mut self, job: DispatchJob) {
        self.tracker.record_dispatched(
            &job.campaign_id,
            job.phase,
            &job.node.node_id,
            &job.directive_id,
        );

        let dispatcher = self.dispatcher.clone();
        let artifacts = self.artifacts.clone();
        let tracker = self.tracker.clone();
        let options = self.options.clone();

        self.tasks.spawn(async move {
            deliver(job, dispatcher.as_ref(), artifacts.as_ref(), &tracker, &options).await;
        });
    }

    /// Collect finished delivery tasks
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                warn!("Dispatch task ended abnormally: {}", e);
            }
        }
    }

    /// Abort deliveries still in flight
    pub fn shutdown(&mut self) {
        self.tasks.abort_all();
    }
}

async fn deliver(
    job: DispatchJob,
    dispatcher: &dyn NodeDispatcher,
    artifacts: &dyn ArtifactSource,
    tracker: &ProgressTracker,
    options: &DispatchOptions,
) {
    let artifact = match artifacts.resolve(&job.version, &job.node.platform).await {
        Ok(artifact) => artifact,
        Err(e) => {
            warn!(
                campaign = %job.campaign_id,
                node = %job.node.node_id,
                "Artifact unavailable: {}",
                e
            );
            tracker.record_failure(&job.directive_id, FailureClass::Permanent, e.to_string());
            return;
        }
    };

    let directive = UpgradeDirective {
        directive_id: job.directive_id.clone(),
        node_id: job.node.node_id.clone(),
        target_version: job.version.clone(),
        artifact_url: artifact.url,
        expected_checksum_hex: artifact.checksum_hex,
        issued_at: Utc::now(),
        kind: job.kind,
        signature: artifact.signature,
    };

    let mut attempt = 1;
    loop {
        match dispatcher.dispatch(&job.node, &directive).await {
            Ok(()) => {
                debug!(
                    campaign = %job.campaign_id,
                    node = %job.node.node_id,
                    directive = %directive.directive_id,
                    "Directive delivered"
                );
                return;
            }
            Err(DispatchError::Rejected(reason)) => {
                warn!(
                    campaign = %job.campaign_id,
                    node = %job.node.node_id,
                    "Directive rejected: {}",
                    reason
                );
                tracker.record_failure(&directive.directive_id, FailureClass::Rejected, reason);
                return;
            }
            Err(DispatchError::Unreachable(err)) if attempt < options.attempts => {
                let delay = calc_exp_backoff(&options.cooldown, attempt - 1);
                debug!(
                    node = %job.node.node_id,
                    "Delivery attempt {} failed: {}. Retrying in {:?}",
                    attempt,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(DispatchError::Unreachable(err)) => {
                warn!(
                    campaign = %job.campaign_id,
                    node = %job.node.node_id,
                    "Node unreachable after {} attempts: {}",
                    attempt,
                    err
                );
                tracker.record_failure(&directive.directive_id, FailureClass::Unreachable, err);
                return;
            }
        }
    }
}
