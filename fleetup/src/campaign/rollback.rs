//! Rollback controller
//!
//! Compensates a failed (or operator-cancelled) rollout by sending downgrade
//! directives to the previous known-good version. Only nodes that reported
//! `success` are running the new binary, so only they are downgraded; a
//! success that arrives after the rollback began gets its own downgrade
//! through [`RollbackController::follow_up`]. A downgrade that does not
//! succeed is never retried; the node is flagged for manual intervention
//! instead.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use control_api::{RollbackEvent, RollbackTrigger};
use node_api::{DirectiveKind, Outcome};
use tracing::{info, warn};

use crate::campaign::dispatch::DispatchJob;
use crate::campaign::inventory::FleetNode;
use crate::campaign::model::Campaign;
use crate::tracker::{PhaseKey, ProgressTracker};

pub struct RollbackController {
    tracker: Arc<ProgressTracker>,
}

impl RollbackController {
    pub fn new(tracker: Arc<ProgressTracker>) -> Self {
        Self { tracker }
    }

    /// Record a rollback event covering `phases` and build its downgrade jobs.
    ///
    /// Returns the index of the new event in `campaign.rollback_events`.
    pub fn initiate(
        &self,
        campaign: &mut Campaign,
        nodes: &HashMap<String, FleetNode>,
        trigger: RollbackTrigger,
        phases: &[usize],
    ) -> (usize, Vec<DispatchJob>) {
        let event_index = campaign.rollback_events.len();
        let key = PhaseKey::Rollback(event_index);

        let mut affected = BTreeSet::new();
        let mut targets = Vec::new();
        for &phase in phases {
            for outcome in self.tracker.outcomes(&campaign.id, PhaseKey::Rollout(phase)) {
                affected.insert(outcome.node_id.clone());
                if outcome.reached_target()
                    && !campaign.manual_intervention.contains(&outcome.node_id)
                {
                    targets.push(outcome.node_id);
                }
            }
        }

        let jobs: Vec<DispatchJob> = targets
            .iter()
            .filter_map(|node_id| nodes.get(node_id))
            .map(|node| {
                DispatchJob::new(
                    &campaign.id,
                    key,
                    node.clone(),
                    &campaign.previous_version,
                    DirectiveKind::Downgrade,
                )
            })
            .collect();

        warn!(
            campaign = %campaign.id,
            trigger = ?trigger,
            affected = affected.len(),
            downgrades = jobs.len(),
            "Rolling back to {}",
            campaign.previous_version
        );

        campaign.rollback_events.push(RollbackEvent {
            campaign_id: campaign.id.clone(),
            triggered_by: trigger,
            affected_nodes: affected.into_iter().collect(),
            initiated_at: Utc::now(),
            completed_at: None,
            manual_intervention: Vec::new(),
        });

        (event_index, jobs)
    }

    /// Downgrade a node whose upgrade success was reported after rollback
    /// event `event_index` had already been initiated. Reopens the event.
    pub fn follow_up(
        &self,
        campaign: &mut Campaign,
        node: &FleetNode,
        event_index: usize,
    ) -> DispatchJob {
        warn!(
            campaign = %campaign.id,
            node = %node.node_id,
            event = event_index,
            "Late upgrade success on a rolled back phase, downgrading to {}",
            campaign.previous_version
        );

        if let Some(event) = campaign.rollback_events.get_mut(event_index) {
            if !event.affected_nodes.contains(&node.node_id) {
                event.affected_nodes.push(node.node_id.clone());
            }
            event.completed_at = None;
        }

        DispatchJob::new(
            &campaign.id,
            PhaseKey::Rollback(event_index),
            node.clone(),
            &campaign.previous_version,
            DirectiveKind::Downgrade,
        )
    }

    /// Whether every downgrade of the event has reported
    pub fn is_settled(&self, campaign_id: &str, event_index: usize) -> bool {
        self.tracker
            .progress(campaign_id, PhaseKey::Rollback(event_index))
            .pending
            == 0
    }

    /// Close the event: unreported downgrades expire, and every node whose
    /// downgrade did not succeed is flagged for manual intervention.
    pub fn settle(&self, campaign: &mut Campaign, event_index: usize) {
        let key = PhaseKey::Rollback(event_index);
        self.tracker.expire_pending(&campaign.id, key);

        let stuck: Vec<String> = self
            .tracker
            .outcomes(&campaign.id, key)
            .into_iter()
            .filter(|o| o.outcome != Outcome::Success)
            .map(|o| {
                warn!(
                    campaign = %campaign.id,
                    node = %o.node_id,
                    class = ?o.failure_class,
                    "Downgrade failed, manual intervention required: {}",
                    o.last_error.as_deref().unwrap_or("no error reported")
                );
                o.node_id
            })
            .collect();

        campaign.manual_intervention.extend(stuck.iter().cloned());

        if let Some(event) = campaign.rollback_events.get_mut(event_index) {
            event.completed_at = Some(Utc::now());
            event.manual_intervention = stuck;
        }

        info!(campaign = %campaign.id, event = event_index, "Rollback settled");
    }
}
