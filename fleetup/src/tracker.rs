//! Progress tracker
//!
//! Aggregates directive outcomes per campaign phase. Dispatch workers and the
//! report endpoint write here; the coordinator's control loop reads counters
//! and drains follow-ups on every tick. Counters move with each transition,
//! so reads never walk a phase's directives. Every operation is idempotent
//! per `directive_id`.

use std::collections::HashMap;
use std::sync::RwLock;

use control_api::PhaseProgress;
use node_api::{FailureClass, Outcome, OutcomeReport};
use tracing::{debug, info};

use crate::errors::FleetError;

/// Which batch of directives an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKey {
    /// Upgrade directives of phase N
    Rollout(usize),
    /// Downgrade directives of rollback event N
    Rollback(usize),
}

/// Result of ingesting an outcome report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// First terminal outcome for the directive
    Recorded,
    /// The directive already had a terminal outcome
    Duplicate,
    /// Arrived after the directive expired; kept but not counted
    Late,
}

/// Latest known outcome of one node in a phase
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub node_id: String,
    pub outcome: Outcome,
    pub failure_class: Option<FailureClass>,
    pub last_error: Option<String>,
    /// What the node reported after its directive expired
    pub late_outcome: Option<Outcome>,
}

impl NodeOutcome {
    /// Whether the node ended up on the directive's version, on time or not
    pub fn reached_target(&self) -> bool {
        self.outcome == Outcome::Success || self.late_outcome == Some(Outcome::Success)
    }
}

/// Upgrade that succeeded after its phase stopped waiting for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LateSuccess {
    pub phase: usize,
    pub node_id: String,
}

/// Reports the control loop has to act on beyond the counters
#[derive(Debug, Default)]
pub struct Followups {
    /// Nodes whose upgrade ended in `manual_intervention_required`
    pub manual_intervention: Vec<String>,
    pub late_successes: Vec<LateSuccess>,
}

impl Followups {
    fn is_empty(&self) -> bool {
        self.manual_intervention.is_empty() && self.late_successes.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    campaign_id: String,
    phase: PhaseKey,
    node_id: String,
    outcome: Outcome,
    failure_class: Option<FailureClass>,
    last_error: Option<String>,
    expired: bool,
    late_outcome: Option<Outcome>,
}

#[derive(Debug, Default)]
struct PhaseLedger {
    directives: Vec<String>,
    progress: PhaseProgress,
}

#[derive(Debug, Default)]
struct CampaignLedger {
    phases: HashMap<PhaseKey, PhaseLedger>,
    /// Rollout outcomes across all phases
    succeeded: u64,
    failed: u64,
    followups: Followups,
}

#[derive(Debug, Default)]
struct Ledger {
    entries: HashMap<String, Entry>,
    campaigns: HashMap<String, CampaignLedger>,
    /// Campaigns with undrained follow-ups
    noted: Vec<String>,
}

impl Ledger {
    /// Move the counters of a pending entry that just turned terminal
    fn count_terminal(&mut self, directive_id: &str) {
        let Some(entry) = self.entries.get(directive_id) else {
            return;
        };
        let Some(campaign) = self.campaigns.get_mut(&entry.campaign_id) else {
            return;
        };

        let success = entry.outcome == Outcome::Success;
        if let Some(phase) = campaign.phases.get_mut(&entry.phase) {
            phase.progress.pending = phase.progress.pending.saturating_sub(1);
            if success {
                phase.progress.succeeded += 1;
            } else {
                phase.progress.failed += 1;
            }
        }

        if let PhaseKey::Rollout(_) = entry.phase {
            if success {
                campaign.succeeded += 1;
            } else {
                campaign.failed += 1;
            }
        }
    }

    fn note(&mut self, campaign_id: &str, add: impl FnOnce(&mut Followups)) {
        let Some(campaign) = self.campaigns.get_mut(campaign_id) else {
            return;
        };
        if campaign.followups.is_empty() {
            self.noted.push(campaign_id.to_string());
        }
        add(&mut campaign.followups);
    }

    fn phase(&self, campaign_id: &str, phase: PhaseKey) -> Option<&PhaseLedger> {
        self.campaigns.get(campaign_id)?.phases.get(&phase)
    }
}

/// Outcome ledger keyed by directive id
#[derive(Debug, Default)]
pub struct ProgressTracker {
    ledger: RwLock<Ledger>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a directive as pending
    pub fn record_dispatched(
        &self,
        campaign_id: &str,
        phase: PhaseKey,
        node_id: &str,
        directive_id: &str,
    ) {
        let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());
        if ledger.entries.contains_key(directive_id) {
            return;
        }

        ledger.entries.insert(
            directive_id.to_string(),
            Entry {
                campaign_id: campaign_id.to_string(),
                phase,
                node_id: node_id.to_string(),
                outcome: Outcome::Pending,
                failure_class: None,
                last_error: None,
                expired: false,
                late_outcome: None,
            },
        );

        let batch = ledger
            .campaigns
            .entry(campaign_id.to_string())
            .or_default()
            .phases
            .entry(phase)
            .or_default();
        batch.directives.push(directive_id.to_string());
        batch.progress.attempted += 1;
        batch.progress.pending += 1;
    }

    /// Fail a pending directive on the coordinator side (delivery failed).
    ///
    /// Returns false if the directive is unknown or already terminal.
    pub fn record_failure(&self, directive_id: &str, class: FailureClass, error: String) -> bool {
        let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());
        match ledger.entries.get_mut(directive_id) {
            Some(entry) if entry.outcome == Outcome::Pending => {
                debug!(
                    directive = %directive_id,
                    node = %entry.node_id,
                    "Directive failed before reaching the node: {}",
                    error
                );
                entry.outcome = Outcome::Failed;
                entry.failure_class = Some(class);
                entry.last_error = Some(error);
            }
            _ => return false,
        }
        ledger.count_terminal(directive_id);
        true
    }

    /// Apply a node's outcome report
    pub fn ingest(&self, report: &OutcomeReport) -> Result<Ingested, FleetError> {
        if !report.outcome.is_terminal() {
            return Err(FleetError::ReportError(
                "only terminal outcomes can be reported".to_string(),
            ));
        }

        let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());
        let entry = ledger.entries.get_mut(&report.directive_id).ok_or_else(|| {
            FleetError::NotFound(format!("unknown directive {}", report.directive_id))
        })?;

        if entry.node_id != report.node_id {
            return Err(FleetError::Unauthorized(format!(
                "directive {} was not issued to node {}",
                report.directive_id, report.node_id
            )));
        }

        let campaign_id = entry.campaign_id.clone();
        let phase = entry.phase;

        if entry.outcome.is_terminal() {
            if !entry.expired || entry.late_outcome.is_some() {
                return Ok(Ingested::Duplicate);
            }

            info!(
                directive = %report.directive_id,
                node = %report.node_id,
                outcome = ?report.outcome,
                "Late report after the phase window closed"
            );
            entry.late_outcome = Some(report.outcome);

            if let PhaseKey::Rollout(index) = phase {
                match report.outcome {
                    Outcome::Success => ledger.note(&campaign_id, |f| {
                        f.late_successes.push(LateSuccess {
                            phase: index,
                            node_id: report.node_id.clone(),
                        })
                    }),
                    Outcome::ManualInterventionRequired => ledger.note(&campaign_id, |f| {
                        f.manual_intervention.push(report.node_id.clone())
                    }),
                    _ => {}
                }
            }
            return Ok(Ingested::Late);
        }

        entry.outcome = report.outcome;
        entry.failure_class = report.failure_class;
        entry.last_error = report.last_error.clone();
        ledger.count_terminal(&report.directive_id);

        if matches!(phase, PhaseKey::Rollout(_))
            && report.outcome == Outcome::ManualInterventionRequired
        {
            ledger.note(&campaign_id, |f| {
                f.manual_intervention.push(report.node_id.clone())
            });
        }
        Ok(Ingested::Recorded)
    }

    /// Fail every directive of a phase still pending; returns their node ids
    pub fn expire_pending(&self, campaign_id: &str, phase: PhaseKey) -> Vec<String> {
        let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());

        let pending: Vec<String> = match ledger.phase(campaign_id, phase) {
            Some(batch) if batch.progress.pending > 0 => batch
                .directives
                .iter()
                .filter(|id| {
                    ledger
                        .entries
                        .get(id.as_str())
                        .is_some_and(|e| e.outcome == Outcome::Pending)
                })
                .cloned()
                .collect(),
            _ => return Vec::new(),
        };

        let mut expired = Vec::new();
        for id in &pending {
            if let Some(entry) = ledger.entries.get_mut(id) {
                entry.outcome = Outcome::Failed;
                entry.failure_class = Some(FailureClass::Expired);
                entry.last_error = Some("no report before the window closed".to_string());
                entry.expired = true;
                expired.push(entry.node_id.clone());
            }
            ledger.count_terminal(id);
        }
        expired
    }

    /// Counts for one phase
    pub fn progress(&self, campaign_id: &str, phase: PhaseKey) -> PhaseProgress {
        let ledger = self.ledger.read().unwrap_or_else(|e| e.into_inner());
        ledger
            .phase(campaign_id, phase)
            .map(|batch| batch.progress)
            .unwrap_or_default()
    }

    /// Node outcomes of one phase
    pub fn outcomes(&self, campaign_id: &str, phase: PhaseKey) -> Vec<NodeOutcome> {
        let ledger = self.ledger.read().unwrap_or_else(|e| e.into_inner());
        let Some(batch) = ledger.phase(campaign_id, phase) else {
            return Vec::new();
        };

        batch
            .directives
            .iter()
            .filter_map(|id| ledger.entries.get(id))
            .map(|entry| NodeOutcome {
                node_id: entry.node_id.clone(),
                outcome: entry.outcome,
                failure_class: entry.failure_class,
                last_error: entry.last_error.clone(),
                late_outcome: entry.late_outcome,
            })
            .collect()
    }

    /// Rollout successes and failures across all phases of a campaign
    pub fn campaign_totals(&self, campaign_id: &str) -> (u64, u64) {
        let ledger = self.ledger.read().unwrap_or_else(|e| e.into_inner());
        ledger
            .campaigns
            .get(campaign_id)
            .map(|c| (c.succeeded, c.failed))
            .unwrap_or((0, 0))
    }

    /// Drain follow-ups of every campaign that has any
    pub fn take_followups(&self) -> Vec<(String, Followups)> {
        let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());
        let noted = std::mem::take(&mut ledger.noted);

        noted
            .into_iter()
            .filter_map(|id| {
                let followups = std::mem::take(&mut ledger.campaigns.get_mut(&id)?.followups);
                Some((id, followups))
            })
            .collect()
    }
}
