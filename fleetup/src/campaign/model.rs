//! Campaign aggregate

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use control_api::{
    CampaignConfig, CampaignSnapshot, CampaignStatus, PhaseConfig, PhaseResult, RollbackEvent,
};

use crate::errors::FleetError;

/// A staged rollout of one target version across the fleet.
///
/// Owned and mutated by the coordinator's control loop only.
#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub target_version: String,
    pub previous_version: String,
    pub phases: Vec<PhaseConfig>,
    pub rollback_threshold: f64,

    pub status: CampaignStatus,
    pub current_phase: usize,
    pub total_nodes: u64,
    pub phase_results: Vec<PhaseResult>,
    pub rollback_events: Vec<RollbackEvent>,
    pub manual_intervention: BTreeSet<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Build a draft campaign from operator configuration
    pub fn from_config(config: CampaignConfig, total_nodes: u64) -> Result<Self, FleetError> {
        validate(&config)?;

        let id = config
            .campaign_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let name = config
            .name
            .unwrap_or_else(|| format!("upgrade to {}", config.target_version));

        Ok(Self {
            id,
            name,
            target_version: config.target_version,
            previous_version: config.previous_version,
            phases: config.phases,
            rollback_threshold: config.rollback_threshold,
            status: CampaignStatus::Draft,
            current_phase: 0,
            total_nodes,
            phase_results: Vec::new(),
            rollback_events: Vec::new(),
            manual_intervention: BTreeSet::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a terminal status and stamp the completion time
    pub fn finish(&mut self, status: CampaignStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Read-only view with counts supplied by the tracker
    pub fn snapshot(&self, success_count: u64, failure_count: u64) -> CampaignSnapshot {
        CampaignSnapshot {
            campaign_id: self.id.clone(),
            name: Some(self.name.clone()),
            target_version: self.target_version.clone(),
            previous_version: self.previous_version.clone(),
            status: self.status,
            phases: self.phases.clone(),
            rollback_threshold: self.rollback_threshold,
            current_phase: self.current_phase,
            total_nodes: self.total_nodes,
            success_count,
            failure_count,
            phase_results: self.phase_results.clone(),
            rollback_events: self.rollback_events.clone(),
            manual_intervention_nodes: self.manual_intervention.iter().cloned().collect(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Check operator configuration before a campaign is created.
///
/// Phase percentages are cumulative, so they must increase and the last phase
/// must cover the whole fleet. Trailing phases may repeat 100%.
pub fn validate(config: &CampaignConfig) -> Result<(), FleetError> {
    let invalid = |msg: String| -> Result<(), FleetError> { Err(FleetError::InvalidCampaign(msg)) };

    if config.target_version.trim().is_empty() {
        return invalid("target_version is required".to_string());
    }
    if config.previous_version.trim().is_empty() {
        return invalid("previous_version is required".to_string());
    }
    if config.target_version == config.previous_version {
        return invalid("target_version equals previous_version".to_string());
    }
    if config.phases.is_empty() {
        return invalid("at least one phase is required".to_string());
    }
    if !(0.0..=100.0).contains(&config.rollback_threshold) {
        return invalid(format!(
            "rollback_threshold {} is outside 0..=100",
            config.rollback_threshold
        ));
    }

    let mut previous = 0.0;
    for phase in &config.phases {
        if phase.name.trim().is_empty() {
            return invalid("phase name is required".to_string());
        }
        if !(phase.percentage > 0.0 && phase.percentage <= 100.0) {
            return invalid(format!(
                "phase {}: percentage {} is outside (0, 100]",
                phase.name, phase.percentage
            ));
        }
        let repeats_full_fleet = phase.percentage == 100.0 && previous == 100.0;
        if phase.percentage <= previous && !repeats_full_fleet {
            return invalid(format!(
                "phase {}: percentage {} does not exceed the previous phase",
                phase.name, phase.percentage
            ));
        }
        if !(0.0..=100.0).contains(&phase.success_threshold) {
            return invalid(format!(
                "phase {}: success_threshold {} is outside 0..=100",
                phase.name, phase.success_threshold
            ));
        }
        previous = phase.percentage;
    }

    if previous < 100.0 {
        return invalid("the last phase must cover 100% of the fleet".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(name: &str, percentage: f64) -> PhaseConfig {
        PhaseConfig {
            name: name.to_string(),
            percentage,
            success_threshold: 95.0,
            wait_minutes: 0,
        }
    }

    fn config(phases: Vec<PhaseConfig>) -> CampaignConfig {
        CampaignConfig {
            campaign_id: None,
            name: None,
            target_version: "2.0.0".to_string(),
            previous_version: "1.9.0".to_string(),
            phases,
            rollback_threshold: 90.0,
        }
    }

    #[test]
    fn accepts_increasing_phases() {
        let campaign = Campaign::from_config(
            config(vec![phase("canary", 1.0), phase("all", 100.0)]),
            1000,
        )
        .unwrap();
        assert_eq!(campaign.status, CampaignStatus::Draft);
        assert_eq!(campaign.total_nodes, 1000);
        assert!(!campaign.id.is_empty());
    }

    #[test]
    fn rejects_decreasing_percentages() {
        let err = validate(&config(vec![
            phase("a", 10.0),
            phase("b", 5.0),
            phase("c", 100.0),
        ]))
        .unwrap_err();
        assert!(matches!(err, FleetError::InvalidCampaign(_)));
    }

    #[test]
    fn accepts_repeated_full_fleet_phases() {
        let cfg = config(vec![phase("half", 50.0), phase("all", 100.0), phase("soak", 100.0)]);
        assert!(validate(&cfg).is_ok());

        let err = validate(&config(vec![
            phase("a", 50.0),
            phase("b", 50.0),
            phase("c", 100.0),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("does not exceed"));
    }

    #[test]
    fn rejects_partial_fleet_coverage() {
        assert!(validate(&config(vec![phase("a", 10.0), phase("b", 50.0)])).is_err());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let mut cfg = config(vec![phase("all", 100.0)]);
        cfg.rollback_threshold = 120.0;
        assert!(validate(&cfg).is_err());

        let mut cfg = config(vec![phase("all", 100.0)]);
        cfg.phases[0].success_threshold = -1.0;
        assert!(validate(&cfg).is_err());
    }
}
