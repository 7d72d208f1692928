//! Control API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase as authored by an operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    /// Cumulative share of the fleet covered once this phase completes (0-100)
    pub percentage: f64,
    /// Minimum phase success rate in percent
    pub success_threshold: f64,
    #[serde(default)]
    pub wait_minutes: u64,
}

/// Campaign creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Generated when absent
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub target_version: String,
    /// Known-good version used for compensating directives
    pub previous_version: String,
    pub phases: Vec<PhaseConfig>,
    /// Cumulative success rate (percent) below which the whole campaign rolls back
    pub rollback_threshold: f64,
}

/// Campaign lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Failed,
    RolledBack,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Failed | CampaignStatus::RolledBack
        )
    }
}

/// Gate evaluation of a finished phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase_name: String,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub gate_passed: bool,
    /// Gate was passed by an operator override rather than by the success rate
    #[serde(default)]
    pub overridden: bool,
}

/// What caused a rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RollbackTrigger {
    PhaseBreach { phase: String },
    CampaignBreach,
    Manual,
}

/// A rollback issued against part or all of a campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEvent {
    pub campaign_id: String,
    pub triggered_by: RollbackTrigger,
    pub affected_nodes: Vec<String>,
    pub initiated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Nodes whose downgrade did not succeed
    #[serde(default)]
    pub manual_intervention: Vec<String>,
}

/// Read-only view of a campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSnapshot {
    pub campaign_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub target_version: String,
    pub previous_version: String,
    pub status: CampaignStatus,
    pub phases: Vec<PhaseConfig>,
    pub rollback_threshold: f64,
    /// Index into `phases` of the phase being run or last run
    pub current_phase: usize,
    pub total_nodes: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub phase_results: Vec<PhaseResult>,
    pub rollback_events: Vec<RollbackEvent>,
    pub manual_intervention_nodes: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Live counts for one phase of a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pending: u64,
}

/// Response to an outcome report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportAck {
    pub directive_id: String,
    /// False when the report repeated an already recorded outcome
    pub recorded: bool,
}

/// Error body returned by the control API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}
