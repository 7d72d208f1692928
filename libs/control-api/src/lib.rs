//! Campaign control models served by the fleetup coordinator.

pub mod models;

pub use models::{
    ApiError, CampaignConfig, CampaignSnapshot, CampaignStatus, PhaseConfig, PhaseProgress,
    PhaseResult, ReportAck, RollbackEvent, RollbackTrigger,
};
