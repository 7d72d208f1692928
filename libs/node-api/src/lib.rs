//! Wire models shared by the fleetup coordinator and node agents.

pub mod models;

pub use models::{
    ArtifactSignature, DirectiveAck, DirectiveKind, FailureClass, Outcome, OutcomeReport,
    UpgradeDirective,
};
