//! Node server state

use std::sync::Arc;

use crate::node::intake::UpgradeIntake;

/// Server state shared across node handlers
pub struct ServerState {
    pub intake: Arc<UpgradeIntake>,
}

impl ServerState {
    pub fn new(intake: Arc<UpgradeIntake>) -> Self {
        Self { intake }
    }
}
