//! Control API state

use std::sync::Arc;

use crate::campaign::coordinator::Coordinator;
use crate::campaign::inventory::Inventory;
use crate::tracker::ProgressTracker;

/// State shared across control API handlers
pub struct ApiState {
    pub coordinator: Coordinator,
    pub inventory: Arc<Inventory>,
    pub tracker: Arc<ProgressTracker>,
}

impl ApiState {
    pub fn new(
        coordinator: Coordinator,
        inventory: Arc<Inventory>,
        tracker: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            coordinator,
            inventory,
            tracker,
        }
    }
}
