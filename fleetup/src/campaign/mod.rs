//! Campaign coordinator and its collaborators

pub mod artifacts;
pub mod coordinator;
pub mod dispatch;
pub mod inventory;
pub mod model;
pub mod rollback;
pub mod selection;
