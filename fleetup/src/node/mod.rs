//! Node-local upgrade engine

pub mod artifact;
pub mod executor;
pub mod fsm;
pub mod intake;
pub mod reporting;
pub mod service;
pub mod signature;
pub mod state;
