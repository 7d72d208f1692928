//! Process wiring for the agent and coordinator

pub mod options;
pub mod run;
pub mod state;
