//! HTTP clients

pub mod artifacts;
pub mod client;
pub mod directives;
pub mod reports;
