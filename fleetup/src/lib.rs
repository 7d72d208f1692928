//! fleetup library
//!
//! Node-local upgrade engine and the phased campaign coordinator that drives
//! it across a fleet.

pub mod api;
pub mod app;
pub mod campaign;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod node;
pub mod server;
pub mod storage;
pub mod tracker;
pub mod utils;
pub mod workers;
