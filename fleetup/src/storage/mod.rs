//! Local storage: paths, settings and node identity

pub mod identity;
pub mod layout;
pub mod settings;
