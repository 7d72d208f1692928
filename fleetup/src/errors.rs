//! Error types for fleetup

use thiserror::Error;

/// Main error type shared by the node agent and the coordinator
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Node not registered: {0}")]
    NodeNotRegistered(String),

    #[error("Directive rejected: {0}")]
    DirectiveRejected(String),

    #[error("Invalid directive: {0}")]
    InvalidDirective(String),

    #[error("Service manager error: {0}")]
    ServiceError(String),

    #[error("Artifact error: {0}")]
    ArtifactError(String),

    #[error("Report error: {0}")]
    ReportError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid campaign: {0}")]
    InvalidCampaign(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for FleetError {
    fn from(err: anyhow::Error) -> Self {
        FleetError::Internal(err.to_string())
    }
}
