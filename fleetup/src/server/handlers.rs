//! Node API request handlers

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use node_api::{DirectiveAck, UpgradeDirective};
use serde::Serialize;
use tracing::info;

use crate::errors::FleetError;
use crate::server::error::ErrorResponse;
use crate::server::state::ServerState;
use crate::utils::{version_info, VersionInfo};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "fleetup".to_string(),
        version: version_info().version,
    })
}

/// Version handler
pub async fn version_handler() -> Json<VersionInfo> {
    Json(version_info())
}

/// Current upgrade record, `null` before the first directive
pub async fn upgrade_state_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.intake.store().current().await)
}

/// Directive intake handler
pub async fn directive_handler(
    State(state): State<Arc<ServerState>>,
    Json(directive): Json<UpgradeDirective>,
) -> Result<impl IntoResponse, ErrorResponse> {
    let directive_id = directive.directive_id.clone();

    match state.intake.accept(directive).await {
        Ok(_) => Ok((
            StatusCode::ACCEPTED,
            Json(DirectiveAck {
                directive_id,
                accepted: true,
                reason: None,
            }),
        )),
        Err(e @ (FleetError::DirectiveRejected(_) | FleetError::InvalidDirective(_))) => {
            info!(directive = %directive_id, "Directive refused: {}", e);
            let reason = e.to_string();
            let status = ErrorResponse::from(e).status();
            Ok((
                status,
                Json(DirectiveAck {
                    directive_id,
                    accepted: false,
                    reason: Some(reason),
                }),
            ))
        }
        Err(e) => Err(e.into()),
    }
}
