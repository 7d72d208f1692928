//! Control API request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use control_api::{CampaignConfig, CampaignSnapshot, PhaseProgress, ReportAck};
use node_api::OutcomeReport;
use tracing::{debug, info};

use crate::api::state::ApiState;
use crate::errors::FleetError;
use crate::server::error::ErrorResponse;
use crate::tracker::Ingested;

type ApiResult<T> = Result<Json<T>, ErrorResponse>;

pub async fn create_campaign_handler(
    State(state): State<Arc<ApiState>>,
    Json(config): Json<CampaignConfig>,
) -> Result<(StatusCode, Json<CampaignSnapshot>), ErrorResponse> {
    let snapshot = state.coordinator.create(config).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

pub async fn list_campaigns_handler(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<Vec<CampaignSnapshot>> {
    Ok(Json(state.coordinator.list().await?))
}

pub async fn campaign_status_handler(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<CampaignSnapshot> {
    Ok(Json(state.coordinator.status(&id).await?))
}

pub async fn start_campaign_handler(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<CampaignSnapshot> {
    Ok(Json(state.coordinator.start(&id).await?))
}

pub async fn pause_campaign_handler(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<CampaignSnapshot> {
    Ok(Json(state.coordinator.pause(&id).await?))
}

pub async fn resume_campaign_handler(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<CampaignSnapshot> {
    Ok(Json(state.coordinator.resume(&id).await?))
}

pub async fn rollback_campaign_handler(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<CampaignSnapshot> {
    Ok(Json(state.coordinator.rollback(&id).await?))
}

pub async fn override_gate_handler(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<CampaignSnapshot> {
    Ok(Json(state.coordinator.override_gate(&id).await?))
}

pub async fn phase_progress_handler(
    State(state): State<Arc<ApiState>>,
    Path((id, phase)): Path<(String, usize)>,
) -> ApiResult<PhaseProgress> {
    Ok(Json(state.coordinator.progress(&id, phase).await?))
}

/// Outcome report intake. The bearer token must belong to the reporting node.
pub async fn report_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(report): Json<OutcomeReport>,
) -> ApiResult<ReportAck> {
    let token = bearer_token(&headers)?;
    state.inventory.authenticate(&report.node_id, token)?;

    let ingested = state.tracker.ingest(&report)?;
    match ingested {
        Ingested::Recorded => info!(
            node = %report.node_id,
            directive = %report.directive_id,
            outcome = ?report.outcome,
            "Outcome recorded"
        ),
        Ingested::Duplicate => debug!(directive = %report.directive_id, "Duplicate outcome report"),
        Ingested::Late => info!(
            node = %report.node_id,
            directive = %report.directive_id,
            "Outcome reported after the window closed"
        ),
    }

    Ok(Json(ReportAck {
        directive_id: report.directive_id,
        recorded: ingested != Ingested::Duplicate,
    }))
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, FleetError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(|| FleetError::Unauthorized("missing bearer token".to_string()))
}
