//! Error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use control_api::ApiError;
use tracing::error;

use crate::errors::FleetError;

/// A `FleetError` rendered as a JSON error body with a matching status code
#[derive(Debug)]
pub struct ErrorResponse(pub FleetError);

impl From<FleetError> for ErrorResponse {
    fn from(e: FleetError) -> Self {
        Self(e)
    }
}

impl ErrorResponse {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            FleetError::NotFound(_) => StatusCode::NOT_FOUND,
            FleetError::Conflict(_) | FleetError::DirectiveRejected(_) => StatusCode::CONFLICT,
            FleetError::InvalidCampaign(_)
            | FleetError::InvalidDirective(_)
            | FleetError::ReportError(_)
            | FleetError::JsonError(_) => StatusCode::BAD_REQUEST,
            FleetError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            FleetError::ShutdownError(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            FleetError::NotFound(_) => "not_found",
            FleetError::Conflict(_) => "conflict",
            FleetError::DirectiveRejected(_) => "directive_rejected",
            FleetError::InvalidCampaign(_) => "invalid_campaign",
            FleetError::InvalidDirective(_) => "invalid_directive",
            FleetError::ReportError(_) | FleetError::JsonError(_) => "invalid_report",
            FleetError::Unauthorized(_) => "unauthorized",
            FleetError::ShutdownError(_) => "unavailable",
            _ => "internal",
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        let body = ApiError {
            code: self.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
