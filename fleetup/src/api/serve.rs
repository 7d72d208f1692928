//! Control API server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{
    campaign_status_handler, create_campaign_handler, list_campaigns_handler,
    override_gate_handler, pause_campaign_handler, phase_progress_handler, report_handler,
    resume_campaign_handler, rollback_campaign_handler, start_campaign_handler,
};
use crate::api::state::ApiState;
use crate::app::options::ServerOptions;
use crate::errors::FleetError;
use crate::server::serve::bind_and_serve;

/// Routes of the coordinator API
pub fn router(state: Arc<ApiState>) -> Router {
    let v1 = Router::new()
        // Campaigns
        .route(
            "/campaigns",
            get(list_campaigns_handler).post(create_campaign_handler),
        )
        .route("/campaigns/{id}", get(campaign_status_handler))
        .route("/campaigns/{id}/start", post(start_campaign_handler))
        .route("/campaigns/{id}/pause", post(pause_campaign_handler))
        .route("/campaigns/{id}/resume", post(resume_campaign_handler))
        .route("/campaigns/{id}/rollback", post(rollback_campaign_handler))
        .route("/campaigns/{id}/override", post(override_gate_handler))
        .route(
            "/campaigns/{id}/phases/{index}/progress",
            get(phase_progress_handler),
        )
        // Node reports
        .route("/reports", post(report_handler));

    Router::new()
        .nest("/api/v1", v1)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the control API server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ApiState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), FleetError>>, FleetError> {
    bind_and_serve(options, router(state), shutdown_signal).await
}
