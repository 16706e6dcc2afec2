use axum::{extract::State, http::StatusCode, Json};
use tracing::warn;

use crate::api::{state::AppState, types::HealthResponse};

/// GET /healthz -- liveness, no dependencies checked
pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.uptime_seconds(),
    })
}

/// GET /readyz -- ready once the store answers
pub async fn readyz(
    State(state): State<AppState>,
) -> std::result::Result<Json<HealthResponse>, (StatusCode, Json<HealthResponse>)> {
    match state.store.ping().await {
        Ok(()) => Ok(Json(HealthResponse {
            status: "ok".to_string(),
            uptime_secs: state.uptime_seconds(),
        })),
        Err(e) => {
            warn!(error = %e, "readiness check failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded".to_string(),
                    uptime_secs: state.uptime_seconds(),
                }),
            ))
        }
    }
}
