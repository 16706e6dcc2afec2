use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use chrono::Utc;
use tracing::{info, warn};

use crate::api::{state::AppState, submission::SubmissionRequest, types::*};

/// PUT /execution/v1/command
pub async fn submit_command(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SubmissionRequest>, JsonRejection>,
) -> std::result::Result<Json<SubmitResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| bad_request(e.body_text()))?;

    let command = request
        .validate(&state.dictionaries, Utc::now(), state.time_for_execution)
        .map_err(|e| {
            warn!(error = %e, "rejected submission");
            api_error(e)
        })?;

    let id = state
        .store
        .insert(&command, state.statuses.created)
        .await
        .map_err(|e| {
            warn!(error = %e, fingerprint = %command.fingerprint, "failed to store command");
            api_error(e)
        })?;

    info!(
        command_id = id,
        instrument = %command.instrument,
        account_id = command.account_id,
        fingerprint = %command.fingerprint,
        "command accepted"
    );
    Ok(Json(SubmitResponse { id }))
}

/// GET /execution/v1/command/:id
pub async fn get_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<CommandView>, ApiError> {
    let id: i64 = id
        .parse()
        .map_err(|_| bad_request(format!("malformed command id '{}'", id)))?;

    let command = state
        .store
        .load_by_id(id)
        .await
        .map_err(api_error)?
        .ok_or_else(|| bad_request(format!("command {} not found", id)))?;
    let history = state.store.history(id).await.map_err(api_error)?;

    let statuses = state.dictionaries.execution_statuses();
    Ok(Json(CommandView::new(command, history, |status| {
        statuses
            .name_of(status)
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string())
    })))
}
