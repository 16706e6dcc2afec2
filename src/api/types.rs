use axum::{http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Command;
use crate::error::RelayError;
use crate::store::HistoryEntry;

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

impl From<RelayError> for ErrorResponse {
    fn from(e: RelayError) -> Self {
        Self {
            error: e.to_string(),
        }
    }
}

/// Client mistakes map to 400, everything else to 500.
pub fn api_error(e: RelayError) -> ApiError {
    let status = match &e {
        RelayError::Validation(_) | RelayError::NotFound(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(e.into()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
}

/// A stored command with its status name and transition history
#[derive(Debug, Clone, Serialize)]
pub struct CommandView {
    pub status: String,
    pub command: Command,
    pub history: Vec<StatusChange>,
}

impl CommandView {
    pub fn new(
        command: Command,
        history: Vec<HistoryEntry>,
        status_name: impl Fn(i16) -> String,
    ) -> Self {
        Self {
            status: status_name(command.status_id),
            history: history
                .into_iter()
                .map(|h| StatusChange {
                    from: status_name(h.status_from),
                    to: status_name(h.status_to),
                    timestamp: h.timestamp,
                })
                .collect(),
            command,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: i64,
}
