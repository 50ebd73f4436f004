use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::security::SecurityError;

/// Errors reported to the offending connection only; never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolError {
    #[error("already in a room")]
    AlreadyInRoom,
    #[error("invalid room id")]
    InvalidRoomId,
    #[error("not in a room")]
    SelfNotInRoom,
    #[error("target is not in the room")]
    TargetNotInRoom,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Protocol(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Security(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };

        let body = Json(json!({
            "error": error_message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
