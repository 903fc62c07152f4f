//! Error types for dglabd.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid configuration: {var}: {reason}")]
    Config { var: &'static str, reason: String },

    #[error("unknown device: {0}")]
    UnknownDevice(Uuid),

    #[error("alias already in use: {0}")]
    AliasTaken(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = match &self {
            BridgeError::Config { .. } => StatusCode::BAD_REQUEST,
            BridgeError::UnknownDevice(_) => StatusCode::NOT_FOUND,
            BridgeError::AliasTaken(_) => StatusCode::CONFLICT,
            BridgeError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}
