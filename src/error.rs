//! Error taxonomy shared by the engine, the stores and the HTTP surface

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    /// The requested transition is not legal from the proposal's current state
    #[error("Invalid transition: {0}")]
    InvariantViolation(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code, used as the `error` field of responses
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::InvariantViolation(_) => "invalid_transition",
            AppError::NotAuthorized(_) => "not_authorized",
            AppError::Notification(_) => "notification",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InvariantViolation(_) => StatusCode::CONFLICT,
            AppError::NotAuthorized(_) => StatusCode::FORBIDDEN,
            AppError::Notification(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Storage and internal details stay in the log
        let message = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "Database error".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                "Internal error".to_string()
            }
            AppError::Notification(e) => {
                tracing::error!("Notification error: {}", e);
                self.to_string()
            }
            AppError::NotFound(e)
            | AppError::Validation(e)
            | AppError::InvariantViolation(e)
            | AppError::NotAuthorized(e) => e.clone(),
        };

        let body = json!({ "error": self.code(), "message": message });
        (self.status(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
