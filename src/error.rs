//! Application error taxonomy
//!
//! Upstream network failures are converted at the Upstream Client boundary
//! (serve cache or fail), so the catalog and admission paths only see
//! `UpstreamUnavailable` when there is nothing left to serve.

use axum::{http::StatusCode, Json};
use thiserror::Error;

use crate::services::xtream::XtreamError;

#[derive(Error, Debug)]
pub enum AppError {
    /// Bad upstream credentials or the account did not answer in time
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Upstream timeout/network failure with no cached data to fall back on
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // unique_violation
                Some("23505") => Self::AlreadyExists(db_err.message().to_string()),
                // foreign_key_violation
                Some("23503") => Self::NotFound("Referenced resource not found".to_string()),
                _ => Self::Database(err),
            },
            _ => Self::Database(err),
        }
    }
}

impl From<XtreamError> for AppError {
    fn from(err: XtreamError) -> Self {
        match err {
            XtreamError::Unauthorized(msg) => Self::Auth(msg),
            other => Self::UpstreamUnavailable(other.to_string()),
        }
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyExists(_) => StatusCode::CONFLICT,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert into the `(status, {"error": ..})` pair route handlers return
    pub fn into_response_parts(self) -> (StatusCode, Json<serde_json::Value>) {
        let status = self.status_code();
        let message = match &self {
            // Never leak driver details to clients
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "Database error".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                "Internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message })))
    }
}
