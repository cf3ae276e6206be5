pub mod admin;
pub mod catalog;
pub mod health;
pub mod proxy;
pub mod streams;

use axum::{
    http::{HeaderMap, StatusCode},
    Json,
};

use crate::error::AppError;

/// Error half of every handler result
pub type ApiError = (StatusCode, Json<serde_json::Value>);

pub type ApiResult<T> = Result<T, ApiError>;

pub fn api_error(status: StatusCode, message: &str) -> ApiError {
    (status, Json(serde_json::json!({ "error": message })))
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        err.into_response_parts()
    }
}

/// Absolute http(s) URL with a host
pub fn is_http_url(raw: &str) -> bool {
    match url::Url::parse(raw) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.has_host(),
        Err(_) => false,
    }
}

/// Subscriber id set by the auth collaborator in front of this service
pub fn user_id_from(headers: &HeaderMap) -> ApiResult<i64> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "Missing or invalid x-user-id"))
}
