//! Stream session lifecycle: start, heartbeat, release

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::session::ApiResponse;
use crate::routes::{user_id_from, ApiResult};
use crate::services::playback::PlaybackMode;
use crate::services::streaming::{StartOptions, StartOutcome};
use crate::AppState;

/// Optional body of a start request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Force a playback mode, bypassing the probe
    pub mode: Option<PlaybackMode>,
    #[serde(default)]
    pub native_codec_support: bool,
    #[serde(default)]
    pub skip_probe: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_token: String,
    pub active: bool,
}

/// First hop of x-forwarded-for, else x-real-ip
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// POST /api/streams/:stream_id/start
pub async fn start_stream(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<StartRequest>>,
) -> ApiResult<impl IntoResponse> {
    let user_id = user_id_from(&headers)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let opts = StartOptions {
        ip_address: client_ip(&headers),
        forced_mode: request.mode,
        native_codec_support: request.native_codec_support,
        skip_probe: request.skip_probe,
    };

    match state.streaming.start_stream(user_id, &stream_id, &opts).await? {
        StartOutcome::Started(start) => Ok((StatusCode::OK, Json(ApiResponse::success(start)))),
        StartOutcome::NoCapacity => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": "No capacity available for this stream",
                "code": "NO_CAPACITY"
            })),
        )),
    }
}

/// POST /api/sessions/:token/heartbeat
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let active = state.streaming.heartbeat(&token).await?;
    let status = if active {
        StatusCode::OK
    } else {
        // Swept or released: the client has to start again
        StatusCode::GONE
    };
    Ok((
        status,
        Json(SessionStatus {
            session_token: token,
            active,
        }),
    ))
}

/// DELETE /api/sessions/:token
pub async fn release(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let released = state.streaming.release(&token).await?;
    Ok(Json(serde_json::json!({ "success": true, "released": released })))
}
