use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::routes::{api_error, is_http_url, ApiResult};
use crate::AppState;

// Re-export reqwest header module to avoid version conflicts
mod reqwest_header {
    pub use reqwest::header::{
        ACCEPT, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED, RANGE, REFERER,
    };
}

/// Query parameters for the open stream proxy
#[derive(Deserialize)]
pub struct StreamProxyQuery {
    pub url: String,
    #[serde(default)]
    pub referer: Option<String>,
}

/// Shared client for upstream media requests
pub fn build_proxy_client(timeout_ms: u64, user_agent: &str) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .user_agent(user_agent)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
}

/// Guess content type from URL
fn guess_content_type(url: &str) -> &'static str {
    let path = url.split('?').next().unwrap_or(url).to_lowercase();
    if path.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if path.ends_with(".mp4") {
        "video/mp4"
    } else if path.ends_with(".mkv") {
        "video/x-matroska"
    } else if path.ends_with(".avi") {
        "video/x-msvideo"
    } else {
        "video/MP2T"
    }
}

/// GET /api/proxy/session/:token
/// Streams the upstream bytes of a session. The upstream URL embeds the
/// credential, so it never leaves the server and is never logged.
pub async fn session_proxy(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let upstream_url = state.streaming.upstream_url_for_token(&token).await?;
    forward(&state.http, &upstream_url, None, &headers, "session").await
}

/// GET /api/proxy/stream?url=<encoded>&referer=<optional>
/// Passthrough for non-IPTV sources: bypasses CORS and fixes Content-Type.
pub async fn stream_proxy(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamProxyQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if !is_http_url(&query.url) {
        return Err(api_error(StatusCode::BAD_REQUEST, "Invalid url parameter"));
    }
    forward(
        &state.http,
        &query.url,
        query.referer.as_deref(),
        &headers,
        "stream",
    )
    .await
}

async fn forward(
    client: &Client,
    url: &str,
    referer: Option<&str>,
    headers: &HeaderMap,
    kind: &str,
) -> ApiResult<Response> {
    let mut request = client.get(url);

    // Forward essential headers (using reqwest's header constants)
    match headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
        Some(accept) => request = request.header(reqwest_header::ACCEPT, accept),
        None => request = request.header(reqwest_header::ACCEPT, "*/*"),
    }

    // Range for partial content
    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        request = request.header(reqwest_header::RANGE, range);
    }

    if let Some(referer) = referer {
        request = request.header(reqwest_header::REFERER, referer);
    }

    let upstream_response = request.send().await.map_err(|e| {
        let status = if e.is_timeout() {
            StatusCode::GATEWAY_TIMEOUT
        } else {
            StatusCode::BAD_GATEWAY
        };
        // reqwest errors carry the URL; strip it before logging
        tracing::error!(kind, "Proxy request failed: {}", e.without_url());
        api_error(status, "Upstream stream unavailable")
    })?;

    let upstream_status = upstream_response.status();
    let upstream_headers = upstream_response.headers();

    let content_type = upstream_headers
        .get(reqwest_header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_else(|| guess_content_type(url))
        .to_string();

    let mut response = Response::builder()
        .status(StatusCode::from_u16(upstream_status.as_u16()).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-store")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            "Content-Length, Content-Type, Accept-Ranges",
        );

    // Optional passthrough (reqwest constants for reading, axum for writing)
    let passthrough = [
        (reqwest_header::CONTENT_LENGTH, header::CONTENT_LENGTH),
        (reqwest_header::ACCEPT_RANGES, header::ACCEPT_RANGES),
        (reqwest_header::ETAG, header::ETAG),
        (reqwest_header::LAST_MODIFIED, header::LAST_MODIFIED),
    ];
    for (from, to) in passthrough {
        if let Some(value) = upstream_headers.get(from).and_then(|v| v.to_str().ok()) {
            response = response.header(to, value.to_string());
        }
    }

    let body = Body::from_stream(upstream_response.bytes_stream());

    response.body(body).map_err(|e| {
        tracing::error!("Failed to build response: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
    })
}
