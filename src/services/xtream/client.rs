//! Xtream Codes API Client
//!
//! HTTP client for the Xtream Codes Player API v2 plus the pure URL builders
//! for playback, playlist and XMLTV endpoints.

use super::types::*;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// Server URL plus decrypted login for one upstream account
///
/// Holds plaintext secrets: `Debug` is redacted and the type is never
/// serialized.
#[derive(Clone)]
pub struct XtreamCredentials {
    /// Server base URL (e.g., "http://example.com:8080")
    pub server: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for XtreamCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XtreamCredentials")
            .field("server", &"[REDACTED]")
            .field("username", &crate::services::crypto::mask(&self.username))
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl XtreamCredentials {
    pub fn new(server: &str, username: &str, password: &str) -> Self {
        Self {
            server: server.trim().trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// Build the player_api.php base URL
    pub fn api_url(&self) -> String {
        format!(
            "{}/player_api.php?username={}&password={}",
            self.server, self.username, self.password
        )
    }

    /// Build playback URL for a live stream with the given container extension
    pub fn stream_url(&self, stream_id: &str, extension: &str) -> String {
        format!(
            "{}/live/{}/{}/{}.{}",
            self.server, self.username, self.password, stream_id, extension
        )
    }

    /// Build HLS playback URL for a live stream
    pub fn hls_url(&self, stream_id: &str) -> String {
        self.stream_url(stream_id, "m3u8")
    }

    /// Build the full M3U playlist URL
    pub fn m3u_url(&self) -> String {
        format!(
            "{}/get.php?username={}&password={}&type=m3u_plus&output=ts",
            self.server, self.username, self.password
        )
    }

    /// Build EPG XML URL
    pub fn xmltv_url(&self) -> String {
        format!(
            "{}/xmltv.php?username={}&password={}",
            self.server, self.username, self.password
        )
    }
}

/// Calls the Upstream Client needs from an Xtream panel
#[async_trait]
pub trait XtreamApi: Send + Sync {
    /// Get authentication info (user_info + server_info)
    async fn get_auth(&self) -> Result<XtreamAuthResponse, XtreamError>;

    /// Get live stream categories
    async fn get_live_categories(&self) -> Result<Vec<XtreamCategory>, XtreamError>;

    /// Get all live streams (names of categories are not included)
    async fn get_live_streams(&self) -> Result<Vec<XtreamLiveStream>, XtreamError>;

    /// Get short EPG for a stream (next few programmes)
    async fn get_short_epg(
        &self,
        stream_id: &str,
        limit: Option<u32>,
    ) -> Result<XtreamEpgListings, XtreamError>;

    /// Get the full EPG table for a stream
    async fn get_simple_data_table(&self, stream_id: &str)
        -> Result<XtreamEpgListings, XtreamError>;
}

/// Xtream API Client
pub struct XtreamClient {
    http: Client,
    base_url: String,
    user_agent: String,
}

impl XtreamClient {
    /// Create a new Xtream client
    pub fn new(
        creds: &XtreamCredentials,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, XtreamError> {
        let http = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true) // Many Xtream servers have self-signed certs
            .build()
            .map_err(|e| XtreamError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: creds.api_url(),
            user_agent: user_agent.to_string(),
        })
    }

    /// Make a GET request with optional action parameter
    async fn get<T: DeserializeOwned>(&self, action: &str) -> Result<T, XtreamError> {
        let url = if action.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}&action={}", self.base_url, action)
        };

        debug!("Xtream API request: {}", if action.is_empty() { "auth" } else { action });

        let response = self
            .http
            .get(&url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    XtreamError::Timeout
                } else {
                    XtreamError::Network(e.without_url().to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(XtreamError::Unauthorized(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(XtreamError::Http(status.as_u16()));
        }

        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                XtreamError::Timeout
            } else {
                XtreamError::Network(e.without_url().to_string())
            }
        })?;

        // Some servers return HTML error pages instead of JSON
        if text.trim_start().starts_with('<') {
            return Err(XtreamError::Unauthorized(
                "Server returned HTML instead of JSON".to_string(),
            ));
        }

        // Handle empty responses (some endpoints return empty for no results)
        if text.is_empty() || text == "null" {
            return Err(XtreamError::EmptyResponse);
        }

        serde_json::from_str(&text).map_err(|e| {
            error!(
                "Failed to parse Xtream response for action '{}': {}",
                action, e
            );
            XtreamError::Parse(e.to_string())
        })
    }
}

#[async_trait]
impl XtreamApi for XtreamClient {
    async fn get_auth(&self) -> Result<XtreamAuthResponse, XtreamError> {
        let auth: XtreamAuthResponse = self.get("").await?;
        if !auth.user_info.auth && !auth.user_info.is_active() {
            return Err(XtreamError::Unauthorized("Invalid credentials".to_string()));
        }
        Ok(auth)
    }

    async fn get_live_categories(&self) -> Result<Vec<XtreamCategory>, XtreamError> {
        match self.get("get_live_categories").await {
            Err(XtreamError::EmptyResponse) => Ok(Vec::new()),
            other => other,
        }
    }

    async fn get_live_streams(&self) -> Result<Vec<XtreamLiveStream>, XtreamError> {
        match self.get("get_live_streams").await {
            Err(XtreamError::EmptyResponse) => Ok(Vec::new()),
            other => other,
        }
    }

    async fn get_short_epg(
        &self,
        stream_id: &str,
        limit: Option<u32>,
    ) -> Result<XtreamEpgListings, XtreamError> {
        let mut action = format!("get_short_epg&stream_id={}", stream_id);
        if let Some(l) = limit {
            action.push_str(&format!("&limit={}", l));
        }
        match self.get(&action).await {
            Err(XtreamError::EmptyResponse) => Ok(XtreamEpgListings::default()),
            other => other,
        }
    }

    async fn get_simple_data_table(
        &self,
        stream_id: &str,
    ) -> Result<XtreamEpgListings, XtreamError> {
        match self
            .get(&format!("get_simple_data_table&stream_id={}", stream_id))
            .await
        {
            Err(XtreamError::EmptyResponse) => Ok(XtreamEpgListings::default()),
            other => other,
        }
    }
}

/// Xtream API Error types
#[derive(Debug, Error)]
pub enum XtreamError {
    /// Network/connection error
    #[error("Network error: {0}")]
    Network(String),
    /// Request exceeded its deadline
    #[error("Request timed out")]
    Timeout,
    /// Credentials rejected by the panel
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// HTTP error (non-2xx status)
    #[error("HTTP error: {0}")]
    Http(u16),
    /// JSON parsing error
    #[error("Parse error: {0}")]
    Parse(String),
    /// Empty response from server
    #[error("Empty response")]
    EmptyResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> XtreamCredentials {
        XtreamCredentials::new("http://example.com:8080/", "user", "pass")
    }

    #[test]
    fn test_client_url_construction() {
        let client = XtreamClient::new(&creds(), Duration::from_secs(5), "test").unwrap();
        assert!(client
            .base_url
            .starts_with("http://example.com:8080/player_api.php"));
        assert!(client.base_url.contains("username=user"));
        assert!(client.base_url.contains("password=pass"));
        // Should not have double slash
        assert!(!client.base_url.contains("//player_api"));
    }

    #[test]
    fn test_credentials_url_builders() {
        let creds = creds();

        assert_eq!(
            creds.stream_url("123", "ts"),
            "http://example.com:8080/live/user/pass/123.ts"
        );
        assert_eq!(
            creds.hls_url("123"),
            "http://example.com:8080/live/user/pass/123.m3u8"
        );
        assert_eq!(
            creds.m3u_url(),
            "http://example.com:8080/get.php?username=user&password=pass&type=m3u_plus&output=ts"
        );
        assert_eq!(
            creds.xmltv_url(),
            "http://example.com:8080/xmltv.php?username=user&password=pass"
        );
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let rendered = format!("{:?}", XtreamCredentials::new("http://s", "someuser", "secret"));
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("someuser"));
        assert!(rendered.contains("****user"));
    }
}
