//! Xtream Codes API Types
//!
//! Type definitions for the subset of the Xtream Codes Player API v2 this
//! server consumes: account info, live categories, live streams and EPG.

use serde::{Deserialize, Deserializer, Serialize};

/// Accept `"123"`, `123` or `null` for identifiers.
///
/// Panels disagree on whether ids are JSON strings or numbers, so every id is
/// normalized to an opaque string.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn required_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    string_or_number(deserializer)?
        .ok_or_else(|| serde::de::Error::custom("missing identifier"))
}

// ============================================================================
// Authentication Response Types
// ============================================================================

/// Main authentication response from player_api.php (no action)
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct XtreamAuthResponse {
    pub user_info: XtreamUserInfo,
    #[serde(default)]
    pub server_info: Option<XtreamServerInfo>,
}

/// User account information
#[derive(Deserialize, Serialize, Clone)]
pub struct XtreamUserInfo {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "auth_flag")]
    pub auth: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub exp_date: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub is_trial: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub active_cons: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub max_connections: Option<String>,
}

/// `auth` comes back as `1`, `0`, `"1"` or is missing entirely
fn auth_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(matches!(
        string_or_number(deserializer)?.as_deref(),
        Some("1") | Some("true")
    ))
}

impl std::fmt::Debug for XtreamUserInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XtreamUserInfo")
            .field("auth", &self.auth)
            .field("status", &self.status)
            .field("exp_date", &self.exp_date)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

impl XtreamUserInfo {
    /// Check if account is active
    pub fn is_active(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("active"))
            .unwrap_or(false)
    }

    /// Parse expiration timestamp to Unix timestamp
    pub fn exp_timestamp(&self) -> Option<i64> {
        self.exp_date.as_ref()?.parse().ok()
    }

    pub fn max_connections_i32(&self) -> Option<i32> {
        self.max_connections.as_ref()?.parse().ok()
    }

    pub fn active_connections_i32(&self) -> Option<i32> {
        self.active_cons.as_ref()?.parse().ok()
    }

    /// Check if trial account
    pub fn is_trial_account(&self) -> bool {
        self.is_trial.as_deref() == Some("1")
    }
}

/// Server information
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct XtreamServerInfo {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub port: Option<String>,
    #[serde(default)]
    pub server_protocol: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub timestamp_now: Option<i64>,
}

// ============================================================================
// Category Types
// ============================================================================

/// Live category
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct XtreamCategory {
    #[serde(deserialize_with = "required_string_or_number")]
    pub category_id: String,
    pub category_name: String,
    #[serde(default)]
    pub parent_id: Option<i32>,
}

// ============================================================================
// Live Stream Types
// ============================================================================

/// Live stream (channel) information
///
/// `get_live_streams` only carries `category_id`; the name has to be joined
/// from `get_live_categories`.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct XtreamLiveStream {
    #[serde(default)]
    pub num: Option<i64>,
    pub name: String,
    #[serde(deserialize_with = "required_string_or_number")]
    pub stream_id: String,
    #[serde(default)]
    pub stream_icon: Option<String>,
    #[serde(default)]
    pub epg_channel_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub category_id: Option<String>,
    #[serde(default)]
    pub tv_archive: Option<i32>,
}

// ============================================================================
// EPG Types
// ============================================================================

/// Short EPG entry (from get_short_epg / get_simple_data_table)
///
/// Titles and descriptions are base64 encoded by most panels; they are passed
/// through untouched.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct XtreamEpgEntry {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub start_timestamp: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub stop_timestamp: Option<String>,
}

/// EPG listings container
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct XtreamEpgListings {
    #[serde(default)]
    pub epg_listings: Vec<XtreamEpgEntry>,
}
