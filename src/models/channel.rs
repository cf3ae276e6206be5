use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A playable item belonging to exactly one provider.
///
/// Cross-provider identity is the normalized name, never the id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: i64,
    pub provider_id: i64,
    /// Opaque upstream identifier, unique within the provider
    pub stream_id: String,
    pub name: String,
    pub logo: Option<String>,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub epg_channel_id: Option<String>,
    pub is_enabled: bool,
}

/// Channel row produced by a provider sync
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub stream_id: String,
    pub name: String,
    pub logo: Option<String>,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub epg_channel_id: Option<String>,
}

/// Failover edge from a primary channel to a backup on another provider
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMapping {
    pub id: i64,
    pub primary_channel_id: i64,
    pub backup_channel_id: i64,
    /// Try-order, ascending; ties broken by id (insertion order)
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMapping {
    pub primary_channel_id: i64,
    pub backup_channel_id: i64,
    #[serde(default)]
    pub priority: Option<i32>,
}
