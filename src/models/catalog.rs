use serde::{Deserialize, Serialize};

/// Channel as presented in a subscriber's merged catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogChannel {
    pub stream_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epg_channel_id: Option<String>,
    /// Set for package-based entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<i64>,
    /// Set for entries served from a credential's upstream catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<i64>,
}

impl CatalogChannel {
    /// Dedup key: lower-cased, trimmed name
    pub fn dedup_key(&self) -> String {
        self.name.trim().to_lowercase()
    }

    pub fn in_category(&self, category_id: &str) -> bool {
        self.category_id.as_deref() == Some(category_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogCategory {
    pub id: String,
    pub name: String,
}

/// Per-credential snapshot of the upstream live catalog
///
/// Persisted to disk without any secret: playable URLs are rebuilt on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCatalog {
    pub categories: Vec<CatalogCategory>,
    pub channels: Vec<CatalogChannel>,
    /// Unix millis of the refresh that produced this snapshot
    pub timestamp: i64,
}

impl CachedCatalog {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.timestamp
    }

    pub fn is_fresh(&self, now_ms: i64, ttl_ms: i64) -> bool {
        self.age_ms(now_ms) < ttl_ms
    }
}
