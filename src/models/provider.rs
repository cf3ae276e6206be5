use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream protocol spoken by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Xtream,
    M3u,
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolKind::Xtream => write!(f, "xtream"),
            ProtocolKind::M3u => write!(f, "m3u"),
        }
    }
}

impl std::str::FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "xtream" => Ok(ProtocolKind::Xtream),
            "m3u" => Ok(ProtocolKind::M3u),
            other => Err(format!("Unknown protocol kind: {}", other)),
        }
    }
}

/// Health as last observed by the provider health monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl HealthStatus {
    /// Lenient parse for values read back from the database
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "healthy" => HealthStatus::Healthy,
            "degraded" => HealthStatus::Degraded,
            "unhealthy" => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

/// A content source. `base_url` is stored encrypted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub kind: ProtocolKind,
    #[serde(skip_serializing)]
    pub base_url: String,
    pub is_active: bool,
    pub health_status: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Insert/update payload for a provider (`base_url` already encrypted)
#[derive(Debug, Clone)]
pub struct NewProvider {
    pub name: String,
    pub kind: ProtocolKind,
    pub base_url: String,
    pub is_active: bool,
}

/// A login under a provider. `username`/`password`/`server_url` are stored
/// encrypted; `server_url` is only set for legacy standalone credentials.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: i64,
    pub provider_id: Option<i64>,
    #[serde(skip_serializing)]
    pub server_url: Option<String>,
    #[serde(skip_serializing)]
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub max_connections: i32,
    pub is_active: bool,
    pub health_status: HealthStatus,
}

/// Insert/update payload for a credential (secrets already encrypted)
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub provider_id: Option<i64>,
    pub server_url: Option<String>,
    pub username: String,
    pub password: String,
    pub max_connections: i32,
    pub is_active: bool,
}
