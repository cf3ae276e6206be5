//! Database row types for PostgreSQL
//!
//! These types map directly to database rows and convert into the domain
//! models in `crate::models`.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::models::{
    ActiveStreamSession, Channel, ChannelMapping, Credential, HealthStatus, ProtocolKind, Provider,
};

// ============================================================================
// Database Row Types
// ============================================================================

/// Provider row from database
#[derive(Debug, Clone, FromRow)]
pub struct ProviderRow {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub base_url: String,
    pub is_active: bool,
    pub health_status: String,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl From<ProviderRow> for Provider {
    fn from(row: ProviderRow) -> Self {
        Provider {
            id: row.id,
            name: row.name,
            // CHECK constraint keeps this to known values
            kind: row.kind.parse().unwrap_or(ProtocolKind::Xtream),
            base_url: row.base_url,
            is_active: row.is_active,
            health_status: HealthStatus::parse(&row.health_status),
            last_health_check: row.last_health_check,
        }
    }
}

/// Credential row from database
#[derive(Debug, Clone, FromRow)]
pub struct CredentialRow {
    pub id: i64,
    pub provider_id: Option<i64>,
    pub server_url: Option<String>,
    pub username: String,
    pub password: String,
    pub max_connections: i32,
    pub is_active: bool,
    pub health_status: String,
}

impl From<CredentialRow> for Credential {
    fn from(row: CredentialRow) -> Self {
        Credential {
            id: row.id,
            provider_id: row.provider_id,
            server_url: row.server_url,
            username: row.username,
            password: row.password,
            max_connections: row.max_connections,
            is_active: row.is_active,
            health_status: HealthStatus::parse(&row.health_status),
        }
    }
}

/// Channel row from database
#[derive(Debug, Clone, FromRow)]
pub struct ChannelRow {
    pub id: i64,
    pub provider_id: i64,
    pub stream_id: String,
    pub name: String,
    pub logo: Option<String>,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub epg_channel_id: Option<String>,
    pub is_enabled: bool,
}

impl From<ChannelRow> for Channel {
    fn from(row: ChannelRow) -> Self {
        Channel {
            id: row.id,
            provider_id: row.provider_id,
            stream_id: row.stream_id,
            name: row.name,
            logo: row.logo,
            category_id: row.category_id,
            category_name: row.category_name,
            epg_channel_id: row.epg_channel_id,
            is_enabled: row.is_enabled,
        }
    }
}

/// Channel mapping row from database
#[derive(Debug, Clone, FromRow)]
pub struct MappingRow {
    pub id: i64,
    pub primary_channel_id: i64,
    pub backup_channel_id: i64,
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<MappingRow> for ChannelMapping {
    fn from(row: MappingRow) -> Self {
        ChannelMapping {
            id: row.id,
            primary_channel_id: row.primary_channel_id,
            backup_channel_id: row.backup_channel_id,
            priority: row.priority,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

/// Active stream session row from database
#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: i64,
    pub user_id: i64,
    pub stream_id: String,
    pub credential_id: i64,
    pub session_token: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub ip_address: Option<String>,
}

impl From<SessionRow> for ActiveStreamSession {
    fn from(row: SessionRow) -> Self {
        ActiveStreamSession {
            id: row.id,
            user_id: row.user_id,
            stream_id: row.stream_id,
            credential_id: row.credential_id,
            session_token: row.session_token,
            started_at: row.started_at,
            last_heartbeat: row.last_heartbeat,
            ip_address: row.ip_address,
        }
    }
}
