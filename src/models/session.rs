use chrono::{DateTime, Utc};
use serde::Serialize;

/// A viewer's lease on one credential slot for one stream
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStreamSession {
    pub id: i64,
    pub user_id: i64,
    pub stream_id: String,
    pub credential_id: i64,
    pub session_token: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub ip_address: Option<String>,
}

impl ActiveStreamSession {
    /// Heartbeat is younger than the staleness threshold
    pub fn is_fresh(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_heartbeat >= cutoff
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: i64,
    pub stream_id: String,
    pub credential_id: i64,
    pub session_token: String,
    pub ip_address: Option<String>,
}

/// Generic API response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}
