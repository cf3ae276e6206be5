//! Provider health monitor
//!
//! Periodically authenticates every active credential of every active
//! Xtream provider and writes credential and provider health back. It only
//! reads session state; capacity is never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::time;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::models::{HealthStatus, ProtocolKind, Provider};
use crate::services::pool::CredentialPool;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialHealth {
    pub credential_id: i64,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealthReport {
    pub provider_id: i64,
    pub provider_name: String,
    pub status: HealthStatus,
    pub credentials: Vec<CredentialHealth>,
    pub checked_at: DateTime<Utc>,
}

/// healthy = all ok, degraded = some ok, unhealthy = none ok, unknown = nothing to check
pub fn aggregate(total: usize, healthy: usize) -> HealthStatus {
    match (total, healthy) {
        (0, _) => HealthStatus::Unknown,
        (t, h) if h >= t => HealthStatus::Healthy,
        (_, 0) => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

pub struct HealthMonitor {
    pool: Arc<CredentialPool>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<CredentialPool>) -> Self {
        Self { pool }
    }

    pub async fn check_provider_by_id(&self, provider_id: i64) -> Result<ProviderHealthReport> {
        let provider = self
            .pool
            .store()
            .get_provider(provider_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Provider {} not found", provider_id)))?;
        if provider.kind == ProtocolKind::M3u {
            return Err(AppError::Validation(
                "M3U providers have no credentials to check".to_string(),
            ));
        }
        self.check_provider(&provider).await
    }

    pub async fn check_provider(&self, provider: &Provider) -> Result<ProviderHealthReport> {
        let store = self.pool.store();
        let credentials = store.active_credentials_for_provider(provider.id).await?;

        let checks = credentials.iter().map(|credential| async move {
            let healthy = match self.pool.get_client(credential.id).await {
                Ok(client) => client.is_healthy().await,
                Err(e) => {
                    warn!(credential_id = credential.id, "Cannot build client: {}", e);
                    false
                }
            };
            CredentialHealth {
                credential_id: credential.id,
                healthy,
            }
        });
        let results = join_all(checks).await;

        for result in &results {
            let status = if result.healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            };
            store.set_credential_health(result.credential_id, status).await?;
        }

        let healthy = results.iter().filter(|r| r.healthy).count();
        let status = aggregate(results.len(), healthy);
        let checked_at = Utc::now();
        store
            .set_provider_health(provider.id, status, checked_at)
            .await?;

        if status != provider.health_status {
            info!(
                provider_id = provider.id,
                from = %provider.health_status,
                to = %status,
                "Provider health changed"
            );
        }

        Ok(ProviderHealthReport {
            provider_id: provider.id,
            provider_name: provider.name.clone(),
            status,
            credentials: results,
            checked_at,
        })
    }

    /// One pass over every active Xtream provider
    pub async fn check_all(&self) -> Result<Vec<ProviderHealthReport>> {
        let providers = self.pool.store().list_providers().await?;
        let mut reports = Vec::new();
        for provider in providers
            .iter()
            .filter(|p| p.is_active && p.kind == ProtocolKind::Xtream)
        {
            match self.check_provider(provider).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(provider_id = provider.id, "Health check failed: {}", e),
            }
        }
        Ok(reports)
    }
}

/// Background loop; the first pass runs immediately
pub async fn start_health_task(monitor: Arc<HealthMonitor>, interval_secs: u64) {
    info!("Starting provider health monitor (interval: {}s)", interval_secs);

    let mut interval = time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        interval.tick().await;
        match monitor.check_all().await {
            Ok(reports) => {
                let unhealthy = reports
                    .iter()
                    .filter(|r| r.status == HealthStatus::Unhealthy)
                    .count();
                info!(
                    "Health check complete: {} providers, {} unhealthy",
                    reports.len(),
                    unhealthy
                );
            }
            Err(e) => warn!("Health check pass failed: {}", e),
        }
    }
}
