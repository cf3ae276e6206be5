//! Failover Mapping Engine
//!
//! Directed edges from a primary channel to prioritized backups on other
//! providers, fuzzy suggestions for new edges, and the failover-time choice
//! of which backup to use.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashSet;
use serde::Serialize;
use tracing::{debug, info};

use crate::db::Store;
use crate::error::{AppError, Result};
use crate::models::{Channel, ChannelMapping, HealthStatus, NewMapping, Provider};
use crate::services::matching::{normalize_name, similarity_normalized};
use crate::services::pool::CredentialPool;

/// Confidence floor for cross-provider suggestions
pub const SUGGESTION_FLOOR: f64 = 0.40;
/// Confidence floor when the admin already picked the target provider
pub const PROVIDER_SUGGESTION_FLOOR: f64 = 0.10;
pub const DEFAULT_SUGGESTION_LIMIT: usize = 10;

/// A usable backup of a primary channel
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupChannel {
    pub mapping_id: i64,
    pub priority: i32,
    pub channel: Channel,
    pub provider_id: i64,
    pub provider_name: String,
    pub provider_health: HealthStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSuggestion {
    pub channel: Channel,
    pub provider_id: i64,
    pub provider_name: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BulkOutcome {
    Created {
        #[serde(rename = "mappingId")]
        mapping_id: i64,
    },
    Duplicate,
    Invalid { reason: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemResult {
    pub primary_channel_id: i64,
    pub backup_channel_id: i64,
    #[serde(flatten)]
    pub outcome: BulkOutcome,
}

/// Per-backup view exposed by the failover rehearsal tooling
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDiagnostic {
    pub mapping_id: i64,
    pub priority: i32,
    pub channel_id: i64,
    pub stream_id: String,
    pub channel_name: String,
    pub provider_id: i64,
    pub provider_name: String,
    pub health: HealthStatus,
    /// Provider has an active credential that decrypts
    pub usable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverDecision {
    pub primary_channel_id: i64,
    pub primary_stream_id: String,
    pub test_mode: bool,
    pub selected: Option<BackupDiagnostic>,
    pub reason: String,
    pub backups: Vec<BackupDiagnostic>,
}

impl FailoverDecision {
    pub fn selected_channel_id(&self) -> Option<i64> {
        self.selected.as_ref().map(|b| b.channel_id)
    }
}

pub struct FailoverEngine {
    pool: Arc<CredentialPool>,
    /// Primary stream ids forced onto their top backup
    test_mode: DashSet<String>,
}

impl FailoverEngine {
    pub fn new(pool: Arc<CredentialPool>) -> Self {
        Self {
            pool,
            test_mode: DashSet::new(),
        }
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.pool.store()
    }

    // ========================================================================
    // Mapping CRUD
    // ========================================================================

    pub async fn create_mapping(
        &self,
        primary_channel_id: i64,
        backup_channel_id: i64,
        priority: Option<i32>,
    ) -> Result<ChannelMapping> {
        if primary_channel_id == backup_channel_id {
            return Err(AppError::Validation(
                "A channel cannot be its own backup".to_string(),
            ));
        }

        let primary = self.store().get_channel(primary_channel_id).await?.ok_or_else(|| {
            AppError::Validation(format!("Primary channel {} not found", primary_channel_id))
        })?;
        let backup = self.store().get_channel(backup_channel_id).await?.ok_or_else(|| {
            AppError::Validation(format!("Backup channel {} not found", backup_channel_id))
        })?;

        if primary.provider_id == backup.provider_id {
            return Err(AppError::Validation(
                "Primary and backup channels must belong to different providers".to_string(),
            ));
        }

        let priority = match priority {
            Some(p) if p < 1 => {
                return Err(AppError::Validation("Priority must be at least 1".to_string()))
            }
            Some(p) => p,
            None => self.next_priority(primary_channel_id).await?,
        };

        let mapping = self
            .store()
            .insert_mapping(primary_channel_id, backup_channel_id, priority)
            .await?;
        info!(
            mapping_id = mapping.id,
            primary_channel_id, backup_channel_id, priority, "Failover mapping created"
        );
        Ok(mapping)
    }

    async fn next_priority(&self, primary_channel_id: i64) -> Result<i32> {
        let existing = self.store().mappings_for_primary(primary_channel_id).await?;
        Ok(existing.iter().map(|m| m.priority).max().unwrap_or(0) + 1)
    }

    pub async fn update_mapping(
        &self,
        id: i64,
        priority: Option<i32>,
        is_active: Option<bool>,
    ) -> Result<ChannelMapping> {
        if matches!(priority, Some(p) if p < 1) {
            return Err(AppError::Validation("Priority must be at least 1".to_string()));
        }
        self.store()
            .update_mapping(id, priority, is_active)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Mapping {} not found", id)))
    }

    pub async fn delete_mapping(&self, id: i64) -> Result<()> {
        if !self.store().delete_mapping(id).await? {
            return Err(AppError::NotFound(format!("Mapping {} not found", id)));
        }
        Ok(())
    }

    pub async fn list_mappings(&self) -> Result<Vec<ChannelMapping>> {
        self.store().list_mappings().await
    }

    pub async fn mappings_for_primary(&self, primary_channel_id: i64) -> Result<Vec<ChannelMapping>> {
        self.store().mappings_for_primary(primary_channel_id).await
    }

    /// Backups by priority: active mapping, enabled channel, active provider
    pub async fn get_backup_channels(&self, primary_channel_id: i64) -> Result<Vec<BackupChannel>> {
        let mut backups = Vec::new();
        for mapping in self.store().mappings_for_primary(primary_channel_id).await? {
            if !mapping.is_active {
                continue;
            }
            let channel = match self.store().get_channel(mapping.backup_channel_id).await? {
                Some(c) if c.is_enabled => c,
                _ => continue,
            };
            let provider = match self.store().get_provider(channel.provider_id).await? {
                Some(p) if p.is_active => p,
                _ => continue,
            };
            backups.push(BackupChannel {
                mapping_id: mapping.id,
                priority: mapping.priority,
                provider_id: provider.id,
                provider_name: provider.name,
                provider_health: provider.health_status,
                channel,
            });
        }
        Ok(backups)
    }

    // ========================================================================
    // Suggestions
    // ========================================================================

    /// Likely backups on every other active provider (floor 40%)
    pub async fn suggest_mappings(
        &self,
        primary_channel_id: i64,
        limit: usize,
    ) -> Result<Vec<MappingSuggestion>> {
        let primary = self.require_channel(primary_channel_id).await?;
        let providers: Vec<Provider> = self
            .store()
            .list_providers()
            .await?
            .into_iter()
            .filter(|p| p.is_active && p.id != primary.provider_id)
            .collect();
        self.suggest_from(&primary, &providers, SUGGESTION_FLOOR, limit)
            .await
    }

    /// Likely backups on one chosen provider (floor 10%)
    pub async fn suggest_mappings_for_provider(
        &self,
        primary_channel_id: i64,
        target_provider_id: i64,
        limit: usize,
    ) -> Result<Vec<MappingSuggestion>> {
        let primary = self.require_channel(primary_channel_id).await?;
        if primary.provider_id == target_provider_id {
            return Err(AppError::Validation(
                "Target provider must differ from the primary channel's provider".to_string(),
            ));
        }
        let provider = self
            .store()
            .get_provider(target_provider_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Provider {} not found", target_provider_id)))?;
        self.suggest_from(&primary, &[provider], PROVIDER_SUGGESTION_FLOOR, limit)
            .await
    }

    async fn suggest_from(
        &self,
        primary: &Channel,
        providers: &[Provider],
        floor: f64,
        limit: usize,
    ) -> Result<Vec<MappingSuggestion>> {
        let target = normalize_name(&primary.name);
        let already_mapped: HashSet<i64> = self
            .store()
            .mappings_for_primary(primary.id)
            .await?
            .into_iter()
            .map(|m| m.backup_channel_id)
            .collect();

        let mut suggestions = Vec::new();
        for provider in providers {
            for channel in self.store().channels_for_provider(provider.id).await? {
                if !channel.is_enabled || already_mapped.contains(&channel.id) {
                    continue;
                }
                let score = similarity_normalized(&target, &normalize_name(&channel.name));
                if score >= floor {
                    suggestions.push(MappingSuggestion {
                        channel,
                        provider_id: provider.id,
                        provider_name: provider.name.clone(),
                        score,
                    });
                }
            }
        }

        suggestions.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.channel.name.cmp(&b.channel.name))
        });
        suggestions.truncate(limit);
        debug!(
            primary_channel_id = primary.id,
            count = suggestions.len(),
            "Mapping suggestions computed"
        );
        Ok(suggestions)
    }

    /// Create each entry independently; failures are reported, not fatal
    pub async fn bulk_create_mappings(&self, items: &[NewMapping]) -> Vec<BulkItemResult> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let outcome = match self
                .create_mapping(item.primary_channel_id, item.backup_channel_id, item.priority)
                .await
            {
                Ok(mapping) => BulkOutcome::Created {
                    mapping_id: mapping.id,
                },
                Err(AppError::AlreadyExists(_)) => BulkOutcome::Duplicate,
                Err(e) => BulkOutcome::Invalid {
                    reason: e.to_string(),
                },
            };
            results.push(BulkItemResult {
                primary_channel_id: item.primary_channel_id,
                backup_channel_id: item.backup_channel_id,
                outcome,
            });
        }

        let created = results
            .iter()
            .filter(|r| matches!(r.outcome, BulkOutcome::Created { .. }))
            .count();
        info!("Bulk mapping: {} of {} created", created, items.len());
        results
    }

    // ========================================================================
    // Failover-time choice
    // ========================================================================

    /// First backup whose provider is not unhealthy and can serve; otherwise
    /// the first usable one regardless of health.
    pub async fn resolve_failover(&self, primary: &Channel) -> Result<FailoverDecision> {
        let mut backups = Vec::new();
        for backup in self.get_backup_channels(primary.id).await? {
            let usable = self
                .pool
                .provider_has_usable_credential(backup.provider_id)
                .await?;
            let issue = if !usable {
                Some("No active credential".to_string())
            } else if backup.provider_health == HealthStatus::Unhealthy {
                Some("Provider unhealthy".to_string())
            } else {
                None
            };
            backups.push(BackupDiagnostic {
                mapping_id: backup.mapping_id,
                priority: backup.priority,
                channel_id: backup.channel.id,
                stream_id: backup.channel.stream_id.clone(),
                channel_name: backup.channel.name.clone(),
                provider_id: backup.provider_id,
                provider_name: backup.provider_name,
                health: backup.provider_health,
                usable,
                issue,
            });
        }

        let healthy = backups
            .iter()
            .find(|b| b.usable && b.health != HealthStatus::Unhealthy);
        let (selected, reason) = match healthy {
            Some(b) => (Some(b.clone()), format!("Backup on {} is healthy", b.provider_name)),
            None => match backups.iter().find(|b| b.usable) {
                Some(b) => (
                    Some(b.clone()),
                    format!("No healthy backup; using {} as last resort", b.provider_name),
                ),
                None if backups.is_empty() => (None, "No backups configured".to_string()),
                None => (None, "No usable backup".to_string()),
            },
        };

        Ok(FailoverDecision {
            primary_channel_id: primary.id,
            primary_stream_id: primary.stream_id.clone(),
            test_mode: self.is_test_mode(&primary.stream_id),
            selected,
            reason,
            backups,
        })
    }

    /// Primary channel for a stream id: the first carrying mappings, else the first
    pub async fn find_primary_channel(&self, stream_id: &str) -> Result<Channel> {
        let candidates = self.store().channels_by_stream_id(stream_id).await?;
        for channel in &candidates {
            if !self.store().mappings_for_primary(channel.id).await?.is_empty() {
                return Ok(channel.clone());
            }
        }
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("No channel with stream id {}", stream_id)))
    }

    async fn require_channel(&self, id: i64) -> Result<Channel> {
        self.store()
            .get_channel(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Channel {} not found", id)))
    }

    // ========================================================================
    // Test mode
    // ========================================================================

    pub fn set_test_mode(&self, primary_stream_id: &str, enabled: bool) {
        if enabled {
            self.test_mode.insert(primary_stream_id.to_string());
        } else {
            self.test_mode.remove(primary_stream_id);
        }
        info!(stream_id = primary_stream_id, enabled, "Failover test mode changed");
    }

    pub fn is_test_mode(&self, primary_stream_id: &str) -> bool {
        self.test_mode.contains(primary_stream_id)
    }

    pub fn test_mode_streams(&self) -> Vec<String> {
        let mut streams: Vec<String> = self.test_mode.iter().map(|s| s.key().clone()).collect();
        streams.sort();
        streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::admission::testing::{fixture, Fixture};

    fn engine(fx: &Fixture) -> FailoverEngine {
        FailoverEngine::new(fx.pool.clone())
    }

    #[tokio::test]
    async fn test_create_mapping_validation() {
        let fx = fixture();
        let a = fx.provider("A");
        let b = fx.provider("B");
        let hbo_a = fx.store.add_channel(a, "1", "HBO");
        let cnn_a = fx.store.add_channel(a, "2", "CNN");
        let hbo_b = fx.store.add_channel(b, "9", "HBO East");
        let engine = engine(&fx);

        assert!(matches!(
            engine.create_mapping(hbo_a, hbo_a, None).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            engine.create_mapping(hbo_a, cnn_a, None).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            engine.create_mapping(hbo_a, 999, None).await,
            Err(AppError::Validation(_))
        ));

        let created = engine.create_mapping(hbo_a, hbo_b, None).await.unwrap();
        assert_eq!(created.priority, 1);
        assert!(matches!(
            engine.create_mapping(hbo_a, hbo_b, None).await,
            Err(AppError::AlreadyExists(_))
        ));

        let backups = engine.get_backup_channels(hbo_a).await.unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].channel.name, "HBO East");
    }

    #[tokio::test]
    async fn test_backups_ordered_by_priority_and_filtered() {
        let fx = fixture();
        let a = fx.provider("A");
        let b = fx.provider("B");
        let c = fx.provider("C");
        let primary = fx.store.add_channel(a, "1", "HBO");
        let first = fx.store.add_channel(b, "10", "HBO B");
        let second = fx.store.add_channel(c, "20", "HBO C");
        let disabled = fx.store.add_channel(b, "11", "HBO B2");
        let engine = engine(&fx);

        // Auto priority appends; explicit priority reorders
        engine.create_mapping(primary, second, None).await.unwrap();
        engine.create_mapping(primary, disabled, None).await.unwrap();
        let m = engine.create_mapping(primary, first, Some(1)).await.unwrap();
        assert_eq!(m.priority, 1);

        let ids: Vec<i64> = engine
            .get_backup_channels(primary)
            .await
            .unwrap()
            .iter()
            .map(|b| b.channel.id)
            .collect();
        assert_eq!(ids, vec![second, first, disabled]);

        fx.store.set_channel_enabled(disabled, false);
        fx.store.set_provider_active(c, false);
        let ids: Vec<i64> = engine
            .get_backup_channels(primary)
            .await
            .unwrap()
            .iter()
            .map(|b| b.channel.id)
            .collect();
        assert_eq!(ids, vec![first]);

        let all = engine.mappings_for_primary(primary).await.unwrap();
        let inactive = all.iter().find(|m| m.backup_channel_id == first).unwrap();
        engine.update_mapping(inactive.id, None, Some(false)).await.unwrap();
        assert!(engine.get_backup_channels(primary).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_suggestions_use_floor_and_skip_same_provider() {
        let fx = fixture();
        let a = fx.provider("A");
        let b = fx.provider("B");
        let primary = fx.store.add_channel(a, "1", "USA Network (East) HD");
        fx.store.add_channel(a, "2", "USA Network");
        let close = fx.store.add_channel(b, "10", "USA Net");
        let exact = fx.store.add_channel(b, "11", "USA NETWORK SD");
        fx.store.add_channel(b, "12", "Discovery Channel");
        let engine = engine(&fx);

        let suggestions = engine.suggest_mappings(primary, 10).await.unwrap();
        let ids: Vec<i64> = suggestions.iter().map(|s| s.channel.id).collect();
        assert_eq!(ids, vec![exact, close]);
        assert!(suggestions.iter().all(|s| s.score >= SUGGESTION_FLOOR));

        assert_eq!(engine.suggest_mappings(primary, 1).await.unwrap().len(), 1);

        // Already-mapped backups are not suggested again
        engine.create_mapping(primary, exact, None).await.unwrap();
        let ids: Vec<i64> = engine
            .suggest_mappings(primary, 10)
            .await
            .unwrap()
            .iter()
            .map(|s| s.channel.id)
            .collect();
        assert_eq!(ids, vec![close]);
    }

    #[tokio::test]
    async fn test_provider_targeted_suggestions_use_lower_floor() {
        let fx = fixture();
        let a = fx.provider("A");
        let b = fx.provider("B");
        let primary = fx.store.add_channel(a, "1", "Sky Sports Main Event");
        let weak = fx.store.add_channel(b, "10", "Sky Cinema");
        let engine = engine(&fx);

        let general = engine.suggest_mappings(primary, 10).await.unwrap();
        assert!(general.is_empty());

        let targeted = engine
            .suggest_mappings_for_provider(primary, b, 10)
            .await
            .unwrap();
        assert_eq!(targeted.len(), 1);
        assert_eq!(targeted[0].channel.id, weak);
        assert!(targeted[0].score >= PROVIDER_SUGGESTION_FLOOR);

        assert!(matches!(
            engine.suggest_mappings_for_provider(primary, a, 10).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_bulk_create_reports_each_item() {
        let fx = fixture();
        let a = fx.provider("A");
        let b = fx.provider("B");
        let p = fx.store.add_channel(a, "1", "HBO");
        let same = fx.store.add_channel(a, "2", "HBO 2");
        let other = fx.store.add_channel(b, "3", "HBO");
        let engine = engine(&fx);

        let items = vec![
            NewMapping { primary_channel_id: p, backup_channel_id: other, priority: None },
            NewMapping { primary_channel_id: p, backup_channel_id: other, priority: None },
            NewMapping { primary_channel_id: p, backup_channel_id: same, priority: None },
        ];
        let results = engine.bulk_create_mappings(&items).await;

        assert!(matches!(results[0].outcome, BulkOutcome::Created { .. }));
        assert_eq!(results[1].outcome, BulkOutcome::Duplicate);
        assert!(matches!(results[2].outcome, BulkOutcome::Invalid { .. }));
        assert_eq!(engine.list_mappings().await.unwrap().len(), 1);

        let json = serde_json::to_value(&results[1]).unwrap();
        assert_eq!(json["status"], "duplicate");
        assert_eq!(json["primaryChannelId"], p);
    }

    #[tokio::test]
    async fn test_resolve_prefers_healthy_then_usable() {
        let fx = fixture();
        let a = fx.provider("A");
        let b = fx.provider("B");
        let c = fx.provider("C");
        let d = fx.provider("D");
        fx.credential(b, "b1", 1);
        fx.credential(c, "c1", 1);
        let primary_id = fx.store.add_channel(a, "1", "HBO");
        let on_b = fx.store.add_channel(b, "10", "HBO B");
        let on_c = fx.store.add_channel(c, "20", "HBO C");
        let on_d = fx.store.add_channel(d, "30", "HBO D");
        let engine = engine(&fx);
        engine.create_mapping(primary_id, on_d, None).await.unwrap();
        engine.create_mapping(primary_id, on_b, None).await.unwrap();
        engine.create_mapping(primary_id, on_c, None).await.unwrap();
        let primary = fx.store.get_channel(primary_id).await.unwrap().unwrap();

        let now = chrono::Utc::now();
        fx.store.set_provider_health(b, HealthStatus::Unhealthy, now).await.unwrap();
        fx.store.set_provider_health(c, HealthStatus::Healthy, now).await.unwrap();

        let decision = engine.resolve_failover(&primary).await.unwrap();
        assert_eq!(decision.selected_channel_id(), Some(on_c));
        assert_eq!(decision.backups.len(), 3);
        assert_eq!(decision.backups[0].issue.as_deref(), Some("No active credential"));
        assert_eq!(decision.backups[1].issue.as_deref(), Some("Provider unhealthy"));

        // Nothing healthy left: fall back to the first usable backup
        fx.store.set_provider_health(c, HealthStatus::Unhealthy, now).await.unwrap();
        let decision = engine.resolve_failover(&primary).await.unwrap();
        assert_eq!(decision.selected_channel_id(), Some(on_b));
    }

    #[tokio::test]
    async fn test_test_mode_and_primary_lookup() {
        let fx = fixture();
        let a = fx.provider("A");
        let b = fx.provider("B");
        fx.store.add_channel(b, "1", "Same Id Elsewhere");
        let primary = fx.store.add_channel(a, "1", "HBO");
        let backup = fx.store.add_channel(b, "2", "HBO B");
        let engine = engine(&fx);
        engine.create_mapping(primary, backup, None).await.unwrap();

        assert_eq!(engine.find_primary_channel("1").await.unwrap().id, primary);
        assert!(matches!(
            engine.find_primary_channel("nope").await,
            Err(AppError::NotFound(_))
        ));

        assert!(!engine.is_test_mode("1"));
        engine.set_test_mode("1", true);
        assert!(engine.is_test_mode("1"));
        assert_eq!(engine.test_mode_streams(), vec!["1".to_string()]);
        engine.set_test_mode("1", false);
        assert!(!engine.is_test_mode("1"));
    }
}
