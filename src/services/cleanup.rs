//! Stale session sweep
//!
//! Runs as a background task on startup, then periodically.
//! - Deletes leases whose heartbeat is older than the stale threshold
//! - Drops unleased playback tickets on the same threshold
//! - Removes expired catalog snapshots from the disk cache

use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::services::admission::AdmissionController;
use crate::services::cache::CatalogDiskCache;
use crate::services::streaming::StreamingService;

/// Configuration for the sweep
pub struct CleanupConfig {
    /// How often to run (in seconds)
    pub interval_secs: u64,
    /// Heartbeat age after which a session no longer counts
    pub stale_after: Duration,
    /// Snapshot age after which the disk copy is removed
    pub snapshot_ttl: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            stale_after: Duration::from_secs(90),
            snapshot_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Everything one sweep touches
pub struct CleanupTargets {
    pub admission: Arc<AdmissionController>,
    pub streaming: Arc<StreamingService>,
    pub disk: Option<CatalogDiskCache>,
}

/// Result of a cleanup cycle
#[derive(Debug, Default)]
pub struct CleanupResult {
    pub sessions_swept: usize,
    pub tickets_swept: usize,
    pub snapshots_removed: usize,
    pub errors: Vec<String>,
}

impl CleanupResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn total_removed(&self) -> usize {
        self.sessions_swept + self.tickets_swept + self.snapshots_removed
    }
}

/// Run a single cleanup cycle
pub async fn run_cleanup(targets: &CleanupTargets, config: &CleanupConfig) -> CleanupResult {
    let mut result = CleanupResult::default();

    match targets.admission.sweep_stale().await {
        Ok(swept) => {
            result.sessions_swept = swept.len();
            for session in &swept {
                tracing::debug!(
                    credential_id = session.credential_id,
                    user_id = session.user_id,
                    stream_id = %session.stream_id,
                    "Swept stale session"
                );
            }
        }
        Err(e) => {
            result.errors.push(format!("Session sweep failed: {}", e));
            tracing::error!("Cleanup: session sweep failed: {}", e);
        }
    }

    result.tickets_swept = targets.streaming.sweep_tickets(config.stale_after);

    if let Some(disk) = &targets.disk {
        match disk.cleanup_expired(config.snapshot_ttl).await {
            Ok(count) => result.snapshots_removed = count,
            Err(e) => {
                result.errors.push(format!("Snapshot cleanup failed: {}", e));
                tracing::error!("Cleanup: snapshot cleanup failed: {}", e);
            }
        }
    }

    if result.total_removed() > 0 {
        tracing::info!(
            "Cleanup: {} sessions, {} tickets, {} snapshots removed",
            result.sessions_swept,
            result.tickets_swept,
            result.snapshots_removed
        );
    }

    result
}

/// Start the background cleanup task
///
/// Runs immediately on startup, then periodically at the configured interval.
/// This should be spawned as a background task using `tokio::spawn`.
pub async fn start_cleanup_task(targets: CleanupTargets, config: CleanupConfig) {
    tracing::info!(
        "Starting cleanup task (interval: {}s, stale after: {}s)",
        config.interval_secs,
        config.stale_after.as_secs()
    );

    let mut interval = time::interval(Duration::from_secs(config.interval_secs.max(1)));

    loop {
        // First tick completes immediately
        interval.tick().await;

        let result = run_cleanup(&targets, &config).await;
        if !result.is_success() {
            for error in &result.errors {
                tracing::warn!("Cleanup error: {}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::services::admission::{testing::fixture, Admission};
    use crate::services::failover::FailoverEngine;
    use crate::services::playback::PlaybackSelector;
    use crate::services::streaming::{StartOptions, StartOutcome};

    #[tokio::test]
    async fn test_run_cleanup_frees_capacity_of_abandoned_sessions() {
        let fx = fixture();
        let a = fx.provider("A");
        let c1 = fx.credential(a, "c1", 1);
        let hbo = fx.store.add_channel(a, "100", "HBO");
        fx.package_for(&[hbo], &[1, 2]);

        let streaming = Arc::new(StreamingService::new(
            fx.pool.clone(),
            fx.admission.clone(),
            Arc::new(FailoverEngine::new(fx.pool.clone())),
            Arc::new(PlaybackSelector::new(None, Duration::from_secs(60), 8)),
            "http://hub.example.com",
            None,
        ));
        let start = fx.admission.acquire(1, "100", None).await.unwrap();
        let token = match start {
            Admission::Leased(s) => s.session_token,
            other => panic!("expected a lease, got {:?}", other),
        };
        fx.store
            .set_heartbeat(&token, chrono::Utc::now() - chrono::Duration::seconds(300));

        let dir = tempfile::tempdir().unwrap();
        let targets = CleanupTargets {
            admission: fx.admission.clone(),
            streaming: streaming.clone(),
            disk: Some(CatalogDiskCache::new(dir.path()).await.unwrap()),
        };
        let result = run_cleanup(&targets, &CleanupConfig::default()).await;
        assert!(result.is_success());
        assert_eq!(result.sessions_swept, 1);
        assert_eq!(result.snapshots_removed, 0);

        let cutoff = fx.admission.cutoff();
        assert_eq!(fx.store.count_active_sessions(c1, cutoff).await.unwrap(), 0);
        assert!(matches!(
            streaming
                .start_stream(2, "100", &StartOptions::default())
                .await
                .unwrap(),
            StartOutcome::Started(_)
        ));
    }
}
