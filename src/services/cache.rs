use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::models::CachedCatalog;

/// Disk-based cache of per-credential catalog snapshots
///
/// One `credential-{id}.json` file per credential. Snapshots never contain
/// secrets, so they can be read back after a restart without the key.
#[derive(Clone)]
pub struct CatalogDiskCache {
    cache_dir: PathBuf,
}

impl CatalogDiskCache {
    /// Create the cache directory if needed
    pub async fn new(cache_dir: impl AsRef<Path>) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir)
            .await
            .with_context(|| format!("Failed to create cache dir {}", cache_dir.display()))?;
        Ok(Self { cache_dir })
    }

    /// Load a snapshot if present and younger than `ttl`
    pub async fn load(&self, credential_id: i64, ttl: Duration) -> Option<CachedCatalog> {
        let path = self.snapshot_path(credential_id);
        let content = fs::read_to_string(&path).await.ok()?;

        let snapshot = match serde_json::from_str::<CachedCatalog>(&content) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Failed to parse catalog snapshot {}: {}", path.display(), e);
                let _ = fs::remove_file(&path).await;
                return None;
            }
        };

        let now = chrono::Utc::now().timestamp_millis();
        if !snapshot.is_fresh(now, ttl.as_millis() as i64) {
            tracing::debug!(credential_id, "Disk catalog snapshot expired");
            return None;
        }

        Some(snapshot)
    }

    /// Persist a snapshot with an atomic replace
    pub async fn save(&self, credential_id: i64, snapshot: &CachedCatalog) -> Result<()> {
        let path = self.snapshot_path(credential_id);
        let tmp_path = self.snapshot_tmp_path(credential_id);
        let content = serde_json::to_vec(snapshot)?;

        let mut file = File::create(&tmp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        // Atomic replace to avoid readers seeing partial writes
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    pub async fn remove(&self, credential_id: i64) -> Result<()> {
        let _ = fs::remove_file(self.snapshot_path(credential_id)).await;
        let _ = fs::remove_file(self.snapshot_tmp_path(credential_id)).await;
        Ok(())
    }

    /// Delete snapshot files older than `ttl`; returns how many were removed
    pub async fn cleanup_expired(&self, ttl: Duration) -> Result<usize> {
        let mut entries = fs::read_dir(&self.cache_dir).await?;
        let now = chrono::Utc::now().timestamp_millis();
        let ttl_ms = ttl.as_millis() as i64;
        let mut removed = 0usize;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let stale = match fs::read_to_string(&path).await {
                Ok(content) => serde_json::from_str::<CachedCatalog>(&content)
                    .map(|s| !s.is_fresh(now, ttl_ms))
                    .unwrap_or(true),
                Err(_) => false,
            };
            if stale && fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }

        Ok(removed)
    }

    // ============ Path Helpers ============

    fn snapshot_path(&self, credential_id: i64) -> PathBuf {
        self.cache_dir.join(format!("credential-{}.json", credential_id))
    }

    fn snapshot_tmp_path(&self, credential_id: i64) -> PathBuf {
        self.cache_dir
            .join(format!("credential-{}.json.tmp", credential_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CatalogCategory, CatalogChannel};

    fn snapshot(timestamp: i64) -> CachedCatalog {
        CachedCatalog {
            categories: vec![CatalogCategory {
                id: "1".into(),
                name: "News".into(),
            }],
            channels: vec![CatalogChannel {
                stream_id: "10".into(),
                name: "CNN".into(),
                logo: None,
                category_id: Some("1".into()),
                category_name: Some("News".into()),
                epg_channel_id: None,
                channel_id: None,
                provider_id: None,
                credential_id: Some(7),
            }],
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_save_and_load_fresh_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CatalogDiskCache::new(dir.path()).await.unwrap();

        let now = chrono::Utc::now().timestamp_millis();
        cache.save(7, &snapshot(now)).await.unwrap();

        let loaded = cache.load(7, Duration::from_secs(1800)).await.unwrap();
        assert_eq!(loaded.channels.len(), 1);
        assert_eq!(loaded.channels[0].name, "CNN");
        assert!(cache.load(8, Duration::from_secs(1800)).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_snapshot_is_ignored_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CatalogDiskCache::new(dir.path()).await.unwrap();

        let old = chrono::Utc::now().timestamp_millis() - 3_600_000;
        cache.save(7, &snapshot(old)).await.unwrap();

        assert!(cache.load(7, Duration::from_secs(1800)).await.is_none());
        assert_eq!(cache.cleanup_expired(Duration::from_secs(1800)).await.unwrap(), 1);
        assert!(!dir.path().join("credential-7.json").exists());
    }
}
