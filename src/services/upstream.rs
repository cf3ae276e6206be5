//! Upstream Client
//!
//! One instance per credential. Wraps the Xtream wire client with a
//! TTL-bounded catalog cache kept in memory and mirrored on disk. Network
//! failures stop here: a refresh that fails serves the stale snapshot when
//! there is one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{CachedCatalog, CatalogCategory, CatalogChannel};
use crate::services::cache::CatalogDiskCache;
use crate::services::crypto::mask;
use crate::services::xtream::{XtreamApi, XtreamCredentials, XtreamEpgListings};

/// Catalog snapshots older than this are refreshed
pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(30 * 60);

/// Deadline for `authenticate()`
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Account status reported by the panel
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    pub status: String,
    pub is_active: bool,
    pub expires_at: Option<i64>,
    pub max_connections: Option<i32>,
    pub active_connections: Option<i32>,
    pub is_trial: bool,
    /// `****last4` of the login
    pub username: String,
}

pub struct UpstreamClient {
    /// `None` for the environment default credential
    credential_id: Option<i64>,
    provider_id: Option<i64>,
    creds: XtreamCredentials,
    api: Arc<dyn XtreamApi>,
    disk: Option<CatalogDiskCache>,
    ttl: Duration,
    auth_timeout: Duration,
    cache: RwLock<Option<CachedCatalog>>,
    /// Serializes refreshes so concurrent misses fetch once
    refresh_lock: Mutex<()>,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("credential_id", &self.credential_id)
            .field("provider_id", &self.provider_id)
            .field("creds", &self.creds)
            .finish_non_exhaustive()
    }
}

impl UpstreamClient {
    pub fn new(
        credential_id: Option<i64>,
        provider_id: Option<i64>,
        creds: XtreamCredentials,
        api: Arc<dyn XtreamApi>,
    ) -> Self {
        Self {
            credential_id,
            provider_id,
            creds,
            api,
            disk: None,
            ttl: DEFAULT_CATALOG_TTL,
            auth_timeout: AUTH_TIMEOUT,
            cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Attach a disk cache and seed memory from it when the snapshot is fresh
    pub async fn with_disk_cache(mut self, disk: CatalogDiskCache) -> Self {
        if let Some(id) = self.credential_id {
            if let Some(snapshot) = disk.load(id, self.ttl).await {
                debug!(
                    credential_id = id,
                    channels = snapshot.channels.len(),
                    "Loaded catalog snapshot from disk"
                );
                self.cache = RwLock::new(Some(snapshot));
            }
        }
        self.disk = Some(disk);
        self
    }

    pub fn credential_id(&self) -> Option<i64> {
        self.credential_id
    }

    pub fn provider_id(&self) -> Option<i64> {
        self.provider_id
    }

    /// Label for logs, never containing secrets
    fn label(&self) -> String {
        match self.credential_id {
            Some(id) => format!("credential {}", id),
            None => "default credential".to_string(),
        }
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Authenticate against the panel
    ///
    /// Fails with `AppError::Auth` on rejected credentials and on timeout.
    pub async fn authenticate(&self) -> Result<AccountStatus> {
        let auth = match tokio::time::timeout(self.auth_timeout, self.api.get_auth()).await {
            Ok(Ok(auth)) => auth,
            Ok(Err(e)) => return Err(AppError::Auth(e.to_string())),
            Err(_) => {
                return Err(AppError::Auth(format!(
                    "Authentication timed out after {}s",
                    self.auth_timeout.as_secs()
                )))
            }
        };

        let info = auth.user_info;
        Ok(AccountStatus {
            status: info.status.clone().unwrap_or_else(|| "unknown".to_string()),
            is_active: info.is_active(),
            expires_at: info.exp_timestamp(),
            max_connections: info.max_connections_i32(),
            active_connections: info.active_connections_i32(),
            is_trial: info.is_trial_account(),
            username: mask(&self.creds.username),
        })
    }

    /// One authentication round trip interpreted as a boolean. Never fails.
    pub async fn is_healthy(&self) -> bool {
        match self.authenticate().await {
            Ok(status) => status.is_active,
            Err(e) => {
                debug!("Health check failed for {}: {}", self.label(), e);
                false
            }
        }
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    pub async fn get_categories(&self) -> Result<Vec<CatalogCategory>> {
        Ok(self.catalog().await?.categories)
    }

    /// Live channels, optionally restricted to one category
    pub async fn get_channels(&self, category_id: Option<&str>) -> Result<Vec<CatalogChannel>> {
        let snapshot = self.catalog().await?;
        Ok(match category_id {
            Some(cat) => snapshot
                .channels
                .into_iter()
                .filter(|c| c.in_category(cat))
                .collect(),
            None => snapshot.channels,
        })
    }

    /// Whether this credential's catalog carries the stream; failures read as no
    pub async fn has_stream(&self, stream_id: &str) -> bool {
        match self.catalog().await {
            Ok(snapshot) => snapshot.channels.iter().any(|c| c.stream_id == stream_id),
            Err(_) => false,
        }
    }

    /// Timestamp of the cached snapshot, if any
    pub async fn cache_timestamp(&self) -> Option<i64> {
        self.cache.read().await.as_ref().map(|s| s.timestamp)
    }

    /// Drop the in-memory snapshot so the next read refetches
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Cached snapshot when fresh, otherwise refresh (stale on failure)
    async fn catalog(&self) -> Result<CachedCatalog> {
        let now = chrono::Utc::now().timestamp_millis();
        let ttl_ms = self.ttl.as_millis() as i64;

        if let Some(snapshot) = self.cache.read().await.as_ref() {
            if snapshot.is_fresh(now, ttl_ms) {
                return Ok(snapshot.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another task may have refreshed while we waited
        if let Some(snapshot) = self.cache.read().await.as_ref() {
            if snapshot.is_fresh(chrono::Utc::now().timestamp_millis(), ttl_ms) {
                return Ok(snapshot.clone());
            }
        }

        match self.fetch_catalog().await {
            Ok(snapshot) => {
                self.store_snapshot(&snapshot).await;
                Ok(snapshot)
            }
            Err(e) => {
                metrics::UPSTREAM_REFRESHES.with_label_values(&["error"]).inc();
                if let Some(stale) = self.cache.read().await.as_ref() {
                    warn!(
                        "Catalog refresh failed for {}, serving stale cache: {}",
                        self.label(),
                        e
                    );
                    return Ok(stale.clone());
                }
                warn!("Catalog refresh failed for {} with no cache: {}", self.label(), e);
                Err(AppError::UpstreamUnavailable(e.to_string()))
            }
        }
    }

    /// Force a refresh regardless of TTL. A failure is returned as-is; the
    /// cached catalog is left in place for reads.
    pub async fn refresh(&self) -> Result<CachedCatalog> {
        let _guard = self.refresh_lock.lock().await;
        match self.fetch_catalog().await {
            Ok(snapshot) => {
                self.store_snapshot(&snapshot).await;
                Ok(snapshot)
            }
            Err(e) => {
                metrics::UPSTREAM_REFRESHES.with_label_values(&["error"]).inc();
                Err(AppError::UpstreamUnavailable(e.to_string()))
            }
        }
    }

    async fn fetch_catalog(&self) -> std::result::Result<CachedCatalog, crate::services::xtream::XtreamError> {
        let categories = self.api.get_live_categories().await?;
        let streams = self.api.get_live_streams().await?;

        // get_live_streams omits category names
        let names: HashMap<&str, &str> = categories
            .iter()
            .map(|c| (c.category_id.as_str(), c.category_name.as_str()))
            .collect();

        let channels: Vec<CatalogChannel> = streams
            .iter()
            .map(|s| CatalogChannel {
                stream_id: s.stream_id.clone(),
                name: s.name.trim().to_string(),
                logo: s.stream_icon.clone().filter(|l| !l.is_empty()),
                category_id: s.category_id.clone(),
                category_name: s
                    .category_id
                    .as_deref()
                    .and_then(|id| names.get(id))
                    .map(|n| n.to_string()),
                epg_channel_id: s.epg_channel_id.clone().filter(|e| !e.is_empty()),
                channel_id: None,
                provider_id: self.provider_id,
                credential_id: self.credential_id,
            })
            .collect();

        let categories = categories
            .into_iter()
            .map(|c| CatalogCategory {
                id: c.category_id,
                name: c.category_name,
            })
            .collect();

        Ok(CachedCatalog {
            categories,
            channels,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn store_snapshot(&self, snapshot: &CachedCatalog) {
        metrics::UPSTREAM_REFRESHES.with_label_values(&["ok"]).inc();
        info!(
            "Catalog refreshed for {}: {} categories, {} channels",
            self.label(),
            snapshot.categories.len(),
            snapshot.channels.len()
        );

        *self.cache.write().await = Some(snapshot.clone());

        if let (Some(disk), Some(id)) = (&self.disk, self.credential_id) {
            if let Err(e) = disk.save(id, snapshot).await {
                warn!("Failed to persist catalog snapshot for credential {}: {}", id, e);
            }
        }
    }

    // ========================================================================
    // EPG
    // ========================================================================

    pub async fn get_short_epg(&self, stream_id: &str, limit: Option<u32>) -> Result<XtreamEpgListings> {
        Ok(self.api.get_short_epg(stream_id, limit).await?)
    }

    pub async fn get_full_epg(&self, stream_id: &str) -> Result<XtreamEpgListings> {
        Ok(self.api.get_simple_data_table(stream_id).await?)
    }

    // ========================================================================
    // URL builders (no network)
    // ========================================================================

    pub fn get_stream_url(&self, stream_id: &str, extension: &str) -> String {
        self.creds.stream_url(stream_id, extension)
    }

    pub fn get_hls_stream_url(&self, stream_id: &str) -> String {
        self.creds.hls_url(stream_id)
    }

    pub fn get_m3u_url(&self) -> String {
        self.creds.m3u_url()
    }

    pub fn get_xmltv_url(&self) -> String {
        self.creds.xmltv_url()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable `XtreamApi` for tests

    use super::*;
    use crate::services::xtream::{
        XtreamAuthResponse, XtreamCategory, XtreamError, XtreamLiveStream, XtreamUserInfo,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub struct FakeApi {
        pub categories: StdMutex<Vec<(String, String)>>,
        /// (stream_id, name, category_id)
        pub streams: StdMutex<Vec<(String, String, String)>>,
        pub fail: AtomicBool,
        pub reject_auth: AtomicBool,
        pub auth_delay: StdMutex<Option<Duration>>,
        pub stream_calls: AtomicUsize,
    }

    impl FakeApi {
        pub fn with_channels(names: &[(&str, &str)]) -> Arc<Self> {
            let api = Self::default();
            *api.categories.lock().unwrap() = vec![("1".to_string(), "General".to_string())];
            *api.streams.lock().unwrap() = names
                .iter()
                .map(|(id, name)| (id.to_string(), name.to_string(), "1".to_string()))
                .collect();
            Arc::new(api)
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl XtreamApi for FakeApi {
        async fn get_auth(&self) -> std::result::Result<XtreamAuthResponse, XtreamError> {
            let delay = *self.auth_delay.lock().unwrap();
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(XtreamError::Network("connection refused".into()));
            }
            if self.reject_auth.load(Ordering::SeqCst) {
                return Err(XtreamError::Unauthorized("Invalid credentials".into()));
            }
            Ok(XtreamAuthResponse {
                user_info: XtreamUserInfo {
                    username: Some("user".into()),
                    auth: true,
                    status: Some("Active".into()),
                    exp_date: Some("1893456000".into()),
                    is_trial: Some("0".into()),
                    active_cons: Some("0".into()),
                    max_connections: Some("2".into()),
                },
                server_info: None,
            })
        }

        async fn get_live_categories(
            &self,
        ) -> std::result::Result<Vec<XtreamCategory>, XtreamError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(XtreamError::Timeout);
            }
            Ok(self
                .categories
                .lock()
                .unwrap()
                .iter()
                .map(|(id, name)| XtreamCategory {
                    category_id: id.clone(),
                    category_name: name.clone(),
                    parent_id: None,
                })
                .collect())
        }

        async fn get_live_streams(
            &self,
        ) -> std::result::Result<Vec<XtreamLiveStream>, XtreamError> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(XtreamError::Timeout);
            }
            Ok(self
                .streams
                .lock()
                .unwrap()
                .iter()
                .map(|(id, name, cat)| XtreamLiveStream {
                    num: None,
                    name: name.clone(),
                    stream_id: id.clone(),
                    stream_icon: None,
                    epg_channel_id: None,
                    category_id: Some(cat.clone()),
                    tv_archive: None,
                })
                .collect())
        }

        async fn get_short_epg(
            &self,
            _stream_id: &str,
            _limit: Option<u32>,
        ) -> std::result::Result<XtreamEpgListings, XtreamError> {
            Ok(XtreamEpgListings::default())
        }

        async fn get_simple_data_table(
            &self,
            _stream_id: &str,
        ) -> std::result::Result<XtreamEpgListings, XtreamError> {
            Ok(XtreamEpgListings::default())
        }
    }
}
