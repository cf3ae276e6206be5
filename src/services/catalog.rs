//! Catalog Resolver
//!
//! Merges everything a subscriber can see into one deduplicated catalog.
//! Package-based access wins when it yields anything; otherwise the legacy
//! per-credential catalogs are merged in credential priority order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::models::{CachedCatalog, CatalogCategory, CatalogChannel, Channel};
use crate::services::pool::CredentialPool;
use crate::services::upstream::UpstreamClient;
use crate::services::xtream::XtreamEpgListings;

/// Per-user merged catalog cache
pub struct UserCatalogCache {
    ttl: Duration,
    entries: RwLock<HashMap<i64, CachedCatalog>>,
}

impl UserCatalogCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, user_id: i64) -> Option<CachedCatalog> {
        let now = chrono::Utc::now().timestamp_millis();
        let entries = self.entries.read().await;
        entries
            .get(&user_id)
            .filter(|c| c.is_fresh(now, self.ttl.as_millis() as i64))
            .cloned()
    }

    pub async fn put(&self, user_id: i64, catalog: CachedCatalog) {
        self.entries.write().await.insert(user_id, catalog);
    }

    pub async fn invalidate(&self, user_id: i64) {
        self.entries.write().await.remove(&user_id);
    }

    /// Credential membership changed: every merged catalog is suspect
    pub async fn invalidate_all(&self) {
        let mut entries = self.entries.write().await;
        if !entries.is_empty() {
            debug!("Invalidating {} user catalogs", entries.len());
        }
        entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

pub struct CatalogResolver {
    pool: Arc<CredentialPool>,
}

impl CatalogResolver {
    pub fn new(pool: Arc<CredentialPool>) -> Self {
        Self { pool }
    }

    /// Merged, deduplicated, name-sorted channels for a user
    pub async fn get_merged_channels(
        &self,
        user_id: i64,
        category_id: Option<&str>,
    ) -> Result<Vec<CatalogChannel>> {
        let catalog = self.merged_catalog(user_id).await?;
        Ok(match category_id {
            Some(cat) => catalog
                .channels
                .into_iter()
                .filter(|c| c.in_category(cat))
                .collect(),
            None => catalog.channels,
        })
    }

    pub async fn get_categories(&self, user_id: i64) -> Result<Vec<CatalogCategory>> {
        Ok(self.merged_catalog(user_id).await?.categories)
    }

    /// Short EPG for a stream the user can see
    pub async fn get_short_epg(
        &self,
        user_id: i64,
        stream_id: &str,
        limit: Option<u32>,
    ) -> Result<XtreamEpgListings> {
        let client = self.client_for_stream(user_id, stream_id).await?;
        client.get_short_epg(stream_id, limit).await
    }

    /// A client able to serve the stream: the bound session's credential,
    /// the package channel's provider, then the user's credentials in order.
    pub async fn client_for_stream(
        &self,
        user_id: i64,
        stream_id: &str,
    ) -> Result<Arc<UpstreamClient>> {
        let store = self.pool.store();

        if let Some(session) = store.find_session(user_id, stream_id).await? {
            if let Ok(client) = self.pool.get_client(session.credential_id).await {
                return Ok(client);
            }
        }

        let package_channel = store
            .package_channels_for_user(user_id)
            .await?
            .into_iter()
            .find(|c| c.stream_id == stream_id);
        if let Some(channel) = package_channel {
            for credential in store.active_credentials_for_provider(channel.provider_id).await? {
                if let Ok(client) = self.pool.get_client(credential.id).await {
                    return Ok(client);
                }
            }
        }

        for client in self.pool.get_clients_for_user(user_id).await? {
            if client.has_stream(stream_id).await {
                return Ok(client);
            }
        }

        Err(AppError::NotFound(format!(
            "Stream {} is not in this user's catalog",
            stream_id
        )))
    }

    async fn merged_catalog(&self, user_id: i64) -> Result<CachedCatalog> {
        let cache = self.pool.user_catalogs();
        if let Some(cached) = cache.get(user_id).await {
            return Ok(cached);
        }

        let mut channels = self.package_channels(user_id).await?;
        if channels.is_empty() {
            channels = self.legacy_channels(user_id).await?;
        }

        let catalog = CachedCatalog {
            categories: categories_of(&channels),
            channels,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        cache.put(user_id, catalog.clone()).await;
        Ok(catalog)
    }

    /// Channels of the user's packages whose provider can actually serve them
    async fn package_channels(&self, user_id: i64) -> Result<Vec<CatalogChannel>> {
        let rows = self
            .pool
            .store()
            .package_channels_for_user(user_id)
            .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut usable: HashMap<i64, bool> = HashMap::new();
        for row in &rows {
            if !usable.contains_key(&row.provider_id) {
                let ok = self
                    .pool
                    .provider_has_usable_credential(row.provider_id)
                    .await?;
                if !ok {
                    warn!(
                        provider_id = row.provider_id,
                        "Provider has no usable credential, hiding its channels"
                    );
                }
                usable.insert(row.provider_id, ok);
            }
        }

        let channels = rows
            .into_iter()
            .filter(|c| usable.get(&c.provider_id).copied().unwrap_or(false))
            .map(from_channel)
            .collect();
        Ok(dedup_and_sort(channels))
    }

    /// Union of every usable credential's upstream catalog
    async fn legacy_channels(&self, user_id: i64) -> Result<Vec<CatalogChannel>> {
        let clients = self.pool.get_clients_for_user(user_id).await?;
        let results = join_all(clients.iter().map(|c| c.get_channels(None))).await;

        let mut merged = Vec::new();
        for (client, result) in clients.iter().zip(results) {
            match result {
                Ok(channels) => merged.extend(channels),
                Err(e) => warn!(
                    credential_id = ?client.credential_id(),
                    "Credential catalog unavailable, treating as empty: {}", e
                ),
            }
        }
        Ok(dedup_and_sort(merged))
    }
}

fn from_channel(channel: Channel) -> CatalogChannel {
    CatalogChannel {
        stream_id: channel.stream_id,
        name: channel.name,
        logo: channel.logo,
        category_id: channel.category_id,
        category_name: channel.category_name,
        epg_channel_id: channel.epg_channel_id,
        channel_id: Some(channel.id),
        provider_id: Some(channel.provider_id),
        credential_id: None,
    }
}

/// First occurrence of each name wins; the result is sorted by name
pub fn dedup_and_sort(channels: Vec<CatalogChannel>) -> Vec<CatalogChannel> {
    let mut seen = HashSet::new();
    let mut unique: Vec<CatalogChannel> = channels
        .into_iter()
        .filter(|c| seen.insert(c.dedup_key()))
        .collect();
    unique.sort_by_cached_key(|c| c.name.trim().to_lowercase());
    unique
}

/// Distinct categories present in a channel list, sorted by name
fn categories_of(channels: &[CatalogChannel]) -> Vec<CatalogCategory> {
    let mut seen = HashSet::new();
    let mut categories: Vec<CatalogCategory> = channels
        .iter()
        .filter_map(|c| {
            let id = c.category_id.clone()?;
            if !seen.insert(id.clone()) {
                return None;
            }
            Some(CatalogCategory {
                name: c.category_name.clone().unwrap_or_else(|| id.clone()),
                id,
            })
        })
        .collect();
    categories.sort_by_cached_key(|c| c.name.to_lowercase());
    categories
}
