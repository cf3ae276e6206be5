//! Credential Pool
//!
//! Owns one `UpstreamClient` per active credential. Clients are built lazily
//! on first access, which is the only place secrets get decrypted.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::db::Store;
use crate::error::{AppError, Result};
use crate::models::{Credential, ProtocolKind};
use crate::services::cache::CatalogDiskCache;
use crate::services::catalog::UserCatalogCache;
use crate::services::crypto::SecretsCodec;
use crate::services::upstream::{UpstreamClient, AUTH_TIMEOUT, DEFAULT_CATALOG_TTL};
use crate::services::xtream::{XtreamApi, XtreamClient, XtreamCredentials};

/// Builds the wire client for a set of decrypted credentials
pub type ApiFactory =
    Arc<dyn Fn(&XtreamCredentials) -> Result<Arc<dyn XtreamApi>> + Send + Sync>;

/// Factory producing real HTTP clients
pub fn http_api_factory(timeout: Duration, user_agent: String) -> ApiFactory {
    Arc::new(move |creds: &XtreamCredentials| {
        let client = XtreamClient::new(creds, timeout, &user_agent)?;
        Ok(Arc::new(client) as Arc<dyn XtreamApi>)
    })
}

pub struct CredentialPool {
    store: Arc<dyn Store>,
    codec: SecretsCodec,
    factory: ApiFactory,
    disk: Option<CatalogDiskCache>,
    catalog_ttl: Duration,
    auth_timeout: Duration,
    clients: DashMap<i64, Arc<UpstreamClient>>,
    default_client: Option<Arc<UpstreamClient>>,
    user_catalogs: Arc<UserCatalogCache>,
}

impl CredentialPool {
    pub fn new(
        store: Arc<dyn Store>,
        codec: SecretsCodec,
        factory: ApiFactory,
        user_catalogs: Arc<UserCatalogCache>,
    ) -> Self {
        Self {
            store,
            codec,
            factory,
            disk: None,
            catalog_ttl: DEFAULT_CATALOG_TTL,
            auth_timeout: AUTH_TIMEOUT,
            clients: DashMap::new(),
            default_client: None,
            user_catalogs,
        }
    }

    pub fn with_disk_cache(mut self, disk: CatalogDiskCache) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn with_timeouts(mut self, catalog_ttl: Duration, auth_timeout: Duration) -> Self {
        self.catalog_ttl = catalog_ttl;
        self.auth_timeout = auth_timeout;
        self
    }

    /// Register the environment default credential (plaintext from config)
    pub fn with_default_credential(
        mut self,
        server: &str,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let creds = XtreamCredentials::new(server, username, password);
        let api = (self.factory)(&creds)?;
        let client = UpstreamClient::new(None, None, creds, api)
            .with_ttl(self.catalog_ttl)
            .with_auth_timeout(self.auth_timeout);
        info!("Environment default credential configured");
        self.default_client = Some(Arc::new(client));
        Ok(self)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn codec(&self) -> &SecretsCodec {
        &self.codec
    }

    pub fn user_catalogs(&self) -> &Arc<UserCatalogCache> {
        &self.user_catalogs
    }

    pub fn default_client(&self) -> Option<Arc<UpstreamClient>> {
        self.default_client.clone()
    }

    /// Number of constructed per-credential clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    // ========================================================================
    // Client lookup
    // ========================================================================

    /// Existing client, or a newly constructed one for an active credential
    pub async fn get_client(&self, credential_id: i64) -> Result<Arc<UpstreamClient>> {
        if let Some(client) = self.clients.get(&credential_id) {
            return Ok(client.clone());
        }

        let credential = self
            .store
            .get_credential(credential_id)
            .await?
            .filter(|c| c.is_active)
            .ok_or_else(|| {
                AppError::NotFound(format!("Credential {} not found or inactive", credential_id))
            })?;

        let client = Arc::new(self.build_client(&credential).await?);
        debug!(credential_id, "Constructed upstream client");

        Ok(self
            .clients
            .entry(credential_id)
            .or_insert(client)
            .clone())
    }

    async fn build_client(&self, credential: &Credential) -> Result<UpstreamClient> {
        let server = match credential.provider_id {
            Some(provider_id) => {
                let provider = self.store.get_provider(provider_id).await?.ok_or_else(|| {
                    AppError::NotFound(format!("Provider {} not found", provider_id))
                })?;
                self.codec.decrypt(&provider.base_url)?
            }
            // Legacy standalone credential carries its own server URL
            None => match &credential.server_url {
                Some(url) => self.codec.decrypt(url)?,
                None => {
                    return Err(AppError::Validation(format!(
                        "Credential {} has no provider and no server URL",
                        credential.id
                    )))
                }
            },
        };
        let username = self.codec.decrypt(&credential.username)?;
        let password = self.codec.decrypt(&credential.password)?;

        let creds = XtreamCredentials::new(&server, &username, &password);
        let api = (self.factory)(&creds)?;

        let client = UpstreamClient::new(Some(credential.id), credential.provider_id, creds, api)
            .with_ttl(self.catalog_ttl)
            .with_auth_timeout(self.auth_timeout);

        Ok(match &self.disk {
            Some(disk) => client.with_disk_cache(disk.clone()).await,
            None => client,
        })
    }

    /// Clients for the credentials assigned to the user's active plans, in
    /// assignment priority. Credentials that cannot be built are skipped.
    pub async fn plan_clients_for_user(&self, user_id: i64) -> Result<Vec<Arc<UpstreamClient>>> {
        let credentials = self.store.plan_credentials_for_user(user_id).await?;
        let mut clients = Vec::with_capacity(credentials.len());
        for credential in credentials {
            match self.get_client(credential.id).await {
                Ok(client) => clients.push(client),
                Err(e) => warn!(
                    credential_id = credential.id,
                    "Skipping unusable credential: {}", e
                ),
            }
        }
        Ok(clients)
    }

    /// Plan clients, else the environment default, else nothing
    pub async fn get_clients_for_user(&self, user_id: i64) -> Result<Vec<Arc<UpstreamClient>>> {
        let clients = self.plan_clients_for_user(user_id).await?;
        if !clients.is_empty() {
            return Ok(clients);
        }
        Ok(self.default_client.clone().into_iter().collect())
    }

    /// Whether the provider has at least one active credential that decrypts.
    /// M3U providers need none.
    pub async fn provider_has_usable_credential(&self, provider_id: i64) -> Result<bool> {
        let provider = match self.store.get_provider(provider_id).await? {
            Some(p) => p,
            None => return Ok(false),
        };
        if provider.kind == ProtocolKind::M3u {
            return Ok(true);
        }

        for credential in self.store.active_credentials_for_provider(provider_id).await? {
            if self.get_client(credential.id).await.is_ok() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Drop and rebuild after an admin edit. Returns `None` when the
    /// credential is now inactive.
    pub async fn reload_credential(&self, credential_id: i64) -> Result<Option<Arc<UpstreamClient>>> {
        self.drop_client(credential_id).await;
        self.user_catalogs.invalidate_all().await;

        match self.get_client(credential_id).await {
            Ok(client) => {
                info!(credential_id, "Credential reloaded");
                Ok(Some(client))
            }
            Err(AppError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn remove_credential(&self, credential_id: i64) {
        self.drop_client(credential_id).await;
        self.user_catalogs.invalidate_all().await;
        info!(credential_id, "Credential removed from pool");
    }

    /// Drop every client of a provider (its URL or status changed)
    pub async fn invalidate_provider(&self, provider_id: i64) {
        let ids: Vec<i64> = self
            .clients
            .iter()
            .filter(|entry| entry.value().provider_id() == Some(provider_id))
            .map(|entry| *entry.key())
            .collect();
        for id in ids {
            self.drop_client(id).await;
        }
        self.user_catalogs.invalidate_all().await;
    }

    async fn drop_client(&self, credential_id: i64) {
        self.clients.remove(&credential_id);
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.remove(credential_id).await {
                warn!(credential_id, "Failed to remove catalog snapshot: {}", e);
            }
        }
    }

    /// Construct clients for every active credential at startup
    pub async fn warm(&self) -> Result<usize> {
        let mut built = 0;
        for credential in self.store.list_credentials(None).await? {
            if !credential.is_active {
                continue;
            }
            match self.get_client(credential.id).await {
                Ok(_) => built += 1,
                Err(e) => warn!(
                    credential_id = credential.id,
                    "Failed to construct client: {}", e
                ),
            }
        }
        info!("Credential pool warmed with {} clients", built);
        Ok(built)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{codec, FakeRegistry};
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::services::upstream::testing::FakeApi;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: FakeRegistry,
        pool: CredentialPool,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = FakeRegistry::default();
        let pool = CredentialPool::new(
            store.clone(),
            codec(),
            registry.factory(),
            Arc::new(UserCatalogCache::new(Duration::from_secs(1800))),
        );
        Fixture {
            store,
            registry,
            pool,
        }
    }

    fn add_provider(fx: &Fixture, name: &str) -> i64 {
        let url = codec().encrypt("http://panel.example.com").unwrap();
        fx.store.add_provider(name, ProtocolKind::Xtream, &url)
    }

    fn add_credential(fx: &Fixture, provider_id: i64, user: &str, max: i32) -> i64 {
        let c = codec();
        fx.store.add_credential(
            Some(provider_id),
            &c.encrypt(user).unwrap(),
            &c.encrypt("pw").unwrap(),
            max,
        )
    }

    #[tokio::test]
    async fn test_get_client_is_lazy_and_shared() {
        let fx = fixture();
        let provider = add_provider(&fx, "A");
        let cred = add_credential(&fx, provider, "alice", 2);

        assert_eq!(fx.pool.len(), 0);
        let first = fx.pool.get_client(cred).await.unwrap();
        let second = fx.pool.get_client(cred).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.credential_id(), Some(cred));
        assert_eq!(
            first.get_hls_stream_url("5"),
            "http://panel.example.com/live/alice/pw/5.m3u8"
        );
    }

    #[tokio::test]
    async fn test_get_client_rejects_inactive_and_missing() {
        let fx = fixture();
        let provider = add_provider(&fx, "A");
        let cred = add_credential(&fx, provider, "alice", 2);
        fx.store.set_credential_active(cred, false);

        assert!(matches!(fx.pool.get_client(cred).await, Err(AppError::NotFound(_))));
        assert!(matches!(fx.pool.get_client(999).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_clients_for_user_follow_plan_priority() {
        let fx = fixture();
        let provider = add_provider(&fx, "A");
        let low = add_credential(&fx, provider, "low", 1);
        let high = add_credential(&fx, provider, "high", 1);
        let plan = fx.store.add_plan();
        fx.store.add_credential_to_plan(plan, low, 2);
        fx.store.add_credential_to_plan(plan, high, 1);
        fx.store.subscribe(42, plan);

        let clients = fx.pool.get_clients_for_user(42).await.unwrap();
        let ids: Vec<_> = clients.iter().map(|c| c.credential_id()).collect();
        assert_eq!(ids, vec![Some(high), Some(low)]);
    }

    #[tokio::test]
    async fn test_clients_for_user_fall_back_to_default() {
        let fx = fixture();
        assert!(fx.pool.get_clients_for_user(1).await.unwrap().is_empty());

        let pool = fx
            .pool
            .with_default_credential("http://default.example.com", "env", "envpw")
            .unwrap();
        let clients = pool.get_clients_for_user(1).await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].credential_id(), None);
    }

    #[tokio::test]
    async fn test_undecryptable_credential_is_skipped() {
        let fx = fixture();
        let provider = add_provider(&fx, "A");
        let broken = fx
            .store
            .add_credential(Some(provider), "not-base64", "nope", 1);
        let good = add_credential(&fx, provider, "alice", 1);
        let plan = fx.store.add_plan();
        fx.store.add_credential_to_plan(plan, broken, 1);
        fx.store.add_credential_to_plan(plan, good, 2);
        fx.store.subscribe(7, plan);

        let clients = fx.pool.plan_clients_for_user(7).await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].credential_id(), Some(good));
    }

    #[tokio::test]
    async fn test_provider_usable_credential() {
        let fx = fixture();
        let xtream = add_provider(&fx, "A");
        let empty = add_provider(&fx, "B");
        let m3u = fx.store.add_provider("C", ProtocolKind::M3u, "unused");
        add_credential(&fx, xtream, "alice", 1);

        assert!(fx.pool.provider_has_usable_credential(xtream).await.unwrap());
        assert!(!fx.pool.provider_has_usable_credential(empty).await.unwrap());
        assert!(fx.pool.provider_has_usable_credential(m3u).await.unwrap());
        assert!(!fx.pool.provider_has_usable_credential(999).await.unwrap());
    }

    #[tokio::test]
    async fn test_reload_and_remove_rebuild_clients() {
        let fx = fixture();
        let provider = add_provider(&fx, "A");
        let cred = add_credential(&fx, provider, "alice", 1);
        fx.registry
            .register("alice", FakeApi::with_channels(&[("1", "HBO")]));

        let before = fx.pool.get_client(cred).await.unwrap();
        let after = fx.pool.reload_credential(cred).await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));

        fx.store.set_credential_active(cred, false);
        assert!(fx.pool.reload_credential(cred).await.unwrap().is_none());

        fx.store.set_credential_active(cred, true);
        fx.pool.get_client(cred).await.unwrap();
        fx.pool.remove_credential(cred).await;
        assert_eq!(fx.pool.len(), 0);
    }

    #[tokio::test]
    async fn test_warm_builds_active_credentials() {
        let fx = fixture();
        let provider = add_provider(&fx, "A");
        add_credential(&fx, provider, "a", 1);
        let off = add_credential(&fx, provider, "b", 1);
        fx.store.set_credential_active(off, false);

        assert_eq!(fx.pool.warm().await.unwrap(), 1);
        assert_eq!(fx.pool.len(), 1);
    }
}
