//! Persistence seam used by the services
//!
//! `PgStore` implements it on top of the sqlx repositories; tests use the
//! in-memory store in `db::memory`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::repository::{channels, credentials, mappings, providers, sessions, subscriptions};
use crate::error::Result;
use crate::models::{
    ActiveStreamSession, Channel, ChannelMapping, Credential, HealthStatus, NewChannel,
    NewCredential, NewProvider, NewSession, Provider,
};

#[async_trait]
pub trait Store: Send + Sync {
    // Providers
    async fn get_provider(&self, id: i64) -> Result<Option<Provider>>;
    async fn list_providers(&self) -> Result<Vec<Provider>>;
    async fn create_provider(&self, provider: &NewProvider) -> Result<Provider>;
    async fn update_provider(&self, id: i64, provider: &NewProvider) -> Result<Option<Provider>>;
    async fn delete_provider(&self, id: i64) -> Result<bool>;
    async fn set_provider_health(
        &self,
        id: i64,
        status: HealthStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<()>;

    // Credentials
    async fn get_credential(&self, id: i64) -> Result<Option<Credential>>;
    async fn list_credentials(&self, provider_id: Option<i64>) -> Result<Vec<Credential>>;
    /// Active credentials of a provider, in insertion order
    async fn active_credentials_for_provider(&self, provider_id: i64) -> Result<Vec<Credential>>;
    async fn create_credential(&self, credential: &NewCredential) -> Result<Credential>;
    async fn update_credential(
        &self,
        id: i64,
        credential: &NewCredential,
    ) -> Result<Option<Credential>>;
    async fn delete_credential(&self, id: i64) -> Result<bool>;
    async fn set_credential_health(&self, id: i64, status: HealthStatus) -> Result<()>;

    // Subscriptions
    /// Active credentials of the user's active plans, by assignment priority
    async fn plan_credentials_for_user(&self, user_id: i64) -> Result<Vec<Credential>>;
    /// Enabled channels of active packages on the user's plans, in join order
    async fn package_channels_for_user(&self, user_id: i64) -> Result<Vec<Channel>>;

    // Channels
    async fn get_channel(&self, id: i64) -> Result<Option<Channel>>;
    async fn channels_for_provider(&self, provider_id: i64) -> Result<Vec<Channel>>;
    async fn channels_by_stream_id(&self, stream_id: &str) -> Result<Vec<Channel>>;
    async fn upsert_channels(&self, provider_id: i64, channels: &[NewChannel]) -> Result<usize>;

    // Mappings
    async fn get_mapping(&self, id: i64) -> Result<Option<ChannelMapping>>;
    /// Mappings of a primary channel ordered by priority, then insertion
    async fn mappings_for_primary(&self, primary_channel_id: i64) -> Result<Vec<ChannelMapping>>;
    async fn list_mappings(&self) -> Result<Vec<ChannelMapping>>;
    /// Fails with `AlreadyExists` when the edge is already present
    async fn insert_mapping(
        &self,
        primary_channel_id: i64,
        backup_channel_id: i64,
        priority: i32,
    ) -> Result<ChannelMapping>;
    async fn update_mapping(
        &self,
        id: i64,
        priority: Option<i32>,
        is_active: Option<bool>,
    ) -> Result<Option<ChannelMapping>>;
    async fn delete_mapping(&self, id: i64) -> Result<bool>;

    // Sessions
    async fn find_session(&self, user_id: i64, stream_id: &str)
        -> Result<Option<ActiveStreamSession>>;
    async fn find_session_by_token(&self, token: &str) -> Result<Option<ActiveStreamSession>>;
    /// Sessions on the credential with a heartbeat at or after `cutoff`
    async fn count_active_sessions(&self, credential_id: i64, cutoff: DateTime<Utc>)
        -> Result<i64>;
    /// Insert a lease unless the credential already holds `max_connections`
    /// fresh sessions (`Ok(None)`). A duplicate `(user, stream)` fails with
    /// `AlreadyExists`.
    async fn insert_session_if_below(
        &self,
        session: &NewSession,
        max_connections: i32,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<ActiveStreamSession>>;
    /// Refresh the heartbeat of a session that is still fresh at `cutoff`.
    /// A stale session is not revived and yields `false`.
    async fn touch_session(&self, token: &str, at: DateTime<Utc>, cutoff: DateTime<Utc>)
        -> Result<bool>;
    async fn delete_session(&self, token: &str) -> Result<bool>;
    async fn sessions_for_credential(&self, credential_id: i64)
        -> Result<Vec<ActiveStreamSession>>;
    async fn delete_stale_sessions(&self, cutoff: DateTime<Utc>)
        -> Result<Vec<ActiveStreamSession>>;
    async fn delete_sessions_for_credential(&self, credential_id: i64) -> Result<u64>;
}

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn into_vec<R, M: From<R>>(rows: Vec<R>) -> Vec<M> {
    rows.into_iter().map(Into::into).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn get_provider(&self, id: i64) -> Result<Option<Provider>> {
        Ok(providers::find_by_id(&self.pool, id).await?.map(Into::into))
    }

    async fn list_providers(&self) -> Result<Vec<Provider>> {
        Ok(into_vec(providers::list_all(&self.pool).await?))
    }

    async fn create_provider(&self, provider: &NewProvider) -> Result<Provider> {
        Ok(providers::insert(&self.pool, provider).await?.into())
    }

    async fn update_provider(&self, id: i64, provider: &NewProvider) -> Result<Option<Provider>> {
        Ok(providers::update(&self.pool, id, provider).await?.map(Into::into))
    }

    async fn delete_provider(&self, id: i64) -> Result<bool> {
        Ok(providers::delete(&self.pool, id).await? > 0)
    }

    async fn set_provider_health(
        &self,
        id: i64,
        status: HealthStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        providers::set_health(&self.pool, id, status, checked_at).await?;
        Ok(())
    }

    async fn get_credential(&self, id: i64) -> Result<Option<Credential>> {
        Ok(credentials::find_by_id(&self.pool, id).await?.map(Into::into))
    }

    async fn list_credentials(&self, provider_id: Option<i64>) -> Result<Vec<Credential>> {
        Ok(into_vec(credentials::list(&self.pool, provider_id).await?))
    }

    async fn active_credentials_for_provider(&self, provider_id: i64) -> Result<Vec<Credential>> {
        Ok(into_vec(
            credentials::active_for_provider(&self.pool, provider_id).await?,
        ))
    }

    async fn create_credential(&self, credential: &NewCredential) -> Result<Credential> {
        Ok(credentials::insert(&self.pool, credential).await?.into())
    }

    async fn update_credential(
        &self,
        id: i64,
        credential: &NewCredential,
    ) -> Result<Option<Credential>> {
        Ok(credentials::update(&self.pool, id, credential)
            .await?
            .map(Into::into))
    }

    async fn delete_credential(&self, id: i64) -> Result<bool> {
        Ok(credentials::delete(&self.pool, id).await? > 0)
    }

    async fn set_credential_health(&self, id: i64, status: HealthStatus) -> Result<()> {
        credentials::set_health(&self.pool, id, status).await?;
        Ok(())
    }

    async fn plan_credentials_for_user(&self, user_id: i64) -> Result<Vec<Credential>> {
        Ok(into_vec(
            subscriptions::plan_credentials_for_user(&self.pool, user_id).await?,
        ))
    }

    async fn package_channels_for_user(&self, user_id: i64) -> Result<Vec<Channel>> {
        Ok(into_vec(
            subscriptions::package_channels_for_user(&self.pool, user_id).await?,
        ))
    }

    async fn get_channel(&self, id: i64) -> Result<Option<Channel>> {
        Ok(channels::find_by_id(&self.pool, id).await?.map(Into::into))
    }

    async fn channels_for_provider(&self, provider_id: i64) -> Result<Vec<Channel>> {
        Ok(into_vec(channels::get_by_provider(&self.pool, provider_id).await?))
    }

    async fn channels_by_stream_id(&self, stream_id: &str) -> Result<Vec<Channel>> {
        Ok(into_vec(channels::find_by_stream_id(&self.pool, stream_id).await?))
    }

    async fn upsert_channels(&self, provider_id: i64, new_channels: &[NewChannel]) -> Result<usize> {
        Ok(channels::upsert_many(&self.pool, provider_id, new_channels).await?)
    }

    async fn get_mapping(&self, id: i64) -> Result<Option<ChannelMapping>> {
        Ok(mappings::find_by_id(&self.pool, id).await?.map(Into::into))
    }

    async fn mappings_for_primary(&self, primary_channel_id: i64) -> Result<Vec<ChannelMapping>> {
        Ok(into_vec(
            mappings::get_by_primary(&self.pool, primary_channel_id).await?,
        ))
    }

    async fn list_mappings(&self) -> Result<Vec<ChannelMapping>> {
        Ok(into_vec(mappings::list_all(&self.pool).await?))
    }

    async fn insert_mapping(
        &self,
        primary_channel_id: i64,
        backup_channel_id: i64,
        priority: i32,
    ) -> Result<ChannelMapping> {
        Ok(
            mappings::insert(&self.pool, primary_channel_id, backup_channel_id, priority)
                .await?
                .into(),
        )
    }

    async fn update_mapping(
        &self,
        id: i64,
        priority: Option<i32>,
        is_active: Option<bool>,
    ) -> Result<Option<ChannelMapping>> {
        Ok(mappings::update(&self.pool, id, priority, is_active)
            .await?
            .map(Into::into))
    }

    async fn delete_mapping(&self, id: i64) -> Result<bool> {
        Ok(mappings::delete(&self.pool, id).await? > 0)
    }

    async fn find_session(
        &self,
        user_id: i64,
        stream_id: &str,
    ) -> Result<Option<ActiveStreamSession>> {
        Ok(sessions::find_by_user_stream(&self.pool, user_id, stream_id)
            .await?
            .map(Into::into))
    }

    async fn find_session_by_token(&self, token: &str) -> Result<Option<ActiveStreamSession>> {
        Ok(sessions::find_by_token(&self.pool, token).await?.map(Into::into))
    }

    async fn count_active_sessions(
        &self,
        credential_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(sessions::count_fresh_for_credential(&self.pool, credential_id, cutoff).await?)
    }

    async fn insert_session_if_below(
        &self,
        session: &NewSession,
        max_connections: i32,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<ActiveStreamSession>> {
        Ok(
            sessions::insert_if_below_capacity(&self.pool, session, max_connections, cutoff)
                .await?
                .map(Into::into),
        )
    }

    async fn touch_session(
        &self,
        token: &str,
        at: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(sessions::touch(&self.pool, token, at, cutoff).await? > 0)
    }

    async fn delete_session(&self, token: &str) -> Result<bool> {
        Ok(sessions::delete_by_token(&self.pool, token).await? > 0)
    }

    async fn sessions_for_credential(
        &self,
        credential_id: i64,
    ) -> Result<Vec<ActiveStreamSession>> {
        Ok(into_vec(
            sessions::get_by_credential(&self.pool, credential_id).await?,
        ))
    }

    async fn delete_stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ActiveStreamSession>> {
        Ok(into_vec(sessions::delete_stale(&self.pool, cutoff).await?))
    }

    async fn delete_sessions_for_credential(&self, credential_id: i64) -> Result<u64> {
        Ok(sessions::delete_by_credential(&self.pool, credential_id).await?)
    }
}
