//! In-memory `Store` for tests
//!
//! The capacity check and the insert in `insert_session_if_below` are two
//! separate critical sections with a yield in between, so tests exercise the
//! admission controller's own serialization rather than the store's.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::store::Store;
use crate::error::{AppError, Result};
use crate::models::{
    ActiveStreamSession, Channel, ChannelMapping, Credential, HealthStatus, NewChannel,
    NewCredential, NewProvider, NewSession, ProtocolKind, Provider,
};

#[derive(Default)]
struct State {
    next_id: i64,
    providers: Vec<Provider>,
    credentials: Vec<Credential>,
    channels: Vec<Channel>,
    /// (id, is_active)
    packages: Vec<(i64, bool)>,
    /// (package_id, channel_id)
    package_channels: Vec<(i64, i64)>,
    /// (id, is_active)
    plans: Vec<(i64, bool)>,
    /// (plan_id, package_id)
    plan_packages: Vec<(i64, i64)>,
    /// (plan_id, credential_id, priority)
    plan_credentials: Vec<(i64, i64, i32)>,
    /// (user_id, plan_id, is_active)
    subscriptions: Vec<(i64, i64, bool)>,
    mappings: Vec<ChannelMapping>,
    sessions: Vec<ActiveStreamSession>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn active_plans_of(&self, user_id: i64) -> Vec<i64> {
        self.subscriptions
            .iter()
            .filter(|(uid, _, active)| *uid == user_id && *active)
            .map(|(_, plan_id, _)| *plan_id)
            .filter(|plan_id| self.plans.iter().any(|(id, active)| id == plan_id && *active))
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ============ Seeding helpers ============

    pub fn add_provider(&self, name: &str, kind: ProtocolKind, base_url: &str) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.providers.push(Provider {
            id,
            name: name.to_string(),
            kind,
            base_url: base_url.to_string(),
            is_active: true,
            health_status: HealthStatus::Unknown,
            last_health_check: None,
        });
        id
    }

    pub fn add_credential(
        &self,
        provider_id: Option<i64>,
        username: &str,
        password: &str,
        max_connections: i32,
    ) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.credentials.push(Credential {
            id,
            provider_id,
            server_url: None,
            username: username.to_string(),
            password: password.to_string(),
            max_connections,
            is_active: true,
            health_status: HealthStatus::Unknown,
        });
        id
    }

    pub fn add_channel(&self, provider_id: i64, stream_id: &str, name: &str) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.channels.push(Channel {
            id,
            provider_id,
            stream_id: stream_id.to_string(),
            name: name.to_string(),
            logo: None,
            category_id: None,
            category_name: None,
            epg_channel_id: None,
            is_enabled: true,
        });
        id
    }

    pub fn set_channel_enabled(&self, channel_id: i64, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(ch) = state.channels.iter_mut().find(|c| c.id == channel_id) {
            ch.is_enabled = enabled;
        }
    }

    pub fn set_provider_active(&self, provider_id: i64, active: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(p) = state.providers.iter_mut().find(|p| p.id == provider_id) {
            p.is_active = active;
        }
    }

    pub fn set_credential_active(&self, credential_id: i64, active: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.credentials.iter_mut().find(|c| c.id == credential_id) {
            c.is_active = active;
        }
    }

    pub fn add_package(&self, is_active: bool) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.packages.push((id, is_active));
        id
    }

    pub fn add_channel_to_package(&self, package_id: i64, channel_id: i64) {
        let mut state = self.state.lock().unwrap();
        state.package_channels.push((package_id, channel_id));
    }

    pub fn add_plan(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.plans.push((id, true));
        id
    }

    pub fn add_package_to_plan(&self, plan_id: i64, package_id: i64) {
        let mut state = self.state.lock().unwrap();
        state.plan_packages.push((plan_id, package_id));
    }

    pub fn add_credential_to_plan(&self, plan_id: i64, credential_id: i64, priority: i32) {
        let mut state = self.state.lock().unwrap();
        state.plan_credentials.push((plan_id, credential_id, priority));
    }

    pub fn subscribe(&self, user_id: i64, plan_id: i64) {
        let mut state = self.state.lock().unwrap();
        state.subscriptions.push((user_id, plan_id, true));
    }

    /// Backdate a session's heartbeat
    pub fn set_heartbeat(&self, token: &str, at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.sessions.iter_mut().find(|s| s.session_token == token) {
            s.last_heartbeat = at;
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_provider(&self, id: i64) -> Result<Option<Provider>> {
        let state = self.state.lock().unwrap();
        Ok(state.providers.iter().find(|p| p.id == id).cloned())
    }

    async fn list_providers(&self) -> Result<Vec<Provider>> {
        Ok(self.state.lock().unwrap().providers.clone())
    }

    async fn create_provider(&self, provider: &NewProvider) -> Result<Provider> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        let created = Provider {
            id,
            name: provider.name.clone(),
            kind: provider.kind,
            base_url: provider.base_url.clone(),
            is_active: provider.is_active,
            health_status: HealthStatus::Unknown,
            last_health_check: None,
        };
        state.providers.push(created.clone());
        Ok(created)
    }

    async fn update_provider(&self, id: i64, provider: &NewProvider) -> Result<Option<Provider>> {
        let mut state = self.state.lock().unwrap();
        Ok(state.providers.iter_mut().find(|p| p.id == id).map(|p| {
            p.name = provider.name.clone();
            p.kind = provider.kind;
            p.base_url = provider.base_url.clone();
            p.is_active = provider.is_active;
            p.clone()
        }))
    }

    async fn delete_provider(&self, id: i64) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let before = state.providers.len();
        state.providers.retain(|p| p.id != id);
        if state.providers.len() == before {
            return Ok(false);
        }
        // Cascade
        let removed_creds: Vec<i64> = state
            .credentials
            .iter()
            .filter(|c| c.provider_id == Some(id))
            .map(|c| c.id)
            .collect();
        let removed_channels: Vec<i64> = state
            .channels
            .iter()
            .filter(|c| c.provider_id == id)
            .map(|c| c.id)
            .collect();
        state.credentials.retain(|c| c.provider_id != Some(id));
        state.channels.retain(|c| c.provider_id != id);
        state
            .sessions
            .retain(|s| !removed_creds.contains(&s.credential_id));
        state.mappings.retain(|m| {
            !removed_channels.contains(&m.primary_channel_id)
                && !removed_channels.contains(&m.backup_channel_id)
        });
        Ok(true)
    }

    async fn set_provider_health(
        &self,
        id: i64,
        status: HealthStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(p) = state.providers.iter_mut().find(|p| p.id == id) {
            p.health_status = status;
            p.last_health_check = Some(checked_at);
        }
        Ok(())
    }

    async fn get_credential(&self, id: i64) -> Result<Option<Credential>> {
        let state = self.state.lock().unwrap();
        Ok(state.credentials.iter().find(|c| c.id == id).cloned())
    }

    async fn list_credentials(&self, provider_id: Option<i64>) -> Result<Vec<Credential>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .credentials
            .iter()
            .filter(|c| provider_id.is_none() || c.provider_id == provider_id)
            .cloned()
            .collect())
    }

    async fn active_credentials_for_provider(&self, provider_id: i64) -> Result<Vec<Credential>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .credentials
            .iter()
            .filter(|c| c.provider_id == Some(provider_id) && c.is_active)
            .cloned()
            .collect())
    }

    async fn create_credential(&self, credential: &NewCredential) -> Result<Credential> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        let created = Credential {
            id,
            provider_id: credential.provider_id,
            server_url: credential.server_url.clone(),
            username: credential.username.clone(),
            password: credential.password.clone(),
            max_connections: credential.max_connections,
            is_active: credential.is_active,
            health_status: HealthStatus::Unknown,
        };
        state.credentials.push(created.clone());
        Ok(created)
    }

    async fn update_credential(
        &self,
        id: i64,
        credential: &NewCredential,
    ) -> Result<Option<Credential>> {
        let mut state = self.state.lock().unwrap();
        Ok(state.credentials.iter_mut().find(|c| c.id == id).map(|c| {
            c.provider_id = credential.provider_id;
            c.server_url = credential.server_url.clone();
            c.username = credential.username.clone();
            c.password = credential.password.clone();
            c.max_connections = credential.max_connections;
            c.is_active = credential.is_active;
            c.clone()
        }))
    }

    async fn delete_credential(&self, id: i64) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let before = state.credentials.len();
        state.credentials.retain(|c| c.id != id);
        state.sessions.retain(|s| s.credential_id != id);
        state.plan_credentials.retain(|(_, cid, _)| *cid != id);
        Ok(state.credentials.len() != before)
    }

    async fn set_credential_health(&self, id: i64, status: HealthStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.credentials.iter_mut().find(|c| c.id == id) {
            c.health_status = status;
        }
        Ok(())
    }

    async fn plan_credentials_for_user(&self, user_id: i64) -> Result<Vec<Credential>> {
        let state = self.state.lock().unwrap();
        let plans = state.active_plans_of(user_id);
        let mut assigned: Vec<(i32, i64)> = state
            .plan_credentials
            .iter()
            .filter(|(plan_id, _, _)| plans.contains(plan_id))
            .map(|(_, cid, priority)| (*priority, *cid))
            .collect();
        assigned.sort();

        let mut result: Vec<Credential> = Vec::new();
        for (_, cid) in assigned {
            if result.iter().any(|c| c.id == cid) {
                continue;
            }
            if let Some(c) = state.credentials.iter().find(|c| c.id == cid && c.is_active) {
                result.push(c.clone());
            }
        }
        Ok(result)
    }

    async fn package_channels_for_user(&self, user_id: i64) -> Result<Vec<Channel>> {
        let state = self.state.lock().unwrap();
        let mut result = Vec::new();
        for plan_id in state.active_plans_of(user_id) {
            for (_, package_id) in state.plan_packages.iter().filter(|(p, _)| *p == plan_id) {
                let active = state
                    .packages
                    .iter()
                    .any(|(id, is_active)| id == package_id && *is_active);
                if !active {
                    continue;
                }
                for (_, channel_id) in state
                    .package_channels
                    .iter()
                    .filter(|(pkg, _)| pkg == package_id)
                {
                    if let Some(ch) = state
                        .channels
                        .iter()
                        .find(|c| c.id == *channel_id && c.is_enabled)
                    {
                        result.push(ch.clone());
                    }
                }
            }
        }
        Ok(result)
    }

    async fn get_channel(&self, id: i64) -> Result<Option<Channel>> {
        let state = self.state.lock().unwrap();
        Ok(state.channels.iter().find(|c| c.id == id).cloned())
    }

    async fn channels_for_provider(&self, provider_id: i64) -> Result<Vec<Channel>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .channels
            .iter()
            .filter(|c| c.provider_id == provider_id)
            .cloned()
            .collect())
    }

    async fn channels_by_stream_id(&self, stream_id: &str) -> Result<Vec<Channel>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .channels
            .iter()
            .filter(|c| c.stream_id == stream_id)
            .cloned()
            .collect())
    }

    async fn upsert_channels(&self, provider_id: i64, channels: &[NewChannel]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        for new in channels {
            let existing = state
                .channels
                .iter_mut()
                .find(|c| c.provider_id == provider_id && c.stream_id == new.stream_id);
            match existing {
                Some(ch) => {
                    ch.name = new.name.clone();
                    ch.logo = new.logo.clone();
                    ch.category_id = new.category_id.clone();
                    ch.category_name = new.category_name.clone();
                    ch.epg_channel_id = new.epg_channel_id.clone();
                }
                None => {
                    let id = state.next_id();
                    state.channels.push(Channel {
                        id,
                        provider_id,
                        stream_id: new.stream_id.clone(),
                        name: new.name.clone(),
                        logo: new.logo.clone(),
                        category_id: new.category_id.clone(),
                        category_name: new.category_name.clone(),
                        epg_channel_id: new.epg_channel_id.clone(),
                        is_enabled: true,
                    });
                }
            }
        }
        Ok(channels.len())
    }

    async fn get_mapping(&self, id: i64) -> Result<Option<ChannelMapping>> {
        let state = self.state.lock().unwrap();
        Ok(state.mappings.iter().find(|m| m.id == id).cloned())
    }

    async fn mappings_for_primary(&self, primary_channel_id: i64) -> Result<Vec<ChannelMapping>> {
        let state = self.state.lock().unwrap();
        let mut result: Vec<ChannelMapping> = state
            .mappings
            .iter()
            .filter(|m| m.primary_channel_id == primary_channel_id)
            .cloned()
            .collect();
        result.sort_by_key(|m| (m.priority, m.id));
        Ok(result)
    }

    async fn list_mappings(&self) -> Result<Vec<ChannelMapping>> {
        Ok(self.state.lock().unwrap().mappings.clone())
    }

    async fn insert_mapping(
        &self,
        primary_channel_id: i64,
        backup_channel_id: i64,
        priority: i32,
    ) -> Result<ChannelMapping> {
        let mut state = self.state.lock().unwrap();
        if state.mappings.iter().any(|m| {
            m.primary_channel_id == primary_channel_id && m.backup_channel_id == backup_channel_id
        }) {
            return Err(AppError::AlreadyExists("Mapping already exists".to_string()));
        }
        let id = state.next_id();
        let mapping = ChannelMapping {
            id,
            primary_channel_id,
            backup_channel_id,
            priority,
            is_active: true,
            created_at: Utc::now(),
        };
        state.mappings.push(mapping.clone());
        Ok(mapping)
    }

    async fn update_mapping(
        &self,
        id: i64,
        priority: Option<i32>,
        is_active: Option<bool>,
    ) -> Result<Option<ChannelMapping>> {
        let mut state = self.state.lock().unwrap();
        Ok(state.mappings.iter_mut().find(|m| m.id == id).map(|m| {
            if let Some(p) = priority {
                m.priority = p;
            }
            if let Some(a) = is_active {
                m.is_active = a;
            }
            m.clone()
        }))
    }

    async fn delete_mapping(&self, id: i64) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let before = state.mappings.len();
        state.mappings.retain(|m| m.id != id);
        Ok(state.mappings.len() != before)
    }

    async fn find_session(
        &self,
        user_id: i64,
        stream_id: &str,
    ) -> Result<Option<ActiveStreamSession>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .iter()
            .find(|s| s.user_id == user_id && s.stream_id == stream_id)
            .cloned())
    }

    async fn find_session_by_token(&self, token: &str) -> Result<Option<ActiveStreamSession>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .iter()
            .find(|s| s.session_token == token)
            .cloned())
    }

    async fn count_active_sessions(
        &self,
        credential_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .iter()
            .filter(|s| s.credential_id == credential_id && s.is_fresh(cutoff))
            .count() as i64)
    }

    async fn insert_session_if_below(
        &self,
        session: &NewSession,
        max_connections: i32,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<ActiveStreamSession>> {
        let count = self
            .count_active_sessions(session.credential_id, cutoff)
            .await?;
        if count >= i64::from(max_connections) {
            return Ok(None);
        }

        tokio::task::yield_now().await;

        let mut state = self.state.lock().unwrap();
        if state
            .sessions
            .iter()
            .any(|s| s.user_id == session.user_id && s.stream_id == session.stream_id)
        {
            return Err(AppError::AlreadyExists("Session already exists".to_string()));
        }
        let id = state.next_id();
        let now = Utc::now();
        let created = ActiveStreamSession {
            id,
            user_id: session.user_id,
            stream_id: session.stream_id.clone(),
            credential_id: session.credential_id,
            session_token: session.session_token.clone(),
            started_at: now,
            last_heartbeat: now,
            ip_address: session.ip_address.clone(),
        };
        state.sessions.push(created.clone());
        Ok(Some(created))
    }

    async fn touch_session(
        &self,
        token: &str,
        at: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state
            .sessions
            .iter_mut()
            .find(|s| s.session_token == token && s.is_fresh(cutoff))
        {
            Some(s) => {
                s.last_heartbeat = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_session(&self, token: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let before = state.sessions.len();
        state.sessions.retain(|s| s.session_token != token);
        Ok(state.sessions.len() != before)
    }

    async fn sessions_for_credential(
        &self,
        credential_id: i64,
    ) -> Result<Vec<ActiveStreamSession>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .iter()
            .filter(|s| s.credential_id == credential_id)
            .cloned()
            .collect())
    }

    async fn delete_stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ActiveStreamSession>> {
        let mut state = self.state.lock().unwrap();
        let (stale, fresh): (Vec<_>, Vec<_>) =
            state.sessions.drain(..).partition(|s| !s.is_fresh(cutoff));
        state.sessions = fresh;
        Ok(stale)
    }

    async fn delete_sessions_for_credential(&self, credential_id: i64) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let before = state.sessions.len();
        state.sessions.retain(|s| s.credential_id != credential_id);
        Ok((before - state.sessions.len()) as u64)
    }
}
