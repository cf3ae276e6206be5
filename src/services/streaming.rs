//! Stream start orchestration
//!
//! admission -> failover (test mode, unhealthy primary, no capacity) ->
//! playback decision. Unleased playback (environment default credential,
//! saturated backup) gets an in-memory ticket so the proxy can still serve it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::Store;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{Channel, HealthStatus};
use crate::services::admission::{Admission, AdmissionController};
use crate::services::failover::FailoverEngine;
use crate::services::playback::{
    transcode_url, DecideOptions, PlaybackDecision, PlaybackMode, PlaybackSelector, PlaybackUrls,
};
use crate::services::pool::CredentialPool;
use crate::services::upstream::UpstreamClient;

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub ip_address: Option<String>,
    pub forced_mode: Option<PlaybackMode>,
    pub native_codec_support: bool,
    pub skip_probe: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverInfo {
    pub primary_stream_id: String,
    pub backup_channel_id: i64,
    pub backup_stream_id: String,
    pub provider_name: String,
    pub reason: String,
    pub test_mode: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub session_token: String,
    /// Stream actually served (the backup's id after a failover)
    pub stream_id: String,
    pub credential_id: Option<i64>,
    /// Counted against the credential's capacity
    pub leased: bool,
    pub overflow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failover: Option<FailoverInfo>,
    pub playback: PlaybackDecision,
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(StreamStart),
    NoCapacity,
}

/// Unleased playback handle
#[derive(Debug, Clone)]
struct Ticket {
    /// `None` for the environment default credential
    credential_id: Option<i64>,
    stream_id: String,
    last_seen: Instant,
}

/// Where a start landed before the playback decision
struct Placement {
    token: String,
    stream_id: String,
    credential_id: Option<i64>,
    leased: bool,
    overflow: bool,
    failover: Option<FailoverInfo>,
}

pub struct StreamingService {
    pool: Arc<CredentialPool>,
    admission: Arc<AdmissionController>,
    failover: Arc<FailoverEngine>,
    playback: Arc<PlaybackSelector>,
    public_base_url: String,
    media_base_url: Option<String>,
    tickets: DashMap<String, Ticket>,
}

impl StreamingService {
    pub fn new(
        pool: Arc<CredentialPool>,
        admission: Arc<AdmissionController>,
        failover: Arc<FailoverEngine>,
        playback: Arc<PlaybackSelector>,
        public_base_url: &str,
        media_base_url: Option<String>,
    ) -> Self {
        Self {
            pool,
            admission,
            failover,
            playback,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            media_base_url,
            tickets: DashMap::new(),
        }
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.pool.store()
    }

    pub async fn start_stream(
        &self,
        user_id: i64,
        stream_id: &str,
        opts: &StartOptions,
    ) -> Result<StartOutcome> {
        // Restarting a stream the user already holds keeps the lease
        if let Some(existing) = self.admission.held_session(user_id, stream_id).await? {
            let placement = Placement {
                token: existing.session_token,
                stream_id: existing.stream_id,
                credential_id: Some(existing.credential_id),
                leased: true,
                overflow: false,
                failover: None,
            };
            return Ok(StartOutcome::Started(self.finish(placement, opts).await?));
        }

        let primary = self.primary_channel_for(user_id, stream_id).await?;

        if let Some(primary) = &primary {
            if self.failover.is_test_mode(stream_id) {
                if let Some(placement) = self.place_on_backup(user_id, primary, opts, "test_mode").await? {
                    return Ok(StartOutcome::Started(self.finish(placement, opts).await?));
                }
            }

            if self.provider_health(primary.provider_id).await? == HealthStatus::Unhealthy {
                if let Some(placement) = self.place_on_backup(user_id, primary, opts, "unhealthy").await? {
                    return Ok(StartOutcome::Started(self.finish(placement, opts).await?));
                }
            }
        }

        let placement = match self
            .admission
            .acquire(user_id, stream_id, opts.ip_address.clone())
            .await?
        {
            Admission::Leased(session) => Placement {
                token: session.session_token,
                stream_id: session.stream_id,
                credential_id: Some(session.credential_id),
                leased: true,
                overflow: false,
                failover: None,
            },
            Admission::Default => self.ticket(None, stream_id, false),
            Admission::Overflow(credential_id) => self.ticket(Some(credential_id), stream_id, true),
            Admission::NoCapacity => {
                let backup = match &primary {
                    Some(primary) => {
                        self.place_on_backup(user_id, primary, opts, "no_capacity")
                            .await?
                    }
                    None => None,
                };
                match backup {
                    Some(placement) => placement,
                    None => {
                        info!(user_id, stream_id, "No capacity and no usable backup");
                        return Ok(StartOutcome::NoCapacity);
                    }
                }
            }
        };

        Ok(StartOutcome::Started(self.finish(placement, opts).await?))
    }

    /// The channel the user is entitled to under `stream_id`: a package
    /// channel, else the catalog row of a plan credential that carries the
    /// stream. `None` when the user cannot see it, so no failover applies.
    async fn primary_channel_for(&self, user_id: i64, stream_id: &str) -> Result<Option<Channel>> {
        let from_package = self
            .store()
            .package_channels_for_user(user_id)
            .await?
            .into_iter()
            .find(|c| c.stream_id == stream_id);
        if from_package.is_some() {
            return Ok(from_package);
        }

        let candidates = self.store().channels_by_stream_id(stream_id).await?;
        if candidates.is_empty() {
            return Ok(None);
        }
        for credential in self.store().plan_credentials_for_user(user_id).await? {
            let channel = match credential
                .provider_id
                .and_then(|p| candidates.iter().find(|c| c.provider_id == p))
            {
                Some(c) => c,
                None => continue,
            };
            let client = match self.pool.get_client(credential.id).await {
                Ok(c) => c,
                Err(e) => {
                    debug!(credential_id = credential.id, "Skipping credential: {}", e);
                    continue;
                }
            };
            if client.has_stream(stream_id).await {
                return Ok(Some(channel.clone()));
            }
        }
        Ok(None)
    }

    async fn provider_health(&self, provider_id: i64) -> Result<HealthStatus> {
        Ok(self
            .store()
            .get_provider(provider_id)
            .await?
            .map(|p| p.health_status)
            .unwrap_or_default())
    }

    async fn place_on_backup(
        &self,
        user_id: i64,
        primary: &Channel,
        opts: &StartOptions,
        trigger: &str,
    ) -> Result<Option<Placement>> {
        let decision = self.failover.resolve_failover(primary).await?;
        let selected = match decision.selected {
            Some(s) => s,
            None => {
                warn!(
                    stream_id = %primary.stream_id,
                    trigger,
                    "Failover wanted but {}", decision.reason
                );
                return Ok(None);
            }
        };
        let backup = match self.store().get_channel(selected.channel_id).await? {
            Some(c) => c,
            None => return Ok(None),
        };

        let mut placement = match self
            .admission
            .acquire_backup(user_id, &backup, opts.ip_address.clone())
            .await?
        {
            Admission::Leased(session) => Placement {
                token: session.session_token,
                stream_id: session.stream_id,
                credential_id: Some(session.credential_id),
                leased: true,
                overflow: false,
                failover: None,
            },
            Admission::Overflow(credential_id) => {
                self.ticket(Some(credential_id), &backup.stream_id, true)
            }
            Admission::Default | Admission::NoCapacity => return Ok(None),
        };

        metrics::FAILOVERS.with_label_values(&[trigger]).inc();
        info!(
            user_id,
            primary_stream_id = %primary.stream_id,
            backup_stream_id = %backup.stream_id,
            trigger,
            "Failover to backup channel"
        );

        placement.failover = Some(FailoverInfo {
            primary_stream_id: primary.stream_id.clone(),
            backup_channel_id: backup.id,
            backup_stream_id: backup.stream_id.clone(),
            provider_name: selected.provider_name,
            reason: decision.reason,
            test_mode: trigger == "test_mode",
        });
        Ok(Some(placement))
    }

    fn ticket(&self, credential_id: Option<i64>, stream_id: &str, overflow: bool) -> Placement {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.tickets.insert(
            token.clone(),
            Ticket {
                credential_id,
                stream_id: stream_id.to_string(),
                last_seen: Instant::now(),
            },
        );
        Placement {
            token,
            stream_id: stream_id.to_string(),
            credential_id,
            leased: false,
            overflow,
            failover: None,
        }
    }

    async fn finish(&self, placement: Placement, opts: &StartOptions) -> Result<StreamStart> {
        let client = self.client_for(placement.credential_id).await?;
        let proxy = format!(
            "{}/api/proxy/session/{}",
            self.public_base_url, placement.token
        );
        let urls = PlaybackUrls {
            direct: client.get_stream_url(&placement.stream_id, "ts"),
            transcode: self.media_base_url.as_deref().map(|m| transcode_url(m, &proxy)),
            proxy,
        };
        let decide_opts = DecideOptions {
            skip_probe: opts.skip_probe,
            forced_mode: opts.forced_mode,
            is_iptv_stream: true,
            native_codec_support: opts.native_codec_support,
        };
        let playback = self.playback.select(&urls, &decide_opts).await;

        Ok(StreamStart {
            session_token: placement.token,
            stream_id: placement.stream_id,
            credential_id: placement.credential_id,
            leased: placement.leased,
            overflow: placement.overflow,
            failover: placement.failover,
            playback,
        })
    }

    async fn client_for(&self, credential_id: Option<i64>) -> Result<Arc<UpstreamClient>> {
        match credential_id {
            Some(id) => self.pool.get_client(id).await,
            None => self
                .pool
                .default_client()
                .ok_or_else(|| AppError::Internal("No default credential configured".to_string())),
        }
    }

    // ========================================================================
    // Session handles
    // ========================================================================

    /// Upstream URL behind a session token. Internal only: it carries secrets.
    pub async fn upstream_url_for_token(&self, token: &str) -> Result<String> {
        if let Some(session) = self.admission.session_by_token(token).await? {
            if !session.is_fresh(self.admission.cutoff()) {
                return Err(AppError::NotFound("Session expired".to_string()));
            }
            let client = self.pool.get_client(session.credential_id).await?;
            return Ok(client.get_stream_url(&session.stream_id, "ts"));
        }

        let ticket = self
            .tickets
            .get(token)
            .map(|t| t.clone())
            .ok_or_else(|| AppError::NotFound("Unknown session".to_string()))?;
        let client = self.client_for(ticket.credential_id).await?;
        Ok(client.get_stream_url(&ticket.stream_id, "ts"))
    }

    pub async fn heartbeat(&self, token: &str) -> Result<bool> {
        if self.admission.heartbeat(token).await? {
            return Ok(true);
        }
        Ok(match self.tickets.get_mut(token) {
            Some(mut ticket) => {
                ticket.last_seen = Instant::now();
                true
            }
            None => false,
        })
    }

    pub async fn release(&self, token: &str) -> Result<bool> {
        if self.admission.release(token).await? {
            return Ok(true);
        }
        Ok(self.tickets.remove(token).is_some())
    }

    /// Drop tickets not heard from within `stale_after`
    pub fn sweep_tickets(&self, stale_after: Duration) -> usize {
        let before = self.tickets.len();
        self.tickets.retain(|_, t| t.last_seen.elapsed() < stale_after);
        before - self.tickets.len()
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.len()
    }
}
