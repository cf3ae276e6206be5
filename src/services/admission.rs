//! Session Admission Controller
//!
//! Picks a credential with spare capacity for a stream and writes the lease.
//! Check and insert are serialized per credential in-process, and the insert
//! itself is conditional on the fresh-session count, so
//! `sessions(credential) <= max_connections` holds under concurrency.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::Store;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{ActiveStreamSession, Channel, Credential, NewSession};
use crate::services::pool::CredentialPool;

/// Attempts before giving up when a slot is taken between select and insert
const MAX_ATTEMPTS: usize = 3;

/// Outcome of choosing a credential for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSelection {
    Bound(i64),
    /// No plan credentials; play through the environment default
    UseDefault,
    NoCapacity,
}

/// Credential picked for a failover target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSelection {
    pub credential_id: i64,
    /// Every credential was saturated; this one is used best-effort
    pub overflow: bool,
}

/// Result of an admission attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Lease written, or the one the user already held
    Leased(ActiveStreamSession),
    /// Environment default credential, not capacity tracked
    Default,
    /// Saturated backup credential used without a lease
    Overflow(i64),
    NoCapacity,
}

impl Admission {
    pub fn outcome(&self) -> &'static str {
        match self {
            Admission::Leased(_) => "leased",
            Admission::Default => "default",
            Admission::Overflow(_) => "overflow",
            Admission::NoCapacity => "no_capacity",
        }
    }
}

pub struct AdmissionController {
    pool: Arc<CredentialPool>,
    stale_after: Duration,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl AdmissionController {
    pub fn new(pool: Arc<CredentialPool>, stale_after: Duration) -> Self {
        Self {
            pool,
            stale_after,
            locks: DashMap::new(),
        }
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.pool.store()
    }

    /// Sessions with a heartbeat before this instant no longer hold a slot
    pub fn cutoff(&self) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::milliseconds(self.stale_after.as_millis() as i64)
    }

    fn lock_for(&self, credential_id: i64) -> Arc<Mutex<()>> {
        self.locks.entry(credential_id).or_default().clone()
    }

    async fn has_capacity(&self, credential: &Credential) -> Result<bool> {
        let active = self
            .store()
            .count_active_sessions(credential.id, self.cutoff())
            .await?;
        Ok(active < i64::from(credential.max_connections))
    }

    // ========================================================================
    // Selection (read only)
    // ========================================================================

    pub async fn select_credential_for_stream(
        &self,
        user_id: i64,
        stream_id: &str,
    ) -> Result<CredentialSelection> {
        if let Some(existing) = self.store().find_session(user_id, stream_id).await? {
            if existing.is_fresh(self.cutoff()) {
                return Ok(CredentialSelection::Bound(existing.credential_id));
            }
        }

        // Package path: the channel's own provider serves it
        let package_channel = self
            .store()
            .package_channels_for_user(user_id)
            .await?
            .into_iter()
            .find(|c| c.stream_id == stream_id);
        if let Some(channel) = package_channel {
            for credential in self
                .store()
                .active_credentials_for_provider(channel.provider_id)
                .await?
            {
                if self.has_capacity(&credential).await? {
                    return Ok(CredentialSelection::Bound(credential.id));
                }
            }
            return Ok(CredentialSelection::NoCapacity);
        }

        // Legacy path: plan credentials whose catalog carries the stream
        let credentials = self.store().plan_credentials_for_user(user_id).await?;
        if credentials.is_empty() {
            return Ok(if self.pool.default_client().is_some() {
                CredentialSelection::UseDefault
            } else {
                CredentialSelection::NoCapacity
            });
        }

        for credential in credentials {
            let client = match self.pool.get_client(credential.id).await {
                Ok(c) => c,
                Err(e) => {
                    debug!(credential_id = credential.id, "Skipping credential: {}", e);
                    continue;
                }
            };
            if client.has_stream(stream_id).await && self.has_capacity(&credential).await? {
                return Ok(CredentialSelection::Bound(credential.id));
            }
        }
        Ok(CredentialSelection::NoCapacity)
    }

    /// Failover variant: the channel's provider is used directly, bypassing
    /// the user's plan. Saturation yields the first credential flagged
    /// `overflow`; `None` means the provider has no active credential.
    pub async fn select_credential_for_backup(
        &self,
        channel: &Channel,
    ) -> Result<Option<BackupSelection>> {
        let credentials = self
            .store()
            .active_credentials_for_provider(channel.provider_id)
            .await?;

        for credential in &credentials {
            if self.has_capacity(credential).await? {
                return Ok(Some(BackupSelection {
                    credential_id: credential.id,
                    overflow: false,
                }));
            }
        }

        Ok(credentials.first().map(|c| BackupSelection {
            credential_id: c.id,
            overflow: true,
        }))
    }

    /// `select_credential_for_backup` for the first enabled channel with this stream id
    pub async fn select_credential_for_backup_stream(
        &self,
        stream_id: &str,
    ) -> Result<Option<BackupSelection>> {
        let channel = self
            .store()
            .channels_by_stream_id(stream_id)
            .await?
            .into_iter()
            .find(|c| c.is_enabled);
        match channel {
            Some(channel) => self.select_credential_for_backup(&channel).await,
            None => Ok(None),
        }
    }

    // ========================================================================
    // Leasing
    // ========================================================================

    /// Select and lease in one step. Idempotent per `(user, stream)`.
    pub async fn acquire(
        &self,
        user_id: i64,
        stream_id: &str,
        ip_address: Option<String>,
    ) -> Result<Admission> {
        let admission = self.acquire_inner(user_id, stream_id, ip_address).await?;
        metrics::ADMISSIONS
            .with_label_values(&[admission.outcome()])
            .inc();
        Ok(admission)
    }

    async fn acquire_inner(
        &self,
        user_id: i64,
        stream_id: &str,
        ip_address: Option<String>,
    ) -> Result<Admission> {
        if let Some(existing) = self.held_session(user_id, stream_id).await? {
            return Ok(Admission::Leased(existing));
        }

        for _ in 0..MAX_ATTEMPTS {
            match self.select_credential_for_stream(user_id, stream_id).await? {
                CredentialSelection::Bound(credential_id) => {
                    if let Some(admission) = self
                        .try_lease(user_id, stream_id, credential_id, ip_address.clone())
                        .await?
                    {
                        return Ok(admission);
                    }
                }
                CredentialSelection::UseDefault => return Ok(Admission::Default),
                CredentialSelection::NoCapacity => return Ok(Admission::NoCapacity),
            }
        }

        warn!(user_id, stream_id, "Admission lost the race on every attempt");
        Ok(Admission::NoCapacity)
    }

    /// Lease a failover target's credential for the user
    pub async fn acquire_backup(
        &self,
        user_id: i64,
        channel: &Channel,
        ip_address: Option<String>,
    ) -> Result<Admission> {
        if let Some(existing) = self.held_session(user_id, &channel.stream_id).await? {
            return Ok(Admission::Leased(existing));
        }

        let mut last = None;
        for _ in 0..MAX_ATTEMPTS {
            let selection = match self.select_credential_for_backup(channel).await? {
                Some(s) => s,
                None => return Ok(Admission::NoCapacity),
            };
            if selection.overflow {
                info!(
                    credential_id = selection.credential_id,
                    stream_id = %channel.stream_id,
                    "Backup credential saturated, playing best-effort without a lease"
                );
                metrics::ADMISSIONS.with_label_values(&["overflow"]).inc();
                return Ok(Admission::Overflow(selection.credential_id));
            }
            last = Some(selection.credential_id);
            if let Some(admission) = self
                .try_lease(
                    user_id,
                    &channel.stream_id,
                    selection.credential_id,
                    ip_address.clone(),
                )
                .await?
            {
                metrics::ADMISSIONS
                    .with_label_values(&[admission.outcome()])
                    .inc();
                return Ok(admission);
            }
        }

        Ok(match last {
            Some(credential_id) => Admission::Overflow(credential_id),
            None => Admission::NoCapacity,
        })
    }

    /// The lease the user holds on this stream, if it still counts against
    /// capacity. A stale row is deleted under its credential's lock so the
    /// caller goes back through admission instead of reviving it.
    pub async fn held_session(
        &self,
        user_id: i64,
        stream_id: &str,
    ) -> Result<Option<ActiveStreamSession>> {
        let existing = match self.store().find_session(user_id, stream_id).await? {
            Some(s) => s,
            None => return Ok(None),
        };
        if existing.is_fresh(self.cutoff()) {
            return Ok(Some(existing));
        }

        let lock = self.lock_for(existing.credential_id);
        let _guard = lock.lock().await;
        self.store().delete_session(&existing.session_token).await?;
        debug!(
            user_id,
            stream_id,
            credential_id = existing.credential_id,
            "Dropped stale lease before re-admission"
        );
        Ok(None)
    }

    /// Conditional insert under the credential's lock. `None` when the slot
    /// was taken since selection.
    async fn try_lease(
        &self,
        user_id: i64,
        stream_id: &str,
        credential_id: i64,
        ip_address: Option<String>,
    ) -> Result<Option<Admission>> {
        let credential = match self.store().get_credential(credential_id).await? {
            Some(c) if c.is_active => c,
            _ => return Ok(None),
        };

        let lock = self.lock_for(credential_id);
        let _guard = lock.lock().await;

        let session = NewSession {
            user_id,
            stream_id: stream_id.to_string(),
            credential_id,
            session_token: uuid::Uuid::new_v4().simple().to_string(),
            ip_address,
        };

        match self
            .store()
            .insert_session_if_below(&session, credential.max_connections, self.cutoff())
            .await
        {
            Ok(Some(created)) => {
                info!(
                    user_id,
                    stream_id,
                    credential_id,
                    "Session admitted"
                );
                Ok(Some(Admission::Leased(created)))
            }
            Ok(None) => {
                debug!(credential_id, "Credential filled up before insert");
                Ok(None)
            }
            // Same user raced itself; hand back the winner's lease
            Err(AppError::AlreadyExists(_)) => {
                let cutoff = self.cutoff();
                Ok(self
                    .store()
                    .find_session(user_id, stream_id)
                    .await?
                    .filter(|s| s.is_fresh(cutoff))
                    .map(Admission::Leased))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn heartbeat(&self, token: &str) -> Result<bool> {
        self.store()
            .touch_session(token, Utc::now(), self.cutoff())
            .await
    }

    pub async fn release(&self, token: &str) -> Result<bool> {
        let released = self.store().delete_session(token).await?;
        if released {
            debug!("Session released");
        }
        Ok(released)
    }

    pub async fn session_by_token(&self, token: &str) -> Result<Option<ActiveStreamSession>> {
        self.store().find_session_by_token(token).await
    }

    pub async fn active_streams_for_credential(
        &self,
        credential_id: i64,
    ) -> Result<Vec<ActiveStreamSession>> {
        self.store().sessions_for_credential(credential_id).await
    }

    /// Drop every lease on a credential (it was deleted or deactivated)
    pub async fn release_credential(&self, credential_id: i64) -> Result<u64> {
        let released = self
            .store()
            .delete_sessions_for_credential(credential_id)
            .await?;
        self.locks.remove(&credential_id);
        Ok(released)
    }

    /// Remove sessions whose heartbeat is older than the staleness threshold
    pub async fn sweep_stale(&self) -> Result<Vec<ActiveStreamSession>> {
        let swept = self.store().delete_stale_sessions(self.cutoff()).await?;
        if !swept.is_empty() {
            metrics::SWEPT_SESSIONS.inc_by(swept.len() as u64);
        }
        Ok(swept)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{fixture, fixture_with};
    use super::*;
    use crate::services::upstream::testing::FakeApi;

    fn leased_credential(admission: &Admission) -> i64 {
        match admission {
            Admission::Leased(s) => s.credential_id,
            other => panic!("expected a lease, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_two_viewers_fill_credential_third_gets_no_capacity() {
        let fx = fixture();
        let a = fx.provider("A");
        let c1 = fx.credential(a, "c1", 2);
        let hbo = fx.store.add_channel(a, "100", "HBO");
        let cnn = fx.store.add_channel(a, "101", "CNN");
        fx.package_for(&[hbo, cnn], &[1, 2, 3]);

        let first = fx.admission.acquire(1, "100", None).await.unwrap();
        let second = fx.admission.acquire(2, "100", None).await.unwrap();
        assert_eq!(leased_credential(&first), c1);
        assert_eq!(leased_credential(&second), c1);

        assert_eq!(
            fx.admission.select_credential_for_stream(3, "100").await.unwrap(),
            CredentialSelection::NoCapacity
        );
        assert_eq!(
            fx.admission.acquire(3, "100", None).await.unwrap(),
            Admission::NoCapacity
        );
        assert_eq!(fx.store.session_count(), 2);
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let fx = fixture();
        let a = fx.provider("A");
        let c1 = fx.credential(a, "c1", 1);
        let hbo = fx.store.add_channel(a, "100", "HBO");
        fx.package_for(&[hbo], &[1]);

        let first = fx.admission.acquire(1, "100", Some("10.0.0.1".into())).await.unwrap();
        assert_eq!(
            fx.admission.select_credential_for_stream(1, "100").await.unwrap(),
            CredentialSelection::Bound(c1)
        );
        let second = fx.admission.acquire(1, "100", None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fx.store.session_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_holds_under_concurrent_admission() {
        let fx = fixture();
        let a = fx.provider("A");
        let c1 = fx.credential(a, "c1", 2);
        let c2 = fx.credential(a, "c2", 1);
        let hbo = fx.store.add_channel(a, "100", "HBO");
        let users: Vec<i64> = (1..=20).collect();
        fx.package_for(&[hbo], &users);

        let tasks: Vec<_> = users
            .iter()
            .map(|user| {
                let admission = fx.admission.clone();
                let user = *user;
                tokio::spawn(async move { admission.acquire(user, "100", None).await })
            })
            .collect();

        let mut leased = 0;
        for task in tasks {
            if let Admission::Leased(_) = task.await.unwrap().unwrap() {
                leased += 1;
            }
        }

        assert_eq!(leased, 3);
        assert_eq!(fx.store.session_count(), 3);
        let cutoff = fx.admission.cutoff();
        assert_eq!(fx.store.count_active_sessions(c1, cutoff).await.unwrap(), 2);
        assert_eq!(fx.store.count_active_sessions(c2, cutoff).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_legacy_path_checks_catalog_and_capacity() {
        let fx = fixture();
        let a = fx.provider("A");
        let full = fx.credential(a, "full", 1);
        let spare = fx.credential(a, "spare", 1);
        fx.registry
            .register("full", FakeApi::with_channels(&[("100", "HBO")]));
        fx.registry
            .register("spare", FakeApi::with_channels(&[("100", "HBO"), ("200", "CNN")]));
        let plan = fx.store.add_plan();
        fx.store.add_credential_to_plan(plan, full, 1);
        fx.store.add_credential_to_plan(plan, spare, 2);
        fx.store.subscribe(1, plan);
        fx.store.subscribe(2, plan);

        assert_eq!(leased_credential(&fx.admission.acquire(1, "100", None).await.unwrap()), full);
        assert_eq!(leased_credential(&fx.admission.acquire(2, "100", None).await.unwrap()), spare);
        assert_eq!(
            fx.admission.select_credential_for_stream(1, "999").await.unwrap(),
            CredentialSelection::NoCapacity
        );
    }

    #[tokio::test]
    async fn test_default_credential_when_user_has_no_plan_credentials() {
        let fx = fixture_with(|pool| {
            pool.with_default_credential("http://env.example.com", "env", "pw")
                .unwrap()
        });
        assert_eq!(
            fx.admission.select_credential_for_stream(1, "100").await.unwrap(),
            CredentialSelection::UseDefault
        );
        assert_eq!(fx.admission.acquire(1, "100", None).await.unwrap(), Admission::Default);
        assert_eq!(fx.store.session_count(), 0);

        let without = fixture();
        assert_eq!(
            without.admission.select_credential_for_stream(1, "100").await.unwrap(),
            CredentialSelection::NoCapacity
        );
    }

    #[tokio::test]
    async fn test_stale_session_frees_capacity_and_is_swept() {
        let fx = fixture();
        let a = fx.provider("A");
        let c1 = fx.credential(a, "c1", 1);
        let hbo = fx.store.add_channel(a, "100", "HBO");
        fx.package_for(&[hbo], &[1, 2]);

        let first = fx.admission.acquire(1, "100", None).await.unwrap();
        let token = match &first {
            Admission::Leased(s) => s.session_token.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(fx.admission.acquire(2, "100", None).await.unwrap(), Admission::NoCapacity);

        fx.store
            .set_heartbeat(&token, Utc::now() - chrono::Duration::seconds(300));
        let swept = fx.admission.sweep_stale().await.unwrap();
        assert_eq!(swept.len(), 1);
        assert!(fx.admission.active_streams_for_credential(c1).await.unwrap().is_empty());

        assert_eq!(leased_credential(&fx.admission.acquire(2, "100", None).await.unwrap()), c1);
    }

    #[tokio::test]
    async fn test_stale_lease_is_not_revived_over_capacity() {
        let fx = fixture();
        let a = fx.provider("A");
        let c1 = fx.credential(a, "c1", 1);
        let hbo = fx.store.add_channel(a, "100", "HBO");
        fx.package_for(&[hbo], &[1, 2]);

        let stale_token = match fx.admission.acquire(1, "100", None).await.unwrap() {
            Admission::Leased(s) => s.session_token,
            other => panic!("unexpected {:?}", other),
        };
        fx.store
            .set_heartbeat(&stale_token, Utc::now() - chrono::Duration::seconds(300));

        // The stale lease no longer holds the slot
        let second = fx.admission.acquire(2, "100", None).await.unwrap();
        assert_eq!(leased_credential(&second), c1);

        // User 1 comes back: no revival by heartbeat, no lease handed back
        assert!(!fx.admission.heartbeat(&stale_token).await.unwrap());
        assert_eq!(
            fx.admission.select_credential_for_stream(1, "100").await.unwrap(),
            CredentialSelection::NoCapacity
        );
        assert_eq!(fx.admission.acquire(1, "100", None).await.unwrap(), Admission::NoCapacity);
        assert!(!fx.admission.heartbeat(&stale_token).await.unwrap());

        let cutoff = fx.admission.cutoff();
        assert_eq!(fx.store.count_active_sessions(c1, cutoff).await.unwrap(), 1);
        assert_eq!(fx.store.session_count(), 1);

        // Once the slot frees up the user is re-admitted with a new lease
        let second_token = match second {
            Admission::Leased(s) => s.session_token,
            other => panic!("unexpected {:?}", other),
        };
        assert!(fx.admission.release(&second_token).await.unwrap());
        match fx.admission.acquire(1, "100", None).await.unwrap() {
            Admission::Leased(s) => assert_ne!(s.session_token, stale_token),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fx.store.count_active_sessions(c1, cutoff).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_lease_insert_is_distinct_from_full() {
        let fx = fixture();
        let a = fx.provider("A");
        let c1 = fx.credential(a, "c1", 1);
        let hbo = fx.store.add_channel(a, "100", "HBO");
        fx.package_for(&[hbo], &[1, 2]);
        fx.admission.acquire(1, "100", None).await.unwrap();

        let lease = |user_id: i64, token: &str| NewSession {
            user_id,
            stream_id: "100".to_string(),
            credential_id: c1,
            session_token: token.to_string(),
            ip_address: None,
        };
        let cutoff = fx.admission.cutoff();
        assert!(matches!(
            fx.store.insert_session_if_below(&lease(1, "dup"), 2, cutoff).await,
            Err(AppError::AlreadyExists(_))
        ));
        assert_eq!(
            fx.store
                .insert_session_if_below(&lease(2, "full"), 1, cutoff)
                .await
                .unwrap(),
            None
        );
        assert_eq!(fx.store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_and_release() {
        let fx = fixture();
        let a = fx.provider("A");
        fx.credential(a, "c1", 1);
        let hbo = fx.store.add_channel(a, "100", "HBO");
        fx.package_for(&[hbo], &[1]);

        let token = match fx.admission.acquire(1, "100", None).await.unwrap() {
            Admission::Leased(s) => s.session_token,
            other => panic!("unexpected {:?}", other),
        };
        assert!(fx.admission.heartbeat(&token).await.unwrap());
        assert!(fx.admission.release(&token).await.unwrap());
        assert!(!fx.admission.release(&token).await.unwrap());
        assert!(!fx.admission.heartbeat(&token).await.unwrap());
    }

    #[tokio::test]
    async fn test_backup_selection_overflows_when_saturated() {
        let fx = fixture();
        let b = fx.provider("B");
        let only = fx.credential(b, "b1", 1);
        let backup_id = fx.store.add_channel(b, "500", "HBO East");
        let backup = fx.store.get_channel(backup_id).await.unwrap().unwrap();

        // Backup is outside both users' plans
        let first = fx.admission.acquire_backup(1, &backup, None).await.unwrap();
        assert_eq!(leased_credential(&first), only);

        let second = fx.admission.acquire_backup(2, &backup, None).await.unwrap();
        assert_eq!(second, Admission::Overflow(only));
        assert_eq!(fx.store.session_count(), 1);

        let selection = fx
            .admission
            .select_credential_for_backup_stream("500")
            .await
            .unwrap()
            .unwrap();
        assert!(selection.overflow);
        assert!(fx
            .admission
            .select_credential_for_backup_stream("missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_release_credential_drops_its_sessions() {
        let fx = fixture();
        let a = fx.provider("A");
        let c1 = fx.credential(a, "c1", 3);
        let hbo = fx.store.add_channel(a, "100", "HBO");
        fx.package_for(&[hbo], &[1, 2]);
        fx.admission.acquire(1, "100", None).await.unwrap();
        fx.admission.acquire(2, "100", None).await.unwrap();

        assert_eq!(fx.admission.release_credential(c1).await.unwrap(), 2);
        assert_eq!(fx.store.session_count(), 0);
    }
}
