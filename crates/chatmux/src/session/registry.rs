//! Per-user session registry
//!
//! Sessions live in one map per [`ModelTier`], keyed by user id. A session
//! remembers where the user's upstream conversation left off and which
//! credential it is bound to.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use super::credential::Credential;
use super::pool::CredentialPool;
use super::tier::ModelTier;
use crate::upstream::Cursor;

/// Idle time after which a session is moved to a freshly drawn credential
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct SessionState {
    cursor: Option<Cursor>,
    last_activity: DateTime<Utc>,
    credential: Arc<Credential>,
}

#[derive(Debug)]
pub struct UserSession {
    user_id: String,
    tier: ModelTier,
    state: Mutex<SessionState>,
}

impl UserSession {
    pub fn new(user_id: impl Into<String>, tier: ModelTier, credential: Arc<Credential>) -> Self {
        Self {
            user_id: user_id.into(),
            tier,
            state: Mutex::new(SessionState {
                cursor: None,
                last_activity: Utc::now(),
                credential,
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn tier(&self) -> ModelTier {
        self.tier
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.state().cursor.clone()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state().last_activity
    }

    pub fn credential(&self) -> Arc<Credential> {
        Arc::clone(&self.state().credential)
    }

    /// Record a successful upstream step
    pub fn update(&self, cursor: Cursor) {
        let mut state = self.state();
        state.cursor = Some(cursor);
        state.last_activity = Utc::now();
    }

    /// Backdate or advance the activity clock
    pub fn set_last_activity(&self, at: DateTime<Utc>) {
        self.state().last_activity = at;
    }

    pub(crate) fn rebind(&self, credential: Arc<Credential>) {
        self.state().credential = credential;
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct SessionRegistry {
    pool: Arc<CredentialPool>,
    stale_after: Duration,
    default: DashMap<String, Arc<UserSession>>,
    paid: DashMap<String, Arc<UserSession>>,
    gpt4: DashMap<String, Arc<UserSession>>,
}

impl SessionRegistry {
    pub fn new(pool: Arc<CredentialPool>) -> Self {
        Self {
            pool,
            stale_after: DEFAULT_STALE_AFTER,
            default: DashMap::new(),
            paid: DashMap::new(),
            gpt4: DashMap::new(),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    fn sessions(&self, tier: ModelTier) -> &DashMap<String, Arc<UserSession>> {
        match tier {
            ModelTier::Default => &self.default,
            ModelTier::Paid => &self.paid,
            ModelTier::Gpt4 => &self.gpt4,
        }
    }

    /// Existing session for `(user_id, tier)`, or a new one bound to a
    /// randomly drawn credential. Creation is atomic per key.
    pub fn get_or_create(&self, user_id: &str, tier: ModelTier) -> Arc<UserSession> {
        let entry = self
            .sessions(tier)
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let credential = self.pool.pick_random();
                info!(
                    "[Session] new session for {} on {} bound to {}",
                    user_id,
                    tier,
                    credential.email()
                );
                Arc::new(UserSession::new(user_id, tier, credential))
            });
        Arc::clone(entry.value())
    }

    pub fn get(&self, user_id: &str, tier: ModelTier) -> Option<Arc<UserSession>> {
        self.sessions(tier)
            .get(user_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Forget the user's default and gpt-4 conversations after a failure.
    /// Paid sessions are left alone.
    pub fn evict(&self, user_id: &str) {
        let default = self.default.remove(user_id).is_some();
        let gpt4 = self.gpt4.remove(user_id).is_some();
        debug!(
            "[Session] evicted {} (default: {}, gpt4: {})",
            user_id, default, gpt4
        );
    }

    /// Draw a new credential when the session has been idle too long.
    /// Returns the credential the next turn must use.
    pub fn rebind_if_stale(&self, session: &UserSession) -> Arc<Credential> {
        self.rebind_if_stale_at(session, Utc::now())
    }

    pub fn rebind_if_stale_at(&self, session: &UserSession, now: DateTime<Utc>) -> Arc<Credential> {
        let stale = (now - session.last_activity())
            .to_std()
            .map(|idle| idle >= self.stale_after)
            .unwrap_or(false);

        if stale {
            let credential = self.pool.pick_random();
            info!(
                "[Session] {} idle past {:?}, rebinding to {}",
                session.user_id(),
                self.stale_after,
                credential.email()
            );
            session.rebind(Arc::clone(&credential));
            credential
        } else {
            session.credential()
        }
    }

    pub fn len(&self, tier: ModelTier) -> usize {
        self.sessions(tier).len()
    }
}
