//! Upstream credentials
//!
//! A credential owns one upstream identity, the client handle built from it,
//! and the lock that serializes every turn made through it. Sessions share
//! credentials through `Arc`; the handle is swapped wholesale on refresh.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use super::{ChatError, ModelTier};
use crate::upstream::{Auth, UpstreamClient, UpstreamConnector, UpstreamError};

/// Parsed form of `email:password[:access_token[:refresh_token]]`
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSpec {
    pub email: String,
    pub password: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl CredentialSpec {
    pub fn parse(spec: &str) -> Result<Self, ChatError> {
        let fields: Vec<&str> = spec.split(':').collect();
        let owned = |i: usize| fields.get(i).map(|f| f.to_string());

        match fields.len() {
            2..=4 => Ok(Self {
                email: fields[0].to_string(),
                password: fields[1].to_string(),
                access_token: owned(2),
                refresh_token: owned(3),
            }),
            n => Err(ChatError::FormatError(n)),
        }
    }

    /// Material used for the first login: the pre-issued token if any
    fn initial_auth(&self) -> Auth {
        match &self.access_token {
            Some(token) => Auth::AccessToken(token.clone()),
            None => self.password_auth(),
        }
    }

    fn password_auth(&self) -> Auth {
        Auth::Password {
            email: self.email.clone(),
            password: self.password.clone(),
        }
    }
}

impl FromStr for CredentialSpec {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for CredentialSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSpec")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// State only reachable while holding the credential's turn lock
#[derive(Debug, Default)]
pub struct TurnState {
    /// Model forced for the current turn; `None` lets the upstream decide
    pub model: Option<ModelTier>,
}

/// Exclusive access to a credential for the duration of one turn
pub type TurnGuard = OwnedMutexGuard<TurnState>;

pub struct Credential {
    spec: CredentialSpec,
    refresh_token: Mutex<Option<String>>,
    verbose: AtomicBool,
    client: RwLock<Arc<dyn UpstreamClient>>,
    connector: Arc<dyn UpstreamConnector>,
    lock: Arc<TokioMutex<TurnState>>,
}

impl Credential {
    /// Build the initial client handle and wrap it
    pub async fn connect(
        spec: CredentialSpec,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Result<Self, UpstreamError> {
        info!("[Credential] init: {}", spec.email);
        let client = connector.connect(&spec.initial_auth()).await?;
        Ok(Self::with_client(spec, client, connector))
    }

    /// Wrap an already-built client handle
    pub fn with_client(
        spec: CredentialSpec,
        client: Arc<dyn UpstreamClient>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Self {
        Self {
            refresh_token: Mutex::new(spec.refresh_token.clone()),
            spec,
            verbose: AtomicBool::new(false),
            client: RwLock::new(client),
            connector,
            lock: Arc::new(TokioMutex::new(TurnState::default())),
        }
    }

    pub fn email(&self) -> &str {
        &self.spec.email
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Current refresh token, after any rotation
    pub fn refresh_token(&self) -> Option<String> {
        self.refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the current client handle
    pub fn client(&self) -> Arc<dyn UpstreamClient> {
        Arc::clone(&self.client.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// The turn lock. Allocated with the credential, so this never creates one.
    pub fn ensure_lock(&self) -> &Arc<TokioMutex<TurnState>> {
        &self.lock
    }

    /// Wait until no other turn is running on this credential
    pub async fn acquire(&self) -> TurnGuard {
        Arc::clone(self.ensure_lock()).lock_owned().await
    }

    /// Rebuild the client handle. Never fails: on error the current handle
    /// stays in place and the next failure will try again.
    pub async fn refresh(&self) {
        match self.refresh_token() {
            Some(refresh_token) => self.rotate_tokens(&refresh_token).await,
            None => self.login_again().await,
        }
    }

    async fn rotate_tokens(&self, refresh_token: &str) {
        let pair = match self.connector.exchange_refresh_token(refresh_token).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("[Credential] refresh token exchange failed for {}: {}", self.email(), e);
                return;
            }
        };

        if let Some(rotated) = pair.refresh_token {
            *self
                .refresh_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(rotated);
        }

        match self.connector.connect(&Auth::AccessToken(pair.access_token)).await {
            Ok(client) => {
                self.replace_client(client);
                info!("[Credential] access token refreshed: {}", self.email());
            }
            Err(e) => error!("[Credential] rebuild after refresh failed for {}: {}", self.email(), e),
        }
    }

    async fn login_again(&self) {
        match self.connector.connect(&self.spec.password_auth()).await {
            Ok(client) => {
                self.replace_client(client);
                info!("[Credential] token refreshed: {}", self.email());
            }
            Err(e) => warn!("[Credential] re-login failed for {}: {}", self.email(), e),
        }
    }

    fn replace_client(&self, client: Arc<dyn UpstreamClient>) {
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("email", &self.spec.email)
            .field("verbose", &self.is_verbose())
            .finish_non_exhaustive()
    }
}
