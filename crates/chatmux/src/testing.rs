//! Test utilities for chatmux - scripted upstream mocks
//!
//! This module provides:
//! - A scripted [`MockClient`] that replays queued turns and tracks overlap
//! - A recording [`MockConnector`] for login and token-rotation paths
//! - Helpers that wire mocks into credentials, pools and orchestrators

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;

use crate::session::{Credential, CredentialPool, CredentialSpec, Orchestrator, SessionRegistry};
use crate::upstream::{
    AskEvent, AskRequest, AskStream, Auth, Cursor, TokenPair, UpstreamClient, UpstreamConnector,
    UpstreamError,
};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Conversation id used by [`MockClient::push_messages`]
pub const MOCK_CONVERSATION_ID: &str = "conv-mock";

pub fn mock_event(message: &str, conversation_id: &str, parent_id: &str) -> AskEvent {
    AskEvent {
        message: message.to_string(),
        cursor: Cursor::new(conversation_id, parent_id),
    }
}

type Turn = Vec<Result<AskEvent, UpstreamError>>;

/// Counts concurrently running turns for as long as it lives
struct InFlight {
    current: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(current: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Upstream client that replays queued turns in order. A call with nothing
/// queued yields an empty answer.
#[derive(Default)]
pub struct MockClient {
    turns: Mutex<VecDeque<Turn>>,
    requests: Mutex<Vec<AskRequest>>,
    step_delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before every event, so turns take time on the tokio clock
    pub fn with_step_delay(delay: Duration) -> Self {
        Self {
            step_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn push_turn(&self, events: Vec<Result<AskEvent, UpstreamError>>) {
        locked(&self.turns).push_back(events);
    }

    /// Queue a successful turn of cumulative messages, each with its own
    /// parent id
    pub fn push_messages(&self, messages: &[&str]) {
        let events = messages
            .iter()
            .enumerate()
            .map(|(i, message)| Ok(mock_event(message, MOCK_CONVERSATION_ID, &format!("msg-{i}"))))
            .collect();
        self.push_turn(events);
    }

    pub fn push_error(&self, error: UpstreamError) {
        self.push_turn(vec![Err(error)]);
    }

    pub fn requests(&self) -> Vec<AskRequest> {
        locked(&self.requests).clone()
    }

    /// Number of turns streaming right now
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of turns ever streaming at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl UpstreamClient for MockClient {
    fn ask(&self, request: AskRequest) -> AskStream {
        locked(&self.requests).push(request);
        let events = locked(&self.turns).pop_front().unwrap_or_default();
        let delay = self.step_delay;
        let current = Arc::clone(&self.in_flight);
        let peak = Arc::clone(&self.max_in_flight);

        Box::pin(stream! {
            let _in_flight = InFlight::enter(current, &peak);
            for event in events {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                yield event;
            }
        })
    }
}

/// Connector that records every login and token exchange
#[derive(Default)]
pub struct MockConnector {
    connects: Mutex<Vec<Auth>>,
    exchanges: Mutex<Vec<String>>,
    clients: Mutex<VecDeque<Arc<MockClient>>>,
    connect_error: Mutex<Option<UpstreamError>>,
    exchange_result: Mutex<Option<Result<TokenPair, UpstreamError>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client handed out by the next successful connect
    pub fn push_client(&self, client: Arc<MockClient>) {
        locked(&self.clients).push_back(client);
    }

    pub fn fail_connects(&self, error: UpstreamError) {
        *locked(&self.connect_error) = Some(error);
    }

    pub fn set_exchange_result(&self, result: Result<TokenPair, UpstreamError>) {
        *locked(&self.exchange_result) = Some(result);
    }

    pub fn connect_calls(&self) -> Vec<Auth> {
        locked(&self.connects).clone()
    }

    pub fn exchange_calls(&self) -> Vec<String> {
        locked(&self.exchanges).clone()
    }
}

#[async_trait]
impl UpstreamConnector for MockConnector {
    async fn connect(&self, auth: &Auth) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
        locked(&self.connects).push(auth.clone());
        if let Some(error) = locked(&self.connect_error).clone() {
            return Err(error);
        }
        let client = locked(&self.clients)
            .pop_front()
            .unwrap_or_else(|| Arc::new(MockClient::new()));
        Ok(client)
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenPair, UpstreamError> {
        locked(&self.exchanges).push(refresh_token.to_string());
        locked(&self.exchange_result).clone().unwrap_or_else(|| {
            Ok(TokenPair {
                access_token: format!("access-for-{refresh_token}"),
                refresh_token: None,
            })
        })
    }
}

/// Credential `email:password` wired to a fresh [`MockClient`]
pub fn mock_credential(
    email: &str,
    connector: &Arc<MockConnector>,
) -> (Arc<Credential>, Arc<MockClient>) {
    mock_credential_with(&format!("{email}:password"), MockClient::new(), connector)
}

/// Credential parsed from `spec` and wired to `client`
pub fn mock_credential_with(
    spec: &str,
    client: MockClient,
    connector: &Arc<MockConnector>,
) -> (Arc<Credential>, Arc<MockClient>) {
    let spec = CredentialSpec::parse(spec).expect("mock credential spec must parse");
    let client = Arc::new(client);
    let credential = Credential::with_client(
        spec,
        Arc::clone(&client) as Arc<dyn UpstreamClient>,
        Arc::clone(connector) as Arc<dyn UpstreamConnector>,
    );
    (Arc::new(credential), client)
}

pub fn mock_pool(size: usize) -> (Arc<CredentialPool>, Arc<MockConnector>) {
    let connector = Arc::new(MockConnector::new());
    let credentials = (0..size)
        .map(|i| mock_credential(&format!("user{i}@example.com"), &connector).0)
        .collect();
    let pool = CredentialPool::new(credentials).expect("mock pool needs at least one credential");
    (Arc::new(pool), connector)
}

/// An orchestrator over mock credentials, with every handle exposed
pub struct MockBackend {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<SessionRegistry>,
    pub credentials: Vec<Arc<Credential>>,
    pub clients: Vec<Arc<MockClient>>,
    pub connector: Arc<MockConnector>,
}

impl MockBackend {
    /// One credential per client
    pub fn new(clients: Vec<MockClient>) -> Self {
        let connector = Arc::new(MockConnector::new());
        let (credentials, clients): (Vec<_>, Vec<_>) = clients
            .into_iter()
            .enumerate()
            .map(|(i, client)| {
                mock_credential_with(&format!("user{i}@example.com:password"), client, &connector)
            })
            .unzip();

        let pool = CredentialPool::new(credentials.clone())
            .expect("mock backend needs at least one client");
        let registry = Arc::new(SessionRegistry::new(Arc::new(pool)));
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&registry)));

        Self {
            orchestrator,
            registry,
            credentials,
            clients,
            connector,
        }
    }

    /// A single credential backed by one client
    pub fn single() -> Self {
        Self::new(vec![MockClient::new()])
    }

    pub fn client(&self) -> &Arc<MockClient> {
        &self.clients[0]
    }
}
