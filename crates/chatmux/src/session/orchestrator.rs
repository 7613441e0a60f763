//! Conversation turns
//!
//! Every turn follows the same path: resolve the tier, find or create the
//! user's session, rebind it if it went stale, then hold the bound
//! credential's lock while the upstream answer is read. Buffered and
//! streamed turns both read the answer as [`Deltas`].
//!
//! On any failure the credential is refreshed and the user's default and
//! gpt-4 sessions are evicted before the error is handed back, all while
//! the lock is still held.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_stream::stream;
use futures::{Stream, StreamExt};
use tracing::{debug, error};

use super::credential::{Credential, TurnGuard};
use super::error::ChatError;
use super::registry::{SessionRegistry, UserSession};
use super::tier::TierSelection;
use crate::upstream::{AskRequest, AskStream, Cursor, UpstreamError};

/// The text added by one upstream step, with the cursor it left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub text: String,
    pub cursor: Cursor,
}

/// Turns cumulative upstream messages into suffix deltas
pub struct Deltas {
    inner: AskStream,
    previous: String,
}

impl Deltas {
    pub fn new(inner: AskStream) -> Self {
        Self {
            inner,
            previous: String::new(),
        }
    }
}

/// Text of `message` past the first `previous.chars().count()` characters
fn suffix_after(message: &str, previous: &str) -> String {
    match message.strip_prefix(previous) {
        Some(rest) => rest.to_string(),
        None => message.chars().skip(previous.chars().count()).collect(),
    }
}

impl Stream for Deltas {
    type Item = Result<Delta, UpstreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => {
                let text = suffix_after(&event.message, &this.previous);
                this.previous = event.message;
                Poll::Ready(Some(Ok(Delta {
                    text,
                    cursor: event.cursor,
                })))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Fragments of a streamed answer. An `Err` is always the last item.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

enum TurnFailure {
    Upstream(UpstreamError),
    Empty,
}

/// One locked exchange with the upstream
struct Turn {
    registry: Arc<SessionRegistry>,
    session: Arc<UserSession>,
    credential: Arc<Credential>,
    guard: TurnGuard,
}

impl Turn {
    async fn begin(registry: Arc<SessionRegistry>, user_id: &str, selection: TierSelection) -> Self {
        let session = registry.get_or_create(user_id, selection.tier);
        let credential = registry.rebind_if_stale(&session);
        let mut guard = credential.acquire().await;
        guard.model = selection.model_override;

        Self {
            registry,
            session,
            credential,
            guard,
        }
    }

    fn ask(&self, sentence: &str) -> Deltas {
        let cursor = self.session.cursor();
        debug!(
            "[Session] ask upstream: user={} tier={} credential={} continuing={}",
            self.session.user_id(),
            self.session.tier(),
            self.credential.email(),
            cursor.is_some()
        );

        let request = AskRequest {
            prompt: sentence.to_string(),
            cursor,
            model: self.guard.model.map(|tier| tier.slug().to_string()),
            verbose: self.credential.is_verbose(),
        };
        Deltas::new(self.credential.client().ask(request))
    }

    fn record(&self, cursor: Cursor) {
        self.session.update(cursor);
    }

    /// Recover from a failed turn and release the lock afterwards
    async fn fail(self, failure: TurnFailure) -> ChatError {
        self.credential.refresh().await;
        self.registry.evict(self.session.user_id());

        let chat_error = match failure {
            TurnFailure::Upstream(e) => {
                error!(
                    "[Session] upstream failure for {} on {}: {}",
                    self.session.user_id(),
                    self.credential.email(),
                    e
                );
                ChatError::from(e)
            }
            TurnFailure::Empty => {
                error!(
                    "[Session] empty response for {} on {}",
                    self.session.user_id(),
                    self.credential.email()
                );
                ChatError::EmptyResponse
            }
        };
        drop(self.guard);
        chat_error
    }
}

pub struct Orchestrator {
    registry: Arc<SessionRegistry>,
}

impl Orchestrator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run a turn to completion and return the whole answer
    pub async fn chat(
        &self,
        sentence: &str,
        user_id: &str,
        model: Option<&str>,
    ) -> Result<String, ChatError> {
        let selection = TierSelection::resolve(model)?;
        let turn = Turn::begin(Arc::clone(&self.registry), user_id, selection).await;
        let mut deltas = turn.ask(sentence);

        let mut answer = String::new();
        let mut last_cursor = None;
        while let Some(step) = deltas.next().await {
            match step {
                Ok(delta) => {
                    answer.push_str(&delta.text);
                    last_cursor = Some(delta.cursor);
                }
                Err(e) => {
                    drop(deltas);
                    return Err(turn.fail(TurnFailure::Upstream(e)).await);
                }
            }
        }
        drop(deltas);

        match last_cursor {
            Some(cursor) if !answer.is_empty() => {
                turn.record(cursor);
                Ok(answer)
            }
            _ => Err(turn.fail(TurnFailure::Empty).await),
        }
    }

    /// Start a streamed turn. The model is checked here; the session and
    /// lock are only taken once the stream is first polled.
    pub fn chat_stream(
        &self,
        sentence: &str,
        user_id: &str,
        model: Option<&str>,
    ) -> Result<FragmentStream, ChatError> {
        let selection = TierSelection::resolve(model)?;
        let registry = Arc::clone(&self.registry);
        let sentence = sentence.to_string();
        let user_id = user_id.to_string();

        Ok(Box::pin(stream! {
            let turn = Turn::begin(registry, &user_id, selection).await;
            let mut deltas = turn.ask(&sentence);

            while let Some(step) = deltas.next().await {
                match step {
                    Ok(delta) => {
                        turn.record(delta.cursor);
                        if !delta.text.is_empty() {
                            yield Ok(delta.text);
                        }
                    }
                    Err(e) => {
                        drop(deltas);
                        yield Err(turn.fail(TurnFailure::Upstream(e)).await);
                        return;
                    }
                }
            }
        }))
    }
}
