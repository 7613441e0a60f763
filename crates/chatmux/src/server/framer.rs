//! Keep-alive and deadline framing for streamed answers
//!
//! The framer sits between a [`FragmentStream`](crate::session::FragmentStream)
//! and the SSE body. A background task forwards fragments into a queue so
//! that waiting on the upstream never blocks keep-alives.
//!
//! States run `Starting -> Streaming -> Draining -> Done`. Streaming ends
//! when the forwarder reports completion or the deadline passes; draining
//! flushes whatever is already queued. Every stream opens with
//! [`FrameEvent::Start`] and closes with [`FrameEvent::Done`], whatever
//! happens in between.

use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::session::{ChatError, OVERLOAD_MESSAGE};

const FALLBACK_ERROR_MESSAGE: &str = "Internal Server Error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Start,
    Message(String),
    KeepAlive,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    Starting,
    Streaming,
    Draining,
    Done,
}

enum Forwarded {
    Fragment(String),
    Finished,
}

/// Stop flag shared with the forwarder. Raised explicitly once streaming
/// ends, and on drop when the consumer goes away.
struct StopSignal(watch::Sender<bool>);

impl StopSignal {
    fn raise(&self) {
        self.0.send_replace(true);
    }
}

impl Drop for StopSignal {
    fn drop(&mut self) {
        self.raise();
    }
}

fn advance(state: &mut FramerState, next: FramerState) {
    debug!("[Stream] {:?} -> {:?}", state, next);
    *state = next;
}

#[derive(Debug, Clone, Copy)]
pub struct StreamFramer {
    keepalive: Duration,
    deadline: Duration,
}

impl StreamFramer {
    pub fn new(keepalive: Duration, deadline: Duration) -> Self {
        Self {
            keepalive,
            deadline,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.keepalive(), config.deadline())
    }

    pub fn frame<S>(&self, fragments: S) -> impl Stream<Item = FrameEvent> + Send + 'static
    where
        S: Stream<Item = Result<String, ChatError>> + Send + 'static,
    {
        let keepalive = self.keepalive;
        let deadline = self.deadline;

        stream! {
            let mut state = FramerState::Starting;
            yield FrameEvent::Start;

            let (stop_tx, stop_rx) = watch::channel(false);
            let stop = StopSignal(stop_tx);
            let (tx, mut rx) = mpsc::unbounded_channel();
            tokio::spawn(forward(fragments, tx, stop_rx));

            let started = Instant::now();
            advance(&mut state, FramerState::Streaming);

            while state == FramerState::Streaming {
                match timeout(keepalive, rx.recv()).await {
                    Ok(Some(Forwarded::Fragment(text))) => {
                        yield FrameEvent::Message(text);
                    }
                    Ok(Some(Forwarded::Finished)) | Ok(None) => {
                        advance(&mut state, FramerState::Draining);
                    }
                    Err(_) if started.elapsed() > deadline => {
                        warn!("[Stream] no answer within {:?}, giving up", deadline);
                        yield FrameEvent::Message(OVERLOAD_MESSAGE.to_string());
                        advance(&mut state, FramerState::Draining);
                    }
                    Err(_) => {
                        yield FrameEvent::KeepAlive;
                    }
                }
            }

            stop.raise();
            while let Ok(Forwarded::Fragment(text)) = rx.try_recv() {
                yield FrameEvent::Message(text);
            }
            advance(&mut state, FramerState::Done);

            yield FrameEvent::Done;
        }
    }
}

/// Pump fragments into the queue until they run out or the stop flag is
/// raised. Raising the flag drops the fragment stream at once, even while
/// its turn still waits for the credential lock.
async fn forward<S>(
    fragments: S,
    tx: mpsc::UnboundedSender<Forwarded>,
    mut stop: watch::Receiver<bool>,
) where
    S: Stream<Item = Result<String, ChatError>> + Send + 'static,
{
    let mut fragments = std::pin::pin!(fragments);
    loop {
        let item = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            item = fragments.next() => item,
        };
        let Some(item) = item else { break };

        match item {
            Ok(text) => {
                if tx.send(Forwarded::Fragment(text)).is_err() {
                    break;
                }
            }
            Err(e) => {
                let message = e.to_string();
                let message = if message.is_empty() {
                    FALLBACK_ERROR_MESSAGE.to_string()
                } else {
                    message
                };
                let _ = tx.send(Forwarded::Fragment(message));
                break;
            }
        }
    }
    let _ = tx.send(Forwarded::Finished);
}
