//! Upstream chat provider seam
//!
//! The orchestrator only talks to the provider through [`UpstreamClient`]
//! (one authenticated handle per credential) and [`UpstreamConnector`]
//! (which builds handles and rotates tokens). The ChatGPT-style HTTP
//! implementation is [`ChatGptConnector`].

mod chatgpt;
mod sse;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

pub use chatgpt::{ChatGptClient, ChatGptConnector};

/// Position in an upstream conversation.
///
/// A turn either starts a new conversation (no cursor) or continues one,
/// in which case both ids are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub conversation_id: String,
    pub parent_id: String,
}

impl Cursor {
    pub fn new(conversation_id: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            parent_id: parent_id.into(),
        }
    }
}

/// A single prompt sent upstream
#[derive(Debug, Clone, Default)]
pub struct AskRequest {
    pub prompt: String,
    /// Conversation to continue; `None` starts a new one
    pub cursor: Option<Cursor>,
    /// Model slug override; `None` lets the provider pick
    pub model: Option<String>,
    /// Log raw upstream traffic at debug level
    pub verbose: bool,
}

/// One partial answer. `message` is the full text generated so far, not a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskEvent {
    pub message: String,
    pub cursor: Cursor,
}

/// Lazy sequence of partial answers for one turn
pub type AskStream = Pin<Box<dyn Stream<Item = Result<AskEvent, UpstreamError>> + Send + 'static>>;

/// Error code reported by the provider itself (as opposed to the transport)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiErrorCode {
    /// Provider error carrying an HTTP-like status
    Status(u16),
    ExpiredAccessToken,
    InvalidAccessToken,
    /// Provider-specific code with no better mapping
    Other(String),
}

impl fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiErrorCode::Status(status) => write!(f, "{status}"),
            ApiErrorCode::ExpiredAccessToken => f.write_str("expired_access_token"),
            ApiErrorCode::InvalidAccessToken => f.write_str("invalid_access_token"),
            ApiErrorCode::Other(code) => f.write_str(code),
        }
    }
}

/// Errors raised by upstream clients and connectors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    /// The provider answered with an error payload
    #[error("Upstream API error ({code}): {message}")]
    Api { code: ApiErrorCode, message: String },

    /// Non-success HTTP status without a provider error payload
    #[error("Upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection, timeout or body read failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Response could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Authentication material used to build a client handle
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    AccessToken(String),
    Password { email: String, password: String },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::AccessToken(_) => f.write_str("Auth::AccessToken([REDACTED])"),
            Auth::Password { email, .. } => f
                .debug_struct("Auth::Password")
                .field("email", email)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Result of a refresh-token exchange
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    /// Rotated refresh token, when the provider issues one
    pub refresh_token: Option<String>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// An authenticated handle able to run conversation turns
pub trait UpstreamClient: Send + Sync {
    fn ask(&self, request: AskRequest) -> AskStream;
}

/// Builds client handles and rotates tokens
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Build a client handle, logging in first when given a password
    async fn connect(&self, auth: &Auth) -> Result<Arc<dyn UpstreamClient>, UpstreamError>;

    /// Trade a refresh token for a fresh access token
    async fn exchange_refresh_token(&self, refresh_token: &str)
    -> Result<TokenPair, UpstreamError>;
}
