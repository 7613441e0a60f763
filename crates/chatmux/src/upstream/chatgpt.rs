//! ChatGPT-style backend client
//!
//! Talks to a `backend-api` style conversation endpoint that streams the
//! answer as SSE, where every `data:` line carries the full message so far.
//! Access tokens come from an OAuth token endpoint via the password grant
//! (email/password credentials) or the refresh-token grant.

use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::config::UpstreamConfig;

use super::sse::{SseLine, SseLineDecoder};
use super::{
    ApiErrorCode, AskEvent, AskRequest, AskStream, Auth, Cursor, TokenPair, UpstreamClient,
    UpstreamConnector, UpstreamError,
};

/// Model used when a request carries no override
const DEFAULT_MODEL: &str = "text-davinci-002-render-sha";

const OAUTH_SCOPE: &str = "openid profile email offline_access";

const REFRESH_REDIRECT_URI: &str =
    "com.openai.chat://auth0.openai.com/ios/com.openai.chat/callback";

/// Builds [`ChatGptClient`] handles and talks to the OAuth token endpoint
#[derive(Debug, Clone)]
pub struct ChatGptConnector {
    http: Client,
    base_url: String,
    auth_url: String,
    client_id: String,
}

impl ChatGptConnector {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| UpstreamError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: validated_base(&config.base_url)?,
            auth_url: validated_base(&config.auth_url)?,
            client_id: config.client_id.clone(),
        })
    }

    async fn request_token(&self, request: &TokenRequest<'_>) -> Result<TokenPair, UpstreamError> {
        let url = format!("{}/oauth/token", self.auth_url);
        debug!("Requesting upstream token at: {}", url);

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_response(response).await?;

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(format!("Invalid token response: {e}")))?;

        Ok(TokenPair {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
        })
    }
}

#[async_trait]
impl UpstreamConnector for ChatGptConnector {
    async fn connect(&self, auth: &Auth) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
        let access_token = match auth {
            Auth::AccessToken(token) => token.clone(),
            Auth::Password { email, password } => {
                info!("Logging in upstream as {}", email);
                self.request_token(&TokenRequest::Password {
                    client_id: &self.client_id,
                    username: email,
                    password,
                    scope: OAUTH_SCOPE,
                })
                .await?
                .access_token
            }
        };

        Ok(Arc::new(ChatGptClient {
            http: self.http.clone(),
            conversation_url: format!("{}/conversation", self.base_url),
            access_token,
        }))
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenPair, UpstreamError> {
        self.request_token(&TokenRequest::RefreshToken {
            client_id: &self.client_id,
            refresh_token,
            redirect_uri: REFRESH_REDIRECT_URI,
        })
        .await
    }
}

/// Authenticated conversation client
#[derive(Debug, Clone)]
pub struct ChatGptClient {
    http: Client,
    conversation_url: String,
    access_token: String,
}

impl UpstreamClient for ChatGptClient {
    fn ask(&self, request: AskRequest) -> AskStream {
        Box::pin(conversation_stream(
            self.http.clone(),
            self.conversation_url.clone(),
            self.access_token.clone(),
            request,
        ))
    }
}

fn conversation_stream(
    http: Client,
    url: String,
    access_token: String,
    request: AskRequest,
) -> impl Stream<Item = Result<AskEvent, UpstreamError>> + Send + 'static {
    try_stream! {
        let body = ConversationRequest::from_ask(&request);
        let response = http
            .post(&url)
            .bearer_auth(&access_token)
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_response(response).await?;

        let mut chunks = response.bytes_stream();
        let mut decoder = SseLineDecoder::new();
        let mut finished = false;

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(transport_error)?;
            for line in decoder.push(&chunk) {
                match line {
                    SseLine::Done => {
                        finished = true;
                        break;
                    }
                    SseLine::Data(data) => {
                        if request.verbose {
                            debug!("upstream line: {}", data);
                        }
                        if let Some(event) = parse_event(&data)? {
                            yield event;
                        }
                    }
                }
            }
            if finished {
                break;
            }
        }

        if !finished {
            if let Some(SseLine::Data(data)) = decoder.finish() {
                if let Some(event) = parse_event(&data)? {
                    yield event;
                }
            }
        }
    }
}

/// Decode one `data:` payload. Lines that are not assistant messages are skipped.
fn parse_event(data: &str) -> Result<Option<AskEvent>, UpstreamError> {
    let payload: StreamPayload = match serde_json::from_str(data) {
        Ok(payload) => payload,
        Err(_) => return Ok(None),
    };

    if let Some(detail) = payload.detail {
        return Err(api_error(None, &detail));
    }
    if let Some(Value::String(error)) = payload.error {
        return Err(UpstreamError::Api {
            code: ApiErrorCode::Other("stream_error".to_string()),
            message: error,
        });
    }

    let (Some(message), Some(conversation_id)) = (payload.message, payload.conversation_id) else {
        return Ok(None);
    };
    if message.author.role != "assistant" {
        return Ok(None);
    }
    let Some(text) = message.content.parts.first().and_then(Value::as_str) else {
        return Ok(None);
    };

    Ok(Some(AskEvent {
        message: text.to_string(),
        cursor: Cursor::new(conversation_id, message.id),
    }))
}

/// Pass successful responses through, turn everything else into an error
async fn check_response(response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status.as_u16(), body))
}

fn error_from_body(status: u16, body: String) -> UpstreamError {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&body) else {
        return UpstreamError::Http { status, body };
    };

    if let Some(detail) = map.get("detail") {
        return api_error(Some(status), detail);
    }

    match map.get("error").and_then(Value::as_str) {
        Some(error) => UpstreamError::Api {
            code: ApiErrorCode::Status(status),
            message: map
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or(error)
                .to_string(),
        },
        None => UpstreamError::Http { status, body },
    }
}

/// Map a provider `detail` value, with the HTTP status when there was one
fn api_error(status: Option<u16>, detail: &Value) -> UpstreamError {
    let (code, message) = match detail {
        Value::Object(map) => (
            map.get("code").and_then(Value::as_str),
            map.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| detail.to_string()),
        ),
        Value::String(message) => (None, message.clone()),
        other => (None, other.to_string()),
    };

    let code = match (code, status) {
        (Some("token_expired"), _) => ApiErrorCode::ExpiredAccessToken,
        (Some("invalid_api_key" | "invalid_token"), _) | (_, Some(401)) => {
            ApiErrorCode::InvalidAccessToken
        }
        (_, Some(status)) => ApiErrorCode::Status(status),
        (Some(other), None) => ApiErrorCode::Other(other.to_string()),
        (None, None) => ApiErrorCode::Other("unknown".to_string()),
    };

    UpstreamError::Api { code, message }
}

fn transport_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Transport(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        UpstreamError::Transport(format!("Failed to connect to upstream: {e}"))
    } else {
        UpstreamError::Transport(format!("Request failed: {e}"))
    }
}

fn validated_base(raw: &str) -> Result<String, UpstreamError> {
    Url::parse(raw).map_err(|e| UpstreamError::Transport(format!("Invalid upstream URL {raw}: {e}")))?;
    Ok(raw.trim_end_matches('/').to_string())
}

#[derive(Debug, Serialize)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
enum TokenRequest<'a> {
    Password {
        client_id: &'a str,
        username: &'a str,
        password: &'a str,
        scope: &'a str,
    },
    RefreshToken {
        client_id: &'a str,
        refresh_token: &'a str,
        redirect_uri: &'a str,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConversationRequest<'a> {
    action: &'static str,
    messages: Vec<OutboundMessage<'a>>,
    conversation_id: Option<&'a str>,
    parent_message_id: String,
    model: &'a str,
}

impl<'a> ConversationRequest<'a> {
    fn from_ask(request: &'a AskRequest) -> Self {
        let (conversation_id, parent_message_id) = match &request.cursor {
            Some(cursor) => (
                Some(cursor.conversation_id.as_str()),
                cursor.parent_id.clone(),
            ),
            None => (None, Uuid::new_v4().to_string()),
        };

        Self {
            action: "next",
            messages: vec![OutboundMessage {
                id: Uuid::new_v4().to_string(),
                author: OutboundAuthor { role: "user" },
                content: OutboundContent {
                    content_type: "text",
                    parts: vec![request.prompt.as_str()],
                },
            }],
            conversation_id,
            parent_message_id,
            model: request.model.as_deref().unwrap_or(DEFAULT_MODEL),
        }
    }
}

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    id: String,
    author: OutboundAuthor,
    content: OutboundContent<'a>,
}

#[derive(Debug, Serialize)]
struct OutboundAuthor {
    role: &'static str,
}

#[derive(Debug, Serialize)]
struct OutboundContent<'a> {
    content_type: &'static str,
    parts: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    detail: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    id: String,
    author: StreamAuthor,
    content: StreamContent,
}

#[derive(Debug, Deserialize)]
struct StreamAuthor {
    role: String,
}

#[derive(Debug, Deserialize)]
struct StreamContent {
    #[serde(default)]
    parts: Vec<Value>,
}
