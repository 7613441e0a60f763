//! Route handlers
//!
//! Request validation happens here; everything past it is the
//! orchestrator's business.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use super::sse::ServerSentEvent;

/// Shared session key for callers that do not identify themselves
pub const ANONYMOUS_USER: &str = "anonymous";

const SENTENCE_REQUIRED: &str = "sentence is required";

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    pub sentence: Option<String>,
    pub user_id: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatStreamRequest {
    pub sentence: Option<String>,
    pub user_id: Option<String>,
    pub model: Option<String>,
}

pub async fn ping() -> &'static str {
    "pong"
}

/// Buffered turn: `GET /chat?sentence=&user_id=&model=`
pub async fn chat(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ChatQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return error_response(rejection.status().as_u16(), &rejection.body_text());
        }
    };
    let Some(sentence) = query.sentence else {
        return error_response(400, SENTENCE_REQUIRED);
    };
    let user_id = query.user_id.unwrap_or_else(|| ANONYMOUS_USER.to_string());

    match state
        .orchestrator
        .chat(&sentence, &user_id, query.model.as_deref())
        .await
    {
        Ok(message) => Json(json!({ "message": message })).into_response(),
        Err(e) => {
            tracing::error!("[Engine] chat failed for {}: {}", user_id, e);
            error_response(e.code(), &e.to_string())
        }
    }
}

/// Streamed turn: `POST /chat-stream`, answered as server-sent events
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    request: Result<Json<ChatStreamRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => {
            tracing::warn!("[Engine] unreadable chat stream request: {}", rejection);
            return error_response(rejection.status().as_u16(), &rejection.body_text());
        }
    };
    let Some(sentence) = request.sentence else {
        return error_response(400, SENTENCE_REQUIRED);
    };
    let user_id = request.user_id.unwrap_or_else(|| ANONYMOUS_USER.to_string());

    let fragments = match state
        .orchestrator
        .chat_stream(&sentence, &user_id, request.model.as_deref())
    {
        Ok(fragments) => fragments,
        Err(e) => {
            tracing::error!("[Engine] chat stream rejected for {}: {}", user_id, e);
            return error_response(e.code(), &e.to_string());
        }
    };

    let events = state
        .framer
        .frame(fragments)
        .map(|event| Ok::<_, Infallible>(ServerSentEvent::from(event).encode()));

    let mut response = Response::new(Body::from_stream(events));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    response
}

/// `{"detail", "code"}` body with the status implied by `code`
pub fn error_response(code: u16, detail: &str) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "detail": detail, "code": code }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_status_follows_code() {
        assert_eq!(error_response(429, "slow down").status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error_response(502, "bad gateway").status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_response_invalid_code_is_500() {
        assert_eq!(
            error_response(42, "nonsense").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
