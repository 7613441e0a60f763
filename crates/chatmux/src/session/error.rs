//! Public error taxonomy for chat turns
//!
//! Upstream failures are never surfaced raw: the orchestrator builds one of
//! these from the caught [`UpstreamError`], each with a fixed user-facing
//! message and a numeric code the HTTP layer turns into a status.

use thiserror::Error;

use crate::upstream::{ApiErrorCode, UpstreamError};

pub const RATE_LIMIT_MESSAGE: &str = "Too many requests, please retry later";

/// Sent when the upstream itself is throttling us, and when a stream runs
/// past its deadline.
pub const OVERLOAD_MESSAGE: &str =
    "😱 机器人负载过多，请稍后再试(The robot is overwhelmed, please try again later)";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    #[error("model not supported: {0}")]
    UnsupportedModel(String),

    #[error("empty response")]
    EmptyResponse,

    #[error("OpenAI Token Invalid, please retry")]
    AuthExpired,

    /// Message differs between provider-reported and transport-level throttling
    #[error("{0}")]
    RateLimited(String),

    #[error("OpenAI Server Error")]
    ServerError,

    #[error("Unknown Error")]
    Unknown,

    #[error("{message}")]
    TransportFailure { status: Option<u16>, message: String },

    #[error("token format error: expected 2 to 4 colon-separated fields, got {0}")]
    FormatError(usize),
}

impl ChatError {
    /// Numeric code reported to clients, doubling as the HTTP status
    pub fn code(&self) -> u16 {
        match self {
            ChatError::UnsupportedModel(_) => 400,
            ChatError::EmptyResponse => 502,
            ChatError::AuthExpired => 401,
            ChatError::RateLimited(_) => 429,
            ChatError::ServerError => 502,
            ChatError::Unknown => 500,
            ChatError::TransportFailure { status, .. } => status.unwrap_or(502),
            ChatError::FormatError(_) => 500,
        }
    }
}

impl From<UpstreamError> for ChatError {
    fn from(error: UpstreamError) -> Self {
        match &error {
            UpstreamError::Api {
                code: ApiErrorCode::Status(status),
                ..
            } if *status >= 500 => ChatError::ServerError,
            UpstreamError::Api {
                code: ApiErrorCode::Status(429),
                ..
            } => ChatError::RateLimited(RATE_LIMIT_MESSAGE.to_string()),
            UpstreamError::Api {
                code: ApiErrorCode::ExpiredAccessToken | ApiErrorCode::InvalidAccessToken,
                ..
            } => ChatError::AuthExpired,
            UpstreamError::Api { .. } => ChatError::Unknown,
            UpstreamError::Http { status: 429, .. } => {
                ChatError::RateLimited(OVERLOAD_MESSAGE.to_string())
            }
            UpstreamError::Http { status, .. } if *status >= 500 => ChatError::ServerError,
            UpstreamError::Http { status, .. } => ChatError::TransportFailure {
                status: Some(*status),
                message: error.to_string(),
            },
            UpstreamError::Transport(_) | UpstreamError::Decode(_) => {
                ChatError::TransportFailure {
                    status: None,
                    message: error.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(code: ApiErrorCode) -> UpstreamError {
        UpstreamError::Api {
            code,
            message: "raw upstream text".to_string(),
        }
    }

    fn http(status: u16) -> UpstreamError {
        UpstreamError::Http {
            status,
            body: "<html></html>".to_string(),
        }
    }

    #[test]
    fn test_api_server_errors() {
        assert_eq!(ChatError::from(api(ApiErrorCode::Status(500))), ChatError::ServerError);
        assert_eq!(ChatError::from(api(ApiErrorCode::Status(503))), ChatError::ServerError);
        assert_eq!(ChatError::ServerError.to_string(), "OpenAI Server Error");
    }

    #[test]
    fn test_api_rate_limit() {
        let err = ChatError::from(api(ApiErrorCode::Status(429)));
        assert_eq!(err.to_string(), "Too many requests, please retry later");
        assert_eq!(err.code(), 429);
    }

    #[test]
    fn test_token_errors_are_auth_expired() {
        assert_eq!(
            ChatError::from(api(ApiErrorCode::ExpiredAccessToken)),
            ChatError::AuthExpired
        );
        assert_eq!(
            ChatError::from(api(ApiErrorCode::InvalidAccessToken)),
            ChatError::AuthExpired
        );
        assert_eq!(ChatError::AuthExpired.to_string(), "OpenAI Token Invalid, please retry");
    }

    #[test]
    fn test_other_api_codes_are_unknown() {
        assert_eq!(ChatError::from(api(ApiErrorCode::Status(400))), ChatError::Unknown);
        assert_eq!(
            ChatError::from(api(ApiErrorCode::Other("moderation".to_string()))),
            ChatError::Unknown
        );
        assert_eq!(ChatError::Unknown.to_string(), "Unknown Error");
    }

    #[test]
    fn test_transport_status_mapping() {
        let limited = ChatError::from(http(429));
        assert_eq!(limited, ChatError::RateLimited(OVERLOAD_MESSAGE.to_string()));

        assert_eq!(ChatError::from(http(502)), ChatError::ServerError);

        let forbidden = ChatError::from(http(403));
        assert_eq!(forbidden.code(), 403);
        assert!(forbidden.to_string().contains("HTTP 403"));
    }

    #[test]
    fn test_connection_failures_keep_message() {
        let err = ChatError::from(UpstreamError::Transport("connection reset".to_string()));
        assert_eq!(err.code(), 502);
        assert!(err.to_string().contains("connection reset"));
    }
}
