//! Integration tests for session orchestration
//!
//! Exercises buffered and streamed turns against scripted upstream mocks:
//! answer assembly, cursor bookkeeping, per-credential serialization,
//! stale rebinding, and failure recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;

use chatmux::server::{FrameEvent, StreamFramer};
use chatmux::session::{
    ChatError, CredentialPool, Cursor, ModelTier, OVERLOAD_MESSAGE, Orchestrator, SessionRegistry,
};
use chatmux::testing::{
    MOCK_CONVERSATION_ID, MockBackend, MockClient, MockConnector, mock_credential_with, mock_pool,
};
use chatmux::upstream::{ApiErrorCode, Auth, TokenPair, UpstreamError};

// =============================================================================
// Test Fixtures
// =============================================================================

fn api_error(code: ApiErrorCode) -> UpstreamError {
    UpstreamError::Api {
        code,
        message: "upstream said no".to_string(),
    }
}

/// A one-credential orchestrator whose credential carries a refresh token
fn backend_with_refresh_token() -> (
    Orchestrator,
    Arc<MockClient>,
    Arc<MockConnector>,
    Arc<chatmux::session::Credential>,
) {
    let connector = Arc::new(MockConnector::new());
    let (credential, client) =
        mock_credential_with("me@example.com:pw:at-1:rt-1", MockClient::new(), &connector);
    let pool = CredentialPool::new(vec![Arc::clone(&credential)]).unwrap();
    let registry = Arc::new(SessionRegistry::new(Arc::new(pool)));
    (Orchestrator::new(registry), client, connector, credential)
}

// =============================================================================
// Credential Pool
// =============================================================================

mod pool_tests {
    use super::*;

    #[test]
    fn test_two_cycles_cover_pool_twice() {
        for size in [1, 2, 3, 7] {
            let (pool, _connector) = mock_pool(size);
            let mut counts: HashMap<String, usize> = HashMap::new();
            for _ in 0..size * 2 {
                *counts.entry(pool.pick_random().email().to_string()).or_default() += 1;
            }

            assert_eq!(counts.len(), size);
            assert!(counts.values().all(|count| *count == 2), "pool of {size}: {counts:?}");
        }
    }
}

// =============================================================================
// Buffered Turns
// =============================================================================

mod buffered_tests {
    use super::*;

    #[tokio::test]
    async fn test_answer_is_assembled_from_cumulative_messages() {
        let backend = MockBackend::single();
        backend.client().push_messages(&["Hi", "Hi there", "Hi there!"]);

        let answer = backend.orchestrator.chat("hello", "alice", None).await.unwrap();

        assert_eq!(answer, "Hi there!");
        let session = backend.registry.get("alice", ModelTier::Default).unwrap();
        assert_eq!(session.cursor(), Some(Cursor::new(MOCK_CONVERSATION_ID, "msg-2")));
    }

    #[tokio::test]
    async fn test_second_turn_continues_conversation() {
        let backend = MockBackend::single();
        backend.client().push_messages(&["one"]);
        backend.client().push_messages(&["two"]);

        backend.orchestrator.chat("first", "alice", None).await.unwrap();
        backend.orchestrator.chat("second", "alice", None).await.unwrap();

        let requests = backend.client().requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].cursor.is_none());
        assert_eq!(
            requests[1].cursor,
            Some(Cursor::new(MOCK_CONVERSATION_ID, "msg-0"))
        );
        assert_eq!(requests[1].prompt, "second");
    }

    #[tokio::test]
    async fn test_model_override_is_forwarded() {
        let backend = MockBackend::single();
        backend.client().push_messages(&["a"]);
        backend.client().push_messages(&["b"]);

        backend.orchestrator.chat("x", "alice", Some("gpt-4")).await.unwrap();
        backend.orchestrator.chat("y", "alice", None).await.unwrap();

        let requests = backend.client().requests();
        assert_eq!(requests[0].model.as_deref(), Some("gpt-4"));
        assert!(requests[1].model.is_none());
        assert!(backend.registry.get("alice", ModelTier::Gpt4).is_some());
        assert!(backend.registry.get("alice", ModelTier::Default).is_some());
    }

    #[tokio::test]
    async fn test_unsupported_model_never_reaches_upstream() {
        let backend = MockBackend::single();

        let err = backend
            .orchestrator
            .chat("x", "alice", Some("davinci"))
            .await
            .unwrap_err();

        assert_eq!(err, ChatError::UnsupportedModel("davinci".to_string()));
        assert_eq!(err.code(), 400);
        assert!(backend.client().requests().is_empty());
        assert_eq!(backend.registry.len(ModelTier::Default), 0);
    }

    #[tokio::test]
    async fn test_empty_answer_is_an_error() {
        let backend = MockBackend::single();

        let err = backend.orchestrator.chat("hello", "alice", None).await.unwrap_err();

        assert_eq!(err, ChatError::EmptyResponse);
        assert!(backend.registry.get("alice", ModelTier::Default).is_none());
        // No refresh token, so recovery logs in again with the password
        let connects = backend.connector.connect_calls();
        assert_eq!(connects.len(), 1);
        assert!(matches!(connects[0], Auth::Password { .. }));
    }
}

// =============================================================================
// Failure Recovery
// =============================================================================

mod recovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_error_kinds() {
        let cases = vec![
            (api_error(ApiErrorCode::Status(503)), ChatError::ServerError),
            (
                api_error(ApiErrorCode::Status(429)),
                ChatError::RateLimited("Too many requests, please retry later".to_string()),
            ),
            (api_error(ApiErrorCode::ExpiredAccessToken), ChatError::AuthExpired),
            (api_error(ApiErrorCode::Other("nope".to_string())), ChatError::Unknown),
            (
                UpstreamError::Http {
                    status: 429,
                    body: String::new(),
                },
                ChatError::RateLimited(OVERLOAD_MESSAGE.to_string()),
            ),
        ];

        for (upstream, expected) in cases {
            let backend = MockBackend::single();
            backend.client().push_error(upstream);
            let err = backend.orchestrator.chat("x", "alice", None).await.unwrap_err();
            assert_eq!(err, expected);
        }
    }

    #[tokio::test]
    async fn test_failure_evicts_default_and_gpt4_but_not_paid() {
        let backend = MockBackend::single();
        backend.client().push_messages(&["paid answer"]);
        backend.client().push_messages(&["gpt4 answer"]);
        backend
            .orchestrator
            .chat("x", "alice", Some("text-davinci-002-render-paid"))
            .await
            .unwrap();
        backend.orchestrator.chat("x", "alice", Some("gpt-4")).await.unwrap();

        backend.client().push_error(api_error(ApiErrorCode::Status(500)));
        let err = backend.orchestrator.chat("x", "alice", None).await.unwrap_err();

        assert_eq!(err, ChatError::ServerError);
        assert!(backend.registry.get("alice", ModelTier::Default).is_none());
        assert!(backend.registry.get("alice", ModelTier::Gpt4).is_none());
        assert!(backend.registry.get("alice", ModelTier::Paid).is_some());
    }

    #[tokio::test]
    async fn test_failure_rotates_refresh_token() {
        let (orchestrator, client, connector, credential) = backend_with_refresh_token();
        connector.set_exchange_result(Ok(TokenPair {
            access_token: "at-2".to_string(),
            refresh_token: Some("rt-2".to_string()),
        }));
        client.push_error(api_error(ApiErrorCode::ExpiredAccessToken));

        let err = orchestrator.chat("x", "alice", None).await.unwrap_err();

        assert_eq!(err, ChatError::AuthExpired);
        assert_eq!(connector.exchange_calls(), vec!["rt-1".to_string()]);
        assert_eq!(
            connector.connect_calls(),
            vec![Auth::AccessToken("at-2".to_string())]
        );
        assert_eq!(credential.refresh_token().as_deref(), Some("rt-2"));
    }

    #[tokio::test]
    async fn test_failed_refresh_still_reports_original_error() {
        let (orchestrator, client, connector, credential) = backend_with_refresh_token();
        connector.set_exchange_result(Err(UpstreamError::Transport("auth down".to_string())));
        client.push_error(api_error(ApiErrorCode::Status(502)));

        let err = orchestrator.chat("x", "alice", None).await.unwrap_err();

        assert_eq!(err, ChatError::ServerError);
        assert!(connector.connect_calls().is_empty());
        assert_eq!(credential.refresh_token().as_deref(), Some("rt-1"));
    }

    #[tokio::test]
    async fn test_next_turn_uses_refreshed_client() {
        let backend = MockBackend::single();
        let replacement = Arc::new(MockClient::new());
        replacement.push_messages(&["fresh"]);
        backend.connector.push_client(Arc::clone(&replacement));
        backend.client().push_error(api_error(ApiErrorCode::InvalidAccessToken));

        assert!(backend.orchestrator.chat("x", "alice", None).await.is_err());
        let answer = backend.orchestrator.chat("y", "alice", None).await.unwrap();

        assert_eq!(answer, "fresh");
        assert_eq!(backend.client().requests().len(), 1);
        assert_eq!(replacement.requests().len(), 1);
        assert!(replacement.requests()[0].cursor.is_none());
    }
}

// =============================================================================
// Concurrency And Binding
// =============================================================================

mod binding_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_turns_on_one_credential_never_overlap() {
        let backend = MockBackend::new(vec![MockClient::with_step_delay(Duration::from_millis(50))]);
        backend.client().push_messages(&["a", "ab", "abc"]);
        backend.client().push_messages(&["x", "xy", "xyz"]);

        let (first, second) = tokio::join!(
            backend.orchestrator.chat("one", "alice", None),
            backend.orchestrator.chat("two", "bob", None),
        );

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(backend.client().requests().len(), 2);
        assert_eq!(backend.client().max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turns_on_different_credentials_run_together() {
        let backend = MockBackend::new(vec![
            MockClient::with_step_delay(Duration::from_secs(10)),
            MockClient::with_step_delay(Duration::from_secs(10)),
        ]);
        for client in &backend.clients {
            client.push_messages(&["answer"]);
        }

        let orchestrator = Arc::clone(&backend.orchestrator);
        let first = tokio::spawn(async move { orchestrator.chat("one", "alice", None).await });
        let orchestrator = Arc::clone(&backend.orchestrator);
        let second = tokio::spawn(async move { orchestrator.chat("two", "bob", None).await });
        tokio::time::sleep(Duration::from_secs(5)).await;

        for client in &backend.clients {
            assert_eq!(client.in_flight(), 1);
        }
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stale_session_moves_to_other_credential() {
        let backend = MockBackend::new(vec![MockClient::new(), MockClient::new()]);
        for client in &backend.clients {
            client.push_messages(&["answer"]);
        }

        backend.orchestrator.chat("x", "alice", None).await.unwrap();
        let session = backend.registry.get("alice", ModelTier::Default).unwrap();
        let first = session.credential();
        session.set_last_activity(Utc::now() - chrono::Duration::seconds(301));

        backend.orchestrator.chat("y", "alice", None).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &session.credential()));
        for client in &backend.clients {
            assert_eq!(client.requests().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_recent_session_keeps_credential() {
        let backend = MockBackend::new(vec![MockClient::new(), MockClient::new()]);
        for client in &backend.clients {
            client.push_messages(&["one"]);
            client.push_messages(&["two"]);
        }

        backend.orchestrator.chat("x", "alice", None).await.unwrap();
        let session = backend.registry.get("alice", ModelTier::Default).unwrap();
        let first = session.credential();
        session.set_last_activity(Utc::now() - chrono::Duration::seconds(299));

        backend.orchestrator.chat("y", "alice", None).await.unwrap();

        assert!(Arc::ptr_eq(&first, &session.credential()));
        let served: Vec<_> = backend.clients.iter().map(|c| c.requests().len()).collect();
        assert!(served == vec![2, 0] || served == vec![0, 2], "{served:?}");
    }
}

// =============================================================================
// Streamed Turns
// =============================================================================

mod stream_tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_yields_deltas_and_updates_cursor() {
        let backend = MockBackend::single();
        backend.client().push_messages(&["Hi", "Hi there", "Hi there!"]);

        let fragments: Vec<_> = backend
            .orchestrator
            .chat_stream("hello", "alice", None)
            .unwrap()
            .collect()
            .await;

        let fragments: Vec<String> = fragments.into_iter().map(Result::unwrap).collect();
        assert_eq!(fragments, vec!["Hi", " there", "!"]);
        let session = backend.registry.get("alice", ModelTier::Default).unwrap();
        assert_eq!(session.cursor(), Some(Cursor::new(MOCK_CONVERSATION_ID, "msg-2")));
    }

    #[tokio::test]
    async fn test_stream_rejects_unsupported_model_up_front() {
        let backend = MockBackend::single();

        let result = backend.orchestrator.chat_stream("x", "alice", Some("gpt-5"));

        assert!(matches!(result, Err(ChatError::UnsupportedModel(_))));
        assert!(backend.client().requests().is_empty());
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let backend = MockBackend::single();

        let stream = backend.orchestrator.chat_stream("x", "alice", None).unwrap();
        assert!(backend.registry.get("alice", ModelTier::Default).is_none());
        drop(stream);

        assert!(backend.client().requests().is_empty());
    }

    #[tokio::test]
    async fn test_stream_error_is_last_item_and_evicts() {
        let backend = MockBackend::single();
        backend.client().push_turn(vec![
            Ok(chatmux::testing::mock_event("partial", "c1", "m1")),
            Err(api_error(ApiErrorCode::Status(500))),
        ]);

        let items: Vec<_> = backend
            .orchestrator
            .chat_stream("x", "alice", None)
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok("partial".to_string()));
        assert_eq!(items[1], Err(ChatError::ServerError));
        assert!(backend.registry.get("alice", ModelTier::Default).is_none());
        assert_eq!(backend.connector.connect_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_given_up_while_waiting_never_reaches_upstream() {
        let backend = MockBackend::new(vec![MockClient::with_step_delay(Duration::from_secs(200))]);
        backend.client().push_messages(&["slow answer"]);
        backend.client().push_messages(&["unread answer"]);

        let orchestrator = Arc::clone(&backend.orchestrator);
        let alice = tokio::spawn(async move { orchestrator.chat("q", "alice", None).await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let framer = StreamFramer::new(Duration::from_secs(12), Duration::from_secs(120));
        let fragments = backend
            .orchestrator
            .chat_stream("secret prompt", "bob", None)
            .unwrap();
        let events: Vec<_> = framer.frame(fragments).collect().await;

        assert_eq!(events.iter().filter(|e| **e == FrameEvent::KeepAlive).count(), 10);
        assert_eq!(
            events[events.len() - 2],
            FrameEvent::Message(OVERLOAD_MESSAGE.to_string())
        );

        assert_eq!(alice.await.unwrap(), Ok("slow answer".to_string()));
        tokio::time::sleep(Duration::from_secs(300)).await;

        let prompts: Vec<_> = backend
            .client()
            .requests()
            .into_iter()
            .map(|request| request.prompt)
            .collect();
        assert_eq!(prompts, vec!["q"]);
        let bob = backend.registry.get("bob", ModelTier::Default);
        assert_eq!(bob.and_then(|session| session.cursor()), None);
    }
}
