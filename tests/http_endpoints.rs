//! Integration tests for the HTTP-backed pieces: the finalizer and the
//! streaming text provider, run against a local mock backend.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test http_endpoints
//! ```

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::within;
use session_engine::providers::{ProviderRegistry, TextCompletionAdapter, TextConfig};
use session_engine::streaming::MAX_LINE_BYTES;
use session_engine::{
    ConsentGate, ConsentStatus, FinalizeError, Finalizer, HttpFinalizer, Modality, Phase,
    ProviderErrorKind, Role, SessionEngine, SessionError, SessionRegistry, TurnRecord,
};

const LIMIT: Duration = Duration::from_secs(5);
const CHAT: &str = "/v1/chat/stream";
const FINALIZE: &str = "/v1/sessions/finalize";

fn turns() -> Vec<TurnRecord> {
    vec![
        TurnRecord {
            role: Role::User,
            content: "I have an exam tomorrow".into(),
        },
        TurnRecord {
            role: Role::Assistant,
            content: "Let's plan your evening".into(),
        },
    ]
}

fn ndjson(lines: &[serde_json::Value]) -> String {
    lines
        .iter()
        .map(|line| format!("{}\n", line))
        .collect::<String>()
}

fn text_engine(server: &MockServer) -> SessionEngine {
    let config = TextConfig {
        url: format!("{}{}", server.uri(), CHAT),
        model: "chat-test".into(),
        token: Some("tok-123".into()),
    };
    let mut providers = ProviderRegistry::new();
    providers.register("text-default", Modality::Text, move || {
        Box::new(TextCompletionAdapter::new(config.clone()))
    });

    SessionEngine::builder()
        .providers(providers)
        .consent(Arc::new(ConsentGate::in_memory(ConsentStatus::Granted)))
        .finalizer(Arc::new(HttpFinalizer::new(
            format!("{}{}", server.uri(), FINALIZE),
            Some("tok-123".into()),
            Duration::from_secs(2),
        )))
        .session_registry(Arc::new(SessionRegistry::new()))
        .build()
}

// ============================================================================
// Finalizer
// ============================================================================

mod finalizer {
    use super::*;

    fn finalizer(server: &MockServer, timeout: Duration) -> HttpFinalizer {
        HttpFinalizer::new(
            format!("{}{}", server.uri(), FINALIZE),
            Some("tok-123".into()),
            timeout,
        )
    }

    #[tokio::test]
    async fn posts_turns_and_returns_points_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(FINALIZE))
            .and(header("authorization", "Bearer tok-123"))
            .and(body_partial_json(json!({
                "turns": [
                    {"role": "user", "content": "I have an exam tomorrow"},
                    {"role": "assistant", "content": "Let's plan your evening"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "importantPoints": ["Exam tomorrow", "Plan the evening"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let points = finalizer(&server, Duration::from_secs(2))
            .finalize(uuid::Uuid::new_v4(), &turns())
            .await
            .unwrap();
        assert_eq!(points, vec!["Exam tomorrow", "Plan the evening"]);
    }

    #[tokio::test]
    async fn server_error_keeps_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(FINALIZE))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_json(json!({"error": {"message": "summarizer down"}})),
            )
            .mount(&server)
            .await;

        let err = finalizer(&server, Duration::from_secs(2))
            .finalize(uuid::Uuid::new_v4(), &turns())
            .await
            .unwrap_err();
        match err {
            FinalizeError::Api { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "summarizer down");
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unexpected_body_is_a_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(FINALIZE))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"summary": "?"})))
            .mount(&server)
            .await;

        let err = finalizer(&server, Duration::from_secs(2))
            .finalize(uuid::Uuid::new_v4(), &turns())
            .await
            .unwrap_err();
        assert!(matches!(err, FinalizeError::Parse(_)));
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(FINALIZE))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(3))
                    .set_body_json(json!({"importantPoints": []})),
            )
            .mount(&server)
            .await;

        let err = finalizer(&server, Duration::from_millis(200))
            .finalize(uuid::Uuid::new_v4(), &turns())
            .await
            .unwrap_err();
        assert!(matches!(err, FinalizeError::Timeout));
    }
}

// ============================================================================
// Streaming text provider
// ============================================================================

mod text_provider {
    use super::*;

    #[tokio::test]
    async fn streamed_reply_lands_in_transcript_and_finish_summarizes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CHAT))
            .and(header("authorization", "Bearer tok-123"))
            .and(body_partial_json(json!({
                "model": "chat-test",
                "stream": true,
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                ndjson(&[
                    json!({"type": "token", "payload": "Hello"}),
                    json!({"type": "keepalive"}),
                    json!({"type": "token", "payload": {"text": " there"}}),
                    json!({"type": "turn_complete"}),
                ]),
                "application/x-ndjson",
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(FINALIZE))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "importantPoints": ["User greeted the assistant"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let engine = text_engine(&server);
        let mut observer = engine.start(Modality::Text, "text-default").await.unwrap();
        engine.send("hello").await.unwrap();

        let done = within(
            LIMIT,
            observer.wait_for(|s| s.state == Phase::Listening && s.transcript.len() == 2),
        )
        .await
        .unwrap();
        assert_eq!(done.transcript[1].role, Role::Assistant);
        assert_eq!(done.transcript[1].content, "Hello there");
        assert!(!done.transcript[1].streaming);

        let summary = engine.finish().await.unwrap();
        assert_eq!(summary.key_points, vec!["User greeted the assistant"]);
        assert_eq!(engine.snapshot().state, Phase::Listening);

        engine.end().await.unwrap();
    }

    #[tokio::test]
    async fn sse_style_body_is_accepted() {
        let server = MockServer::start().await;
        let body = concat!(
            ": comment\n",
            "data: {\"type\":\"token\",\"payload\":\"Hi\"}\n\n",
            "data: {\"type\":\"turn_complete\"}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path(CHAT))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let engine = text_engine(&server);
        let mut observer = engine.start(Modality::Text, "text-default").await.unwrap();
        engine.send("hey").await.unwrap();

        let done = within(
            LIMIT,
            observer.wait_for(|s| s.state == Phase::Listening && s.transcript.len() == 2),
        )
        .await
        .unwrap();
        assert_eq!(done.transcript[1].content, "Hi");
    }

    #[tokio::test]
    async fn unauthorized_request_fails_the_session_as_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CHAT))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"message": "invalid token"})),
            )
            .mount(&server)
            .await;

        let engine = text_engine(&server);
        let mut observer = engine.start(Modality::Text, "text-default").await.unwrap();
        engine.send("hello").await.unwrap();

        let failed = within(LIMIT, observer.wait_for(|s| s.state == Phase::Error))
            .await
            .unwrap();
        let fault = failed.error.unwrap();
        assert_eq!(fault.kind, ProviderErrorKind::Rejected);
        assert!(fault.detail.contains("401"));
        assert!(fault.detail.contains("invalid token"));

        assert!(matches!(
            engine.send("again").await,
            Err(SessionError::Busy { phase: Phase::Error })
        ));
    }

    #[tokio::test]
    async fn body_without_turn_complete_is_a_lost_connection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CHAT))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                ndjson(&[json!({"type": "token", "payload": "Hel"})]),
                "application/x-ndjson",
            ))
            .mount(&server)
            .await;

        let engine = text_engine(&server);
        let mut observer = engine.start(Modality::Text, "text-default").await.unwrap();
        engine.send("hello").await.unwrap();

        let failed = within(LIMIT, observer.wait_for(|s| s.state == Phase::Error))
            .await
            .unwrap();
        assert_eq!(failed.error.unwrap().kind, ProviderErrorKind::ConnectionLost);
        // The partial reply is discarded with the failed handle.
        assert_eq!(failed.transcript.len(), 1);
    }

    #[tokio::test]
    async fn endless_line_fails_the_session_instead_of_buffering() {
        let server = MockServer::start().await;
        let body = format!(
            "{}\n{}",
            json!({"type": "token", "payload": "Hel"}),
            "x".repeat(MAX_LINE_BYTES + 1)
        );
        Mock::given(method("POST"))
            .and(path(CHAT))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let engine = text_engine(&server);
        let mut observer = engine.start(Modality::Text, "text-default").await.unwrap();
        engine.send("hello").await.unwrap();

        let failed = within(LIMIT, observer.wait_for(|s| s.state == Phase::Error))
            .await
            .unwrap();
        let fault = failed.error.unwrap();
        assert_eq!(fault.kind, ProviderErrorKind::ConnectionLost);
        assert!(fault.detail.contains("without a newline"), "{}", fault.detail);
        assert_eq!(failed.transcript.len(), 1);
    }

    #[tokio::test]
    async fn backend_error_frame_fails_the_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(CHAT))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                ndjson(&[
                    json!({"type": "token", "payload": "Hel"}),
                    json!({"type": "error", "payload": {"kind": "rate_limited", "message": "slow down"}}),
                ]),
                "application/x-ndjson",
            ))
            .mount(&server)
            .await;

        let engine = text_engine(&server);
        let mut observer = engine.start(Modality::Text, "text-default").await.unwrap();
        engine.send("hello").await.unwrap();

        let failed = within(LIMIT, observer.wait_for(|s| s.state == Phase::Error))
            .await
            .unwrap();
        let fault = failed.error.unwrap();
        assert_eq!(fault.kind, ProviderErrorKind::Rejected);
        assert_eq!(fault.detail, "slow down");
    }
}
