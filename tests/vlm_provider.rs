//! The chat completions provider against a local mock server.

use httpmock::prelude::*;
use httpmock::Method::HEAD;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use mobile_pilot::error::{ErrorKind, ProviderError};
use mobile_pilot::reasoning::{ReasoningProvider, StructuredPrompt, VlmConfig, VlmProvider, check_health};

fn prompt() -> StructuredPrompt {
    StructuredPrompt {
        system: "You operate a phone.".into(),
        text: "Task: open settings".into(),
        image: Some(Arc::new(vec![0x89, 0x50, 0x4e, 0x47])),
    }
}

fn provider(server: &MockServer) -> VlmProvider {
    VlmProvider::new(
        VlmConfig::new(server.url("/v1/chat/completions"))
            .model("test-vl")
            .api_key("sk-test")
            .request_timeout(Duration::from_secs(2)),
    )
    .unwrap()
}

#[tokio::test]
async fn test_completion_round_trip() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-test");
            then.status(200).json_body(json!({
                "choices": [{
                    "message": { "role": "assistant", "content": "{\"action\":\"back\"}" }
                }]
            }));
        })
        .await;

    let response = provider(&server).propose(&prompt()).await.unwrap();
    assert_eq!(response.text, "{\"action\":\"back\"}");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(503).body("overloaded");
        })
        .await;

    let err = provider(&server).propose(&prompt()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Unavailable(_)));
    assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn test_client_error_is_invalid_response() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(400).body("bad request");
        })
        .await;

    let err = provider(&server).propose(&prompt()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderMalformedOutput);
}

#[tokio::test]
async fn test_garbage_body_is_invalid_response() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body("<html>not json</html>");
        })
        .await;

    let err = provider(&server).propose(&prompt()).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .delay(Duration::from_secs(5))
                .json_body(json!({"choices":[{"message":{"content":"{}"}}]}));
        })
        .await;

    let provider = VlmProvider::new(
        VlmConfig::new(server.url("/v1/chat/completions")).request_timeout(Duration::from_millis(200)),
    )
    .unwrap();
    let err = provider.propose(&prompt()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderTimeout);
}

#[tokio::test]
async fn test_health_check() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(HEAD).path("/");
            then.status(200);
        })
        .await;

    assert!(check_health(&server.url("/v1/chat/completions"), Duration::from_secs(2)).await);
    assert!(!check_health("not a url", Duration::from_secs(1)).await);
}
