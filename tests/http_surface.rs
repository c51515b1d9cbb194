mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use antigravity_gateway_lib::models::GatewayConfig;
use antigravity_gateway_lib::proxy::build_router;
use antigravity_gateway_lib::proxy::handlers::{AppState, RoundRobinSelector};
use antigravity_gateway_lib::proxy::rate_limit::InMemoryRateLimits;

use common::*;

fn router(script: Vec<Scripted>, account_ids: &[&str]) -> (Router, Arc<ScriptedUpstream>) {
    let h = harness(script, GatewayConfig::default());
    let accounts = account_ids.iter().map(|id| account(id)).collect();
    let selector = RoundRobinSelector::new(accounts, Arc::new(InMemoryRateLimits::new()));
    let state = AppState::new(Arc::new(h.service), Arc::new(selector));
    (build_router(state, 1 << 20), h.upstream)
}

fn post(uri: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn hello() -> String {
    json!({
        "model": "claude-sonnet-4-5",
        "messages": [{"role": "user", "content": "hello"}]
    })
    .to_string()
}

fn overloaded() -> Scripted {
    Scripted::json(503, google_error(503, "overloaded"))
}

#[tokio::test(start_paused = true)]
async fn test_failover_moves_to_next_account() {
    let (app, upstream) = router(
        vec![
            overloaded(),
            overloaded(),
            overloaded(),
            Scripted::json(200, upstream_text("hi there", 4, 2)),
        ],
        &["acc-a", "acc-b"],
    );

    let response = app.oneshot(post("/v1/messages", hello())).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["type"], "message");
    assert_eq!(body["model"], "claude-sonnet-4-5");

    let accounts: Vec<String> = upstream.calls().into_iter().map(|c| c.account_id).collect();
    assert_eq!(accounts, vec!["acc-a", "acc-a", "acc-a", "acc-b"]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_pool_answers_503_in_claude_shape() {
    let (app, upstream) = router(
        vec![overloaded(), overloaded(), overloaded(), overloaded(), overloaded(), overloaded()],
        &["acc-a", "acc-b"],
    );

    let response = app.oneshot(post("/v1/messages", hello())).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = read_json(response).await;
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "overloaded_error");
    assert_eq!(upstream.call_count(), 6);
}

#[tokio::test]
async fn test_invalid_claude_body_is_rejected_locally() {
    let (app, upstream) = router(Vec::new(), &["acc-a"]);

    let response = app
        .oneshot(post("/v1/messages", "{not json".to_string()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(upstream.call_count(), 0);
}

#[tokio::test]
async fn test_no_accounts_answers_503_in_google_shape() {
    let (app, _) = router(Vec::new(), &[]);

    let response = app
        .oneshot(post(
            "/v1beta/models/gemini-2.5-flash:generateContent",
            json!({"contents": []}).to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = read_json(response).await;
    assert_eq!(body["error"]["code"], 503);
    assert_eq!(body["error"]["status"], "UNAVAILABLE");
}

#[tokio::test]
async fn test_gemini_stream_route() {
    let chunk = json!({"response": {
        "candidates": [{"content": {"role": "model", "parts": [{"text": "streamed"}]}}],
        "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 1}
    }});
    let (app, upstream) = router(
        vec![Scripted::Stream {
            chunks: vec![sse_line(&chunk)],
            hang: false,
        }],
        &["acc-a"],
    );

    let response = app
        .oneshot(post(
            "/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse",
            json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}).to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.starts_with("data: {"));
    assert!(text.contains("streamed"));
    assert!(!text.contains("\"response\""));

    let calls = upstream.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].url.ends_with("v1internal:streamGenerateContent?alt=sse"));
}

#[tokio::test]
async fn test_gemini_count_tokens_route() {
    let (app, upstream) = router(Vec::new(), &["acc-a"]);

    let response = app
        .oneshot(post(
            "/v1beta/models/gemini-2.5-flash:countTokens",
            json!({"contents": []}).to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await, json!({"totalTokens": 0}));
    assert_eq!(upstream.call_count(), 0);
}

#[tokio::test]
async fn test_health() {
    let (app, _) = router(Vec::new(), &[]);
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "ok");
}
