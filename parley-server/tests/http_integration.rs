//! HTTP integration tests for the Parley REST API
//!
//! Every test drives the full router (middleware included) with `oneshot`,
//! backed by the in-memory store and a scripted generation client, so no
//! database or API key is needed.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use common::{call, test_app, test_app_with, test_app_with_registry, test_config, ScriptedClient};
use parley_core::store::MessageStore;
use parley_server::subsystems::registry::SessionRegistry;
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn create_session(router: &axum::Router, user: &str, title: &str) -> String {
    let resp = call(
        router,
        "POST",
        "/api/v1/chat/sessions",
        Some(user),
        Some(json!({ "title": title })),
    )
    .await;
    assert_eq!(resp.status, StatusCode::CREATED, "{}", resp.body);
    resp.body["data"]["id"].as_str().unwrap().to_string()
}

// ===========================================================================
// Scenario 1: implicit session
// ===========================================================================
#[tokio::test]
async fn test_implicit_session_chat() {
    let t = test_app(ScriptedClient::instant());

    let resp = call(&t.router, "POST", "/api/v1/chat", Some("u1"), Some(json!({ "message": "hi" }))).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body["code"], 200);
    let session_id = resp.body["data"]["sessionId"].as_str().unwrap().to_string();
    assert!(!session_id.is_empty());
    assert_eq!(resp.body["data"]["message"], "you said: hi");
    assert_eq!(resp.body["data"]["model"], "test-model");
    assert_eq!(resp.body["data"]["usage"]["totalTokens"], 8);
    assert_eq!(resp.body["data"]["userMessage"]["sequence"], 1);
    assert_eq!(resp.body["data"]["assistantMessage"]["sequence"], 2);

    let resp = call(
        &t.router,
        "GET",
        &format!("/api/v1/chat/sessions/{}", session_id),
        Some("u1"),
        None,
    )
    .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body["data"]["id"], session_id.as_str());
    assert_eq!(resp.body["data"]["title"], "hi");
    assert_eq!(resp.body["data"]["messageCount"], 2);
}

// ===========================================================================
// Scenario 2: ownership leak prevention
// ===========================================================================
#[tokio::test]
async fn test_foreign_session_is_indistinguishable_from_missing() {
    let t = test_app(ScriptedClient::instant());
    let s1 = create_session(&t.router, "u1", "private").await;

    let foreign = call(&t.router, "GET", &format!("/api/v1/chat/sessions/{}", s1), Some("u2"), None).await;
    let missing = call(&t.router, "GET", "/api/v1/chat/sessions/does-not-exist", Some("u2"), None).await;

    assert_eq!(foreign.status, StatusCode::NOT_FOUND);
    assert_eq!(foreign.body["code"], 571);
    assert_eq!(foreign.status, missing.status);
    assert_eq!(foreign.body, missing.body);

    let delete = call(&t.router, "DELETE", &format!("/api/v1/chat/sessions/{}", s1), Some("u2"), None).await;
    assert_eq!(delete.body["code"], 571);

    // still there for its owner
    let own = call(&t.router, "GET", &format!("/api/v1/chat/sessions/{}", s1), Some("u1"), None).await;
    assert_eq!(own.status, StatusCode::OK);
}

// ===========================================================================
// Scenario 3: abort during generation
// ===========================================================================
#[tokio::test]
async fn test_abort_during_generation() {
    let t = test_app(ScriptedClient::sleeping(Duration::from_secs(5)));
    let s1 = create_session(&t.router, "u1", "slow").await;

    let router = t.router.clone();
    let uri = format!("/api/v1/chat/sessions/{}/messages", s1);
    let started = Instant::now();
    let send = tokio::spawn(async move {
        call(&router, "POST", &uri, Some("u1"), Some(json!({ "message": "take your time" }))).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let abort = call(&t.router, "POST", "/api/v1/chat/abort", Some("u1"), Some(json!({ "sessionId": s1 }))).await;
    assert_eq!(abort.status, StatusCode::OK);
    assert_eq!(abort.body["data"]["aborted"], true);

    let sent = send.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(sent.body["code"], 551);
    assert_eq!(sent.status.as_u16(), 499);

    let messages = call(
        &t.router,
        "GET",
        &format!("/api/v1/chat/sessions/{}/messages", s1),
        Some("u1"),
        None,
    )
    .await;
    assert_eq!(messages.body["data"]["total"], 0);

    // repeat abort stays successful
    let again = call(&t.router, "POST", "/api/v1/chat/abort", Some("u1"), Some(json!({ "sessionId": s1 }))).await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(again.body["data"]["aborted"], false);
}

#[tokio::test]
async fn test_client_disconnect_cancels_and_rolls_back() {
    let t = test_app(ScriptedClient::sleeping(Duration::from_secs(5)));
    let s1 = create_session(&t.router, "u1", "hang up").await;

    let router = t.router.clone();
    let uri = format!("/api/v1/chat/sessions/{}/messages", s1);
    let request = tokio::spawn(async move {
        call(&router, "POST", &uri, Some("u1"), Some(json!({ "message": "are you there?" }))).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(t.app.registry.contains(&s1), "turn should be registered while generating");

    // dropping the in-flight request future is what a disconnect looks like to the handler
    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());

    assert!(t.app.registry.is_empty());
    let (_, total) = t
        .store
        .list_messages(&s1, parley_core::store::Page::new(1, 100))
        .await
        .unwrap();
    assert_eq!(total, 0);
    let session = t.store.get_session(&s1).await.unwrap();
    assert_eq!(session.message_count, 0);
    assert!(session.last_message_id.is_none());
}

#[tokio::test]
async fn test_abort_cancels_overlapping_sends() {
    let t = test_app(ScriptedClient::sleeping(Duration::from_secs(2)));
    let s1 = create_session(&t.router, "u1", "busy").await;

    let send = |message: &'static str| {
        let router = t.router.clone();
        let uri = format!("/api/v1/chat/sessions/{}/messages", s1);
        tokio::spawn(async move {
            call(&router, "POST", &uri, Some("u1"), Some(json!({ "message": message }))).await
        })
    };

    let started = Instant::now();
    let first = send("first");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = send("second");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let abort = call(&t.router, "POST", "/api/v1/chat/abort", Some("u1"), Some(json!({ "sessionId": s1 }))).await;
    assert_eq!(abort.body["data"]["aborted"], true);

    for handle in [first, second] {
        let resp = handle.await.unwrap();
        assert_eq!(resp.body["code"], 551);
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    let messages = call(
        &t.router,
        "GET",
        &format!("/api/v1/chat/sessions/{}/messages", s1),
        Some("u1"),
        None,
    )
    .await;
    assert_eq!(messages.body["data"]["total"], 0);
}

// ===========================================================================
// Scenario 4: reaper
// ===========================================================================
#[tokio::test]
async fn test_reaper_drops_idle_handles() {
    let registry = Arc::new(SessionRegistry::new(
        Duration::from_millis(100),
        Duration::from_millis(50),
    ));
    let t = test_app_with_registry(
        test_config(),
        Some(Arc::new(ScriptedClient::instant())),
        registry,
    );

    let s1 = create_session(&t.router, "u1", "idle").await;
    let registry = Arc::clone(&t.app.registry);
    registry.start();

    let (token, _guard) = registry.register(&s1, &CancellationToken::new());
    assert!(registry.contains(&s1));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(registry.get(&s1).is_none(), "idle handle should be reaped");
    assert!(token.is_cancelled());

    let abort = call(&t.router, "POST", "/api/v1/chat/abort", Some("u1"), Some(json!({ "sessionId": s1 }))).await;
    assert_eq!(abort.status, StatusCode::OK);
    assert_eq!(abort.body["data"]["aborted"], false);

    registry.stop().await;
}

// ===========================================================================
// Scenario 5: pagination invariant
// ===========================================================================
#[tokio::test]
async fn test_session_pagination() {
    let t = test_app(ScriptedClient::instant());
    for i in 0..25 {
        create_session(&t.router, "u1", &format!("session {}", i)).await;
    }
    create_session(&t.router, "u2", "someone else's").await;

    let page1 = call(&t.router, "GET", "/api/v1/chat/sessions?pageNo=1&pageSize=10", Some("u1"), None).await;
    let page2 = call(&t.router, "GET", "/api/v1/chat/sessions?pageNo=2&pageSize=10", Some("u1"), None).await;
    let page3 = call(&t.router, "GET", "/api/v1/chat/sessions?pageNo=3&pageSize=10", Some("u1"), None).await;

    assert_eq!(page2.status, StatusCode::OK);
    assert_eq!(page2.body["data"]["total"], 25);
    assert_eq!(page2.body["data"]["pageNo"], 2);

    let ids = |resp: &common::TestResponse| -> Vec<String> {
        resp.body["data"]["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_str().unwrap().to_string())
            .collect()
    };
    let (ids1, ids2, ids3) = (ids(&page1), ids(&page2), ids(&page3));
    assert_eq!(ids1.len(), 10);
    assert_eq!(ids2.len(), 10);
    assert_eq!(ids3.len(), 5);
    assert!(ids2.iter().all(|id| !ids1.contains(id)));
    assert!(ids3.iter().all(|id| !ids1.contains(id) && !ids2.contains(id)));
}

// ===========================================================================
// Scenario 6: health degradation
// ===========================================================================
#[tokio::test]
async fn test_health_reports_failed_generation_probe() {
    let client = ScriptedClient::instant();
    client.probe_ok.store(false, Ordering::SeqCst);
    let t = test_app(client);

    let resp = call(&t.router, "GET", "/health", None, None).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body["code"], 200);
    assert_eq!(resp.body["data"]["status"], "unhealthy");
    assert_eq!(resp.body["data"]["dependencies"]["genkit"], "disconnected");
    assert_eq!(resp.body["data"]["dependencies"]["database"], "connected");
    assert!(resp.body["data"]["uptime"].is_string());
    assert_eq!(resp.body["data"]["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_health_without_generation_backend() {
    let t = test_app_with(test_config(), None);

    let resp = call(&t.router, "GET", "/health", None, None).await;
    assert_eq!(resp.body["data"]["status"], "healthy");
    assert_eq!(resp.body["data"]["dependencies"]["genkit"], "not_configured");

    let chat = call(&t.router, "POST", "/api/v1/chat", Some("u1"), Some(json!({ "message": "hi" }))).await;
    assert_eq!(chat.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(chat.body["code"], 503);
}

// ===========================================================================
// Transport behaviour
// ===========================================================================
#[tokio::test]
async fn test_missing_user_header_is_unauthorized() {
    let t = test_app(ScriptedClient::instant());
    let resp = call(&t.router, "GET", "/api/v1/chat/sessions", None, None).await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    assert_eq!(resp.body["code"], 401);
}

#[tokio::test]
async fn test_request_id_is_generated_or_echoed() {
    let t = test_app(ScriptedClient::instant());

    let resp = call(&t.router, "GET", "/health", None, None).await;
    let generated = resp.headers.get("x-request-id").unwrap().to_str().unwrap();
    assert!(uuid::Uuid::parse_str(generated).is_ok());

    let request = axum::http::Request::builder()
        .uri("/health")
        .header("X-Request-ID", "trace-123")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(t.router.clone(), request).await.unwrap();
    assert_eq!(response.headers().get("x-request-id").unwrap(), "trace-123");
}

#[tokio::test]
async fn test_cors_preflight_returns_no_content() {
    let t = test_app(ScriptedClient::instant());
    let request = axum::http::Request::builder()
        .method("OPTIONS")
        .uri("/api/v1/chat")
        .header("Origin", "https://app.example")
        .header("Access-Control-Request-Method", "POST")
        .body(axum::body::Body::empty())
        .unwrap();

    let response = tower::ServiceExt::oneshot(t.router.clone(), request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers().get("access-control-allow-origin").unwrap(), "*");
    assert!(response.headers().get("x-request-id").is_some());
}

#[tokio::test]
async fn test_malformed_body_is_bad_request_envelope() {
    let t = test_app(ScriptedClient::instant());
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/api/v1/chat")
        .header("X-User-ID", "u1")
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from("{not json"))
        .unwrap();

    let response = tower::ServiceExt::oneshot(t.router.clone(), request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], 400);
}

#[tokio::test]
async fn test_validation_errors_are_422() {
    let t = test_app(ScriptedClient::instant());

    let resp = call(&t.router, "GET", "/api/v1/chat/sessions?pageSize=500", Some("u1"), None).await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.body["code"], 422);

    let resp = call(&t.router, "POST", "/api/v1/chat", Some("u1"), Some(json!({ "message": "" }))).await;
    assert_eq!(resp.body["code"], 422);

    let resp = call(
        &t.router,
        "POST",
        "/api/v1/chat/sessions",
        Some("u1"),
        Some(json!({ "title": "t", "temperature": 2.5 })),
    )
    .await;
    assert_eq!(resp.body["code"], 422);
}

#[tokio::test]
async fn test_unknown_route_is_enveloped() {
    let t = test_app(ScriptedClient::instant());
    let resp = call(&t.router, "GET", "/nope", None, None).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
    assert_eq!(resp.body["code"], 404);
}

// ===========================================================================
// Session lifecycle round trips
// ===========================================================================
#[tokio::test]
async fn test_update_pin_archive_delete() {
    let t = test_app(ScriptedClient::instant());
    let s1 = create_session(&t.router, "u1", "draft").await;
    let uri = format!("/api/v1/chat/sessions/{}", s1);

    let resp = call(&t.router, "PATCH", &uri, Some("u1"), Some(json!({ "systemPrompt": "be brief", "topK": 5 }))).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body["data"]["title"], "draft");
    assert_eq!(resp.body["data"]["systemPrompt"], "be brief");
    assert_eq!(resp.body["data"]["topK"], 5);

    let resp = call(&t.router, "POST", &format!("{}/pin?pinned=true", uri), Some("u1"), None).await;
    assert_eq!(resp.status, StatusCode::OK);
    let resp = call(&t.router, "POST", &format!("{}/archive?archived=true", uri), Some("u1"), None).await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = call(&t.router, "GET", &uri, Some("u1"), None).await;
    assert_eq!(resp.body["data"]["pinned"], true);
    assert_eq!(resp.body["data"]["archived"], true);

    let resp = call(&t.router, "GET", "/api/v1/chat/sessions?pinned=true", Some("u1"), None).await;
    assert_eq!(resp.body["data"]["total"], 1);

    let resp = call(&t.router, "DELETE", &uri, Some("u1"), None).await;
    assert_eq!(resp.status, StatusCode::OK);
    let resp = call(&t.router, "GET", &uri, Some("u1"), None).await;
    assert_eq!(resp.body["code"], 571);
    let resp = call(&t.router, "DELETE", &uri, Some("u1"), None).await;
    assert_eq!(resp.body["code"], 571);
}

#[tokio::test]
async fn test_search_and_messages() {
    let t = test_app(ScriptedClient::instant());
    let chat = call(&t.router, "POST", "/api/v1/chat", Some("u1"), Some(json!({ "message": "tell me about otters" }))).await;
    let session_id = chat.body["data"]["sessionId"].as_str().unwrap().to_string();
    let assistant_id = chat.body["data"]["assistantMessage"]["id"].as_str().unwrap().to_string();

    let resp = call(&t.router, "GET", "/api/v1/chat/sessions/search?keyword=OTTERS", Some("u1"), None).await;
    assert_eq!(resp.body["data"]["total"], 1);
    let resp = call(&t.router, "GET", "/api/v1/chat/sessions/search?keyword=otters", Some("u2"), None).await;
    assert_eq!(resp.body["data"]["total"], 0);

    let resp = call(
        &t.router,
        "GET",
        &format!("/api/v1/chat/sessions/{}/messages?pageNo=1&pageSize=1", session_id),
        Some("u1"),
        None,
    )
    .await;
    assert_eq!(resp.body["data"]["total"], 2);
    assert_eq!(resp.body["data"]["items"][0]["role"], "user");

    let resp = call(&t.router, "GET", &format!("/api/v1/chat/messages/{}", assistant_id), Some("u1"), None).await;
    assert_eq!(resp.body["data"]["role"], "assistant");
    let resp = call(&t.router, "GET", &format!("/api/v1/chat/messages/{}", assistant_id), Some("u2"), None).await;
    assert_eq!(resp.body["code"], 581);

    let resp = call(&t.router, "POST", &format!("/api/v1/chat/messages/{}/abort", assistant_id), Some("u1"), None).await;
    assert_eq!(resp.status, StatusCode::OK);
    let resp = call(&t.router, "POST", "/api/v1/chat/messages/unknown/abort", Some("u1"), None).await;
    assert_eq!(resp.status, StatusCode::OK);
}

// ===========================================================================
// Concurrency: N sends on one session keep sequences dense
// ===========================================================================
#[tokio::test]
async fn test_concurrent_sends_on_one_session() {
    let t = test_app(ScriptedClient::sleeping(Duration::from_millis(5)));
    let s1 = create_session(&t.router, "u1", "busy").await;

    let sends: Vec<_> = (0..8)
        .map(|i| {
            let router = t.router.clone();
            let uri = format!("/api/v1/chat/sessions/{}/messages", s1);
            tokio::spawn(async move {
                call(&router, "POST", &uri, Some("u1"), Some(json!({ "message": format!("m{}", i) }))).await
            })
        })
        .collect();

    for send in futures::future::join_all(sends).await {
        let resp = send.unwrap();
        assert!(
            resp.body["code"] == 200 || resp.body["code"] == 582,
            "unexpected {}",
            resp.body
        );
    }

    let (messages, total) = t
        .store
        .list_messages(&s1, parley_core::store::Page::new(1, 100))
        .await
        .unwrap();
    let sequences: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, (1..=total as i64).collect::<Vec<_>>());
    let session = t.store.get_session(&s1).await.unwrap();
    assert_eq!(session.message_count as u64, total);
}
