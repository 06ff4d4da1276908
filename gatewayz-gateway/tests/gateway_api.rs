//! End-to-end surface tests against the assembled application.

use axum_test::TestServer;
use gatewayz_gateway::config::Config;
use gatewayz_gateway::server::create_server;
use gatewayz_gateway::storage::{MemoryStorage, Storage, User};
use serde_json::{json, Value};
use std::sync::Arc;

async fn test_server(storage: Arc<MemoryStorage>) -> TestServer {
    let mut config = Config::default();
    config.environment = "test".to_string();
    let app = create_server(config, storage as Arc<dyn Storage>)
        .await
        .expect("server should build");
    TestServer::new(app).expect("test server should start")
}

fn seeded_storage() -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert_user(
        "gw-test-key-0123456789abcdef",
        User {
            id: 1,
            api_key_id: 10,
            credits: 5.0,
            tier: "free".to_string(),
            stripe_subscription_id: None,
            subscription_status: None,
        },
    );
    storage
}

#[tokio::test]
async fn test_health_and_ready() {
    let server = test_server(seeded_storage()).await;

    let response = server.get("/health").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["status"], "healthy");

    let response = server.get("/ready").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn test_chat_requires_authorization_header() {
    let server = test_server(seeded_storage()).await;

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "openai/gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .await;

    response.assert_status_unauthorized();
    let body = response.json::<Value>();
    assert_eq!(body["error"]["code"], "invalid_api_key");
    assert_eq!(body["error"]["status"], 401);
    assert!(body["error"]["request_id"].is_string());
}

#[tokio::test]
async fn test_chat_rejects_empty_messages() {
    let server = test_server(seeded_storage()).await;

    let response = server
        .post("/v1/chat/completions")
        .authorization_bearer("gw-test-key-0123456789abcdef")
        .json(&json!({
            "model": "openai/gpt-4o",
            "messages": []
        }))
        .await;

    response.assert_status_bad_request();
    assert_eq!(response.json::<Value>()["error"]["code"], "validation_error");
}

#[tokio::test]
async fn test_unknown_api_key_gets_envelope() {
    let server = test_server(seeded_storage()).await;

    let response = server
        .post("/v1/chat/completions")
        .authorization_bearer("gw-unknown-key-0123456789")
        .json(&json!({
            "model": "openai/gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .await;

    response.assert_status_unauthorized();
    let body = response.json::<Value>();
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn test_metrics_exposition_format() {
    let server = test_server(seeded_storage()).await;

    let response = server.get("/metrics").await;
    response.assert_status_ok();
    let body = response.text();
    assert!(body.contains("concurrency_active_requests"));
    assert!(body.contains("gateway_uptime_seconds"));
}

#[tokio::test]
async fn test_diagnostics_concurrency_shape() {
    let server = test_server(seeded_storage()).await;

    let response = server.get("/api/diagnostics/concurrency").await;
    response.assert_status_ok();
    let body = response.json::<Value>();
    assert_eq!(body["limit"], 20);
    assert_eq!(body["queue_size"], 50);
    assert_eq!(body["health"], "healthy");
}

#[tokio::test]
async fn test_models_list_shape() {
    let server = test_server(seeded_storage()).await;

    let response = server.get("/v1/models").await;
    response.assert_status_ok();
    let body = response.json::<Value>();
    assert_eq!(body["object"], "list");
    assert!(body["data"].is_array());
}

#[tokio::test]
async fn test_code_router_inspection_and_dry_run() {
    let server = test_server(seeded_storage()).await;

    let info = server.get("/v1/routers/code").await;
    info.assert_status_ok();
    let body = info.json::<Value>();
    assert!(body["modes"]
        .as_array()
        .unwrap()
        .iter()
        .any(|m| m == "agentic"));

    let test = server
        .post("/v1/routers/code/test")
        .json(&json!({"prompt": "fix this bug in my python function", "mode": "quality"}))
        .await;
    test.assert_status_ok();
    let body = test.json::<Value>();
    assert_eq!(body["is_code_related"], true);
    assert_eq!(body["classification"]["category"], "debugging");
    assert!(body["route"]["model_id"].is_string());
}

#[tokio::test]
async fn test_general_router_inspection_and_dry_run() {
    let server = test_server(seeded_storage()).await;

    let info = server.get("/v1/routers/general").await;
    info.assert_status_ok();
    assert_eq!(
        info.json::<Value>()["fallback_models"]["latency"],
        "groq/llama-3.3-70b-versatile"
    );

    // No selector configured: the dry run reports the fallback path
    let test = server
        .post("/v1/routers/general/test")
        .json(&json!({"mode": "cost"}))
        .await;
    test.assert_status_ok();
    let body = test.json::<Value>();
    assert_eq!(body["route"]["fallback_used"], true);
    assert_eq!(body["route"]["model_id"], "openai/gpt-4o-mini");
}

#[tokio::test]
async fn test_circuit_breaker_diagnostics() {
    let server = test_server(seeded_storage()).await;

    let response = server.get("/api/diagnostics/circuit-breakers").await;
    response.assert_status_ok();
    let body = response.json::<Value>();
    assert!(body["open_circuits"].as_array().unwrap().is_empty());
}
