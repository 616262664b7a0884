use std::sync::Arc;

use serde_json::{Value, json};

use tabloom::engine::{EngineManager, ManagerConfig};
use tabloom::events::EventBus;
use tabloom::router::Router;
use tabloom::runtime::mock::MockRuntime;

const TARGET: &str = "offscreen";

fn build(runtime: MockRuntime) -> (Router, Arc<MockRuntime>) {
    let runtime = Arc::new(runtime);
    let manager = EngineManager::new(
        runtime.clone(),
        runtime.clone(),
        Arc::new(EventBus::default()),
        None,
        ManagerConfig {
            default_model: "tiny".to_string(),
        },
    );
    (Router::new(manager, TARGET), runtime)
}

async fn send(router: &Router, mut message: Value) -> Value {
    message["target"] = json!(TARGET);
    let response = router
        .route(&message)
        .await
        .expect("message for our target must be answered");
    serde_json::to_value(response).unwrap()
}

#[tokio::test]
async fn messages_for_other_targets_are_ignored() {
    let (router, runtime) = build(MockRuntime::new(Vec::<String>::new()));

    assert!(router.route(&json!({"target": "popup", "action": "init"})).await.is_none());
    assert!(router.route(&json!({"action": "init"})).await.is_none());
    assert_eq!(runtime.create_calls(), 0);
}

#[tokio::test]
async fn ping_answers_without_loading() {
    let (router, runtime) = build(MockRuntime::new(Vec::<String>::new()));

    let reply = send(&router, json!({"action": "ping"})).await;

    assert_eq!(reply, json!({"pong": true, "ready": false}));
    assert_eq!(runtime.create_calls(), 0);
}

#[tokio::test]
async fn status_before_anything_happened() {
    let (router, _) = build(MockRuntime::new(Vec::<String>::new()));

    let reply = send(&router, json!({"action": "get-status"})).await;

    assert_eq!(
        reply,
        json!({
            "ready": false,
            "modelId": null,
            "initializing": false,
            "lastActivityTimestamp": null,
        })
    );
}

#[tokio::test]
async fn init_then_status() {
    let (router, runtime) = build(MockRuntime::new(Vec::<String>::new()));

    let reply = send(&router, json!({"action": "init", "modelId": "small"})).await;
    assert_eq!(reply, json!({"success": true}));

    let status = send(&router, json!({"action": "get-status"})).await;
    assert_eq!(status["ready"], true);
    assert_eq!(status["modelId"], "small");
    assert_eq!(status["initializing"], false);
    assert!(status["lastActivityTimestamp"].as_i64().is_some());
    assert_eq!(runtime.calls().await, vec!["create:small"]);
}

#[tokio::test]
async fn init_without_model_uses_default() {
    let (router, runtime) = build(MockRuntime::new(Vec::<String>::new()));

    send(&router, json!({"action": "init"})).await;

    assert_eq!(runtime.calls().await, vec!["create:tiny"]);
}

#[tokio::test]
async fn init_failure_is_reported_not_raised() {
    let (router, _) = build(MockRuntime::new(Vec::<String>::new()).failing("CUDA driver version is insufficient"));

    let reply = send(&router, json!({"action": "init"})).await;

    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().contains("GPU acceleration is not available"));
}

#[tokio::test]
async fn group_tabs_round_trip() {
    let (router, _) = build(MockRuntime::new(vec![
        r#"OUTPUT: {"groups": [{"name": "Video", "ids": [1, 2]}]}"#,
    ]));

    let reply = send(
        &router,
        json!({
            "action": "group-tabs",
            "tabs": [
                {"id": 7, "title": "Docs", "url": "https://docs.rs"},
                {"id": 8, "title": "Clip", "url": "https://youtube.com/watch?v=1"},
                {"id": 9, "title": "Stream", "url": "https://twitch.tv/x"}
            ]
        }),
    )
    .await;

    assert_eq!(
        reply,
        json!({"success": true, "groups": [{"name": "Video", "tabIds": [8, 9]}]})
    );
}

#[tokio::test]
async fn group_tabs_init_failure_has_fixed_message() {
    let (router, _) = build(MockRuntime::new(Vec::<String>::new()).failing("boom"));

    let reply = send(
        &router,
        json!({"action": "group-tabs", "tabs": [{"id": 1, "title": "a", "url": "https://a.com"}]}),
    )
    .await;

    assert_eq!(reply, json!({"success": false, "error": "Failed to initialize AI"}));
}

#[tokio::test]
async fn group_tabs_parse_failure_is_reported() {
    let (router, _) = build(MockRuntime::new(vec!["no idea"]));

    let reply = send(
        &router,
        json!({
            "action": "group-tabs",
            "tabs": [
                {"id": 1, "title": "a", "url": "https://a.com"},
                {"id": 2, "title": "b", "url": "https://b.com"}
            ]
        }),
    )
    .await;

    assert_eq!(
        reply,
        json!({"success": false, "error": "no JSON found in model response"})
    );
}

#[tokio::test]
async fn chat_round_trip() {
    let (router, _) = build(MockRuntime::new(vec!["You have 3 tabs open."]));

    let reply = send(
        &router,
        json!({"action": "chat", "messages": [{"role": "user", "content": "How many tabs?"}]}),
    )
    .await;

    assert_eq!(reply, json!({"success": true, "response": "You have 3 tabs open."}));
}

#[tokio::test]
async fn warmup_primes_the_engine() {
    let (router, runtime) = build(MockRuntime::new(vec!["ok"]));

    let reply = send(&router, json!({"action": "warmup"})).await;

    assert_eq!(reply, json!({"success": true, "ready": true}));
    let requests = runtime.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].max_tokens, 1);
}

#[tokio::test]
async fn warmup_survives_a_failed_completion() {
    let (router, _) = build(MockRuntime::new(Vec::<String>::new()));

    let reply = send(&router, json!({"action": "warmup", "modelId": "m"})).await;

    assert_eq!(reply, json!({"success": true, "ready": true}));
}

#[tokio::test]
async fn warmup_reports_init_failure() {
    let (router, _) = build(MockRuntime::new(Vec::<String>::new()).failing("boom"));

    let reply = send(&router, json!({"action": "warmup"})).await;

    assert_eq!(reply["success"], false);
    assert_eq!(reply["ready"], false);
}

#[tokio::test]
async fn unload_always_succeeds() {
    let (router, runtime) = build(MockRuntime::new(Vec::<String>::new()).failing_unload("stuck"));

    assert_eq!(send(&router, json!({"action": "unload"})).await, json!({"success": true}));

    send(&router, json!({"action": "init"})).await;
    assert_eq!(send(&router, json!({"action": "unload"})).await, json!({"success": true}));

    assert_eq!(runtime.unload_calls(), 1);
    let ping = send(&router, json!({"action": "ping"})).await;
    assert_eq!(ping["ready"], false);
}

#[tokio::test]
async fn unknown_action_is_an_error_response() {
    let (router, _) = build(MockRuntime::new(Vec::<String>::new()));

    let reply = send(&router, json!({"action": "dance"})).await;

    assert_eq!(reply, json!({"success": false, "error": "unknown action: dance"}));
}

#[tokio::test]
async fn malformed_request_is_an_error_response() {
    let (router, runtime) = build(MockRuntime::new(Vec::<String>::new()));

    let reply = send(&router, json!({"action": "group-tabs", "tabs": "all of them"})).await;

    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().starts_with("invalid request"));
    assert_eq!(runtime.create_calls(), 0);
}
