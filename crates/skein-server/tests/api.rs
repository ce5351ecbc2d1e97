use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body, BodyDataStream};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use skein_core::scheduler::MemoryTaskStore;
use skein_core::KernelConfig;
use skein_server::{build_router, AppState};

fn app() -> (Router, AppState) {
    let state = AppState::new(
        KernelConfig::default(),
        Arc::new(MemoryTaskStore::new()),
        &HashMap::new(),
    );
    (build_router(state.clone()), state)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).expect("request"))
        .await
        .expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, _) = app();
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = send(&app, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn second_run_for_busy_agent_conflicts_until_released() {
    let (app, state) = app();
    let req = json!({ "agent_id": "agent-1", "run_type": "user" });

    let (status, run) = send(&app, Method::POST, "/api/runs", Some(req.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let run_id = run["run_id"].as_str().expect("run id").to_string();
    assert_eq!(run["agent_key"], "agent-1");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/runs",
        Some(json!({ "agent_id": "agent-1", "run_type": "heartbeat" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let (status, body) = send(&app, Method::GET, "/api/runs/agent-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], true);
    assert_eq!(body["run_types"], json!(["user"]));

    let uri = format!("/api/runs/{run_id}");
    let (status, _) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, Method::POST, "/api/runs", Some(req)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(state.run_leases.read().await.len(), 1);
}

#[tokio::test]
async fn allowed_concurrent_run_type_is_admitted() {
    let (app, _) = app();
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/runs",
        Some(json!({ "agent_name": "Scout", "workspace": "/srv/a", "run_type": "heartbeat" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, run) = send(
        &app,
        Method::POST,
        "/api/runs",
        Some(json!({
            "agent_name": "scout",
            "workspace": "/srv/a",
            "run_type": "user",
            "allow_concurrent": ["heartbeat"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(run["agent_key"].as_str().expect("key").starts_with("agent:"));
}

#[tokio::test]
async fn run_request_without_identity_is_rejected() {
    let (app, _) = app();
    let (status, _) = send(&app, Method::POST, "/api/runs", Some(json!({ "run_type": "user" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn tasks_enqueue_list_and_cancel() {
    let (app, _) = app();

    let (status, task) = send(
        &app,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "key": "nightly",
            "kind": "planned",
            "scheduled_at": "2030-01-01T00:00:00Z",
            "context": { "agent_key": "agent-1" },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = task["id"].as_str().expect("id").to_string();
    assert_eq!(task["status"], "queued");

    let (status, _) = send(&app, Method::POST, "/api/tasks", Some(json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, listed) = send(
        &app,
        Method::GET,
        "/api/tasks?status=queued&ctx.agent_key=agent-1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
    assert_eq!(listed[0]["id"], id.as_str());

    let (status, fetched) = send(&app, Method::GET, &format!("/api/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["key"], "nightly");

    let (status, cancelled) = send(
        &app,
        Method::POST,
        &format!("/api/tasks/{id}/cancel"),
        Some(json!({ "reason": "no longer needed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");
    assert_eq!(cancelled["last_error"], "no longer needed");

    let (status, _) = send(&app, Method::POST, "/api/tasks/task_missing/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_task_input_is_a_bad_request() {
    let (app, _) = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/tasks",
        Some(json!({ "kind": "planned" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, _) = send(&app, Method::GET, "/api/tasks?status=sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn repair_with_nothing_running_is_empty() {
    let (app, _) = app();
    let (status, body) = send(&app, Method::POST, "/api/tasks/repair", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requeued"], json!([]));
    assert_eq!(body["failed"], json!([]));
}

#[tokio::test]
async fn state_events_replay_and_clear() {
    let (app, state) = app();
    for n in 0..3 {
        state.sync.publish("demo", "tick", json!({ "n": n }), Some("running"));
    }

    let (status, snapshot) = send(&app, Method::GET, "/api/state/demo", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["seq"], 3);
    assert_eq!(snapshot["status"], "running");

    let (status, body) = send(&app, Method::GET, "/api/state/demo/events?since=1", None).await;
    assert_eq!(status, StatusCode::OK);
    let seqs: Vec<u64> = body["events"]
        .as_array()
        .expect("events")
        .iter()
        .filter_map(|e| e["seq"].as_u64())
        .collect();
    assert_eq!(seqs, vec![2, 3]);
    assert_eq!(body["events"][0]["type"], "tick");
    assert_eq!(body["truncated"], false);

    let (status, channels) = send(&app, Method::GET, "/api/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(channels.as_array().map(Vec::len), Some(1));

    let (status, _) = send(&app, Method::DELETE, "/api/state/demo", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, snapshot) = send(&app, Method::GET, "/api/state/demo", None).await;
    assert_eq!(snapshot["seq"], 0);
    assert_eq!(snapshot["status"], "idle");
}

#[tokio::test]
async fn repair_with_huge_max_age_reports_nothing() {
    let (app, state) = app();
    state
        .scheduler
        .enqueue(skein_core::EnqueueTaskInput::adhoc())
        .await
        .expect("enqueue");
    let acquired = state
        .scheduler
        .acquire_due_tasks(1, chrono::Utc::now())
        .await
        .expect("acquire");
    assert_eq!(acquired.len(), 1);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/tasks/repair",
        Some(json!({ "max_age_ms": 10_000_000_000_000_000_u64 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requeued"], json!([]));
    assert_eq!(body["failed"], json!([]));
}

async fn next_frame(frames: &mut BodyDataStream) -> String {
    let chunk = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .expect("frame in time")
        .expect("stream open")
        .expect("chunk");
    String::from_utf8(chunk.to_vec()).expect("utf8")
}

#[tokio::test]
async fn state_stream_sends_snapshot_then_updates() {
    let (app, state) = app();
    state.sync.publish("live", "tick", json!({ "n": 1 }), Some("running"));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/state/live/stream")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let mut frames = response.into_body().into_data_stream();

    let first = next_frame(&mut frames).await;
    assert!(first.starts_with("event: snapshot\n"), "{first}");
    assert!(first.contains("\"seq\":1"), "{first}");

    state.sync.publish("live", "tick", json!({ "n": 2 }), None);
    let second = next_frame(&mut frames).await;
    assert!(second.starts_with("event: update\n"), "{second}");
    assert!(second.contains("\"seq\":2"), "{second}");
    assert!(second.contains("\"type\":\"tick\""), "{second}");
}
