use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use futures::channel::mpsc;
use futures::StreamExt;
use remote_bridge::model::CommandEnvelope;
use remote_bridge::{BridgeConfig, InboundFrame, MemorySink, OutboundFrame, RemoteBridge, TenantId};
use serde_json::{json, Value};
use tower::ServiceExt;

fn bridge() -> RemoteBridge {
    RemoteBridge::new(BridgeConfig {
        heartbeat_interval_ms: 0,
        ..BridgeConfig::default()
    })
    .unwrap()
}

async fn call(bridge: &RemoteBridge, request: Request<Body>) -> (StatusCode, Value) {
    let response = bridge.clone().build().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Attaches an in-memory browser that echoes every command's params back.
fn attach_echo_browser(bridge: &RemoteBridge, tenant: &TenantId) {
    let (sink, mut outbound) = MemorySink::pair();
    let (inbound, frames) = mpsc::unbounded::<Result<InboundFrame, std::io::Error>>();
    let handle = bridge.attach(tenant, sink);
    let runner = bridge.clone();
    tokio::spawn(async move { runner.run_connection(handle, frames).await });
    tokio::spawn(async move {
        while let Some(frame) = outbound.next().await {
            let OutboundFrame::Text(text) = frame else {
                continue;
            };
            let Ok(command) = serde_json::from_str::<CommandEnvelope>(&text) else {
                continue;
            };
            let reply = json!({
                "request_id": command.request_id,
                "success": true,
                "data": {"command": command.command, "echo": command.params},
            });
            if inbound
                .unbounded_send(Ok(InboundFrame::Text(reply.to_string())))
                .is_err()
            {
                break;
            }
        }
    });
}

#[tokio::test]
async fn status_reports_counts() {
    let bridge = bridge();
    let (status, body) = call(&bridge, get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ready": true, "connections": 0, "pending": 0}));

    attach_echo_browser(&bridge, &TenantId::parse("t1").unwrap());
    let (_, body) = call(&bridge, get("/status")).await;
    assert_eq!(body["connections"], 1);
}

#[tokio::test]
async fn tenant_status_reflects_lifecycle() {
    let bridge = bridge();
    let (status, body) = call(&bridge, get("/v1/tenants/t1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "disconnected");
    assert_eq!(body["generation"], Value::Null);
    assert_eq!(body["in_flight"], 0);

    attach_echo_browser(&bridge, &TenantId::parse("t1").unwrap());
    let (_, body) = call(&bridge, get("/v1/tenants/t1")).await;
    assert_eq!(body["state"], "live");
    assert!(body["generation"].as_u64().is_some());
    assert!(body["opened_at"].as_str().is_some());
}

#[tokio::test]
async fn run_command_returns_reply_data() {
    let bridge = bridge();
    attach_echo_browser(&bridge, &TenantId::parse("t1").unwrap());

    let (status, body) = call(
        &bridge,
        post_json(
            "/v1/tenants/t1/commands",
            json!({"command": "navigate", "params": {"url": "https://example.com"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["request_id"].as_str().is_some());
    assert_eq!(
        body["data"],
        json!({"command": "navigate", "echo": {"url": "https://example.com"}})
    );
}

#[tokio::test]
async fn run_command_without_connection_is_not_found() {
    let bridge = bridge();
    let (status, body) = call(
        &bridge,
        post_json("/v1/tenants/ghost/commands", json!({"command": "ping"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NO_CONNECTION");
}

#[tokio::test]
async fn run_command_times_out_with_gateway_timeout() {
    let bridge = bridge();
    let tenant = TenantId::parse("mute").unwrap();
    let (sink, _outbound) = MemorySink::pair();
    let (_inbound, frames) = mpsc::unbounded::<Result<InboundFrame, std::io::Error>>();
    let handle = bridge.attach(&tenant, sink);
    let runner = bridge.clone();
    tokio::spawn(async move { runner.run_connection(handle, frames).await });

    let started = std::time::Instant::now();
    let (status, body) = call(
        &bridge,
        post_json(
            "/v1/tenants/mute/commands",
            json!({"command": "ping", "timeout_ms": 100}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["code"], "TIMEOUT");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn invalid_tenant_is_bad_request() {
    let bridge = bridge();
    let long = "x".repeat(200);
    let (status, body) = call(&bridge, get(&format!("/v1/tenants/{long}"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_TENANT");
}
