//! HTTP Gateway Tests
//!
//! Drives the axum router in process with `tower::ServiceExt::oneshot`:
//! - Page views answer with the visit count and position headers
//! - Remote failures surface as 5xx, never as success
//! - `/write` is served only when enabled

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::watch;
use tower::ServiceExt;
use walgate::client::{MemoryReplicaClient, ReplicaClient};
use walgate::gateway::{Gateway, GatewayConfig};
use walgate::http_server::{HttpServer, POST_POSITION_HEADER, PRE_POSITION_HEADER, SHIP_MS_HEADER};
use walgate::replication::{Position, Replica};

// =============================================================================
// Test Utilities
// =============================================================================

struct Harness {
    gateway: Arc<Gateway>,
    client: Arc<MemoryReplicaClient>,
    _shutdown: watch::Sender<bool>,
    router: Router,
    _dir: TempDir,
}

async fn harness(expose_sql_endpoint: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = GatewayConfig {
        dsn: dir.path().join("app.db").to_string_lossy().into_owned(),
        replica_dir: dir.path().join("replica").to_string_lossy().into_owned(),
        monitor_interval_ms: 50,
        shutdown_grace_ms: 1000,
        expose_sql_endpoint,
        ..GatewayConfig::default()
    };
    let client = Arc::new(MemoryReplicaClient::new());
    let replica = Replica::new("memory", client.clone() as Arc<dyn ReplicaClient>);
    let gateway = Arc::new(Gateway::open_with(config, vec![replica]).await.unwrap());

    let (shutdown, rx) = watch::channel(false);
    let router = HttpServer::new(gateway.clone(), rx).router();
    Harness {
        gateway,
        client,
        _shutdown: shutdown,
        router,
        _dir: dir,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

// =============================================================================
// Page views
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_page_view_returns_count_and_positions() {
    let h = harness(false).await;

    let (status, headers, body) = send(&h.router, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "This server has been visited 1 times.");
    let first: Position = headers[&POST_POSITION_HEADER].to_str().unwrap().parse().unwrap();
    assert!(headers.contains_key(&PRE_POSITION_HEADER));
    assert!(headers[&SHIP_MS_HEADER].to_str().unwrap().parse::<u64>().is_ok());

    let post = Request::builder().method("POST").uri("/").body(Body::empty()).unwrap();
    let (status, headers, body) = send(&h.router, post).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "This server has been visited 2 times.");
    let second: Position = headers[&POST_POSITION_HEADER].to_str().unwrap().parse().unwrap();
    assert!(second > first);

    h.gateway.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_failure_is_service_unavailable() {
    let h = harness(false).await;
    h.client.set_fail_writes(true);

    let (status, _, body) = send(&h.router, get("/")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["committed"], json!(true));
    assert_eq!(body["step"], json!("confirm"));
    assert!(body["position"].is_string());

    h.client.set_fail_writes(false);
    h.gateway.close().await.unwrap();
}

// =============================================================================
// Generic writes
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_write_endpoint_disabled_by_default() {
    let h = harness(false).await;
    let request = Request::builder()
        .method("POST")
        .uri("/write")
        .header("content-type", "application/json")
        .body(Body::from(json!({"statements": [{"sql": "SELECT 1"}]}).to_string()))
        .unwrap();

    let (status, _, _) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    h.gateway.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_endpoint_returns_receipt() {
    let h = harness(true).await;
    let payload = json!({
        "statements": [
            {"sql": "CREATE TABLE notes (body TEXT)"},
            {"sql": "INSERT INTO notes VALUES (?1)", "params": ["hello"]}
        ],
        "reads": [{"sql": "SELECT body FROM notes"}]
    });
    let request = Request::builder()
        .method("POST")
        .uri("/write")
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();

    let (status, _, body) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::OK);
    let receipt: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(receipt["reads"][0]["rows"], json!([["hello"]]));
    assert!(receipt["post_position"].is_string());

    let bad = Request::builder()
        .method("POST")
        .uri("/write")
        .header("content-type", "application/json")
        .body(Body::from(json!({"statements": []}).to_string()))
        .unwrap();
    let (status, _, _) = send(&h.router, bad).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    h.gateway.close().await.unwrap();
}

// =============================================================================
// Observability
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_health_status_and_metrics() {
    let h = harness(false).await;
    send(&h.router, get("/")).await;

    let (status, _, body) = send(&h.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], json!("ok"));

    let (status, _, body) = send(&h.router, get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    let state: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(state["restore"], json!("no_generation_found"));
    assert_eq!(state["durability"], json!("all"));
    assert_eq!(state["replication"]["replicas"][0]["name"], json!("memory"));

    let (status, _, body) = send(&h.router, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let metrics: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(metrics["writes_acknowledged"], json!(1));

    h.gateway.close().await.unwrap();
    let (status, _, _) = send(&h.router, get("/status")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
