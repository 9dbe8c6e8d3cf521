use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use engine_bridge::router::{build_router_with_state, shutdown_bridge, AppState, AuthConfig};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use stdio_bridge::{BridgeConfig, Gateway, LaunchSpec, ProcessBridge};
use tower::util::ServiceExt;

struct TestApp {
    app: Router,
    state: Arc<AppState>,
}

impl TestApp {
    fn new() -> Self {
        Self::with_options(AuthConfig::disabled(), 5)
    }

    fn with_options(auth: AuthConfig, max_in_flight: usize) -> Self {
        Self::with_launch(mock_engine(), auth, max_in_flight)
    }

    fn with_launch(launch: LaunchSpec, auth: AuthConfig, max_in_flight: usize) -> Self {
        let config = BridgeConfig::new(launch).with_request_timeout(Duration::from_secs(5));
        let gateway = Gateway::new(ProcessBridge::new(config), max_in_flight);
        let (app, state) = build_router_with_state(Arc::new(AppState::new(auth, gateway)));
        Self { app, state }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("read body")
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };
        (status, headers, body)
    }

    async fn rpc(&self, body: Value) -> (StatusCode, axum::http::HeaderMap, Value) {
        self.send(rpc_request(body)).await
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .expect("request");
        let (status, _, body) = self.send(request).await;
        (status, body)
    }

    async fn shutdown(&self) {
        shutdown_bridge(&self.state).await;
    }
}

fn mock_engine() -> LaunchSpec {
    LaunchSpec::new(env!("CARGO_BIN_EXE_engine-bridge")).arg("mock-engine")
}

fn rpc_request(body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/v1/rpc")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn health_is_open_without_engine() {
    let app = TestApp::new();
    let (status, body) = app.get("/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));

    let (status, body) = app.get("/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], false);
    assert_eq!(body["spawnCount"], 0);
    assert_eq!(body["handshake"], "uninitialized");
    assert_eq!(body["droppedNotifications"], 0);
}

#[tokio::test]
async fn request_round_trip_echoes_caller_id() {
    let app = TestApp::new();
    let (status, _, body) = app
        .rpc(json!({
            "jsonrpc": "2.0",
            "id": "client-7",
            "method": "mock/echo",
            "params": {"text": "hello"}
        }))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], "client-7");
    assert_eq!(body["result"]["params"]["text"], "hello");
    assert!(body.get("error").is_none());

    let (_, status_body) = app.get("/v1/status").await;
    assert_eq!(status_body["running"], true);
    assert_eq!(status_body["generation"], 1);
    assert_eq!(status_body["handshake"], "ready");
    assert_eq!(status_body["serverInfo"]["serverInfo"]["name"], "mock-engine");
    app.shutdown().await;
}

#[tokio::test]
async fn engine_error_is_returned_in_the_envelope() {
    let app = TestApp::new();
    let (status, _, body) = app
        .rpc(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "mock/error",
            "params": {"code": -32050, "message": "nope"}
        }))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 3);
    assert_eq!(body["error"]["code"], -32050);
    assert_eq!(body["error"]["message"], "nope");
    assert_eq!(body["error"]["data"]["code"], -32050);
    assert!(body.get("result").is_none());
    app.shutdown().await;
}

#[tokio::test]
async fn notification_is_accepted() {
    let app = TestApp::new();
    let (status, _, body) = app
        .rpc(json!({"jsonrpc": "2.0", "method": "client/ping", "params": {}}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, Value::Null);
    app.shutdown().await;
}

#[tokio::test]
async fn malformed_bodies_are_rejected() {
    let app = TestApp::new();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/rpc")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("{}"))
        .expect("request");
    let (status, headers, body) = app.send(request).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("application/problem+json")
    );
    assert_eq!(body["status"], 415);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/rpc")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let (status, _, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "urn:engine-bridge:error:invalid_request");

    let (status, _, _) = app.rpc(json!({"jsonrpc": "2.0", "id": 1})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = app
        .rpc(json!({"jsonrpc": "2.0", "id": {"nested": true}, "method": "mock/echo"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, status_body) = app.get("/v1/status").await;
    assert_eq!(status_body["spawnCount"], 0);
}

#[tokio::test]
async fn token_is_required_when_configured() {
    let app = TestApp::with_options(AuthConfig::with_token("secret".to_string()), 5);

    let (status, _) = app.get("/v1/health").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.get("/v1/status").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], 401);

    let request = Request::builder()
        .method(Method::GET)
        .uri("/v1/status")
        .header(header::AUTHORIZATION, "Bearer secret")
        .body(Body::empty())
        .expect("request");
    let (status, _, _) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .method(Method::GET)
        .uri("/v1/status")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())
        .expect("request");
    let (status, _, _) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn over_capacity_is_refused_with_retry_after() {
    let app = Arc::new(TestApp::with_options(AuthConfig::disabled(), 1));

    // Warm the engine so the slow call below only measures its own sleep.
    let (status, _, _) = app
        .rpc(json!({"jsonrpc": "2.0", "id": 1, "method": "mock/echo"}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let slow = {
        let app = app.clone();
        tokio::spawn(async move {
            app.rpc(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "mock/sleep",
                "params": {"ms": 600, "value": "slow"}
            }))
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (status, headers, body) = app
        .rpc(json!({"jsonrpc": "2.0", "id": 3, "method": "mock/echo"}))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        headers.get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()),
        Some("1")
    );
    assert_eq!(body["type"], "urn:engine-bridge:error:capacity_exceeded");
    assert_eq!(body["details"]["maxInFlight"], 1);

    let (status, _, body) = slow.await.expect("slow call");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["value"], "slow");

    let (status, _, _) = app
        .rpc(json!({"jsonrpc": "2.0", "id": 4, "method": "mock/echo"}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, status_body) = app.get("/v1/status").await;
    assert_eq!(status_body["rejectedRequests"], 1);
    assert_eq!(status_body["inFlight"], 0);
    app.shutdown().await;
}

#[tokio::test]
async fn restart_starts_a_new_generation() {
    let app = TestApp::new();
    let (status, _, _) = app
        .rpc(json!({"jsonrpc": "2.0", "id": 1, "method": "mock/echo"}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/engine/restart")
        .body(Body::empty())
        .expect("request");
    let (status, _, _) = app.send(request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = app
        .rpc(json!({"jsonrpc": "2.0", "id": 2, "method": "mock/echo"}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, status_body) = app.get("/v1/status").await;
    assert_eq!(status_body["generation"], 2);
    assert_eq!(status_body["spawnCount"], 2);
    app.shutdown().await;
}

#[tokio::test]
async fn engine_exit_maps_to_bad_gateway() {
    let app = TestApp::new();
    let (status, _, body) = app
        .rpc(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "mock/exit",
            "params": {"code": 9}
        }))
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["type"], "urn:engine-bridge:error:process_exited");
    assert_eq!(body["details"]["exitCode"], 9);
    app.shutdown().await;
}

#[tokio::test]
async fn engine_runs_in_configured_directory_and_env() {
    let workdir = tempfile::tempdir().expect("create temp dir");
    let launch = mock_engine()
        .cwd(workdir.path())
        .env("ENGINE_BRIDGE_TEST_MARKER", "from-launch");
    let app = TestApp::with_launch(launch, AuthConfig::disabled(), 5);

    let (status, _, body) = app
        .rpc(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "mock/env",
            "params": {"name": "ENGINE_BRIDGE_TEST_MARKER"}
        }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["value"], "from-launch");

    let expected = workdir.path().canonicalize().expect("canonical temp dir");
    let reported = std::path::PathBuf::from(body["result"]["cwd"].as_str().expect("cwd"));
    assert_eq!(reported.canonicalize().expect("canonical cwd"), expected);
    app.shutdown().await;
}

#[tokio::test]
async fn openapi_lists_the_rpc_route() {
    let app = TestApp::new();
    let (status, body) = app.get("/v1/openapi.json").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/v1/rpc"]["post"].is_object());
    assert!(body["paths"]["/v1/events"]["get"].is_object());
}

#[tokio::test]
async fn unknown_routes_are_problem_documents() {
    let app = TestApp::new();
    let (status, body) = app.get("/v2/nothing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);
}
