#![allow(dead_code)]

use axum::body::{to_bytes, Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use telemon_common::codec;
use telemon_common::types::Metric;
use telemon_server::app;
use telemon_server::config::ServerConfig;
use telemon_server::service::MetricService;
use telemon_server::state::AppState;
use telemon_storage::memory::MemStorage;
use telemon_storage::Storage;
use tempfile::TempDir;
use tower::util::ServiceExt;

pub struct TestContext {
    pub temp_dir: TempDir,
    pub storage: Arc<dyn Storage>,
    pub state: AppState,
    pub app: axum::Router,
}

pub fn build_test_context() -> TestContext {
    build_test_context_with(ServerConfig::default())
}

pub fn build_test_context_with(config: ServerConfig) -> TestContext {
    let temp_dir = tempfile::tempdir().expect("temp dir should be created");
    let storage: Arc<dyn Storage> = Arc::new(MemStorage::new(tracing::Span::none()));
    let state = AppState::new(config, MetricService::new(storage.clone()))
        .expect("state should build");
    let app = app::build_http_app(state.clone());
    TestContext {
        temp_dir,
        storage,
        state,
        app,
    }
}

pub async fn send(app: &axum::Router, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let resp = app
        .clone()
        .oneshot(req)
        .await
        .expect("request should be handled");
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body should read");
    (status, headers, bytes)
}

fn to_json(bytes: &Bytes) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).to_string()))
    }
}

pub async fn request_json(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Value,
) -> (StatusCode, Value, Option<String>) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request should build");
    let (status, headers, bytes) = send(app, req).await;
    let trace_id = headers
        .get("x-trace-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());
    (status, to_json(&bytes), trace_id)
}

pub async fn request_no_body(
    app: &axum::Router,
    method: &str,
    uri: &str,
) -> (StatusCode, String) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    let (status, _, bytes) = send(app, req).await;
    (status, String::from_utf8_lossy(&bytes).to_string())
}

/// A batch request framed the way the agent frames it, minus encryption
/// and signing.
pub fn gzip_batch_request(metrics: &[Metric]) -> Request<Body> {
    let json = serde_json::to_vec(metrics).expect("batch should serialize");
    gzip_body_request(&json)
}

pub fn gzip_body_request(body: &[u8]) -> Request<Body> {
    Request::post("/updates/")
        .header("Content-Type", "application/json")
        .header("Content-Encoding", "gzip")
        .body(Body::from(codec::compress(body).expect("gzip should work")))
        .expect("request should build")
}

pub fn assert_err_envelope(body: &Value, expected_code: i64) {
    assert_eq!(body["err_code"], expected_code, "{body}");
    assert!(body["err_msg"].as_str().is_some(), "{body}");
    assert!(body["trace_id"].as_str().is_some(), "{body}");
    assert!(body["data"].is_null(), "{body}");
}
