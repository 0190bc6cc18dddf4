mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{assert_err_envelope, build_test_context, request_json, request_no_body, send};
use serde_json::json;
use telemon_common::types::Metric;

#[tokio::test]
async fn json_update_echoes_accumulated_counter() {
    let ctx = build_test_context();
    let metric = json!({"id": "PollCount", "type": "counter", "delta": 2});

    let (status, body, trace) = request_json(&ctx.app, "POST", "/update/", metric.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"id": "PollCount", "type": "counter", "delta": 2}));
    assert!(trace.is_some());

    let (_, body, _) = request_json(&ctx.app, "POST", "/update/", metric).await;
    assert_eq!(body["delta"], 4);
}

#[tokio::test]
async fn json_update_rejections() {
    let ctx = build_test_context();

    let (status, body, _) =
        request_json(&ctx.app, "POST", "/update/", json!({"id": "", "type": "gauge", "value": 1})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_err_envelope(&body, 1004);

    let (status, body, _) =
        request_json(&ctx.app, "POST", "/update/", json!({"id": "g", "type": "gauge"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_err_envelope(&body, 1001);

    let (status, _, _) =
        request_json(&ctx.app, "POST", "/update/", json!({"id": "g", "type": "summary", "value": 1})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let req = Request::post("/update/")
        .header("Content-Type", "text/plain")
        .body(Body::from(r#"{"id":"g","type":"gauge","value":1}"#))
        .unwrap();
    let (status, _, _) = send(&ctx.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn kind_is_fixed_by_first_write() {
    let ctx = build_test_context();
    let (status, _) = request_no_body(&ctx.app, "POST", "/update/gauge/X/1.5").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request_no_body(&ctx.app, "POST", "/update/counter/X/1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(ctx.storage.read_gauge("X").await.unwrap().value, Some(1.5));
}

#[tokio::test]
async fn path_update_and_text_value() {
    let ctx = build_test_context();

    assert_eq!(
        request_no_body(&ctx.app, "POST", "/update/gauge/Alloc/0.25").await.0,
        StatusCode::OK
    );
    assert_eq!(
        request_no_body(&ctx.app, "POST", "/update/counter/Hits/3").await.0,
        StatusCode::OK
    );
    assert_eq!(
        request_no_body(&ctx.app, "POST", "/update/counter/Hits/4").await.0,
        StatusCode::OK
    );

    assert_eq!(
        request_no_body(&ctx.app, "GET", "/value/gauge/Alloc").await,
        (StatusCode::OK, "0.25".to_string())
    );
    assert_eq!(
        request_no_body(&ctx.app, "GET", "/value/counter/Hits").await,
        (StatusCode::OK, "7".to_string())
    );
}

#[tokio::test]
async fn path_update_rejections() {
    let ctx = build_test_context();
    assert_eq!(
        request_no_body(&ctx.app, "POST", "/update/histogram/h/1").await.0,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        request_no_body(&ctx.app, "POST", "/update/counter/c/1.5").await.0,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        request_no_body(&ctx.app, "POST", "/update/gauge/g/abc").await.0,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        request_no_body(&ctx.app, "POST", "/update/gauge/").await.0,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn value_lookups() {
    let ctx = build_test_context();
    ctx.storage.write(&Metric::gauge("Alloc", 2.0)).await.unwrap();

    let (status, body, _) =
        request_json(&ctx.app, "POST", "/value/", json!({"id": "Alloc", "type": "gauge"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"id": "Alloc", "type": "gauge", "value": 2.0}));

    let (status, body, _) =
        request_json(&ctx.app, "POST", "/value/", json!({"id": "Alloc", "type": "counter"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_err_envelope(&body, 1004);

    let (status, body, _) =
        request_json(&ctx.app, "POST", "/value/", json!({"id": "Alloc", "type": "histogram"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_err_envelope(&body, 1004);

    assert_eq!(
        request_no_body(&ctx.app, "GET", "/value/gauge/Missing").await.0,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        request_no_body(&ctx.app, "GET", "/value/histogram/Alloc").await.0,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn index_lists_metrics_sorted() {
    let ctx = build_test_context();
    ctx.storage.write(&Metric::gauge("b", 1.5)).await.unwrap();
    ctx.storage.write(&Metric::counter("a", 3)).await.unwrap();

    let (status, html) = request_no_body(&ctx.app, "GET", "/").await;
    assert_eq!(status, StatusCode::OK);
    let a = html.find("<li>a = 3</li>").expect("counter listed");
    let b = html.find("<li>b = 1.5</li>").expect("gauge listed");
    assert!(a < b);
}

#[tokio::test]
async fn responses_are_gzipped_on_request() {
    let ctx = build_test_context();
    for i in 0..20 {
        ctx.storage
            .write(&Metric::gauge(format!("metric{i}"), i as f64))
            .await
            .unwrap();
    }
    let req = Request::get("/")
        .header("Accept-Encoding", "gzip")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&ctx.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-encoding"], "gzip");
    let html = telemon_common::codec::decompress(&body).unwrap();
    assert!(String::from_utf8(html).unwrap().contains("metric19"));
}

#[tokio::test]
async fn ping_reports_backend_health() {
    let ctx = build_test_context();
    assert_eq!(request_no_body(&ctx.app, "GET", "/ping").await.0, StatusCode::OK);
}

#[tokio::test]
async fn ping_fails_once_relational_backend_is_closed() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("metrics.db").display());
    let storage = telemon_storage::open(
        &telemon_storage::StorageConfig {
            database_url: Some(url),
            ..Default::default()
        },
        tracing::Span::none(),
    )
    .await
    .unwrap();
    let state = telemon_server::state::AppState::new(
        telemon_server::config::ServerConfig::default(),
        telemon_server::service::MetricService::new(storage.clone()),
    )
    .unwrap();
    let app = telemon_server::app::build_http_app(state);

    assert_eq!(request_no_body(&app, "GET", "/ping").await.0, StatusCode::OK);
    storage.close().await.unwrap();
    assert_eq!(
        request_no_body(&app, "GET", "/ping").await.0,
        StatusCode::INTERNAL_SERVER_ERROR
    );
}
