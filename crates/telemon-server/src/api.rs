use crate::logging::TraceId;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write;
use telemon_common::error::MetricError;
use telemon_common::types::{Metric, MetricKind};
use telemon_storage::StorageError;

/// Upper bound for buffered request bodies.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Error envelope returned by every failing endpoint.
#[derive(Serialize)]
pub struct ApiError {
    pub err_code: i32,
    pub err_msg: String,
    pub trace_id: String,
    pub data: Option<Value>,
}

fn to_custom_error_code(code: &str) -> i32 {
    match code {
        "bad_request" => 1001,
        "not_found" => 1004,
        "untrusted_origin" => 1008,
        "signature_invalid" => 1009,
        "decrypt_failed" => 1010,
        "decompress_failed" => 1011,
        "payload_too_large" => 1012,
        "internal_error" => 1500,
        "storage_error" => 1501,
        _ => 1999,
    }
}

pub fn error_response(status: StatusCode, trace_id: &str, code: &str, msg: &str) -> Response {
    (
        status,
        Json(ApiError {
            err_code: to_custom_error_code(code),
            err_msg: msg.to_string(),
            trace_id: trace_id.to_string(),
            data: None,
        }),
    )
        .into_response()
}

/// Maps storage failures onto HTTP statuses. Anything that is not the
/// caller's fault is logged and reported as a 500.
pub fn storage_error_response(trace_id: &str, err: &StorageError) -> Response {
    match err {
        StorageError::NotFound { .. } => {
            error_response(StatusCode::NOT_FOUND, trace_id, "not_found", &err.to_string())
        }
        StorageError::WrongType { .. } | StorageError::Validation(_) => {
            error_response(StatusCode::BAD_REQUEST, trace_id, "bad_request", &err.to_string())
        }
        _ => {
            tracing::error!(trace_id = %trace_id, error = %err, "Storage failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                trace_id,
                "storage_error",
                &err.to_string(),
            )
        }
    }
}

/// Single-metric updates answer a missing id with 404 rather than 400.
fn update_error_response(trace_id: &str, err: &StorageError) -> Response {
    if matches!(err, StorageError::Validation(MetricError::EmptyId)) {
        return error_response(StatusCode::NOT_FOUND, trace_id, "not_found", &err.to_string());
    }
    storage_error_response(trace_id, err)
}

fn parse_json<T: DeserializeOwned>(
    trace_id: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<T, Response> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            trace_id,
            "bad_request",
            "Content-Type must be application/json",
        ));
    }
    serde_json::from_slice(body).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            trace_id,
            "bad_request",
            &format!("malformed JSON: {e}"),
        )
    })
}

async fn update_batch(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let metrics: Vec<Metric> = match parse_json(&trace_id, &headers, &body) {
        Ok(metrics) => metrics,
        Err(resp) => return resp,
    };
    match state.service.update_batch(&metrics).await {
        Ok(()) => {
            tracing::debug!(trace_id = %trace_id.0, count = metrics.len(), "Batch stored");
            StatusCode::OK.into_response()
        }
        Err(e) => storage_error_response(&trace_id, &e),
    }
}

async fn update_json(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let metric: Metric = match parse_json(&trace_id, &headers, &body) {
        Ok(metric) => metric,
        Err(resp) => return resp,
    };
    match state.service.update(&metric).await {
        Ok(stored) => Json(stored).into_response(),
        Err(e) => update_error_response(&trace_id, &e),
    }
}

async fn update_path(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((kind, id, value)): Path<(String, String, String)>,
) -> Response {
    let metric = match Metric::parse(&kind, &id, &value) {
        Ok(metric) => metric,
        Err(e) => return update_error_response(&trace_id, &StorageError::from(e)),
    };
    match state.service.update(&metric).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => update_error_response(&trace_id, &e),
    }
}

/// Kept as text so an unknown kind is a failed lookup, not malformed JSON.
#[derive(Debug, Deserialize)]
struct ValueRequest {
    id: String,
    #[serde(rename = "type", alias = "kind")]
    kind: String,
}

async fn value_json(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: ValueRequest = match parse_json(&trace_id, &headers, &body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let Ok(kind) = req.kind.parse::<MetricKind>() else {
        return error_response(
            StatusCode::NOT_FOUND,
            &trace_id,
            "not_found",
            &format!("unknown metric kind '{}'", req.kind),
        );
    };
    match state.service.value(kind, &req.id).await {
        Ok(metric) => Json(metric).into_response(),
        Err(e) => storage_error_response(&trace_id, &e),
    }
}

async fn value_text(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let Ok(kind) = kind.parse::<MetricKind>() else {
        return error_response(
            StatusCode::NOT_FOUND,
            &trace_id,
            "not_found",
            &format!("unknown metric kind '{kind}'"),
        );
    };
    match state.service.value(kind, &id).await {
        Ok(metric) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            metric.display_value(),
        )
            .into_response(),
        Err(e) => storage_error_response(&trace_id, &e),
    }
}

async fn ping(Extension(trace_id): Extension<TraceId>, State(state): State<AppState>) -> Response {
    match state.service.ping().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            tracing::error!(trace_id = %trace_id.0, error = %e, "Storage ping failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &trace_id,
                "storage_error",
                &e.to_string(),
            )
        }
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

async fn index(Extension(trace_id): Extension<TraceId>, State(state): State<AppState>) -> Response {
    let metrics = match state.service.all().await {
        Ok(metrics) => metrics,
        Err(e) => return storage_error_response(&trace_id, &e),
    };
    let mut page = String::from("<!DOCTYPE html>\n<html><head><title>telemon</title></head><body>\n<ul>\n");
    for metric in &metrics {
        let _ = writeln!(
            page,
            "<li>{} = {}</li>",
            escape_html(&metric.id),
            metric.display_value()
        );
    }
    page.push_str("</ul>\n</body></html>\n");
    Html(page).into_response()
}

/// Routes that accept metric data and therefore sit behind the ingestion
/// middleware.
pub fn ingestion_routes() -> Router<AppState> {
    Router::new()
        .route("/updates/", post(update_batch))
        .route("/update/", post(update_json))
        .route("/update/{kind}/{id}/{value}", post(update_path))
}

pub fn query_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/value/", post(value_json))
        .route("/value/{kind}/{id}", get(value_text))
        .route("/ping", get(ping))
}
