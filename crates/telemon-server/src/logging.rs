use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use rand::Rng;
use std::time::Instant;
use tracing::Instrument;

use crate::api::{error_response, MAX_BODY_BYTES};
use crate::middleware::PanicRecovered;

pub static TRACE_ID_HEADER: HeaderName = HeaderName::from_static("x-trace-id");

/// Per-request trace id, stored in request extensions and echoed in the
/// `X-Trace-Id` response header.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    /// Reuses a caller-supplied id when it is short hex, otherwise mints one
    /// from 8 random bytes.
    fn for_request(headers: &HeaderMap) -> Self {
        let forwarded = headers
            .get(&TRACE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|id| (8..=32).contains(&id.len()) && id.bytes().all(|b| b.is_ascii_hexdigit()));
        match forwarded {
            Some(id) => TraceId(id.to_ascii_lowercase()),
            None => {
                let raw: u64 = rand::thread_rng().gen();
                TraceId(format!("{raw:016x}"))
            }
        }
    }
}

impl std::ops::Deref for TraceId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

const SNIPPET_LIMIT: usize = 200;

/// What the log line shows for a body: readable JSON up to the snippet
/// limit, or just its size and encoding.
fn describe_body(headers: &HeaderMap, bytes: &[u8]) -> String {
    if let Some(encoding) = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
    {
        return format!("<{} bytes {encoding}>", bytes.len());
    }
    let Ok(text) = std::str::from_utf8(bytes) else {
        return format!("<{} bytes binary>", bytes.len());
    };
    if text.len() <= SNIPPET_LIMIT {
        return text.to_string();
    }
    let mut cut = SNIPPET_LIMIT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... ({} bytes)", &text[..cut], text.len())
}

fn carries_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"))
}

/// Outermost layer. Assigns the trace id, opens an `http` span for the rest
/// of the stack and logs the request and its outcome. Request bodies are
/// only buffered for JSON POSTs; response bodies only for errors.
pub async fn request_logging(mut req: Request, next: Next) -> Response {
    let trace_id = TraceId::for_request(req.headers());
    req.extensions_mut().insert(trace_id.clone());

    let span = tracing::info_span!(
        "http",
        trace_id = %trace_id.0,
        method = %req.method(),
        path = %req.uri().path(),
    );

    async move {
        let origin = req
            .headers()
            .get(telemon_common::REAL_IP_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();

        let req = if req.method() == Method::POST && carries_json(req.headers()) {
            let (parts, body) = req.into_parts();
            let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "Request body rejected");
                    return with_trace_header(
                        error_response(
                            StatusCode::PAYLOAD_TOO_LARGE,
                            &trace_id,
                            "payload_too_large",
                            "request body too large",
                        ),
                        &trace_id,
                    );
                }
            };
            tracing::info!(origin = %origin, body = %describe_body(&parts.headers, &bytes), "Request");
            Request::from_parts(parts, Body::from(bytes))
        } else {
            tracing::info!(origin = %origin, "Request");
            req
        };

        let started = Instant::now();
        let mut response = next.run(req).await;
        if response.extensions().get::<PanicRecovered>().is_some() {
            response = error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &trace_id,
                "internal_error",
                "internal server error",
            );
        }
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let status = response.status();

        let response = if status.is_client_error() || status.is_server_error() {
            let (parts, body) = response.into_parts();
            let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
                .await
                .unwrap_or_else(|_| Bytes::new());
            let detail = describe_body(&parts.headers, &bytes);
            if status.is_server_error() {
                tracing::error!(status = status.as_u16(), elapsed_ms, detail = %detail, "Response");
            } else {
                tracing::warn!(status = status.as_u16(), elapsed_ms, detail = %detail, "Response");
            }
            Response::from_parts(parts, Body::from(bytes))
        } else {
            tracing::info!(status = status.as_u16(), elapsed_ms, "Response");
            response
        };

        with_trace_header(response, &trace_id)
    }
    .instrument(span)
    .await
}

fn with_trace_header(mut response: Response, trace_id: &TraceId) -> Response {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER.clone(), value);
    }
    response
}
