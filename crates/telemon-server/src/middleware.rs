//! Request integrity and ingestion layers.
//!
//! Each layer buffers the body it needs, so they compose in any order; the
//! router applies them as signature, then decrypt, then trusted subnet, then
//! decompression.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::any::Any;
use std::net::IpAddr;
use telemon_common::error::WireError;
use telemon_common::{codec, signing, REAL_IP_HEADER};

use crate::api::{error_response, MAX_BODY_BYTES};
use crate::logging::TraceId;
use crate::state::AppState;

static HASH_HEADER: HeaderName = HeaderName::from_static("hashsha256");

fn trace_id(req: &Request<Body>) -> String {
    req.extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_default()
}

async fn buffer(req: Request<Body>, trace_id: &str) -> Result<(axum::http::request::Parts, Bytes), Response> {
    let (parts, body) = req.into_parts();
    match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => Ok((parts, bytes)),
        Err(e) => {
            tracing::warn!(trace_id = %trace_id, error = %e, "Failed to buffer request body");
            Err(error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                trace_id,
                "payload_too_large",
                "request body too large",
            ))
        }
    }
}

/// Rebuilds a request around a transformed body. The old length no longer
/// applies.
fn rebuild(mut parts: axum::http::request::Parts, body: impl Into<Bytes>) -> Request<Body> {
    parts.headers.remove(header::CONTENT_LENGTH);
    Request::from_parts(parts, Body::from(body.into()))
}

/// Verifies `HashSHA256` over the raw request body when a key is configured
/// and the header is present, and signs every response body.
///
/// Unsigned requests pass; a malformed or mismatching signature is rejected
/// with 400 before the body is decrypted or decompressed.
pub async fn signature(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let Some(key) = state.hash_key.clone() else {
        return next.run(req).await;
    };
    let trace_id = trace_id(&req);
    let (parts, bytes) = match buffer(req, &trace_id).await {
        Ok(buffered) => buffered,
        Err(resp) => return resp,
    };

    if let Some(header) = parts.headers.get(&HASH_HEADER) {
        let verified = header
            .to_str()
            .map_err(|_| WireError::MalformedSignature)
            .and_then(|sig| signing::verify(&key, &bytes, sig));
        if let Err(e) = verified {
            tracing::warn!(trace_id = %trace_id, error = %e, "Request rejected: bad signature");
            return error_response(
                StatusCode::BAD_REQUEST,
                &trace_id,
                "signature_invalid",
                &e.to_string(),
            );
        }
    }

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;

    let (mut parts, body) = response.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(trace_id = %trace_id, error = %e, "Failed to buffer response body");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &trace_id,
                "internal_error",
                "failed to sign response",
            );
        }
    };
    if let Ok(value) = HeaderValue::from_str(&signing::sign(&key, &body)) {
        parts.headers.insert(HASH_HEADER.clone(), value);
    }
    Response::from_parts(parts, Body::from(body))
}

/// Decrypts RSA-sealed ingestion bodies when a private key is configured.
pub async fn decrypt(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let Some(decryptor) = state.decryptor.clone() else {
        return next.run(req).await;
    };
    let trace_id = trace_id(&req);
    let (parts, bytes) = match buffer(req, &trace_id).await {
        Ok(buffered) => buffered,
        Err(resp) => return resp,
    };
    match decryptor.decrypt(&bytes) {
        Ok(plain) => next.run(rebuild(parts, plain)).await,
        Err(e) => {
            tracing::warn!(trace_id = %trace_id, error = %e, "Request rejected: undecryptable body");
            error_response(
                StatusCode::BAD_REQUEST,
                &trace_id,
                "decrypt_failed",
                &e.to_string(),
            )
        }
    }
}

/// Admits ingestion requests only from the trusted subnet, as claimed by
/// `X-Real-IP`. A no-op when no subnet is configured.
pub async fn trusted_subnet(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(subnet) = state.trusted_subnet else {
        return next.run(req).await;
    };
    let claimed = req
        .headers()
        .get(REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let trusted = claimed
        .parse::<IpAddr>()
        .map(|ip| subnet.contains(ip))
        .unwrap_or(false);
    if trusted {
        return next.run(req).await;
    }

    let trace_id = trace_id(&req);
    let err = WireError::UntrustedOrigin(claimed);
    tracing::warn!(trace_id = %trace_id, error = %err, "Request rejected: untrusted origin");
    error_response(
        StatusCode::FORBIDDEN,
        &trace_id,
        "untrusted_origin",
        &err.to_string(),
    )
}

/// Inflates bodies sent with `Content-Encoding: gzip`, up to the same limit
/// that applies to plain bodies.
pub async fn decompress(req: Request<Body>, next: Next) -> Response {
    let gzipped = req
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case(codec::GZIP))
        .unwrap_or(false);
    if !gzipped {
        return next.run(req).await;
    }
    let trace_id = trace_id(&req);
    let (mut parts, bytes) = match buffer(req, &trace_id).await {
        Ok(buffered) => buffered,
        Err(resp) => return resp,
    };
    match codec::decompress_limited(&bytes, MAX_BODY_BYTES) {
        Ok(plain) => {
            parts.headers.remove(header::CONTENT_ENCODING);
            next.run(rebuild(parts, plain)).await
        }
        Err(e @ WireError::TooLarge { .. }) => {
            tracing::warn!(trace_id = %trace_id, error = %e, "Request rejected: gzip body inflates too far");
            error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &trace_id,
                "payload_too_large",
                &e.to_string(),
            )
        }
        Err(e) => {
            tracing::warn!(trace_id = %trace_id, error = %e, "Request rejected: bad gzip body");
            error_response(
                StatusCode::BAD_REQUEST,
                &trace_id,
                "decompress_failed",
                &e.to_string(),
            )
        }
    }
}

/// Marks a response built by [`panic_response`]. The panic hook has no
/// access to the request, so the logging layer restamps the envelope with
/// the request's trace id.
#[derive(Clone, Copy, Debug)]
pub struct PanicRecovered;

/// Panic responses keep the error envelope.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %detail, "Handler panicked");
    let mut response = error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "",
        "internal_error",
        "internal server error",
    );
    response.extensions_mut().insert(PanicRecovered);
    response
}
