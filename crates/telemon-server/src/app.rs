use crate::api::{self, MAX_BODY_BYTES};
use crate::state::AppState;
use crate::{logging, middleware as mw};
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;

/// Builds the HTTP router.
///
/// Layers, outermost first: request logging, response compression, panic
/// recovery, signature checks. Ingestion routes additionally run decrypt,
/// trusted-subnet and decompression, in that order, before the handler.
pub fn build_http_app(state: AppState) -> Router {
    let ingestion = api::ingestion_routes()
        .layer(middleware::from_fn(mw::decompress))
        .layer(middleware::from_fn_with_state(state.clone(), mw::trusted_subnet))
        .layer(middleware::from_fn_with_state(state.clone(), mw::decrypt));

    ingestion
        .merge(api::query_routes())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn_with_state(state.clone(), mw::signature))
        .layer(CatchPanicLayer::custom(mw::panic_response))
        .layer(CompressionLayer::new())
        .layer(middleware::from_fn(logging::request_logging))
        .with_state(state)
}
