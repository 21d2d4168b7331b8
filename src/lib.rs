pub mod api_constants;
pub mod assembler;
pub mod binning;
pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod handlers;
pub mod metastore;
pub mod projection;
pub mod regression;
pub mod search_backend;
pub mod tile_store;

use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::routing::get;
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api_constants::{
    ADHOC_TILE_ROUTE, DENSITY_TILE_ROUTE, HEALTH_ROUTE, REGRESSION_JSON_ROUTE,
    REGRESSION_TILE_ROUTE,
};
use crate::error::ApiError;
use crate::handlers::{
    get_adhoc_tile, get_density_tile, get_regression_json, get_regression_tile, health, AppState,
};
use crate::metastore::Metastore;
use crate::search_backend::SearchBackendAdapter;
use crate::tile_store::SqliteTileStore;

/// Converts the `BoxError` a timed-out or over-capacity request surfaces
/// through `tower::timeout`/`tower::limit` into the same `ApiError` body
/// every other failure path produces (`TimeoutError` -> 504).
async fn handle_middleware_error(err: tower::BoxError) -> ApiError {
    if err.is::<tower::timeout::error::Elapsed>() {
        ApiError::from(crate::error::TimeoutError)
    } else {
        ApiError::internal(err.to_string())
    }
}

/// Assemble the production router: routes, CORS, tracing, a bounded
/// worker pool and a per-request timeout, via a
/// `ConcurrencyLimitLayer`/`TimeoutLayer` pair tuned to this service's
/// concurrency model.
pub fn build_router(state: AppState, max_concurrent_requests: usize, request_timeout: Duration) -> Router {
    Router::new()
        .route(HEALTH_ROUTE, get(health))
        .route(DENSITY_TILE_ROUTE, get(get_density_tile))
        .route(ADHOC_TILE_ROUTE, get(get_adhoc_tile))
        .route(REGRESSION_TILE_ROUTE, get(get_regression_tile))
        .route(REGRESSION_JSON_ROUTE, get(get_regression_json))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_middleware_error))
                .layer(TimeoutLayer::new(request_timeout))
                .layer(ConcurrencyLimitLayer::new(max_concurrent_requests)),
        )
        .with_state(state)
}

/// Build the state a test can drive against an in-memory store, without
/// any of the production middleware layers.
pub async fn create_test_router(
    store: SqliteTileStore,
    metastore: Metastore,
    search_backend: SearchBackendAdapter,
    tile_size: u32,
    buffer_size: u32,
) -> Router {
    let state = AppState {
        store: Arc::new(store),
        metastore: Arc::new(metastore),
        search_backend: Arc::new(search_backend),
        tile_size,
        buffer_size,
    };

    Router::new()
        .route(HEALTH_ROUTE, get(health))
        .route(DENSITY_TILE_ROUTE, get(get_density_tile))
        .route(ADHOC_TILE_ROUTE, get(get_adhoc_tile))
        .route(REGRESSION_TILE_ROUTE, get(get_regression_tile))
        .route(REGRESSION_JSON_ROUTE, get(get_regression_json))
        .with_state(state)
}
