//! API layer - HTTP handlers and routing
//!
//! It includes:
//! - PDF tool endpoints
//! - Media endpoints
//! - Job status and cancellation endpoints
//! - Health and tool report endpoints
//! - Artifact downloads and static file serving

pub mod download;
pub mod jobs;
pub mod media;
pub mod middleware;
pub mod pdf;
pub mod system;
pub mod upload;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    middleware as axum_middleware,
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
    services::ServeDir,
    trace::TraceLayer,
};

pub use middleware::{ApiError, AppState, RequestStats};

/// Build the `/api/v1` router
pub fn build_api_router() -> Router<AppState> {
    Router::new()
        .merge(system::router())
        .nest("/pdf", pdf::router())
        .nest("/media", media::router())
        .nest("/jobs", jobs::router())
}

fn cors_layer(cors_origin: &str) -> CorsLayer {
    let origin = if cors_origin == "*" {
        AllowOrigin::any()
    } else {
        match cors_origin.parse::<HeaderValue>() {
            Ok(origin) => AllowOrigin::exact(origin),
            Err(_) => {
                tracing::warn!("Invalid CORS origin '{}', allowing any origin", cors_origin);
                AllowOrigin::any()
            }
        }
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
}

/// Build the complete router with middleware
pub fn build_router(state: AppState) -> Router {
    let storage = &state.config.storage;
    let body_limit = usize::try_from(storage.max_upload_size).unwrap_or(usize::MAX);

    Router::new()
        .nest("/api/v1", build_api_router())
        .merge(download::router())
        // Static file serving
        .fallback_service(ServeDir::new(&storage.static_dir))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(cors_layer(&state.config.server.cors_origin))
        .layer(TraceLayer::new_for_http())
        // Request stats middleware (outermost layer, runs for all requests)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::request_stats_middleware,
        ))
        .with_state(state)
}

#[cfg(test)]
mod tests;
