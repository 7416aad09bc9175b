//! docconv-api - HTTP boundary for the docconv conversion queue.
//!
//! The router only talks to [`JobService`]; store selection, the worker pool
//! and background sweeps are wired up by the binary.

pub mod error;
pub mod handlers;

use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use docconv_core::PageMode;
use docconv_jobs::JobService;

pub use error::ApiError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: JobService,
    /// Pagination applied to listings that do not pass `pagination=`.
    pub default_page_mode: PageMode,
}

impl AppState {
    pub fn new(jobs: JobService) -> Self {
        Self {
            jobs,
            default_page_mode: PageMode::default(),
        }
    }

    pub fn with_page_mode(mut self, mode: PageMode) -> Self {
        self.default_page_mode = mode;
        self
    }
}

// =============================================================================
// REQUEST ID (UUIDv7)
// =============================================================================

/// Generates time-ordered UUIDv7 request correlation IDs.
#[derive(Clone, Default)]
struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

/// Parse `ALLOWED_ORIGINS` (comma separated) into CORS origins.
pub fn parse_allowed_origins() -> Vec<HeaderValue> {
    let origins_str = std::env::var("ALLOWED_ORIGINS").unwrap_or_default();
    if origins_str.trim().is_empty() {
        return vec![HeaderValue::from_static("http://localhost:3000")];
    }

    origins_str
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(origin = trimmed, error = %e, "Invalid CORS origin");
                    None
                }
            }
        })
        .collect()
}

/// Build the application router with all middleware layers.
pub fn router(state: AppState, allowed_origins: Vec<HeaderValue>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/api/v1/jobs", handlers::jobs::routes())
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(allowed_origins))
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
                .max_age(Duration::from_secs(3600)),
        )
        // requests carry input references, never file bodies
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .with_state(state)
}
