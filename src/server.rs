use axum::{
    http::{HeaderName, HeaderValue, Method},
    middleware as axum_mw,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::handlers;
use crate::metrics::stream;
use crate::middleware::timing;
use crate::AppState;

/// Path prefix of the pulse surface. Requests under it are not recorded.
pub const PULSE_PREFIX: &str = "/health/pulse";

/// Mounts the pulse routes next to `app` and instruments every route of
/// the combined router.
pub fn create_router(state: Arc<AppState>, app: Router) -> Router {
    let pulse = Router::new()
        // ── Metrics ─────────────────────────────────────────────
        .route("/health/pulse", get(stream::get_metrics))
        .route("/health/pulse/stream", get(stream::metrics_stream))
        // ── Probe control ───────────────────────────────────────
        .route(
            "/health/pulse/endpoints",
            get(handlers::probe::list_endpoints),
        )
        .route("/health/pulse/probe", post(handlers::probe::start_probe))
        .route(
            "/health/pulse/probe/latest",
            get(handlers::probe::latest_job),
        )
        .route("/health/pulse/probe/:id", get(handlers::probe::get_job))
        .route(
            "/health/pulse/probe/:id/payload",
            put(handlers::probe::set_payload).delete(handlers::probe::clear_payload),
        )
        .with_state(state.clone());

    app.merge(pulse)
        // ── Record every request that reaches a route ───────────
        .layer(axum_mw::from_fn_with_state(state, timing::record_requests))
}

/// CORS for dashboards served from other origins. Unparseable origins
/// are logged and skipped.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            HeaderName::from_static("x-correlation-id"),
            HeaderName::from_static("x-pulse-probe"),
        ])
}
