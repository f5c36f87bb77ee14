use axum::{
    extract::{MatchedPath, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::metrics::EndpointKey;
use crate::probe::PROBE_HEADER;
use crate::server::PULSE_PREFIX;
use crate::AppState;

pub const RESPONSE_TIME_HEADER: &str = "x-response-time-ms";

/// Requests slower than this are logged at `warn`.
const SLOW_REQUEST_MS: f64 = 1_000.0;

/// Records every routed request into the aggregator and adds
/// `X-Response-Time-Ms` (handler wall time, two decimals).
///
/// The path is the matched route template (`/api/items/:id`), so
/// concrete ids do not blow up cardinality. Requests to the pulse surface
/// itself and synthetic probes (they record their own results) are timed
/// but not recorded.
pub async fn record_requests(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let raw_path = req.uri().path().to_owned();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| raw_path.clone());
    let skip = is_pulse_path(&raw_path) || req.headers().contains_key(PROBE_HEADER);

    let start = Instant::now();
    let mut response = next.run(req).await;
    let ms = start.elapsed().as_secs_f64() * 1_000.0;

    if let Ok(val) = HeaderValue::from_str(&format!("{ms:.2}")) {
        response.headers_mut().insert(RESPONSE_TIME_HEADER, val);
    }

    if skip {
        return response;
    }

    let status = response.status().as_u16();
    state
        .metrics
        .record(EndpointKey::new(method.as_str(), &path), status, ms);

    if status >= 500 {
        warn!(%method, %path, status, duration_ms = ms, "Request failed");
    } else if ms > SLOW_REQUEST_MS {
        warn!(%method, %path, status, duration_ms = ms, "Slow request");
    } else {
        debug!(%method, %path, status, duration_ms = ms, "Request");
    }

    response
}

/// `/health/pulse` itself or anything below it, but not `/health/pulsecheck`.
fn is_pulse_path(path: &str) -> bool {
    path.strip_prefix(PULSE_PREFIX)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
