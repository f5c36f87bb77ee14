use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::error;

use super::aggregator::MetricsSnapshot;
use crate::AppState;

const STREAM_INTERVAL: Duration = Duration::from_millis(500);

// ─── GET /health/pulse ───────────────────────────────────────────

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

// ─── GET /health/pulse/stream ────────────────────────────────────
/// Server-Sent Events: a full `MetricsSnapshot` as JSON every 500 ms.

pub async fn metrics_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(STREAM_INTERVAL);

    let stream = IntervalStream::new(interval).map(move |_| {
        let snapshot = state.metrics.snapshot();
        let event = Event::default();
        match serde_json::to_string(&snapshot) {
            Ok(json) => Ok(event.data(json)),
            Err(err) => {
                error!(error = %err, "Failed to serialize metrics snapshot");
                Ok(event.data("{}"))
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
