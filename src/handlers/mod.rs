pub mod items;
pub mod probe;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::ProbeError;

// ─── Unified error type ──────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Probe(ProbeError),
}

impl From<ProbeError> for ApiError {
    fn from(err: ProbeError) -> Self {
        Self::Probe(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, extra) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            Self::Probe(err) => match err {
                ProbeError::CooldownActive { wait_seconds } => (
                    StatusCode::TOO_MANY_REQUESTS,
                    err.to_string(),
                    Some(("retry_after_seconds", json!(wait_seconds))),
                ),
                ProbeError::ConcurrencyLimitExceeded { running, max } => (
                    StatusCode::TOO_MANY_REQUESTS,
                    err.to_string(),
                    Some(("running_jobs", json!({ "running": running, "max": max }))),
                ),
                ProbeError::JobNotFound(_) => {
                    (StatusCode::NOT_FOUND, "Probe job not found".into(), None)
                }
                ProbeError::NoRuntime => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), None),
            },
        };

        let mut body = json!({
            "error":  message,
            "status": status.as_u16(),
        });
        if let Some((field, value)) = extra {
            body[field] = value;
        }

        let retry_after = body
            .get("retry_after_seconds")
            .and_then(|v| v.as_f64())
            .map(|secs| secs.ceil().max(1.0) as u64);

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(val) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, val);
            }
        }
        response
    }
}
