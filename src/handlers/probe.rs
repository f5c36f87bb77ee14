use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::probe::{EndpointCatalog, EndpointInfo, Job, JobId, ProbePayload};
use crate::AppState;

use super::ApiError;

// ─── Request / response types ────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct StartProbeRequest {
    /// Endpoint ids (`"GET /api/items/:id"`). Omitted means every
    /// catalogued endpoint.
    #[serde(default)]
    pub endpoints: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct StartProbeResponse {
    pub job_id: JobId,
    pub total_targets: usize,
}

#[derive(Debug, Serialize)]
pub struct EndpointListing {
    #[serde(flatten)]
    pub endpoint: EndpointInfo,
    /// Whether the next probe has a usable payload for this endpoint
    pub probeable: bool,
    pub payload: Option<ProbePayload>,
}

// ─── GET /health/pulse/endpoints ─────────────────────────────────

pub async fn list_endpoints(State(state): State<Arc<AppState>>) -> Json<Vec<EndpointListing>> {
    let listing = state
        .catalog
        .endpoints()
        .into_iter()
        .map(|endpoint| {
            let payload = state.catalog.payload_for(&endpoint);
            EndpointListing {
                probeable: payload.is_some(),
                payload,
                endpoint,
            }
        })
        .collect();
    Json(listing)
}

// ─── POST /health/pulse/probe ────────────────────────────────────

pub async fn start_probe(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StartProbeRequest>>,
) -> Result<(StatusCode, Json<StartProbeResponse>), ApiError> {
    let request = body.map(|Json(req)| req).unwrap_or_default();

    let targets = match request.endpoints {
        Some(ids) => ids
            .iter()
            .map(|id| {
                state
                    .catalog
                    .find(id)
                    .ok_or_else(|| ApiError::NotFound(format!("Endpoint not found: {id}")))
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => state.catalog.endpoints(),
    };

    // Duplicate ids are probed once.
    let total_targets = targets.iter().map(|e| &e.id).collect::<HashSet<_>>().len();
    let job_id = state.probes.start_probe(targets)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartProbeResponse {
            job_id,
            total_targets,
        }),
    ))
}

// ─── GET /health/pulse/probe/latest ──────────────────────────────

pub async fn latest_job(State(state): State<Arc<AppState>>) -> Result<Json<Job>, ApiError> {
    state
        .probes
        .last_job()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No probe jobs yet".into()))
}

// ─── GET /health/pulse/probe/:job_id ─────────────────────────────

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    // Malformed ids cannot name a job.
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound("Probe job not found".into()))?;
    Ok(Json(state.probes.get_job(id)?))
}

// ─── PUT /health/pulse/probe/:endpoint_id/payload ────────────────

pub async fn set_payload(
    State(state): State<Arc<AppState>>,
    Path(endpoint_id): Path<String>,
    Json(payload): Json<ProbePayload>,
) -> Result<Json<ProbePayload>, ApiError> {
    let endpoint = state
        .catalog
        .find(&endpoint_id)
        .ok_or_else(|| ApiError::NotFound(format!("Endpoint not found: {endpoint_id}")))?;

    if !payload.is_usable_for(&endpoint) {
        return Err(ApiError::BadRequest(format!(
            "Payload does not cover the inputs of {endpoint_id}"
        )));
    }

    state
        .catalog
        .set_override(&endpoint_id, payload)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Endpoint not found: {endpoint_id}")))
}

// ─── DELETE /health/pulse/probe/:endpoint_id/payload ─────────────

pub async fn clear_payload(
    State(state): State<Arc<AppState>>,
    Path(endpoint_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.catalog.clear_override(&endpoint_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Endpoint not found: {endpoint_id}")))
    }
}
