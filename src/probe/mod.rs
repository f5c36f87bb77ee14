//! Synthetic probe jobs.
//!
//! A job fans out one request per endpoint through a [`ProbeTransport`],
//! classifies each response, and forwards the observation into the
//! [`MetricsAggregator`](crate::metrics::MetricsAggregator).

pub mod catalog;
pub mod manager;
pub mod transport;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::metrics::EndpointKey;

pub use catalog::{EndpointCatalog, StaticCatalog};
pub use manager::ProbeJobManager;
pub use transport::{HttpTransport, ProbeRequest, ProbeResponse, ProbeTransport};

/// Header attached to every synthetic request so live-traffic
/// instrumentation can ignore it.
pub const PROBE_HEADER: &str = "X-Pulse-Probe";

/// Status forwarded to the aggregator when a probe got no HTTP response.
pub const SYNTHETIC_FAILURE_STATUS: u16 = 599;

pub type JobId = Uuid;

// ─── Endpoint descriptors ────────────────────────────────────────

/// A probe-able route as described by the endpoint catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// `"METHOD path"`, same form as [`EndpointKey`]'s display
    pub id: String,
    pub method: String,
    /// Route template, `{name}` or `:name` parameters
    pub path: String,
    #[serde(default)]
    pub path_params: Vec<String>,
    #[serde(default)]
    pub has_request_body: bool,
    #[serde(default)]
    pub request_media_type: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl EndpointInfo {
    pub fn new(method: &str, path: &str) -> Self {
        let key = EndpointKey::new(method, path);
        let path_params = path
            .split('/')
            .filter_map(path_param_name)
            .map(str::to_owned)
            .collect();
        Self {
            id: key.to_string(),
            method: key.method,
            path: key.path,
            path_params,
            has_request_body: false,
            request_media_type: None,
            summary: None,
        }
    }

    /// Declare a required request body.
    pub fn with_body(mut self, media_type: &str) -> Self {
        self.has_request_body = true;
        self.request_media_type = Some(media_type.to_owned());
        self
    }

    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = Some(summary.to_owned());
        self
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey::new(&self.method, self.path.clone())
    }
}

/// Parameter name of a `:name` or `{name}` path segment.
pub(crate) fn path_param_name(segment: &str) -> Option<&str> {
    if let Some(name) = segment.strip_prefix(':') {
        return (!name.is_empty()).then_some(name);
    }
    segment
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .filter(|name| !name.is_empty())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadSource {
    #[default]
    Generated,
    Custom,
}

/// Request inputs used to exercise one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbePayload {
    #[serde(default)]
    pub path_params: BTreeMap<String, Value>,
    #[serde(default)]
    pub query: BTreeMap<String, Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub source: PayloadSource,
}

impl ProbePayload {
    /// A payload can be sent only when every path parameter has a value
    /// and a declared request body is present.
    pub fn is_usable_for(&self, endpoint: &EndpointInfo) -> bool {
        let params_filled = endpoint
            .path_params
            .iter()
            .all(|name| self.path_params.get(name).is_some_and(|v| !v.is_null()));
        let body_filled =
            !endpoint.has_request_body || self.body.as_ref().is_some_and(|b| !b.is_null());
        params_filled && body_filled
    }
}

// ─── Results ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOutcome {
    Healthy,
    Warning,
    Critical,
    Skipped,
    Timeout,
    Error,
}

/// Classify an HTTP response. 2xx is healthy unless slower than
/// `threshold`, 5xx is critical, and 1xx, 3xx and 4xx are warnings.
pub fn classify(status: u16, latency: Duration, threshold: Duration) -> ProbeOutcome {
    match status {
        200..=299 if latency <= threshold => ProbeOutcome::Healthy,
        200..=299 => ProbeOutcome::Warning,
        500..=u16::MAX => ProbeOutcome::Critical,
        _ => ProbeOutcome::Warning,
    }
}

/// Outcome of probing one endpoint within one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub endpoint_id: String,
    pub method: String,
    pub path: String,
    pub outcome: ProbeOutcome,
    pub status_code: Option<u16>,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
    #[serde(serialize_with = "as_secs")]
    pub checked_at: Duration,
    pub payload_source: Option<PayloadSource>,
}

impl ProbeResult {
    pub(crate) fn new(endpoint: &EndpointInfo, outcome: ProbeOutcome, checked_at: Duration) -> Self {
        Self {
            endpoint_id: endpoint.id.clone(),
            method: endpoint.method.clone(),
            path: endpoint.path.clone(),
            outcome,
            status_code: None,
            latency_ms: None,
            error: None,
            checked_at,
            payload_source: None,
        }
    }

    /// Status to forward into the aggregator, if this result is real traffic.
    pub fn forwarded_status(&self) -> Option<u16> {
        match (self.outcome, self.status_code) {
            (ProbeOutcome::Skipped | ProbeOutcome::Timeout, _) => None,
            (_, Some(code)) => Some(code),
            (ProbeOutcome::Critical, None) => Some(SYNTHETIC_FAILURE_STATUS),
            _ => None,
        }
    }
}

// ─── Jobs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Timeout,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Timeout | Self::Failed)
    }

    /// Forward-only state machine: queued → running → terminal.
    pub fn can_become(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Completed | Self::Timeout | Self::Failed)
        )
    }
}

/// Snapshot of a probe job. Timestamps are monotonic clock readings.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(serialize_with = "as_secs")]
    pub created_at: Duration,
    #[serde(serialize_with = "opt_as_secs")]
    pub started_at: Option<Duration>,
    #[serde(serialize_with = "opt_as_secs")]
    pub completed_at: Option<Duration>,
    pub submitted_at: DateTime<Utc>,
    pub total_targets: usize,
    pub completed: usize,
    pub results: Vec<ProbeResult>,
    pub error: Option<String>,
}

impl Job {
    pub(crate) fn queued(id: JobId, created_at: Duration, total_targets: usize) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            created_at,
            started_at: None,
            completed_at: None,
            submitted_at: Utc::now(),
            total_targets,
            completed: 0,
            results: Vec::with_capacity(total_targets),
            error: None,
        }
    }

    /// Apply a state change; ignored unless it moves forward.
    pub(crate) fn transition(&mut self, next: JobStatus, at: Duration) -> bool {
        if !self.status.can_become(next) {
            return false;
        }
        match next {
            JobStatus::Running => self.started_at = Some(at),
            _ => self.completed_at = Some(at),
        }
        self.status = next;
        true
    }

    /// Append a result once per endpoint while the job is live.
    pub(crate) fn push_result(&mut self, result: ProbeResult) -> bool {
        if self.status.is_terminal() || self.has_result(&result.endpoint_id) {
            return false;
        }
        self.results.push(result);
        self.completed = self.results.len();
        true
    }

    pub fn has_result(&self, endpoint_id: &str) -> bool {
        self.results.iter().any(|r| r.endpoint_id == endpoint_id)
    }

    pub fn result(&self, endpoint_id: &str) -> Option<&ProbeResult> {
        self.results.iter().find(|r| r.endpoint_id == endpoint_id)
    }

    /// Time spent running, once finished.
    pub fn elapsed(&self) -> Option<Duration> {
        Some(self.completed_at?.saturating_sub(self.started_at?))
    }
}

fn as_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

fn opt_as_secs<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn endpoint_info_extracts_path_params() {
        let ep = EndpointInfo::new("get", "/users/{user_id}/items/:item_id");
        assert_eq!(ep.id, "GET /users/{user_id}/items/:item_id");
        assert_eq!(ep.path_params, vec!["user_id", "item_id"]);
    }

    #[test]
    fn classification_follows_status_and_latency() {
        let threshold = MS * 1000;
        assert_eq!(classify(200, MS * 50, threshold), ProbeOutcome::Healthy);
        assert_eq!(classify(204, MS * 1000, threshold), ProbeOutcome::Healthy);
        assert_eq!(classify(200, MS * 1500, threshold), ProbeOutcome::Warning);
        assert_eq!(classify(404, MS * 5, threshold), ProbeOutcome::Warning);
        assert_eq!(classify(422, MS * 5, threshold), ProbeOutcome::Warning);
        assert_eq!(classify(500, MS * 5, threshold), ProbeOutcome::Critical);
        assert_eq!(classify(503, MS * 5, threshold), ProbeOutcome::Critical);
        assert_eq!(classify(101, MS * 5, threshold), ProbeOutcome::Warning);
        assert_eq!(classify(302, MS * 5, threshold), ProbeOutcome::Warning);
    }

    #[test]
    fn payload_needs_every_path_param() {
        let ep = EndpointInfo::new("GET", "/needs/{id}");
        let mut payload = ProbePayload::default();
        assert!(!payload.is_usable_for(&ep));

        payload.path_params.insert("id".into(), Value::Null);
        assert!(!payload.is_usable_for(&ep));

        payload.path_params.insert("id".into(), json!(7));
        assert!(payload.is_usable_for(&ep));
    }

    #[test]
    fn payload_needs_declared_body() {
        let ep = EndpointInfo::new("POST", "/needs").with_body("application/json");
        let mut payload = ProbePayload::default();
        assert!(!payload.is_usable_for(&ep));

        payload.body = Some(json!({"name": "widget"}));
        assert!(payload.is_usable_for(&ep));
    }

    #[test]
    fn job_transitions_only_move_forward() {
        let mut job = Job::queued(Uuid::new_v4(), Duration::ZERO, 1);
        assert!(job.transition(JobStatus::Running, MS * 10));
        assert!(!job.transition(JobStatus::Queued, MS * 20));
        assert!(job.transition(JobStatus::Timeout, MS * 1010));
        assert!(!job.transition(JobStatus::Completed, MS * 2000));
        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(job.elapsed(), Some(MS * 1000));
    }

    #[test]
    fn results_are_appended_once_and_frozen_when_terminal() {
        let ep = EndpointInfo::new("GET", "/a");
        let mut job = Job::queued(Uuid::new_v4(), Duration::ZERO, 2);
        job.transition(JobStatus::Running, Duration::ZERO);

        assert!(job.push_result(ProbeResult::new(&ep, ProbeOutcome::Healthy, MS)));
        assert!(!job.push_result(ProbeResult::new(&ep, ProbeOutcome::Critical, MS)));
        assert_eq!(job.completed, 1);

        job.transition(JobStatus::Completed, MS * 2);
        let other = EndpointInfo::new("GET", "/b");
        assert!(!job.push_result(ProbeResult::new(&other, ProbeOutcome::Healthy, MS)));
        assert_eq!(job.results.len(), 1);
    }

    #[test]
    fn network_failures_forward_synthetic_status() {
        let ep = EndpointInfo::new("GET", "/a");
        let critical = ProbeResult::new(&ep, ProbeOutcome::Critical, MS);
        assert_eq!(critical.forwarded_status(), Some(SYNTHETIC_FAILURE_STATUS));

        let skipped = ProbeResult::new(&ep, ProbeOutcome::Skipped, MS);
        assert_eq!(skipped.forwarded_status(), None);

        let mut healthy = ProbeResult::new(&ep, ProbeOutcome::Healthy, MS);
        healthy.status_code = Some(200);
        assert_eq!(healthy.forwarded_status(), Some(200));
    }

    #[test]
    fn job_serializes_timestamps_as_seconds() {
        let mut job = Job::queued(Uuid::nil(), Duration::from_millis(1500), 0);
        job.transition(JobStatus::Running, Duration::from_secs(2));
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "running");
        assert_eq!(value["created_at"], 1.5);
        assert_eq!(value["started_at"], 2.0);
        assert!(value["completed_at"].is_null());
    }
}
