use std::collections::HashMap;

use parking_lot::RwLock;

use super::{EndpointInfo, PayloadSource, ProbePayload};

/// Source of probe-able endpoints and the payloads used to exercise them.
pub trait EndpointCatalog: Send + Sync {
    fn endpoints(&self) -> Vec<EndpointInfo>;

    /// A payload that satisfies the endpoint's inputs, or `None` when the
    /// endpoint cannot be probed and should be skipped.
    fn payload_for(&self, endpoint: &EndpointInfo) -> Option<ProbePayload>;

    fn find(&self, endpoint_id: &str) -> Option<EndpointInfo> {
        self.endpoints().into_iter().find(|e| e.id == endpoint_id)
    }
}

struct CatalogEntry {
    endpoint: EndpointInfo,
    sample: Option<ProbePayload>,
}

/// In-memory catalog populated at startup.
///
/// Registered samples are reported as `generated`; overrides set at runtime
/// take precedence and are reported as `custom`.
#[derive(Default)]
pub struct StaticCatalog {
    entries: RwLock<Vec<CatalogEntry>>,
    overrides: RwLock<HashMap<String, ProbePayload>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint, replacing any earlier registration with the same id.
    pub fn register(&self, endpoint: EndpointInfo, sample: Option<ProbePayload>) {
        let sample = sample.map(|mut payload| {
            payload.source = PayloadSource::Generated;
            payload
        });
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.endpoint.id == endpoint.id) {
            Some(existing) => {
                existing.endpoint = endpoint;
                existing.sample = sample;
            }
            None => entries.push(CatalogEntry { endpoint, sample }),
        }
    }

    /// Store a custom payload. Returns `None` for an unknown endpoint.
    pub fn set_override(&self, endpoint_id: &str, payload: ProbePayload) -> Option<ProbePayload> {
        self.find(endpoint_id)?;
        let payload = ProbePayload {
            source: PayloadSource::Custom,
            ..payload
        };
        self.overrides
            .write()
            .insert(endpoint_id.to_owned(), payload.clone());
        Some(payload)
    }

    /// Drop a custom payload. Returns `false` for an unknown endpoint.
    pub fn clear_override(&self, endpoint_id: &str) -> bool {
        if self.find(endpoint_id).is_none() {
            return false;
        }
        self.overrides.write().remove(endpoint_id);
        true
    }

    pub fn override_for(&self, endpoint_id: &str) -> Option<ProbePayload> {
        self.overrides.read().get(endpoint_id).cloned()
    }

    fn sample_for(&self, endpoint: &EndpointInfo) -> Option<ProbePayload> {
        let entries = self.entries.read();
        let registered = entries.iter().find(|e| e.endpoint.id == endpoint.id);
        match registered.and_then(|e| e.sample.clone()) {
            Some(sample) => Some(sample),
            // Nothing to fill in: an empty payload is enough.
            None if endpoint.path_params.is_empty() && !endpoint.has_request_body => {
                Some(ProbePayload::default())
            }
            None => None,
        }
    }
}

impl EndpointCatalog for StaticCatalog {
    fn endpoints(&self) -> Vec<EndpointInfo> {
        self.entries
            .read()
            .iter()
            .map(|e| e.endpoint.clone())
            .collect()
    }

    fn payload_for(&self, endpoint: &EndpointInfo) -> Option<ProbePayload> {
        let payload = self
            .override_for(&endpoint.id)
            .or_else(|| self.sample_for(endpoint))?;
        payload.is_usable_for(endpoint).then_some(payload)
    }

    fn find(&self, endpoint_id: &str) -> Option<EndpointInfo> {
        self.entries
            .read()
            .iter()
            .find(|e| e.endpoint.id == endpoint_id)
            .map(|e| e.endpoint.clone())
    }
}
