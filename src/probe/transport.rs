use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde_json::Value;

use super::{path_param_name, EndpointInfo, ProbePayload, PROBE_HEADER};
use crate::error::TransportError;

/// A fully resolved synthetic request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    pub method: String,
    /// Concrete path, parameters already substituted
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
}

/// Issues synthetic requests. Dropping the returned future must release
/// any connection it holds.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn send(&self, request: ProbeRequest) -> Result<ProbeResponse, TransportError>;
}

impl ProbeRequest {
    pub fn build(endpoint: &EndpointInfo, payload: &ProbePayload, timeout: Duration) -> Self {
        let query = payload
            .query
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect();

        let mut headers: Vec<(String, String)> = payload
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.push((PROBE_HEADER.to_owned(), "true".to_owned()));

        let (body, content_type) = match &payload.body {
            None | Some(Value::Null) => (None, None),
            // Raw strings go out verbatim, everything else as JSON
            Some(Value::String(raw)) => (
                Some(raw.clone().into_bytes()),
                Some(
                    payload
                        .media_type
                        .clone()
                        .unwrap_or_else(|| "text/plain".to_owned()),
                ),
            ),
            Some(value) => (
                Some(value.to_string().into_bytes()),
                Some(
                    payload
                        .media_type
                        .clone()
                        .or_else(|| endpoint.request_media_type.clone())
                        .unwrap_or_else(|| "application/json".to_owned()),
                ),
            ),
        };

        Self {
            method: endpoint.method.clone(),
            path: format_path(&endpoint.path, &payload.path_params),
            query,
            headers,
            body,
            content_type,
            timeout,
        }
    }
}

/// Substitute `{name}` / `:name` segments from `params`.
/// Segments without a value are left untouched.
pub fn format_path(template: &str, params: &BTreeMap<String, Value>) -> String {
    template
        .split('/')
        .map(|segment| {
            path_param_name(segment)
                .and_then(|name| params.get(name))
                .filter(|v| !v.is_null())
                .map(value_to_string)
                .unwrap_or_else(|| segment.to_owned())
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─── HTTP transport ──────────────────────────────────────────────

/// `reqwest`-backed transport that sends probes to `base_url`.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ProbeTransport for HttpTransport {
    async fn send(&self, request: ProbeRequest) -> Result<ProbeResponse, TransportError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let url = format!("{}{}", self.base_url, request.path);
        let timeout_ms = request.timeout.as_millis() as u64;

        let mut builder = self
            .client
            .request(method, url)
            .timeout(request.timeout)
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            if let Some(content_type) = &request.content_type {
                builder = builder.header(CONTENT_TYPE, content_type.as_str());
            }
            builder = builder.body(body);
        }

        let to_error = |e: reqwest::Error| {
            if e.is_timeout() {
                TransportError::Timeout(timeout_ms)
            } else {
                TransportError::from(e)
            }
        };

        let response = builder.send().await.map_err(to_error)?;
        let status = response.status().as_u16();
        // Read the body so the connection goes back to the pool
        response.bytes().await.map_err(to_error)?;

        Ok(ProbeResponse { status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn format_path_replaces_both_parameter_styles() {
        let mut params = BTreeMap::new();
        params.insert("user_id".to_owned(), json!("123"));
        params.insert("item_id".to_owned(), json!(456));
        assert_eq!(
            format_path("/users/{user_id}/items/:item_id", &params),
            "/users/123/items/456"
        );
    }

    #[test]
    fn format_path_leaves_plain_paths_alone() {
        assert_eq!(format_path("/test", &BTreeMap::new()), "/test");
        assert_eq!(format_path("/", &BTreeMap::new()), "/");
        assert_eq!(format_path("/items/:id", &BTreeMap::new()), "/items/:id");
    }

    #[test]
    fn request_carries_probe_header_and_query() {
        let ep = EndpointInfo::new("GET", "/search");
        let mut payload = ProbePayload::default();
        payload.query.insert("q".into(), json!("widgets"));
        payload.query.insert("limit".into(), json!(5));
        payload.query.insert("unset".into(), Value::Null);

        let req = ProbeRequest::build(&ep, &payload, Duration::from_secs(1));
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/search");
        assert!(req.headers.contains(&(PROBE_HEADER.to_owned(), "true".to_owned())));
        assert_eq!(
            req.query,
            vec![
                ("limit".to_owned(), "5".to_owned()),
                ("q".to_owned(), "widgets".to_owned())
            ]
        );
        assert!(req.body.is_none());
    }

    #[test]
    fn json_body_is_serialized_with_media_type() {
        let ep = EndpointInfo::new("POST", "/text").with_body("application/json");
        let payload = ProbePayload {
            body: Some(json!({"foo": "bar"})),
            media_type: Some("text/plain".into()),
            ..Default::default()
        };
        let req = ProbeRequest::build(&ep, &payload, Duration::from_secs(1));
        let body: Value = serde_json::from_slice(req.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({"foo": "bar"}));
        assert_eq!(req.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn raw_string_body_is_sent_verbatim() {
        let ep = EndpointInfo::new("POST", "/raw").with_body("text/plain");
        let payload = ProbePayload {
            body: Some(json!("ping")),
            media_type: Some("text/plain".into()),
            ..Default::default()
        };
        let req = ProbeRequest::build(&ep, &payload, Duration::from_secs(1));
        assert_eq!(req.body.as_deref(), Some(&b"ping"[..]));
        assert_eq!(req.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn http_transport_trims_trailing_slash() {
        let transport = HttpTransport::new("http://127.0.0.1:3000/").unwrap();
        assert_eq!(transport.base_url(), "http://127.0.0.1:3000");
    }

    #[tokio::test]
    async fn http_transport_reports_connection_failures() {
        // Reserve a free port, then release it so nothing listens there.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport = HttpTransport::new(format!("http://127.0.0.1:{port}")).unwrap();
        let req = ProbeRequest::build(
            &EndpointInfo::new("GET", "/"),
            &ProbePayload::default(),
            Duration::from_secs(2),
        );
        assert!(matches!(
            transport.send(req).await,
            Err(TransportError::Connect(_))
        ));
    }
}
