//! api-pulse: request metrics and synthetic health probes for axum services.
//!
//! ```text
//!  live request ──▶ middleware::timing ──┐
//!                                        ├──▶ MetricsAggregator ──▶ /health/pulse
//!  ProbeJobManager ──▶ ProbeTransport ───┘
//! ```
//!
//! - [`metrics`]: bounded-cardinality aggregator with streaming percentiles
//! - [`probe`]: probe job scheduler, endpoint catalog and transports
//! - [`server`]: router wiring for the reporting surface

use std::sync::Arc;

pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod probe;
pub mod server;

pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{AggregatorConfig, ProbeConfig};
pub use error::{ConfigError, ProbeError, TransportError};
pub use metrics::{EndpointKey, MetricsAggregator, MetricsSnapshot, PercentileEstimator};
pub use probe::{EndpointInfo, Job, JobStatus, ProbeJobManager, ProbeOutcome, StaticCatalog};

/// Shared state available to every pulse handler via `State<Arc<AppState>>`.
pub struct AppState {
    /// Rolling request metrics: middleware and probes write, handlers read.
    pub metrics: Arc<MetricsAggregator>,

    /// Synthetic probe scheduler.
    pub probes: Arc<ProbeJobManager>,

    /// Probe-able endpoints and their payloads. The same catalog the
    /// probe manager reads from.
    pub catalog: Arc<StaticCatalog>,
}
