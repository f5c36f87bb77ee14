//! Error types shared across the aggregator, the probe scheduler and the
//! HTTP surface.

use thiserror::Error;
use uuid::Uuid;

/// Invalid construction-time limits. Fatal: nothing is built.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A count that must be at least one was zero
    #[error("{field} must be at least 1")]
    ZeroCount { field: &'static str },

    /// A duration that must be positive was zero
    #[error("{field} must be a positive duration")]
    ZeroDuration { field: &'static str },

    /// Bucket width larger than the window it subdivides
    #[error("bucket_seconds ({bucket_seconds}) must not exceed window_seconds ({window_seconds})")]
    BucketLargerThanWindow {
        bucket_seconds: u64,
        window_seconds: u64,
    },

    /// Fewer retained jobs than jobs allowed to run at once
    #[error("max_retained_jobs ({max_retained_jobs}) must be at least max_concurrent_jobs ({max_concurrent_jobs})")]
    RetentionBelowConcurrency {
        max_retained_jobs: usize,
        max_concurrent_jobs: usize,
    },
}

/// Errors returned synchronously by the probe job manager.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    /// Another job started less than `min_probe_interval` ago
    #[error("probe cooldown active, retry in {wait_seconds:.1}s")]
    CooldownActive { wait_seconds: f64 },

    /// Too many jobs are already running
    #[error("too many probe jobs running ({running}/{max})")]
    ConcurrencyLimitExceeded { running: usize, max: usize },

    /// No job with this id is retained
    #[error("probe job not found: {0}")]
    JobNotFound(Uuid),

    /// `start_probe` was called outside a tokio runtime
    #[error("probe jobs require a running tokio runtime")]
    NoRuntime,
}

/// Failure of a single synthetic request. Captured in the job's results,
/// never propagated to the caller of `start_probe`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The per-request timeout elapsed
    #[error("Timeout after {0} ms")]
    Timeout(u64),

    /// Could not connect to the target
    #[error("connection failed: {0}")]
    Connect(String),

    /// Any other request failure
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(0)
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}
