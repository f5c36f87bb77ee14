use serde::Serialize;

use super::digest::PercentileEstimator;

/// Latency percentile breakdown (milliseconds) for one endpoint or for
/// the whole service. Serialized straight into the snapshot JSON.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PercentileSet {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: u64,
}

impl PercentileSet {
    /// Extract a percentile set from a digest.
    /// Returns zeroed values if the digest is empty.
    pub fn from_digest(digest: &PercentileEstimator, mean: f64) -> Self {
        if digest.is_empty() {
            return Self::empty();
        }

        Self {
            min: digest.min(),
            max: digest.max(),
            mean,
            p50: digest.quantile(0.50),
            p90: digest.quantile(0.90),
            p95: digest.quantile(0.95),
            p99: digest.quantile(0.99),
            count: digest.count(),
        }
    }

    /// All-zero placeholder used before any samples are recorded.
    pub fn empty() -> Self {
        Self {
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            p50: 0.0,
            p90: 0.0,
            p95: 0.0,
            p99: 0.0,
            count: 0,
        }
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }
}
