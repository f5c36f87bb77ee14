use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ─── Aggregator ──────────────────────────────────────────────────

/// Limits for the request metrics aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Trailing span covered by latency percentiles and window counts
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Width of one time bucket inside the window
    #[serde(default = "default_bucket_seconds")]
    pub bucket_seconds: u64,

    /// Hard cap on distinct tracked endpoint keys
    #[serde(default = "default_max_endpoints")]
    pub max_endpoints: usize,

    /// Centroid cap per latency digest
    #[serde(default = "default_max_centroids")]
    pub max_centroids: usize,
}

fn default_window_seconds() -> u64 {
    300
}
fn default_bucket_seconds() -> u64 {
    60
}
fn default_max_endpoints() -> usize {
    1000
}
fn default_max_centroids() -> usize {
    100
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            bucket_seconds: default_bucket_seconds(),
            max_endpoints: default_max_endpoints(),
            max_centroids: default_max_centroids(),
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_seconds == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "window_seconds",
            });
        }
        if self.bucket_seconds == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "bucket_seconds",
            });
        }
        if self.bucket_seconds > self.window_seconds {
            return Err(ConfigError::BucketLargerThanWindow {
                bucket_seconds: self.bucket_seconds,
                window_seconds: self.window_seconds,
            });
        }
        if self.max_endpoints == 0 {
            return Err(ConfigError::ZeroCount {
                field: "max_endpoints",
            });
        }
        if self.max_centroids == 0 {
            return Err(ConfigError::ZeroCount {
                field: "max_centroids",
            });
        }
        Ok(())
    }
}

// ─── Probe jobs ──────────────────────────────────────────────────

/// Limits for synthetic probe jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Minimum gap between two job starts. Zero disables the cooldown.
    pub min_probe_interval: Duration,

    /// Jobs allowed in flight at once
    pub max_concurrent_jobs: usize,

    /// Deadline for a whole job, measured from `started_at`
    pub job_timeout: Duration,

    /// Probe tasks allowed in flight inside one job
    pub fan_out: usize,

    /// Deadline for a single synthetic request
    pub probe_timeout: Duration,

    /// 2xx responses slower than this are classified as warnings
    pub latency_threshold: Duration,

    /// How long cancelled probe tasks get to wind down before being aborted
    pub cancel_grace: Duration,

    /// Finished jobs kept for `get_job`
    pub max_retained_jobs: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            min_probe_interval: Duration::from_secs(10),
            max_concurrent_jobs: 2,
            job_timeout: Duration::from_secs(30),
            fan_out: 4,
            probe_timeout: Duration::from_secs(10),
            latency_threshold: Duration::from_millis(1000),
            cancel_grace: Duration::from_millis(250),
            max_retained_jobs: 50,
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("max_concurrent_jobs", self.max_concurrent_jobs),
            ("fan_out", self.fan_out),
            ("max_retained_jobs", self.max_retained_jobs),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(ConfigError::ZeroCount { field });
            }
        }

        let durations = [
            ("job_timeout", self.job_timeout),
            ("probe_timeout", self.probe_timeout),
            ("latency_threshold", self.latency_threshold),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }

        // Every running job must stay retrievable.
        if self.max_retained_jobs < self.max_concurrent_jobs {
            return Err(ConfigError::RetentionBelowConcurrency {
                max_retained_jobs: self.max_retained_jobs,
                max_concurrent_jobs: self.max_concurrent_jobs,
            });
        }
        Ok(())
    }
}
