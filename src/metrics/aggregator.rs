use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use super::percentiles::PercentileSet;
use super::window::RollingWindow;
use super::EndpointKey;
use crate::clock::{Clock, TokioClock};
use crate::config::AggregatorConfig;
use crate::error::ConfigError;

// ─── Configuration ───────────────────────────────────────────────

/// HdrHistogram range: 1 μs → 10 min, 2 significant figures
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 600_000_000;
const HIST_SIGFIG: u8 = 2;

/// Latency distribution bucket boundaries (μs), sized for HTTP handlers.
const DIST_BOUNDARIES: &[u64] = &[
    1_000, 2_000, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000,
    1_000_000, 2_500_000, 5_000_000, 10_000_000,
];

// ─── Public types ────────────────────────────────────────────────

/// Thread-safe, bounded-cardinality request metrics.
///
/// The live-request middleware and the probe scheduler call `record()`,
/// the reporting surface calls `snapshot()`. At most `max_endpoints`
/// keys are tracked; a new key evicts the least recently touched one.
pub struct MetricsAggregator {
    config: AggregatorConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

/// Point-in-time view of one tracked endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub method: String,
    pub path: String,
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub status_codes: BTreeMap<u16, u64>,
    pub window_request_count: u64,
    pub avg_response_time: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Service-wide totals across tracked endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total_requests: u64,
    pub total_errors: u64,
    /// Percent of tracked requests with status ≥ 400
    pub error_rate: f64,
    /// `None` until the first request is recorded
    pub success_rate: Option<f64>,
    pub avg_response_time: f64,
    pub window_seconds: u64,
    pub window_request_count: u64,
    pub requests_per_minute: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub tracked_endpoints: usize,
    pub max_endpoints: usize,
}

/// A bucket in the all-time latency distribution.
#[derive(Debug, Clone, Serialize)]
pub struct DistBucket {
    pub range_start_ms: f64,
    pub range_end_ms: f64,
    pub count: u64,
}

/// Complete snapshot handed to the reporting surface.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub endpoints: BTreeMap<String, EndpointSnapshot>,
    pub summary: Summary,
    pub distribution: Vec<DistBucket>,
}

impl MetricsSnapshot {
    pub fn endpoint(&self, key: &EndpointKey) -> Option<&EndpointSnapshot> {
        self.endpoints.get(&key.to_string())
    }
}

// ─── Internal state ──────────────────────────────────────────────

/// LRU position: clock reading plus a tie-breaking touch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Recency {
    at: Duration,
    seq: u64,
}

struct EndpointStats {
    request_count: u64,
    success_count: u64,
    error_count: u64,
    status_codes: BTreeMap<u16, u64>,
    latency: RollingWindow,
    last_access: Recency,
}

struct Inner {
    endpoints: HashMap<EndpointKey, EndpointStats>,
    global: RollingWindow,
    distribution: Histogram<u64>,
    touches: u64,
}

// ─── MetricsAggregator impl ──────────────────────────────────────

impl MetricsAggregator {
    pub fn new(config: AggregatorConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Mutex::new(Inner::new(&config)),
            config,
            clock,
        })
    }

    /// Default limits on a tokio-backed clock.
    pub fn with_defaults() -> Self {
        let config = AggregatorConfig::default();
        Self {
            inner: Mutex::new(Inner::new(&config)),
            config,
            clock: Arc::new(TokioClock::new()),
        }
    }

    /// Record one completed request.
    ///
    /// Never panics and never fails: a negative or non-finite duration is
    /// recorded as `0.0`, the status code is stored as given, and any fault
    /// while updating is logged and the sample dropped.
    pub fn record(&self, key: EndpointKey, status_code: u16, duration_ms: f64) {
        let duration_ms = if duration_ms.is_finite() {
            duration_ms.max(0.0)
        } else {
            0.0
        };
        let now = self.clock.now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.inner
                .lock()
                .record(&self.config, key, status_code, duration_ms, now)
        }));

        // Logged after the lock is released
        match outcome {
            Ok(Some(evicted)) => info!(
                endpoint = %evicted,
                max_endpoints = self.config.max_endpoints,
                "Evicted endpoint metrics due to max_endpoints limit"
            ),
            Ok(None) => {}
            Err(_) => error!("Failed to record request metrics, sample dropped"),
        }
    }

    /// Shorthand for `record(EndpointKey::new(method, path), ..)`.
    pub fn record_request(&self, method: &str, path: &str, status_code: u16, duration_ms: f64) {
        self.record(EndpointKey::new(method, path), status_code, duration_ms);
    }

    /// Produce an immutable copy of all tracked statistics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = self.clock.now();
        self.inner.lock().snapshot(&self.config, now)
    }

    pub fn tracked_endpoints(&self) -> usize {
        self.inner.lock().endpoints.len()
    }

    pub fn is_tracked(&self, key: &EndpointKey) -> bool {
        self.inner.lock().endpoints.contains_key(key)
    }

    /// Wipe all data.
    pub fn reset(&self) {
        *self.inner.lock() = Inner::new(&self.config);
    }
}

// ─── Inner impl ──────────────────────────────────────────────────

impl EndpointStats {
    fn new(config: &AggregatorConfig, last_access: Recency) -> Self {
        Self {
            request_count: 0,
            success_count: 0,
            error_count: 0,
            status_codes: BTreeMap::new(),
            latency: RollingWindow::new(
                config.window_seconds,
                config.bucket_seconds,
                config.max_centroids,
            ),
            last_access,
        }
    }

    fn snapshot(&self, key: &EndpointKey, now: Duration) -> EndpointSnapshot {
        let latency = self.latency.percentiles(now);
        EndpointSnapshot {
            method: key.method.clone(),
            path: key.path.clone(),
            request_count: self.request_count,
            success_count: self.success_count,
            error_count: self.error_count,
            status_codes: self.status_codes.clone(),
            window_request_count: latency.count,
            avg_response_time: latency.mean,
            p50: latency.p50,
            p90: latency.p90,
            p95: latency.p95,
            p99: latency.p99,
        }
    }
}

impl Inner {
    fn new(config: &AggregatorConfig) -> Self {
        Self {
            endpoints: HashMap::with_capacity(config.max_endpoints.min(1024)),
            global: RollingWindow::new(
                config.window_seconds,
                config.bucket_seconds,
                config.max_centroids,
            ),
            distribution: Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG)
                .expect("histogram creation"),
            touches: 0,
        }
    }

    /// Returns the key evicted to make room, if any.
    fn record(
        &mut self,
        config: &AggregatorConfig,
        key: EndpointKey,
        status_code: u16,
        duration_ms: f64,
        now: Duration,
    ) -> Option<EndpointKey> {
        let evicted = if !self.endpoints.contains_key(&key)
            && self.endpoints.len() >= config.max_endpoints
        {
            self.evict_oldest()
        } else {
            None
        };

        self.touches += 1;
        let recency = Recency {
            at: now,
            seq: self.touches,
        };

        let stats = self
            .endpoints
            .entry(key)
            .or_insert_with(|| EndpointStats::new(config, recency));
        stats.last_access = recency;

        // ── Counters ────────────────────────────────────────────
        stats.request_count = stats.request_count.saturating_add(1);
        *stats.status_codes.entry(status_code).or_insert(0) += 1;
        if status_code >= 400 {
            stats.error_count = stats.error_count.saturating_add(1);
        } else {
            stats.success_count = stats.success_count.saturating_add(1);
        }

        // ── Latency ─────────────────────────────────────────────
        stats.latency.add(duration_ms, now);
        self.global.add(duration_ms, now);
        let micros = (duration_ms * 1_000.0).round() as u64;
        self.distribution.saturating_record(micros.max(HIST_LOW));

        evicted
    }

    /// O(n) scan for the least recently touched key.
    fn evict_oldest(&mut self) -> Option<EndpointKey> {
        let oldest = self
            .endpoints
            .iter()
            .min_by_key(|(_, stats)| stats.last_access)
            .map(|(key, _)| key.clone())?;
        self.endpoints.remove(&oldest);
        Some(oldest)
    }

    fn snapshot(&self, config: &AggregatorConfig, now: Duration) -> MetricsSnapshot {
        let endpoints: BTreeMap<String, EndpointSnapshot> = self
            .endpoints
            .iter()
            .map(|(key, stats)| (key.to_string(), stats.snapshot(key, now)))
            .collect();

        let total_requests: u64 = self.endpoints.values().map(|s| s.request_count).sum();
        let total_errors: u64 = self.endpoints.values().map(|s| s.error_count).sum();
        let error_rate = if total_requests > 0 {
            total_errors as f64 / total_requests as f64 * 100.0
        } else {
            0.0
        };
        let success_rate = (total_requests > 0).then(|| (100.0 - error_rate).max(0.0));

        let global: PercentileSet = self.global.percentiles(now);
        let requests_per_minute = global.count as f64 * 60.0 / config.window_seconds as f64;

        MetricsSnapshot {
            endpoints,
            summary: Summary {
                total_requests,
                total_errors,
                error_rate,
                success_rate,
                avg_response_time: global.mean,
                window_seconds: config.window_seconds,
                window_request_count: global.count,
                requests_per_minute,
                p50: global.p50,
                p90: global.p90,
                p95: global.p95,
                p99: global.p99,
                tracked_endpoints: self.endpoints.len(),
                max_endpoints: config.max_endpoints,
            },
            distribution: compute_distribution(&self.distribution),
        }
    }
}

// ── Distribution histogram for the reporting surface ────────────

fn compute_distribution(hist: &Histogram<u64>) -> Vec<DistBucket> {
    if hist.len() == 0 {
        return Vec::new();
    }

    let bounds = DIST_BOUNDARIES;
    let mut counts = vec![0u64; bounds.len() + 1]; // +1 for overflow

    for iv in hist.iter_recorded() {
        let val = iv.value_iterated_to();
        // First boundary >= val, or the overflow slot
        let idx = match bounds.binary_search(&val) {
            Ok(i) | Err(i) => i,
        };
        counts[idx] += iv.count_at_value();
    }

    let to_ms = |us: u64| us as f64 / 1_000.0;
    let mut result = Vec::with_capacity(counts.len());
    let mut prev = 0u64;
    for (i, &boundary) in bounds.iter().enumerate() {
        if counts[i] > 0 {
            result.push(DistBucket {
                range_start_ms: to_ms(prev),
                range_end_ms: to_ms(boundary),
                count: counts[i],
            });
        }
        prev = boundary;
    }
    if counts[bounds.len()] > 0 {
        result.push(DistBucket {
            range_start_ms: to_ms(prev),
            range_end_ms: to_ms(hist.max()),
            count: counts[bounds.len()],
        });
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn aggregator(max_endpoints: usize) -> (MetricsAggregator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(Duration::from_secs(1_000)));
        let config = AggregatorConfig {
            max_endpoints,
            ..Default::default()
        };
        let aggregator = MetricsAggregator::new(config, clock.clone()).unwrap();
        (aggregator, clock)
    }

    fn key(i: usize) -> EndpointKey {
        EndpointKey::new("GET", format!("/items/{i}"))
    }

    #[test]
    fn invalid_config_fails_construction() {
        let config = AggregatorConfig {
            max_endpoints: 0,
            ..Default::default()
        };
        assert!(MetricsAggregator::new(config, Arc::new(ManualClock::new())).is_err());
    }

    #[test]
    fn counts_successes_errors_and_statuses() {
        let (agg, _) = aggregator(10);
        agg.record_request("get", "/users", 200, 10.0);
        agg.record_request("GET", "/users", 200, 20.0);
        agg.record_request("GET", "/users", 404, 5.0);
        agg.record_request("GET", "/users", 500, 30.0);

        let snap = agg.snapshot();
        let users = snap.endpoint(&EndpointKey::new("GET", "/users")).unwrap();
        assert_eq!(users.request_count, 4);
        assert_eq!(users.success_count, 2);
        assert_eq!(users.error_count, 2);
        assert_eq!(users.status_codes.get(&200), Some(&2));
        assert_eq!(users.status_codes.get(&404), Some(&1));
        assert_eq!(users.status_codes.get(&500), Some(&1));
        assert_eq!(users.avg_response_time, 16.25);

        assert_eq!(snap.summary.total_requests, 4);
        assert_eq!(snap.summary.total_errors, 2);
        assert_eq!(snap.summary.error_rate, 50.0);
        assert_eq!(snap.summary.success_rate, Some(50.0));
    }

    #[test]
    fn negative_duration_is_recorded_as_zero() {
        let (agg, _) = aggregator(10);
        agg.record(key(1), 200, -5.0);

        let snap = agg.snapshot();
        let stats = snap.endpoint(&key(1)).unwrap();
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.p50, 0.0);
        assert_eq!(stats.p99, 0.0);
        assert_eq!(stats.avg_response_time, 0.0);
    }

    #[test]
    fn non_finite_duration_is_recorded_as_zero() {
        let (agg, _) = aggregator(10);
        agg.record(key(1), 200, f64::NAN);
        agg.record(key(1), 200, f64::INFINITY);
        let snap = agg.snapshot();
        assert_eq!(snap.endpoint(&key(1)).unwrap().p99, 0.0);
    }

    #[test]
    fn unusual_status_codes_are_stored_as_given() {
        let (agg, _) = aggregator(10);
        agg.record(key(1), 0, 1.0);
        agg.record(key(1), 999, 1.0);
        let snap = agg.snapshot();
        let stats = snap.endpoint(&key(1)).unwrap();
        assert_eq!(stats.status_codes.get(&0), Some(&1));
        assert_eq!(stats.status_codes.get(&999), Some(&1));
    }

    #[test]
    fn keeps_the_most_recently_touched_endpoints() {
        let (agg, _) = aggregator(10);
        for i in 0..20 {
            agg.record(key(i), 200, 100.0);
        }

        let snap = agg.snapshot();
        assert_eq!(snap.endpoints.len(), 10);
        for i in 10..20 {
            assert!(snap.endpoint(&key(i)).is_some(), "missing {}", key(i));
        }
        assert_eq!(snap.summary.tracked_endpoints, 10);
    }

    #[test]
    fn eviction_picks_the_oldest_last_access() {
        let (agg, clock) = aggregator(3);
        agg.record(key(0), 200, 1.0);
        clock.advance(Duration::from_secs(1));
        agg.record(key(1), 200, 1.0);
        clock.advance(Duration::from_secs(1));
        agg.record(key(2), 200, 1.0);
        clock.advance(Duration::from_secs(1));

        // Touching key 0 makes key 1 the oldest.
        agg.record(key(0), 200, 1.0);
        clock.advance(Duration::from_secs(1));
        agg.record(key(3), 200, 1.0);

        assert!(agg.is_tracked(&key(0)));
        assert!(!agg.is_tracked(&key(1)));
        assert!(agg.is_tracked(&key(2)));
        assert!(agg.is_tracked(&key(3)));
    }

    #[test]
    fn tracked_count_never_exceeds_cap() {
        let (agg, clock) = aggregator(5);
        for round in 0..200usize {
            agg.record(key(round * 7 % 13), 200, round as f64);
            if round % 3 == 0 {
                clock.advance(Duration::from_millis(10));
            }
            assert!(agg.tracked_endpoints() <= 5);
        }
    }

    #[test]
    fn percentiles_reflect_the_window() {
        let (agg, clock) = aggregator(10);
        for v in 1..=100 {
            agg.record(key(1), 200, v as f64);
        }
        let snap = agg.snapshot();
        let stats = snap.endpoint(&key(1)).unwrap();
        assert!((stats.p50 - 50.5).abs() < 3.0);
        assert!(stats.p90 <= stats.p95 && stats.p95 <= stats.p99);
        assert_eq!(snap.summary.window_request_count, 100);
        assert_eq!(snap.summary.requests_per_minute, 20.0);

        // Far past the window: counters stay, percentiles empty out.
        clock.advance(Duration::from_secs(3_600));
        let snap = agg.snapshot();
        let stats = snap.endpoint(&key(1)).unwrap();
        assert_eq!(stats.request_count, 100);
        assert_eq!(stats.window_request_count, 0);
        assert_eq!(stats.p50, 0.0);
    }

    #[test]
    fn distribution_buckets_all_samples() {
        let (agg, _) = aggregator(10);
        agg.record(key(1), 200, 0.5);
        agg.record(key(1), 200, 3.0);
        agg.record(key(1), 200, 40.0);
        agg.record(key(1), 200, 20_000.0);

        let dist = agg.snapshot().distribution;
        let total: u64 = dist.iter().map(|b| b.count).sum();
        assert_eq!(total, 4);
        assert_eq!(dist.first().map(|b| b.range_start_ms), Some(0.0));
    }

    #[test]
    fn reset_clears_all_endpoints() {
        let (agg, _) = aggregator(10);
        agg.record(key(1), 200, 1.0);
        agg.reset();
        let snap = agg.snapshot();
        assert!(snap.endpoints.is_empty());
        assert_eq!(snap.summary.total_requests, 0);
        assert_eq!(snap.summary.success_rate, None);
    }

    #[test]
    fn concurrent_writers_are_all_counted() {
        let (agg, _) = aggregator(1_000);
        let agg = Arc::new(agg);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        agg.record(key(i % 20), if t % 2 == 0 { 200 } else { 503 }, i as f64);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = agg.snapshot();
        assert_eq!(snap.summary.total_requests, 4_000);
        assert_eq!(snap.summary.total_errors, 2_000);
    }
}
