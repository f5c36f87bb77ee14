use std::collections::VecDeque;
use std::time::Duration;

use super::digest::PercentileEstimator;
use super::percentiles::PercentileSet;

/// Samples that landed in one `bucket_seconds` slice of time.
#[derive(Debug, Clone)]
struct Bucket {
    start_secs: u64,
    digest: PercentileEstimator,
    count: u64,
    total: f64,
}

/// Latency statistics over a trailing time window.
///
/// The window is split into fixed-width buckets, each with its own digest.
/// Writes drop buckets that fell fully out of the window; reads skip them
/// without mutating, so a snapshot never needs exclusive access.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    window_secs: u64,
    bucket_secs: u64,
    max_centroids: usize,
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    pub fn new(window_secs: u64, bucket_secs: u64, max_centroids: usize) -> Self {
        let bucket_secs = bucket_secs.max(1);
        let window_secs = window_secs.max(bucket_secs);
        Self {
            window_secs,
            bucket_secs,
            max_centroids,
            buckets: VecDeque::with_capacity((window_secs / bucket_secs) as usize + 1),
        }
    }

    pub fn add(&mut self, value: f64, now: Duration) {
        self.trim(now);

        let now_secs = now.as_secs();
        let start_secs = (now_secs / self.bucket_secs) * self.bucket_secs;

        let needs_bucket = self
            .buckets
            .back()
            .map_or(true, |b| b.start_secs != start_secs);
        if needs_bucket {
            self.buckets.push_back(Bucket {
                start_secs,
                digest: PercentileEstimator::new(self.max_centroids),
                count: 0,
                total: 0.0,
            });
        }

        if let Some(bucket) = self.buckets.back_mut() {
            bucket.digest.insert(value);
            bucket.count += 1;
            bucket.total += value;
        }
    }

    fn cutoff_secs(&self, now: Duration) -> u64 {
        now.as_secs().saturating_sub(self.window_secs)
    }

    fn trim(&mut self, now: Duration) {
        let cutoff = self.cutoff_secs(now);
        while self
            .buckets
            .front()
            .is_some_and(|b| b.start_secs + self.bucket_secs <= cutoff)
        {
            self.buckets.pop_front();
        }
    }

    fn live(&self, now: Duration) -> impl Iterator<Item = &Bucket> {
        let cutoff = self.cutoff_secs(now);
        let bucket_secs = self.bucket_secs;
        self.buckets
            .iter()
            .filter(move |b| b.start_secs + bucket_secs > cutoff)
    }

    pub fn count(&self, now: Duration) -> u64 {
        self.live(now).map(|b| b.count).sum()
    }

    pub fn mean(&self, now: Duration) -> f64 {
        let (total, count) = self
            .live(now)
            .fold((0.0, 0u64), |(t, c), b| (t + b.total, c + b.count));
        if count == 0 {
            return 0.0;
        }
        total / count as f64
    }

    /// One digest covering every live bucket.
    pub fn digest(&self, now: Duration) -> PercentileEstimator {
        let mut merged = PercentileEstimator::new(self.max_centroids);
        for bucket in self.live(now) {
            merged.merge(&bucket.digest);
        }
        merged
    }

    pub fn percentiles(&self, now: Duration) -> PercentileSet {
        PercentileSet::from_digest(&self.digest(now), self.mean(now))
    }

    /// Buckets currently held, including any not yet trimmed.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
