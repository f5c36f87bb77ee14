//! Streaming quantile estimation with a fixed memory bound.
//!
//! [`PercentileEstimator`] is a merging t-digest: samples are folded into an
//! ordered list of `(mean, weight)` centroids. A centroid near the median may
//! grow large, while centroids near the tails stay small, so extreme
//! percentiles keep more precision than the middle of the distribution.
//! Memory is capped by `max_centroids` no matter how many samples arrive.

/// Default centroid cap. Around 100 centroids keeps median error well
/// under one percent of the value range for latency-shaped data.
pub const DEFAULT_MAX_CENTROIDS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Centroid {
    mean: f64,
    weight: f64,
}

impl Centroid {
    fn new(mean: f64, weight: f64) -> Self {
        Self { mean, weight }
    }

    /// Fold `weight` samples with the given mean into this centroid.
    fn absorb(&mut self, mean: f64, weight: f64) {
        let total = self.weight + weight;
        if total > 0.0 {
            self.mean += (mean - self.mean) * weight / total;
            self.weight = total;
        }
    }
}

/// Largest weight a centroid may reach at quantile `q` of a digest holding
/// `total` samples. Shrinks to 1 at both tails.
fn size_bound(q: f64, total: f64, max_centroids: usize) -> f64 {
    let q = q.clamp(0.0, 1.0);
    (4.0 * total * q * (1.0 - q) / max_centroids as f64).max(1.0)
}

fn lerp(from: f64, to: f64, t: f64) -> f64 {
    if t >= 1.0 {
        return to;
    }
    from + (to - from) * t.max(0.0)
}

/// Bounded-memory streaming digest answering approximate quantile queries.
#[derive(Debug, Clone)]
pub struct PercentileEstimator {
    /// Sorted by mean.
    centroids: Vec<Centroid>,
    max_centroids: usize,
    count: f64,
    min: f64,
    max: f64,
}

impl Default for PercentileEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CENTROIDS)
    }
}

impl PercentileEstimator {
    pub fn new(max_centroids: usize) -> Self {
        let max_centroids = max_centroids.max(1);
        Self {
            centroids: Vec::with_capacity(max_centroids + 1),
            max_centroids,
            count: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }

    /// Number of samples ingested.
    pub fn count(&self) -> u64 {
        self.count as u64
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    pub fn centroid_count(&self) -> usize {
        self.centroids.len()
    }

    pub fn max_centroids(&self) -> usize {
        self.max_centroids
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0.0 {
            return 0.0;
        }
        let sum: f64 = self.centroids.iter().map(|c| c.mean * c.weight).sum();
        sum / self.count
    }

    /// Add one sample. Non-finite input is recorded as `0.0`.
    pub fn insert(&mut self, value: f64) {
        let value = if value.is_finite() { value } else { 0.0 };
        self.add_weighted(value, 1.0);
        while self.centroids.len() > self.max_centroids {
            self.merge_smallest_pair();
        }
    }

    fn add_weighted(&mut self, value: f64, weight: f64) {
        if self.count == 0.0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += weight;

        let idx = self.centroids.partition_point(|c| c.mean < value);
        let nearest = match (idx.checked_sub(1), idx < self.centroids.len()) {
            (None, false) => {
                self.centroids.push(Centroid::new(value, weight));
                return;
            }
            (None, true) => idx,
            (Some(below), false) => below,
            (Some(below), true) => {
                let below_gap = value - self.centroids[below].mean;
                let above_gap = self.centroids[idx].mean - value;
                if below_gap <= above_gap {
                    below
                } else {
                    idx
                }
            }
        };

        let weight_before: f64 = self.centroids[..nearest].iter().map(|c| c.weight).sum();
        let candidate = self.centroids[nearest];
        let proposed = candidate.weight + weight;
        let q = (weight_before + proposed / 2.0) / self.count;

        if proposed <= size_bound(q, self.count, self.max_centroids) {
            self.centroids[nearest].absorb(value, weight);
        } else {
            self.centroids.insert(idx, Centroid::new(value, weight));
        }
    }

    /// Merge the adjacent pair with the smallest combined weight.
    fn merge_smallest_pair(&mut self) {
        if self.centroids.len() < 2 {
            return;
        }
        let mut best = 0;
        let mut best_weight = f64::INFINITY;
        for (i, pair) in self.centroids.windows(2).enumerate() {
            let combined = pair[0].weight + pair[1].weight;
            if combined < best_weight {
                best_weight = combined;
                best = i;
            }
        }
        let right = self.centroids.remove(best + 1);
        self.centroids[best].absorb(right.mean, right.weight);
    }

    /// Re-pack centroids under the scale bound, then enforce the cap.
    fn compress(&mut self) {
        if self.centroids.len() > 1 {
            let total = self.count;
            let centroids = std::mem::take(&mut self.centroids);
            let mut packed: Vec<Centroid> = Vec::with_capacity(centroids.len());
            let mut weight_before = 0.0;

            for c in centroids {
                if let Some(last) = packed.last_mut() {
                    let combined = last.weight + c.weight;
                    let q = (weight_before + combined / 2.0) / total;
                    if combined <= size_bound(q, total, self.max_centroids) {
                        last.absorb(c.mean, c.weight);
                        continue;
                    }
                    weight_before += last.weight;
                }
                packed.push(c);
            }
            self.centroids = packed;
        }

        while self.centroids.len() > self.max_centroids {
            self.merge_smallest_pair();
        }
    }

    /// Estimate the value at quantile `q` (0.0..=1.0). Out-of-range `q` is
    /// clamped. Returns `0.0` for an empty digest.
    pub fn quantile(&self, q: f64) -> f64 {
        let (first, last) = match (self.centroids.first(), self.centroids.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return 0.0,
        };
        let q = if q.is_nan() { 0.0 } else { q.clamp(0.0, 1.0) };

        if self.centroids.len() == 1 {
            return lerp(self.min, self.max, q);
        }

        let target = q * self.count;

        // Each centroid's mass is centred on its mean.
        let mut center = first.weight / 2.0;
        if target <= center {
            return lerp(self.min, first.mean, target / center);
        }

        for pair in self.centroids.windows(2) {
            let next_center = center + (pair[0].weight + pair[1].weight) / 2.0;
            if target <= next_center {
                let t = (target - center) / (next_center - center);
                return lerp(pair[0].mean, pair[1].mean, t);
            }
            center = next_center;
        }

        let tail = self.count - center;
        let t = if tail > 0.0 {
            (target - center) / tail
        } else {
            1.0
        };
        lerp(last.mean, self.max, t)
    }

    /// Fold another digest into this one and re-compress.
    pub fn merge(&mut self, other: &PercentileEstimator) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.count += other.count;
        self.centroids.extend_from_slice(&other.centroids);
        self.centroids.sort_by(|a, b| a.mean.total_cmp(&b.mean));
        self.compress();
    }

    pub fn reset(&mut self) {
        self.centroids.clear();
        self.count = 0.0;
        self.min = 0.0;
        self.max = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn exact_quantile(sorted: &[f64], q: f64) -> f64 {
        let rank = ((sorted.len() - 1) as f64 * q).round() as usize;
        sorted[rank]
    }

    #[test]
    fn empty_digest_reports_zero() {
        let digest = PercentileEstimator::default();
        assert_eq!(digest.quantile(0.5), 0.0);
        assert_eq!(digest.quantile(0.99), 0.0);
        assert_eq!(digest.mean(), 0.0);
        assert_eq!(digest.count(), 0);
    }

    #[test]
    fn single_sample_answers_every_quantile() {
        let mut digest = PercentileEstimator::default();
        digest.insert(42.0);
        assert_eq!(digest.quantile(0.0), 42.0);
        assert_eq!(digest.quantile(0.5), 42.0);
        assert_eq!(digest.quantile(1.0), 42.0);
    }

    #[test]
    fn non_finite_samples_are_recorded_as_zero() {
        let mut digest = PercentileEstimator::default();
        digest.insert(f64::NAN);
        digest.insert(f64::INFINITY);
        digest.insert(f64::NEG_INFINITY);
        assert_eq!(digest.count(), 3);
        assert_eq!(digest.quantile(1.0), 0.0);
        assert_eq!(digest.max(), 0.0);
    }

    #[test]
    fn median_of_shuffled_uniform_stream_is_close() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut values: Vec<f64> = (0..10_000).map(|_| rng.gen_range(0.0..1000.0)).collect();

        let mut digest = PercentileEstimator::default();
        for v in &values {
            digest.insert(*v);
        }
        values.sort_by(f64::total_cmp);

        for q in [0.5, 0.9, 0.95, 0.99] {
            let estimate = digest.quantile(q);
            let exact = exact_quantile(&values, q);
            assert!(
                (estimate - exact).abs() < 20.0,
                "q={q}: estimate {estimate} vs exact {exact}"
            );
        }
    }

    #[test]
    fn median_of_sorted_stream_is_close() {
        let mut digest = PercentileEstimator::default();
        for v in 1..=5_001 {
            digest.insert(v as f64);
        }
        let median = digest.quantile(0.5);
        assert!((median - 2_501.0).abs() < 100.0, "median {median}");
    }

    #[test]
    fn quantile_is_monotonic() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut digest = PercentileEstimator::new(50);
        for _ in 0..5_000 {
            // Long-tailed, latency-like
            let v: f64 = rng.gen_range(0.0f64..1.0).powi(4) * 2_000.0;
            digest.insert(v);
        }

        let mut previous = f64::NEG_INFINITY;
        for step in 0..=1000 {
            let q = step as f64 / 1000.0;
            let value = digest.quantile(q);
            assert!(value >= previous, "q={q}: {value} < {previous}");
            previous = value;
        }
        assert_eq!(digest.quantile(0.0), digest.min());
        assert_eq!(digest.quantile(1.0), digest.max());
    }

    #[test]
    fn centroid_count_stays_within_cap() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut digest = PercentileEstimator::new(20);
        for _ in 0..20_000 {
            digest.insert(rng.gen_range(0.0..1.0));
            assert!(digest.centroid_count() <= 20);
        }
        assert_eq!(digest.count(), 20_000);
    }

    #[test]
    fn merge_combines_two_halves() {
        let mut values: Vec<f64> = (0..4_000).map(|v| v as f64).collect();
        values.shuffle(&mut StdRng::seed_from_u64(5));

        let mut left = PercentileEstimator::default();
        let mut right = PercentileEstimator::default();
        for (i, v) in values.iter().enumerate() {
            if i % 2 == 0 {
                left.insert(*v);
            } else {
                right.insert(*v);
            }
        }

        left.merge(&right);
        assert_eq!(left.count(), 4_000);
        assert!(left.centroid_count() <= DEFAULT_MAX_CENTROIDS);
        assert_eq!(left.min(), 0.0);
        assert_eq!(left.max(), 3_999.0);
        let median = left.quantile(0.5);
        assert!((median - 2_000.0).abs() < 80.0, "median {median}");
    }

    #[test]
    fn merge_into_empty_copies_other() {
        let mut other = PercentileEstimator::default();
        for v in [5.0, 10.0, 15.0] {
            other.insert(v);
        }
        let mut digest = PercentileEstimator::default();
        digest.merge(&other);
        assert_eq!(digest.count(), 3);
        assert_eq!(digest.min(), 5.0);
        assert_eq!(digest.max(), 15.0);
        assert_eq!(digest.quantile(0.5), 10.0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut digest = PercentileEstimator::default();
        for v in 0..100 {
            digest.insert(v as f64);
        }
        digest.reset();
        assert!(digest.is_empty());
        assert_eq!(digest.count(), 0);
        assert_eq!(digest.quantile(0.5), 0.0);
    }
}
