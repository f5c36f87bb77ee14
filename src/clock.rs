use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

/// Monotonic time source shared by the aggregator and the probe scheduler.
///
/// `now()` is the elapsed time since the clock's origin. Values never go
/// backwards, so differences between two readings are always valid durations.
/// Deadlines are expressed on the same scale and awaited with `sleep_until`.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;

    /// Resolves once `now()` has reached `deadline`.
    async fn sleep_until(&self, deadline: Duration);
}

/// Production clock backed by tokio's `Instant`.
///
/// Under `tokio::time::pause()` this clock follows the paused runtime, which
/// keeps timeouts and recorded timestamps in agreement during tests.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep_until(&self, deadline: Duration) {
        tokio::time::sleep_until(self.origin + deadline).await;
    }
}

/// Hand-driven clock for deterministic cooldown, window and deadline tests.
/// Sleepers wake only when `advance` moves the clock past their deadline.
#[derive(Debug)]
pub struct ManualClock {
    now: watch::Sender<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Duration::ZERO)
    }

    pub fn starting_at(now: Duration) -> Self {
        let (now, _) = watch::channel(now);
        Self { now }
    }

    pub fn advance(&self, by: Duration) {
        self.now.send_modify(|now| *now += by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.borrow()
    }

    async fn sleep_until(&self, deadline: Duration) {
        let mut now = self.now.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = now.wait_for(|now| *now >= deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::starting_at(Duration::from_secs(5));
        assert_eq!(clock.now(), Duration::from_secs(5));
        assert_eq!(clock.now(), Duration::from_secs(5));

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Duration::from_millis(6500));
    }

    #[tokio::test]
    async fn manual_sleep_wakes_only_when_advanced_past_deadline() {
        let clock = std::sync::Arc::new(ManualClock::new());
        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep_until(Duration::from_secs(2)).await })
        };

        clock.advance(Duration::from_secs(1));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(1));
        sleeper.await.unwrap();
        assert_eq!(clock.now(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_sleeps_until_deadline() {
        let clock = TokioClock::new();
        clock.sleep_until(Duration::from_millis(750)).await;
        assert_eq!(clock.now(), Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(clock.now(), Duration::from_secs(3));
    }
}
