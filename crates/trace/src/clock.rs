use std::fmt;

use chrono::Utc;
use pagetrace_core::time::unix_seconds;
use tokio::time::Instant;

/// Source of span timestamps, in unix seconds.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> f64;
}

/// Wall-clock anchored once at construction, then advanced by a monotonic
/// instant so timestamps never go backwards. Follows tokio's clock, which
/// makes paused-time tests deterministic.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    wall_origin: f64,
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            wall_origin: unix_seconds(Utc::now()),
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.wall_origin + self.origin.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_paused_tokio_time() {
        let clock = MonotonicClock::new();
        let start = clock.now();
        tokio::time::advance(Duration::from_millis(1500)).await;
        let elapsed = clock.now() - start;
        assert!((elapsed - 1.5).abs() < 1e-6, "elapsed {elapsed}");
    }
}
