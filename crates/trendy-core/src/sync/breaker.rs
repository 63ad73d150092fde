//! Circuit breaker that pauses flushing after the server rate-limits us

use std::time::Duration;

use tokio::time::Instant;

/// Rate-limit circuit breaker.
///
/// Each consecutive trip doubles the pause, starting at `base` and capped at
/// `max`. A server supplied `Retry-After` is a floor for the pause.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    base: Duration,
    max: Duration,
    consecutive_trips: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            consecutive_trips: 0,
            open_until: None,
        }
    }

    /// Open the breaker, returning how long it stays open
    pub fn trip(&mut self, retry_after: Option<Duration>) -> Duration {
        let exponent = self.consecutive_trips.min(16);
        let backoff = self
            .base
            .saturating_mul(1_u32 << exponent)
            .min(self.max);
        let pause = retry_after.map_or(backoff, |floor| backoff.max(floor));

        self.consecutive_trips = self.consecutive_trips.saturating_add(1);
        self.open_until = Some(Instant::now() + pause);

        tracing::warn!(
            trips = self.consecutive_trips,
            pause_secs = pause.as_secs(),
            "Rate limited, pausing mutation flush"
        );
        pause
    }

    /// Whether flushing is currently paused
    pub fn is_open(&self) -> bool {
        self.open_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Time left before flushing may resume
    pub fn remaining(&self) -> Option<Duration> {
        let until = self.open_until?;
        let now = Instant::now();
        (now < until).then(|| until - now)
    }

    /// A flush went through without being rate limited
    pub fn record_success(&mut self) {
        self.consecutive_trips = 0;
        self.open_until = None;
    }

    pub fn reset(&mut self) {
        self.record_success();
    }

    pub const fn consecutive_trips(&self) -> u32 {
        self.consecutive_trips
    }
}
