//! Consecutive failure tracking and retry throttling for the reconnect
//! supervisor.

use tracing::{debug, warn};

/// What the supervisor should do on a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// Make one reconnect attempt
    Attempt,
    /// Skip this tick to slow down retries
    Throttled,
}

/// Counts consecutive connection failures and spaces out retries once they
/// pile up.
///
/// While the failure count exceeds `failure_threshold`, only every
/// `throttle_ticks`-th supervisor tick produces an attempt.
#[derive(Debug, Clone)]
pub struct RetryThrottle {
    failures: u32,
    ticks: u32,
    failure_threshold: u32,
    throttle_ticks: u32,
}

impl RetryThrottle {
    /// Create a throttle
    pub fn new(failure_threshold: u32, throttle_ticks: u32) -> Self {
        Self {
            failures: 0,
            ticks: 0,
            failure_threshold,
            throttle_ticks: throttle_ticks.max(1),
        }
    }

    /// Record a failed attempt, returning the consecutive count
    pub fn record_failure(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        if self.failures == self.failure_threshold + 1 {
            warn!(
                "{} consecutive connection failures, throttling retries",
                self.failures
            );
        }
        self.failures
    }

    /// Record a successful attempt
    pub fn record_success(&mut self) {
        if self.failures > 0 {
            debug!("Connection recovered after {} failure(s)", self.failures);
        }
        self.failures = 0;
        self.ticks = 0;
    }

    /// Forget failures and tick progress (immediate reconnect)
    pub fn reset(&mut self) {
        self.failures = 0;
        self.ticks = 0;
    }

    /// Restart tick counting for a new supervisor run
    pub fn restart_ticks(&mut self) {
        self.ticks = 0;
    }

    /// Current consecutive failure count
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether retries are currently being spaced out
    pub fn is_throttled(&self) -> bool {
        self.failures > self.failure_threshold
    }

    /// Advance one supervisor tick
    pub fn tick(&mut self) -> TickDecision {
        self.ticks += 1;
        if self.is_throttled() && self.ticks < self.throttle_ticks {
            debug!(
                "Throttled reconnect tick {}/{} ({} failures)",
                self.ticks, self.throttle_ticks, self.failures
            );
            return TickDecision::Throttled;
        }
        self.ticks = 0;
        TickDecision::Attempt
    }
}

impl Default for RetryThrottle {
    fn default() -> Self {
        Self::new(2, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_every_tick_below_threshold() {
        let mut throttle = RetryThrottle::default();
        assert_eq!(throttle.tick(), TickDecision::Attempt);
        throttle.record_failure();
        assert_eq!(throttle.tick(), TickDecision::Attempt);
        throttle.record_failure();
        assert_eq!(throttle.tick(), TickDecision::Attempt);
        assert!(!throttle.is_throttled());
    }

    #[test]
    fn test_throttles_to_every_fifth_tick() {
        let mut throttle = RetryThrottle::default();
        for _ in 0..3 {
            throttle.record_failure();
        }
        assert!(throttle.is_throttled());

        let decisions: Vec<_> = (0..10).map(|_| throttle.tick()).collect();
        let attempts: Vec<usize> = decisions
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == TickDecision::Attempt)
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(attempts, vec![5, 10]);
    }

    #[test]
    fn test_success_clears_throttle() {
        let mut throttle = RetryThrottle::default();
        for _ in 0..5 {
            throttle.record_failure();
        }
        throttle.tick();
        throttle.record_success();
        assert_eq!(throttle.failures(), 0);
        assert_eq!(throttle.tick(), TickDecision::Attempt);
    }
}
