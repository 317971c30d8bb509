//! QoS Monitor (C6): derives a coarse `isHealthy` signal from the stream of
//! dispatched messages, independent of the supervisor's state transitions
//! (spec §4.6). Grounded on the teacher's `MiddleLayer` message-dispatch loop
//! in `backbone-lib/src/middle_layer.rs`, which already counts inbound
//! traffic per frame; generalized here from "per-frame counter" to "rolling
//! gap-since-last-message" so it composes with the supervisor's ping/pong
//! healthiness check (spec §4.1).

use tokio::time::{Duration, Instant};

/// Tracks how long it has been since any message was last observed on the
/// connection, and reports unhealthy once that gap exceeds `stale_after`.
#[derive(Debug)]
pub struct QosMonitor {
    stale_after: Duration,
    last_message_at: Option<Instant>,
}

impl QosMonitor {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            last_message_at: None,
        }
    }

    /// Call once for every message dispatched on the connection (inbound or
    /// outbound), resetting the staleness clock.
    pub fn observe_message(&mut self, at: Instant) {
        self.last_message_at = Some(at);
    }

    /// Whether the connection looks healthy as of `now`: a message must have
    /// been observed, and recently enough.
    pub fn is_healthy(&self, now: Instant) -> bool {
        match self.last_message_at {
            None => false,
            Some(last) => now.saturating_duration_since(last) < self.stale_after,
        }
    }

    pub fn reset(&mut self) {
        self.last_message_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_before_any_message_observed() {
        let monitor = QosMonitor::new(Duration::from_secs(5));
        assert!(!monitor.is_healthy(Instant::now()));
    }

    #[test]
    fn healthy_immediately_after_a_message() {
        let mut monitor = QosMonitor::new(Duration::from_secs(5));
        let now = Instant::now();
        monitor.observe_message(now);
        assert!(monitor.is_healthy(now));
    }

    #[test]
    fn becomes_unhealthy_once_stale() {
        let mut monitor = QosMonitor::new(Duration::from_millis(10));
        let t0 = Instant::now();
        monitor.observe_message(t0);
        let later = t0 + Duration::from_millis(50);
        assert!(!monitor.is_healthy(later));
    }

    #[test]
    fn reset_clears_healthiness() {
        let mut monitor = QosMonitor::new(Duration::from_secs(5));
        let now = Instant::now();
        monitor.observe_message(now);
        monitor.reset();
        assert!(!monitor.is_healthy(now));
    }
}
