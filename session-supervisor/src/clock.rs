//! Monotonic clock and cancellation-aware timers (C1).
//!
//! Grounded on the teacher's `timer.rs`, generalized from a per-frame
//! `f32 delta_time` ledger (appropriate for a heartbeat-driven game loop) to
//! `tokio::time::Instant` deadlines, which fit the supervisor's tick-driven
//! but fundamentally async step loop.

use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// Opaque handle identifying one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Monotonic now, plus a small scheduled-timer ledger.
///
/// Unlike the teacher's per-frame `Timer`, entries here carry an absolute
/// deadline so `poll_expired` can be called at an arbitrary cadence (driven
/// by the supervisor's step loop, not a fixed frame rate) without losing
/// precision across calls.
pub struct Clock {
    next_id: u64,
    timers: HashMap<TimerId, Instant>,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            timers: HashMap::new(),
        }
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Schedules a new timer `duration` from now. Returns a handle usable
    /// with [`cancel`](Self::cancel).
    pub fn start_timer(&mut self, duration: Duration) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.timers.insert(id, Instant::now() + duration);
        id
    }

    /// Cancels a timer if it still exists. No-op otherwise.
    pub fn cancel(&mut self, id: TimerId) {
        self.timers.remove(&id);
    }

    /// Drains and returns every timer whose deadline has passed.
    pub fn poll_expired(&mut self) -> Vec<TimerId> {
        let now = Instant::now();
        let expired: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.timers.remove(id);
        }
        expired
    }

    /// Checks a single timer by handle: true if it exists and its deadline
    /// has passed. Consumes the timer either way it is found expired, so a
    /// given firing is only ever reported once (callers that `take()` the
    /// `TimerId` out of an `Option` before calling this get the same
    /// one-shot behavior `poll_expired` gives bulk callers).
    pub fn is_expired(&mut self, id: TimerId) -> bool {
        match self.timers.get(&id) {
            Some(deadline) if *deadline <= Instant::now() => {
                self.timers.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Returns the duration until the next timer fires, if any is scheduled.
    /// Used by the supervisor's `tokio::select!` step loop to bound how long
    /// it sleeps before re-checking state.
    pub fn next_deadline_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers
            .values()
            .map(|deadline| deadline.saturating_duration_since(now))
            .min()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeps until `duration` has elapsed, unless `cancel` resolves first.
///
/// This is the cancellation-aware delay used throughout: background
/// downloads, the status hint poll, and the pause-retention timer all race
/// their sleep against the supervisor's per-run cancellation token via this
/// helper instead of a bare `tokio::time::sleep`. Returns `Err(())` if
/// cancellation won the race, so callers can short-circuit their loop.
pub async fn delay_or_cancelled(
    duration: Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<(), ()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(()),
    }
}
