//! Incident reporting: opaque payloads describing client-observed anomalies
//! that are worth surfacing to the host app / telemetry, without the
//! supervisor itself knowing anything about where they end up. A structured
//! incident doubles as a wire-attachable abort trailer, not just a local log
//! record.

use serde::{Deserialize, Serialize};

/// A single classified anomaly report. Kept serializable so it can double as
/// the `AbortSessionStart` trailer payload as well as a local log record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Incident {
    pub kind: IncidentKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IncidentKind {
    /// A `Volatile/serverStatusHint.json` document failed to parse.
    InvalidStatusHint,
    /// `sessionPingPongDurationIncidentThreshold` was exceeded for some ping id.
    PingPongDurationExceeded,
    /// Session-start activation (resource loader `activate()`/`specialize()`) threw.
    ActivationFailed,
    /// A generic client-side failure not otherwise classified.
    Generic,
}

/// A bounded collection of incidents for one session, enforcing a
/// per-session cap on ping/pong duration incidents and "not more than once
/// per ping id".
#[derive(Debug, Default)]
pub struct IncidentTracker {
    incidents: Vec<Incident>,
    ping_pong_incident_ids: std::collections::HashSet<u32>,
    ping_pong_incidents_reported: u32,
}

impl IncidentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, kind: IncidentKind, detail: impl Into<String>) {
        self.incidents.push(Incident {
            kind,
            detail: detail.into(),
        });
    }

    /// Reports a ping/pong duration incident for `ping_id`, subject to the
    /// per-session cap and the once-per-id rule. Returns whether an incident
    /// was actually recorded.
    pub fn report_ping_pong_duration_exceeded(&mut self, ping_id: u32, max_per_session: u32) -> bool {
        if self.ping_pong_incidents_reported >= max_per_session {
            return false;
        }
        if !self.ping_pong_incident_ids.insert(ping_id) {
            return false;
        }
        self.ping_pong_incidents_reported += 1;
        self.report(
            IncidentKind::PingPongDurationExceeded,
            format!("ping id {ping_id} exceeded round-trip threshold"),
        );
        true
    }

    pub fn incidents(&self) -> &[Incident] {
        &self.incidents
    }

    /// Serializes the most recent incident for use as an `AbortSessionStart`
    /// trailer, if any were recorded.
    pub fn latest_trailer(&self) -> Option<Vec<u8>> {
        let latest = self.incidents.last()?;
        serde_json::to_vec(latest).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_pong_incident_is_not_reported_twice_for_same_id() {
        let mut tracker = IncidentTracker::new();
        assert!(tracker.report_ping_pong_duration_exceeded(1, 3));
        assert!(!tracker.report_ping_pong_duration_exceeded(1, 3));
        assert_eq!(tracker.incidents().len(), 1);
    }

    #[test]
    fn ping_pong_incident_respects_per_session_cap() {
        let mut tracker = IncidentTracker::new();
        assert!(tracker.report_ping_pong_duration_exceeded(1, 1));
        assert!(!tracker.report_ping_pong_duration_exceeded(2, 1));
        assert_eq!(tracker.incidents().len(), 1);
    }

    #[test]
    fn latest_trailer_serializes_most_recent_incident() {
        let mut tracker = IncidentTracker::new();
        tracker.report(IncidentKind::ActivationFailed, "bad language pack");
        let trailer = tracker.latest_trailer().unwrap();
        let decoded: Incident = serde_json::from_slice(&trailer).unwrap();
        assert_eq!(decoded.kind, IncidentKind::ActivationFailed);
    }

    #[test]
    fn no_trailer_when_no_incidents_recorded() {
        let tracker = IncidentTracker::new();
        assert!(tracker.latest_trailer().is_none());
    }
}
