//! Status Hint Fetcher (C9): reads a small JSON document describing known
//! server trouble (maintenance windows, elevated-retry hints) ahead of or
//! during a connection attempt, per spec §4.6 and §6 "External Interfaces".
//! Grounded on the teacher's lack of any such fetch — built from `reqwest`
//! + `serde_json` the way the other HTTP-touching modules in this crate do,
//! and `chrono` for the timestamp fields, matching `praxiomlabs-mcpkit`'s
//! dependency choices for both.

use chrono::{DateTime, Utc};
use protocol::MaintenanceWindow;
use serde::Deserialize;

/// Raw JSON shape served at `Volatile/serverStatusHint.json`.
#[derive(Debug, Clone, Deserialize)]
struct RawStatusHint {
    #[serde(default)]
    maintenance_start_at: Option<String>,
    #[serde(default)]
    maintenance_estimated_end_time: Option<String>,
    #[serde(default)]
    extra_connect_attempts: Option<u32>,
    #[serde(default)]
    suppress_background_error_reporting: bool,
}

/// Parsed, validated status hint. Timestamps that fail to parse are treated
/// as "hint absent" rather than an error — a malformed hint document should
/// never itself block a connection attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusHint {
    pub maintenance: Option<MaintenanceWindow>,
    pub extra_connect_attempts: Option<u32>,
    pub suppress_background_error_reporting: bool,
    /// Set when a source responded but its body did not parse as the
    /// expected JSON shape (spec §4.4: "report an invalid status hint
    /// incident and treat as fetch failure"). Distinguishes "source
    /// unreachable" (no incident — just a fetch failure) from "source
    /// reachable but malformed" (an incident is worth reporting) so the
    /// caller can decide whether to call [`crate::incident::IncidentTracker::report`].
    pub had_invalid_source: bool,
}

/// Fetches and parses the status hint from `primary_url`, falling back to
/// `secondary_url` if the primary request fails or does not parse. Returns
/// `StatusHint::default()` (no hint) if both sources fail — the fetcher
/// never surfaces an error upward, it only ever degrades to "no hint", but
/// flags `had_invalid_source` so the caller can report the incident spec
/// §4.4 calls for.
pub async fn fetch_status_hint(
    client: &reqwest::Client,
    primary_url: &str,
    secondary_url: Option<&str>,
) -> StatusHint {
    let mut had_invalid_source = false;

    match try_fetch(client, primary_url).await {
        FetchOutcome::Parsed(hint) => return hint,
        FetchOutcome::Malformed => had_invalid_source = true,
        FetchOutcome::Unreachable => {}
    }

    if let Some(secondary_url) = secondary_url {
        match try_fetch(client, secondary_url).await {
            FetchOutcome::Parsed(mut hint) => {
                hint.had_invalid_source = had_invalid_source;
                return hint;
            }
            FetchOutcome::Malformed => had_invalid_source = true,
            FetchOutcome::Unreachable => {}
        }
    }

    StatusHint {
        had_invalid_source,
        ..StatusHint::default()
    }
}

enum FetchOutcome {
    Parsed(StatusHint),
    /// The source responded but the body did not parse as JSON/the expected shape.
    Malformed,
    /// The source could not be reached at all (connect/timeout/non-JSON transport failure).
    Unreachable,
}

async fn try_fetch(client: &reqwest::Client, url: &str) -> FetchOutcome {
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(_) => return FetchOutcome::Unreachable,
    };
    match response.json::<RawStatusHint>().await {
        Ok(raw) => FetchOutcome::Parsed(parse_raw(raw)),
        Err(_) => FetchOutcome::Malformed,
    }
}

fn parse_raw(raw: RawStatusHint) -> StatusHint {
    let maintenance = raw.maintenance_start_at.and_then(|start_at| {
        if start_at.parse::<DateTime<Utc>>().is_err() {
            return None;
        }
        Some(MaintenanceWindow {
            start_at,
            estimated_end_time: raw
                .maintenance_estimated_end_time
                .filter(|t| t.parse::<DateTime<Utc>>().is_ok()),
        })
    });

    StatusHint {
        maintenance,
        extra_connect_attempts: raw.extra_connect_attempts,
        suppress_background_error_reporting: raw.suppress_background_error_reporting,
        had_invalid_source: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_timestamps_produce_a_maintenance_window() {
        let raw = RawStatusHint {
            maintenance_start_at: Some("2024-06-01T12:00:00Z".to_string()),
            maintenance_estimated_end_time: Some("2024-06-01T13:00:00Z".to_string()),
            extra_connect_attempts: Some(3),
            suppress_background_error_reporting: true,
        };
        let hint = parse_raw(raw);
        assert_eq!(
            hint.maintenance,
            Some(MaintenanceWindow {
                start_at: "2024-06-01T12:00:00Z".to_string(),
                estimated_end_time: Some("2024-06-01T13:00:00Z".to_string()),
            })
        );
        assert_eq!(hint.extra_connect_attempts, Some(3));
        assert!(hint.suppress_background_error_reporting);
    }

    #[test]
    fn malformed_start_timestamp_drops_the_maintenance_window() {
        let raw = RawStatusHint {
            maintenance_start_at: Some("not-a-timestamp".to_string()),
            maintenance_estimated_end_time: None,
            extra_connect_attempts: None,
            suppress_background_error_reporting: false,
        };
        assert_eq!(parse_raw(raw).maintenance, None);
    }

    #[test]
    fn malformed_end_timestamp_keeps_window_but_drops_end() {
        let raw = RawStatusHint {
            maintenance_start_at: Some("2024-06-01T12:00:00Z".to_string()),
            maintenance_estimated_end_time: Some("garbage".to_string()),
            extra_connect_attempts: None,
            suppress_background_error_reporting: false,
        };
        let hint = parse_raw(raw);
        assert_eq!(
            hint.maintenance,
            Some(MaintenanceWindow {
                start_at: "2024-06-01T12:00:00Z".to_string(),
                estimated_end_time: None,
            })
        );
    }

    #[tokio::test]
    async fn both_sources_unreachable_yields_default_hint() {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(200))
            .build()
            .unwrap();
        let hint = fetch_status_hint(
            &client,
            "http://127.0.0.1:1/primary.json",
            Some("http://127.0.0.1:1/secondary.json"),
        )
        .await;
        assert_eq!(hint, StatusHint::default());
        assert!(!hint.had_invalid_source);
    }
}
