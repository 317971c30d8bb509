//! Network Probe (C8): a best-effort tri-state read of "is there a network
//! path to the internet at all", used to tell a dead local network apart
//! from a dead game cluster (spec §4.6). Grounded on the teacher's reqwest
//! usage pattern is absent — this is one of the pieces the teacher never
//! needed, built from the `reqwest` client used elsewhere in this crate for
//! [`crate::status_hint`], per `praxiomlabs-mcpkit`'s dependency choice.

use std::time::Duration;

/// Outcome of a connectivity probe. `Unknown` covers both "never probed" and
/// "probe is currently in flight" so callers don't need a separate loading
/// flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Unknown,
    HasConnection,
    NoConnection,
}

/// Runs up to `attempts` probe GETs against `probe_url`, spaced by
/// `spacing`, stopping at the first success. Mirrors spec §4.6: 5 attempts,
/// 500ms then 1s spacing by default (see [`crate::config::SupervisorConfig`]).
///
/// The first failure alone is tolerated: a lone failed attempt reports
/// `Unknown` rather than `NoConnection`, since one dropped probe is common
/// noise on a healthy link. Only a second consecutive failure escalates to
/// `NoConnection` — and a later success still overrides it.
pub async fn probe_connectivity(
    client: &reqwest::Client,
    probe_url: &str,
    attempts: u32,
    spacing: &[Duration],
) -> NetworkStatus {
    let mut consecutive_failures = 0u32;
    for attempt in 0..attempts {
        match client.get(probe_url).send().await {
            Ok(resp) if resp.status().is_success() => return NetworkStatus::HasConnection,
            _ => consecutive_failures += 1,
        }
        if attempt + 1 < attempts {
            let delay = spacing
                .get(attempt as usize)
                .copied()
                .unwrap_or_else(|| *spacing.last().unwrap_or(&Duration::from_secs(1)));
            tokio::time::sleep(delay).await;
        }
    }
    if consecutive_failures >= 2 {
        NetworkStatus::NoConnection
    } else {
        NetworkStatus::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_host_reports_no_connection() {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let status = probe_connectivity(
            &client,
            "http://127.0.0.1:1/does-not-matter",
            2,
            &[Duration::from_millis(10)],
        )
        .await;
        assert_eq!(status, NetworkStatus::NoConnection);
    }

    #[tokio::test]
    async fn a_single_failed_attempt_is_tolerated() {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let status = probe_connectivity(&client, "http://127.0.0.1:1/does-not-matter", 1, &[]).await;
        assert_eq!(status, NetworkStatus::Unknown);
    }
}
