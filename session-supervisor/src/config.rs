//! Construction-time configuration: endpoints and named timeouts.
//!
//! Everything here is read-only once a [`SupervisorConfig`] is handed to a
//! supervisor — there is deliberately no mutation API.

use std::time::Duration;

/// Where (and how) to reach the backend for one connection attempt.
///
/// Immutable per attempt; a redirect produces a new `Endpoint` rather than
/// mutating this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub cdn_base_url: String,
    /// Ordered list of backup gateways tried after `host`/`port` if the
    /// primary refuses the connection outright.
    pub backup_gateways: Vec<(String, u16)>,
    /// When set, the supervisor never touches the network: `Transport`
    /// resolves to the in-process simulated backend.
    pub offline: bool,
}

impl Endpoint {
    pub fn offline() -> Self {
        Self {
            host: "offline".to_string(),
            port: 0,
            tls: false,
            cdn_base_url: "offline://cdn".to_string(),
            backup_gateways: Vec::new(),
            offline: true,
        }
    }
}

/// Every named timeout/threshold the state machine consults, collected here
/// so none of them end up as magic numbers scattered through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Attempts allowed before giving up with a classified transient/terminal
    /// state. `None` = unlimited.
    pub connect_attempts_max: Option<u32>,
    /// Fixed delay between connecting attempts — no exponential backoff by
    /// design.
    pub connect_attempt_interval: Duration,

    pub connect_timeout: Duration,
    pub server_identify_timeout: Duration,
    pub server_session_init_timeout: Duration,

    pub config_fetch_timeout: Duration,
    pub config_fetch_attempts_max: u32,

    pub close_flush_timeout: Duration,

    pub status_hint_check_delay: Duration,
    pub status_hint_connect_timeout: Duration,
    pub status_hint_read_timeout: Duration,

    pub session_resumption_attempt_max_duration: Duration,
    pub session_ping_pong_duration_incident_threshold: Duration,
    pub max_session_ping_pong_duration_incidents_per_session: u32,

    pub max_session_retaining_pause_duration: Duration,
    pub max_session_retaining_frame_duration: Duration,
    pub max_non_error_masking_pause_duration: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_attempts_max: Some(5),
            connect_attempt_interval: Duration::from_secs(3),

            connect_timeout: Duration::from_secs(10),
            server_identify_timeout: Duration::from_secs(10),
            server_session_init_timeout: Duration::from_secs(20),

            config_fetch_timeout: Duration::from_secs(15),
            config_fetch_attempts_max: 3,

            close_flush_timeout: Duration::from_secs(5),

            status_hint_check_delay: Duration::from_secs(8),
            status_hint_connect_timeout: Duration::from_secs(5),
            status_hint_read_timeout: Duration::from_secs(5),

            session_resumption_attempt_max_duration: Duration::from_secs(30),
            session_ping_pong_duration_incident_threshold: Duration::from_secs(5),
            max_session_ping_pong_duration_incidents_per_session: 3,

            max_session_retaining_pause_duration: Duration::from_secs(60),
            max_session_retaining_frame_duration: Duration::from_secs(2),
            max_non_error_masking_pause_duration: Duration::from_secs(15),
        }
    }
}
