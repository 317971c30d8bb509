//! Session Supervisor (C11): the top-level state machine described in spec
//! §4.1. Grounded on the teacher's `MiddleLayer` in
//! `backbone-lib/src/middle_layer.rs` — same idea (own the connection,
//! expose a small imperative API, let the host poll/drain state) generalized
//! from a frame-driven `update(delta_time)` heartbeat to the async task
//! model spec §9's design notes call out as the systems-language
//! counterpart to the source's goto-based coroutine, while preserving the
//! observable step boundary.

use crate::clock::Clock;
use crate::config::{Endpoint, SupervisorConfig};
use crate::connection::{ConnectionEvent, ServerConnection, SessionStartInfo};
use crate::credentials::{CredentialService, GuestCredentials};
use crate::error::{ConnectionError, RawTransportError};
use crate::incident::IncidentTracker;
use crate::probe::{self, NetworkStatus};
use crate::qos::QosMonitor;
use crate::resources::{ResourceBlobProvider, ResourceLoader};
use crate::status_hint::{self, StatusHint};
use protocol::{ClientMessage, ExperimentAssignment, MaintenanceWindow, ResourceProposal};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Marker payload attached to a transport close issued on behalf of a
/// suspended app (spec §9 "pause-termination marker"). Any `enqueue_close`
/// error whose raw close payload equals this marker is re-classified as
/// `SessionLostInBackground` by [`crate::error::translate`] instead of a
/// generic `TransportClosed`.
pub const PAUSE_CLOSE_MARKER: &[u8] = b"supervisor-pause-close-marker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectingPhase {
    Hello,
    Login,
    SessionStart,
    DownloadingResources,
}

/// A coarse connectivity diagnostic attached to states spec §7 calls
/// `IHasNetworkDiagnosticReport` (flattened here to a plain optional field,
/// per the design notes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDiagnosticReport {
    pub probe_status: NetworkStatusSnapshot,
    pub has_completed_handshake: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatusSnapshot {
    Unknown,
    HasConnection,
    NoConnection,
}

impl From<NetworkStatus> for NetworkStatusSnapshot {
    fn from(status: NetworkStatus) -> Self {
        match status {
            NetworkStatus::Unknown => NetworkStatusSnapshot::Unknown,
            NetworkStatus::HasConnection => NetworkStatusSnapshot::HasConnection,
            NetworkStatus::NoConnection => NetworkStatusSnapshot::NoConnection,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting {
        phase: ConnectingPhase,
        attempt_index: u32,
    },
    Connected {
        is_healthy: bool,
    },
    TransientError {
        error: ConnectionError,
        diagnostic: Option<NetworkDiagnosticReport>,
    },
    TerminalError {
        error: ConnectionError,
        diagnostic: Option<NetworkDiagnosticReport>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceMode {
    NotScheduled,
    Ongoing(MaintenanceWindow),
}

/// Events buffered for the host to drain, in FIFO order (spec §4.1 "message
/// dispatch suspension").
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    DisconnectedFromServer,
    ServerMessage(protocol::ServerMessage),
}

/// What a single call to [`SessionSupervisor::step`] accomplished, so the
/// host's tick loop knows whether to call again immediately or is free to
/// idle (spec §5: "the supervisor is conceptually a single cooperative task
/// that progresses in discrete steps driven by host-loop ticks").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A message, pong, or resume attempt was processed; call again soon.
    Progressed,
    /// The connection is no longer `Connected`; stop calling `step()` until
    /// a fresh `connect()`/`reconnect()`.
    SessionEnded,
}

/// Internal result of racing the next inbound frame against the ping/pong
/// incident deadline inside [`SessionSupervisor::step`].
enum StepTick {
    Event(Result<ConnectionEvent, RawTransportError>),
    PingPongThresholdExceeded,
}

struct ActiveSession {
    resumption_token: String,
    last_ping_id: u32,
    last_ping_sent_at: Option<Instant>,
    last_pong_id: Option<u32>,
    /// Round-trip time of the last answered ping, folded into the ping/pong
    /// incident deadline (spec §4.1 "round-trip estimate plus threshold").
    /// Zero until the first pong of the session arrives.
    last_round_trip_estimate: Duration,
}

/// Drives one player's connection lifecycle end to end. Not `Sync`: the
/// concurrency model (spec §5) is a single cooperative task, so the public
/// API takes `&mut self` throughout and is never meant to be called from
/// more than one task at a time.
pub struct SessionSupervisor {
    config: SupervisorConfig,
    endpoint: Endpoint,
    credential_service: Arc<dyn CredentialService>,
    resource_provider: Arc<dyn ResourceBlobProvider>,
    http_client: reqwest::Client,

    state: ConnectionState,
    cancellation: CancellationToken,
    clock: Clock,

    qos: QosMonitor,
    incidents: IncidentTracker,
    events: VecDeque<SupervisorEvent>,
    suspended: bool,

    maintenance_mode: MaintenanceMode,
    active_experiments: Vec<ExperimentAssignment>,
    app_launch_id: Uuid,
    network_probe_status: NetworkStatus,
    network_probe_task: Option<tokio::task::JoinHandle<NetworkStatus>>,
    status_hint_task: Option<tokio::task::JoinHandle<StatusHint>>,

    has_completed_handshake: bool,
    has_completed_session_init: bool,

    connection: Option<ServerConnection>,
    session: Option<ActiveSession>,
    pause_timer: Option<crate::clock::TimerId>,
    paused_at: Option<Instant>,
}

impl SessionSupervisor {
    pub fn new(
        config: SupervisorConfig,
        endpoint: Endpoint,
        credential_service: Arc<dyn CredentialService>,
        resource_provider: Arc<dyn ResourceBlobProvider>,
    ) -> Self {
        // The shared client is used by the network probe (C8), which has no
        // timeouts of its own in spec §4.6 beyond the attempt spacing; the
        // status hint fetch (C9) builds its own client per fetch so its named
        // `status_hint_connect_timeout`/`status_hint_read_timeout` apply.
        let http_client = reqwest::Client::new();
        Self {
            config,
            endpoint,
            credential_service,
            resource_provider,
            http_client,
            state: ConnectionState::NotConnected,
            cancellation: CancellationToken::new(),
            clock: Clock::new(),
            qos: QosMonitor::new(Duration::from_secs(30)),
            incidents: IncidentTracker::new(),
            events: VecDeque::new(),
            suspended: false,
            maintenance_mode: MaintenanceMode::NotScheduled,
            active_experiments: Vec::new(),
            app_launch_id: Uuid::new_v4(),
            network_probe_status: NetworkStatus::Unknown,
            network_probe_task: None,
            status_hint_task: None,
            has_completed_handshake: false,
            has_completed_session_init: false,
            connection: None,
            session: None,
            pause_timer: None,
            paused_at: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn maintenance_mode(&self) -> &MaintenanceMode {
        &self.maintenance_mode
    }

    pub fn active_experiments(&self) -> &[ExperimentAssignment] {
        &self.active_experiments
    }

    pub fn app_launch_id(&self) -> Uuid {
        self.app_launch_id
    }

    /// Drains buffered host-facing events in FIFO order.
    pub fn drain_events(&mut self) -> Vec<SupervisorEvent> {
        self.events.drain(..).collect()
    }

    pub fn suspend_dispatch(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    /// Runs the full connect sequence: credential load, wire connect,
    /// handshake, resource negotiation, session start. Returns once the
    /// state machine reaches `Connected`, `TransientError`, or
    /// `TerminalError`.
    pub async fn connect(&mut self) {
        self.cancellation = CancellationToken::new();
        self.has_completed_handshake = false;
        self.has_completed_session_init = false;
        self.status_hint_task = None;
        self.network_probe_task = None;
        self.network_probe_status = NetworkStatus::Unknown;

        if let Err(err) = self.credential_service.initialize().await {
            self.finalize_failure(ConnectionError::ClientSideConnectionError(err), false)
                .await;
            return;
        }

        let mut attempt_index = 0u32;
        loop {
            if self.cancellation.is_cancelled() {
                return;
            }

            self.state = ConnectionState::Connecting {
                phase: ConnectingPhase::Hello,
                attempt_index,
            };
            tracing::info!(attempt_index, app_launch_id = %self.app_launch_id, "starting connect attempt");

            let result = if attempt_index == 0 {
                self.run_first_attempt_racing_status_hint_delay().await
            } else {
                self.run_one_attempt(attempt_index).await
            };

            match result {
                Ok(()) => {
                    tracing::info!(attempt_index, app_launch_id = %self.app_launch_id, "connected");
                    return;
                }
                Err(error) => {
                    if !error.is_transient() {
                        tracing::warn!(attempt_index, error = ?error, "connect attempt failed terminally");
                        self.finalize_failure(error, false).await;
                        return;
                    }
                    tracing::warn!(attempt_index, error = ?error, "connect attempt failed, will retry");

                    attempt_index += 1;
                    self.maybe_start_status_hint_fetch();
                    self.maybe_start_network_probe();

                    let budget = self.config.connect_attempts_max;
                    let exhausted = budget.is_some_and(|max| attempt_index > max);
                    if exhausted {
                        if self.status_hint_still_in_flight() {
                            // Trades extra attempts for a better terminal classification
                            // (spec §4.1) — keep retrying until the hint resolves.
                            tracing::debug!("attempt budget exhausted but status hint still in flight, retrying");
                            continue;
                        }
                        self.finalize_failure(error, true).await;
                        return;
                    }

                    if crate::clock::delay_or_cancelled(
                        self.config.connect_attempt_interval,
                        &self.cancellation,
                    )
                    .await
                    .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }

    fn status_hint_still_in_flight(&self) -> bool {
        self.status_hint_task
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Races the first connect attempt (`attempt_index == 0`) against spec
    /// §4.4's delay-based status-hint trigger: if `statusHintCheckDelay`
    /// elapses before the attempt settles, the fetch starts right there
    /// instead of waiting for a transient failure. Later attempts don't race
    /// this delay — by then the first-transient-failure trigger has already
    /// fired (see [`Self::maybe_start_status_hint_fetch`]).
    async fn run_first_attempt_racing_status_hint_delay(&mut self) -> Result<(), ConnectionError> {
        if self.endpoint.offline || self.status_hint_task.is_some() {
            return self.run_one_attempt(0).await;
        }

        let config = self.config.clone();
        let endpoint = self.endpoint.clone();
        let mut hint_handle = None;

        let result = {
            let attempt = self.run_one_attempt(0);
            tokio::pin!(attempt);
            let sleep = tokio::time::sleep(config.status_hint_check_delay);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    res = &mut attempt => break res,
                    _ = &mut sleep, if hint_handle.is_none() => {
                        tracing::debug!("status hint check delay elapsed before initial connect completed");
                        hint_handle = Some(Self::spawn_status_hint_fetch(&config, &endpoint));
                    }
                }
            }
        };

        if let Some(handle) = hint_handle {
            self.status_hint_task = Some(handle);
        }
        result
    }

    fn status_hint_urls(endpoint: &Endpoint) -> (String, Option<String>) {
        let primary = format!("{}/Volatile/serverStatusHint.json", endpoint.cdn_base_url);
        let secondary = endpoint.backup_gateways.first().map(|(host, _port)| {
            let scheme = if endpoint.tls { "https" } else { "http" };
            format!("{scheme}://{host}/Volatile/serverStatusHint.json")
        });
        (primary, secondary)
    }

    fn spawn_status_hint_fetch(
        config: &SupervisorConfig,
        endpoint: &Endpoint,
    ) -> tokio::task::JoinHandle<StatusHint> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.status_hint_connect_timeout)
            .timeout(config.status_hint_read_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let (primary, secondary) = Self::status_hint_urls(endpoint);
        tracing::debug!(primary = %primary, secondary = ?secondary, "starting status hint fetch");
        tokio::spawn(async move { status_hint::fetch_status_hint(&client, &primary, secondary.as_deref()).await })
    }

    fn maybe_start_status_hint_fetch(&mut self) {
        if self.endpoint.offline || self.status_hint_task.is_some() {
            return;
        }
        self.status_hint_task = Some(Self::spawn_status_hint_fetch(&self.config, &self.endpoint));
    }

    /// Starts the independent connectivity probe (spec §4.5) as a background
    /// task once the first connect attempt has failed, mirroring the
    /// auxiliary status-hint fetch above. Offline mode has no network to
    /// probe, so it is always reported healthy.
    fn maybe_start_network_probe(&mut self) {
        if self.network_probe_task.is_some() {
            return;
        }
        if self.endpoint.offline {
            self.network_probe_status = NetworkStatus::HasConnection;
            return;
        }
        let client = self.http_client.clone();
        let probe_url = format!("{}/Connectivity/connectivity-test", self.endpoint.cdn_base_url);
        self.network_probe_task = Some(tokio::spawn(async move {
            probe::probe_connectivity(
                &client,
                &probe_url,
                5,
                &[Duration::from_millis(500), Duration::from_secs(1)],
            )
            .await
        }));
    }

    async fn run_one_attempt(&mut self, attempt_index: u32) -> Result<(), ConnectionError> {
        let mut connection = ServerConnection::connect(&self.endpoint, self.config.connect_timeout)
            .await
            .map_err(crate::error::translate)?;

        connection
            .next_event(self.config.server_identify_timeout)
            .await
            .map_err(crate::error::translate)?;

        let version_info = self.build_version_info(attempt_index);
        connection
            .send_client_hello(version_info)
            .await
            .map_err(crate::error::translate)?;

        let hello_accepted = connection
            .next_event(self.config.server_identify_timeout)
            .await
            .map_err(crate::error::translate)?;
        if !matches!(hello_accepted, ConnectionEvent::ClientHelloAccepted(_)) {
            return Err(ConnectionError::SessionProtocolError(
                crate::error::SessionProtocolErrorKind::SessionProtocolError,
            ));
        }

        self.state = ConnectionState::Connecting {
            phase: ConnectingPhase::Login,
            attempt_index,
        };
        let login_method = self
            .credential_service
            .current_login_method()
            .await
            .map_err(ConnectionError::ClientSideConnectionError)?;
        connection
            .send_login(login_method.into())
            .await
            .map_err(crate::error::translate)?;

        let login_event = connection
            .next_event(self.config.server_identify_timeout)
            .await
            .map_err(crate::error::translate)?;
        match login_event {
            ConnectionEvent::LoginSuccess { .. } => {}
            ConnectionEvent::GuestAccountCreated {
                device_id,
                auth_token,
                player_id,
            } => {
                self.credential_service
                    .store_guest_credentials(GuestCredentials {
                        device_id,
                        auth_token,
                        player_id,
                    })
                    .await
                    .map_err(ConnectionError::ClientSideConnectionError)?;
            }
            _ => {
                return Err(ConnectionError::SessionProtocolError(
                    crate::error::SessionProtocolErrorKind::UnexpectedLoginMessage,
                ));
            }
        }
        self.has_completed_handshake = true;
        tracing::debug!(attempt_index, "handshake complete");

        self.state = ConnectionState::Connecting {
            phase: ConnectingPhase::SessionStart,
            attempt_index,
        };
        let session_info = self
            .run_session_start(&mut connection, ResourceProposal::default(), attempt_index)
            .await?;

        self.has_completed_session_init = true;
        self.maintenance_mode = match &session_info.scheduled_maintenance_mode {
            Some(window) => MaintenanceMode::Ongoing(window.clone()),
            None => MaintenanceMode::NotScheduled,
        };
        self.active_experiments = session_info.active_experiments.clone();
        self.session = Some(ActiveSession {
            resumption_token: session_info.resumption_token.clone(),
            last_ping_id: 0,
            last_ping_sent_at: None,
            last_pong_id: None,
            last_round_trip_estimate: Duration::ZERO,
        });
        self.qos.observe_message(Instant::now());
        self.connection = Some(connection);
        self.state = ConnectionState::Connected { is_healthy: true };
        tracing::info!(attempt_index, session_id = %session_info.resumption_token, "session started");
        Ok(())
    }

    /// Runs `SessionStartRequest`/resource-correction round trips until the
    /// server accepts or rejects the session (spec §4.1 "resource-correction
    /// handling").
    async fn run_session_start(
        &mut self,
        connection: &mut ServerConnection,
        mut proposal: ResourceProposal,
        attempt_index: u32,
    ) -> Result<SessionStartInfo, ConnectionError> {
        let mut query_id = 1u32;
        connection
            .send_session_start_request(query_id, proposal.clone(), "UTC".to_string())
            .await
            .map_err(crate::error::translate)?;

        loop {
            let event = connection
                .next_event(self.config.server_session_init_timeout)
                .await
                .map_err(crate::error::translate)?;

            match event {
                ConnectionEvent::SessionStartSuccess(info) => return Ok(info),
                ConnectionEvent::SessionStartFailure { reason_code, .. } => {
                    return Err(crate::error::translate(crate::connection::classify_handshake_failure(
                        &reason_code,
                    )));
                }
                ConnectionEvent::OperationStillOngoing => continue,
                ConnectionEvent::UpdateScheduledMaintenanceMode { scheduled } => {
                    self.maintenance_mode = match scheduled {
                        Some(window) => MaintenanceMode::Ongoing(window),
                        None => MaintenanceMode::NotScheduled,
                    };
                    continue;
                }
                ConnectionEvent::SessionStartResourceCorrection {
                    resource_correction, ..
                } => {
                    self.state = ConnectionState::Connecting {
                        phase: ConnectingPhase::DownloadingResources,
                        attempt_index,
                    };

                    let loader = ResourceLoader::new(
                        self.config.config_fetch_attempts_max,
                        self.config.config_fetch_timeout,
                    );
                    match loader
                        .load_all(&resource_correction, self.resource_provider.clone())
                        .await
                    {
                        Ok(downloaded_slots) => {
                            tracing::debug!(
                                attempt_index,
                                slot_count = downloaded_slots.len(),
                                "resource correction downloaded"
                            );
                            proposal.slots = resource_correction
                                .slots
                                .iter()
                                .map(|(slot_id, correction)| (slot_id.clone(), correction.archive.clone()))
                                .collect();
                            if let Some(language) = resource_correction.language {
                                proposal.language = Some(language);
                            }
                            if let Some(version) = resource_correction.version {
                                proposal.version = version;
                            }

                            self.state = ConnectionState::Connecting {
                                phase: ConnectingPhase::SessionStart,
                                attempt_index,
                            };
                            query_id += 1;
                            connection
                                .send_session_start_request(query_id, proposal.clone(), "UTC".to_string())
                                .await
                                .map_err(crate::error::translate)?;
                        }
                        Err(_load_error) => {
                            self.incidents.report(
                                crate::incident::IncidentKind::ActivationFailed,
                                "resource correction fetch/activation failed",
                            );
                            let trailer = self.incidents.latest_trailer();
                            let _ = connection.abort_session_start(trailer).await;
                            let _ = tokio::time::timeout(
                                self.config.close_flush_timeout,
                                connection.enqueue_transport_write_fence(),
                            )
                            .await;
                            return Err(ConnectionError::ConfigFetchFailed(
                                crate::error::ConfigFetchSource::Activation,
                            ));
                        }
                    }
                }
                _ => continue,
            }
        }
    }

    fn build_version_info(&self, attempt_index: u32) -> protocol::VersionInfo {
        protocol::VersionInfo {
            game_magic: offline_backend::GAME_MAGIC,
            version: "1.0.0".to_string(),
            build_number: 1,
            client_logic_version: 1,
            full_protocol_hash: offline_backend::PROTOCOL_HASH,
            commit_id: "dev".to_string(),
            client_session_connection_index: attempt_index,
            client_session_nonce: Uuid::new_v4(),
            app_launch_id: self.app_launch_id,
            platform: std::env::consts::OS.to_string(),
            login_protocol_version: 1,
        }
    }

    /// Applies the Error Translator's post-classification pass (spec §4.7)
    /// and lands the supervisor in its final `TransientError`/`TerminalError`
    /// state for this run.
    async fn finalize_failure(&mut self, mut error: ConnectionError, attempts_exhausted: bool) {
        let _ = attempts_exhausted;

        if let Some(handle) = self.status_hint_task.take() {
            if let Ok(hint) = handle.await {
                if hint.had_invalid_source {
                    self.incidents.report(
                        crate::incident::IncidentKind::InvalidStatusHint,
                        "serverStatusHint.json did not parse",
                    );
                }
                if let Some(window) = hint.maintenance {
                    if !self.has_completed_session_init {
                        error = ConnectionError::InMaintenance(window);
                    }
                }
            }
        }

        if let Some(handle) = self.network_probe_task.take() {
            if let Ok(status) = handle.await {
                self.network_probe_status = status;
            }
        }

        if matches!(self.network_probe_status, NetworkStatus::NoConnection) && !self.has_completed_handshake {
            error = ConnectionError::NoNetworkConnectivity;
        }

        if let Some(paused_at) = self.paused_at {
            let paused_for = Instant::now().saturating_duration_since(paused_at);
            if self.session.is_some() && paused_for > self.config.max_non_error_masking_pause_duration {
                tracing::debug!(?paused_for, "masking error behind a long background pause");
                error = ConnectionError::SessionLostInBackground;
            }
        }

        tracing::warn!(error = ?error, "connect finalized to a failure state");

        let diagnostic = if matches!(
            error,
            ConnectionError::NoNetworkConnectivity | ConnectionError::TransportClosed
        ) {
            Some(NetworkDiagnosticReport {
                probe_status: self.network_probe_status.into(),
                has_completed_handshake: self.has_completed_handshake,
            })
        } else {
            None
        };

        self.deliver_disconnected_from_server();
        self.state = if error.is_transient() {
            ConnectionState::TransientError { error, diagnostic }
        } else {
            ConnectionState::TerminalError { error, diagnostic }
        };
    }

    fn deliver_disconnected_from_server(&mut self) {
        if matches!(self.state, ConnectionState::Connected { .. }) || self.session.is_some() {
            self.events.push_back(SupervisorEvent::DisconnectedFromServer);
        }
    }

    /// Services one in-session tick: waits for the next inbound frame (or
    /// the ping/pong incident deadline, whichever comes first), and on
    /// transport loss drives the resume-or-give-up policy of spec §4.1
    /// ("Connected --transport drop--> session-resume attempt"). The host is
    /// expected to call this repeatedly for as long as [`Self::state`]
    /// reports `Connected`.
    pub async fn step(&mut self) -> StepOutcome {
        if !matches!(self.state, ConnectionState::Connected { .. }) || self.connection.is_none() {
            return StepOutcome::SessionEnded;
        }

        let watchdog = self.config.server_session_init_timeout;
        let ping_wait = self.pending_ping_deadline();

        // Scoped so the mutable borrow of `self.connection` ends before we
        // need `&mut self` again below — `tokio::select!` builds every arm's
        // future up front, so a handler that itself calls back into `self`
        // can't live in the same select as one that borrows `self.connection`.
        let tick = {
            let connection = self.connection.as_mut().expect("checked above");
            if let Some(wait) = ping_wait {
                tokio::select! {
                    event = connection.next_event(watchdog) => StepTick::Event(event),
                    _ = tokio::time::sleep(wait) => StepTick::PingPongThresholdExceeded,
                }
            } else {
                StepTick::Event(connection.next_event(watchdog).await)
            }
        };

        match tick {
            StepTick::Event(event) => self.handle_step_event(event).await,
            StepTick::PingPongThresholdExceeded => self.on_ping_pong_threshold_exceeded(),
        }

        if matches!(self.state, ConnectionState::Connected { .. }) {
            StepOutcome::Progressed
        } else {
            StepOutcome::SessionEnded
        }
    }

    async fn handle_step_event(&mut self, event: Result<ConnectionEvent, RawTransportError>) {
        match event {
            Ok(event) => self.handle_in_session_event(event),
            Err(raw) => self.handle_transport_drop(raw).await,
        }
    }

    /// How long until the outstanding ping's incident threshold fires, if a
    /// ping is currently awaiting its matching pong. `None` means there is
    /// nothing to watch for (no ping sent, or already answered).
    fn pending_ping_deadline(&self) -> Option<Duration> {
        let session = self.session.as_ref()?;
        let sent_at = session.last_ping_sent_at?;
        if session.last_pong_id == Some(session.last_ping_id) {
            return None;
        }
        let threshold = self.config.session_ping_pong_duration_incident_threshold + session.last_round_trip_estimate;
        Some(threshold.saturating_sub(Instant::now().saturating_duration_since(sent_at)))
    }

    fn on_ping_pong_threshold_exceeded(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        tracing::warn!(ping_id = session.last_ping_id, "ping/pong incident threshold exceeded");
        self.incidents.report_ping_pong_duration_exceeded(
            session.last_ping_id,
            self.config.max_session_ping_pong_duration_incidents_per_session,
        );
        self.refresh_connected_health();
    }

    /// Applies one decoded in-session event: updates QoS staleness, resolves
    /// a matching `SessionPong`, and applies mid-session maintenance updates
    /// (spec Invariant 4: `MaintenanceMode` is set before the `InMaintenance`
    /// transition is observable).
    fn handle_in_session_event(&mut self, event: ConnectionEvent) {
        self.qos.observe_message(Instant::now());
        match event {
            ConnectionEvent::SessionPong { id } => {
                if let Some(session) = self.session.as_mut() {
                    if id == session.last_ping_id {
                        session.last_pong_id = Some(id);
                        if let Some(sent_at) = session.last_ping_sent_at {
                            session.last_round_trip_estimate =
                                Instant::now().saturating_duration_since(sent_at);
                        }
                    }
                }
                self.refresh_connected_health();
            }
            ConnectionEvent::UpdateScheduledMaintenanceMode { scheduled: Some(window) } => {
                self.maintenance_mode = MaintenanceMode::Ongoing(window.clone());
                self.deliver_disconnected_from_server();
                self.session = None;
                self.state = ConnectionState::TerminalError {
                    error: ConnectionError::InMaintenance(window),
                    diagnostic: None,
                };
            }
            ConnectionEvent::UpdateScheduledMaintenanceMode { scheduled: None } => {
                self.maintenance_mode = MaintenanceMode::NotScheduled;
            }
            _other => {
                // Any other in-session event (e.g. a stray `OperationStillOngoing`
                // heartbeat) just counts as liveness; the game-state model that
                // would decode application payloads is out of scope (spec §1).
                self.refresh_connected_health();
            }
        }
    }

    fn refresh_connected_health(&mut self) {
        if let ConnectionState::Connected { is_healthy } = &mut self.state {
            let ping_ok = self
                .session
                .as_ref()
                .is_some_and(|s| s.last_pong_id == Some(s.last_ping_id));
            *is_healthy = ping_ok && self.qos.is_healthy(Instant::now());
        }
    }

    /// Transport loss while a session is active (spec §4.1 "in-session
    /// resume"): attempts `resume_session_after_connection_drop` in a loop
    /// bounded by `sessionResumptionAttemptMaxDuration` from first loss,
    /// backing off briefly between attempts. On success, re-arms the
    /// ping/pong liveness check; on give-up, emits the synthetic
    /// `DisconnectedFromServer` and lands in `TransientError`.
    async fn handle_transport_drop(&mut self, raw: RawTransportError) {
        self.connection = None;
        if let ConnectionState::Connected { is_healthy } = &mut self.state {
            *is_healthy = false;
        }
        tracing::warn!(raw = ?raw, "transport dropped");

        let Some(resumption_token) = self.session.as_ref().map(|s| s.resumption_token.clone()) else {
            let error = crate::error::translate(raw);
            self.finalize_failure(error, false).await;
            return;
        };

        let deadline = self.config.session_resumption_attempt_max_duration;
        let started = Instant::now();
        loop {
            let elapsed = Instant::now().saturating_duration_since(started);
            if elapsed >= deadline || self.cancellation.is_cancelled() {
                break;
            }
            let remaining = deadline - elapsed;

            match ServerConnection::resume_session_after_connection_drop(
                &self.endpoint,
                self.config.connect_timeout,
                resumption_token.clone(),
                remaining,
            )
            .await
            {
                Ok((mut connection, ConnectionEvent::SessionResumeSuccess { scheduled_maintenance_mode })) => {
                    self.maintenance_mode = match scheduled_maintenance_mode {
                        Some(window) => MaintenanceMode::Ongoing(window),
                        None => MaintenanceMode::NotScheduled,
                    };
                    if let Some(session) = self.session.as_mut() {
                        session.last_ping_id += 1;
                        let ping_id = session.last_ping_id;
                        session.last_pong_id = None;
                        if connection.send_ping(ping_id).await.is_ok() {
                            session.last_ping_sent_at = Some(Instant::now());
                        }
                    }
                    self.qos.reset();
                    self.qos.observe_message(Instant::now());
                    self.connection = Some(connection);
                    self.state = ConnectionState::Connected { is_healthy: false };
                    tracing::info!(resumption_token = %resumption_token, "session resumed");
                    return;
                }
                Ok((_, _)) => continue,
                Err(_) => {
                    if crate::clock::delay_or_cancelled(Duration::from_millis(500), &self.cancellation)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }

        tracing::warn!(resumption_token = %resumption_token, "session resume attempts exhausted");
        self.finalize_failure(ConnectionError::SessionResumeFailed, false).await;
        self.session = None;
    }

    /// Runs the independent network-connectivity probe (spec §4.5) and
    /// records its tri-state result.
    pub async fn run_network_probe(&mut self) {
        if self.endpoint.offline {
            self.network_probe_status = NetworkStatus::HasConnection;
            return;
        }
        let probe_url = format!("{}/Connectivity/connectivity-test", self.endpoint.cdn_base_url);
        self.network_probe_status = probe::probe_connectivity(
            &self.http_client,
            &probe_url,
            5,
            &[Duration::from_millis(500), Duration::from_secs(1)],
        )
        .await;
    }

    /// Sends an application-level message once connected. Returns `false`
    /// without sending if not currently `Connected` (spec's `sendToServer`).
    pub async fn send_to_server(&mut self, message: ClientMessage) -> bool {
        let Some(connection) = self.connection.as_mut() else {
            return false;
        };
        if !matches!(self.state, ConnectionState::Connected { .. }) {
            return false;
        }
        connection.enqueue_send_message(message).await.is_ok()
    }

    /// Closes the connection, optionally flushing pending messages first.
    pub async fn close(&mut self, flush_pending: bool) {
        tracing::info!(flush_pending, "closing connection");
        self.cancellation.cancel();
        if let Some(connection) = self.connection.as_mut() {
            if flush_pending {
                let _ = tokio::time::timeout(
                    self.config.close_flush_timeout,
                    connection.enqueue_transport_write_fence(),
                )
                .await;
            }
            connection.enqueue_close(None).await;
        }
        self.connection = None;
        self.session = None;
        self.state = ConnectionState::NotConnected;
    }

    /// Closes the connection with a supervisor-chosen classified error
    /// rather than the generic `NotConnected` outcome of [`Self::close`].
    pub async fn close_with_error(&mut self, error: ConnectionError, flush_pending: bool) {
        self.close(flush_pending).await;
        self.state = if error.is_transient() {
            ConnectionState::TransientError {
                error,
                diagnostic: None,
            }
        } else {
            ConnectionState::TerminalError {
                error,
                diagnostic: None,
            }
        };
    }

    /// Tears down any existing connection and runs [`Self::connect`] again.
    pub async fn reconnect(&mut self, flush_pending: bool) {
        self.close(flush_pending).await;
        self.connect().await;
    }

    /// Notifies the supervisor the host application has been backgrounded.
    /// Schedules the pause-retention timer (spec §4.1 "pause/resume
    /// policy").
    pub async fn on_application_pause(&mut self, max_background_duration: Option<Duration>) {
        self.paused_at = Some(Instant::now());
        let duration = max_background_duration.unwrap_or(self.config.max_session_retaining_pause_duration);
        tracing::info!(?duration, "application paused");
        self.pause_timer = Some(self.clock.start_timer(duration));

        if let Some(connection) = self.connection.as_mut() {
            let _ = connection
                .send_lifecycle_hint_pausing(Some(duration.as_millis() as u64), None)
                .await;
        }
    }

    /// Notifies the supervisor the host application has returned to the
    /// foreground. If the pause exceeded its retained duration, the session
    /// is declared lost.
    pub async fn on_application_resume(&mut self) {
        let timer_expired = self
            .pause_timer
            .take()
            .map(|id| self.clock.is_expired(id))
            .unwrap_or(false);
        let paused_at = self.paused_at.take();

        if timer_expired {
            tracing::warn!("application resumed after the pause-retention timer expired");
            if let Some(connection) = self.connection.as_mut() {
                connection.enqueue_close(Some(PAUSE_CLOSE_MARKER.to_vec())).await;
            }
            self.connection = None;
            self.deliver_disconnected_from_server();
            self.state = ConnectionState::TransientError {
                error: ConnectionError::SessionLostInBackground,
                diagnostic: None,
            };
            return;
        }

        if let (Some(start), true) = (paused_at, self.connection.is_some()) {
            let elapsed = Instant::now().saturating_duration_since(start);
            if elapsed > self.config.max_session_retaining_pause_duration {
                if let Some(connection) = self.connection.as_mut() {
                    connection.enqueue_close(Some(PAUSE_CLOSE_MARKER.to_vec())).await;
                }
                self.connection = None;
                self.deliver_disconnected_from_server();
                self.state = ConnectionState::TransientError {
                    error: ConnectionError::SessionLostInBackground,
                    diagnostic: None,
                };
                return;
            }
        }

        tracing::info!("application resumed, session retained");
        if let Some(connection) = self.connection.as_mut() {
            let _ = connection.send_lifecycle_hint_unpausing().await;
            let _ = connection.send_lifecycle_hint_unpaused().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{LoginMethod, StaticCredentialService};
    use crate::resources::ResourceBlobProvider;

    struct EmptyProvider;

    #[async_trait::async_trait]
    impl ResourceBlobProvider for EmptyProvider {
        async fn fetch(&self, _archive: &protocol::ArchiveId, _url_suffix: Option<&str>) -> Result<Vec<u8>, String> {
            Ok(Vec::new())
        }
    }

    fn offline_supervisor() -> SessionSupervisor {
        SessionSupervisor::new(
            SupervisorConfig::default(),
            Endpoint::offline(),
            Arc::new(StaticCredentialService::new(LoginMethod::NewGuestAccount)),
            Arc::new(EmptyProvider),
        )
    }

    #[tokio::test]
    async fn offline_happy_path_reaches_connected() {
        let mut supervisor = offline_supervisor();
        supervisor.connect().await;
        assert!(matches!(
            supervisor.state(),
            ConnectionState::Connected { is_healthy: true }
        ));
        assert_eq!(supervisor.maintenance_mode(), &MaintenanceMode::NotScheduled);
        assert!(supervisor.active_experiments().is_empty());
    }

    #[tokio::test]
    async fn close_returns_to_not_connected() {
        let mut supervisor = offline_supervisor();
        supervisor.connect().await;
        supervisor.close(false).await;
        assert_eq!(supervisor.state(), &ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn send_to_server_fails_when_not_connected() {
        let mut supervisor = offline_supervisor();
        let sent = supervisor
            .send_to_server(ClientMessage::SessionPing { id: 1 })
            .await;
        assert!(!sent);
    }

    #[tokio::test]
    async fn pause_then_quick_resume_keeps_session() {
        let mut supervisor = offline_supervisor();
        supervisor.connect().await;
        supervisor.on_application_pause(Some(Duration::from_secs(60))).await;
        supervisor.on_application_resume().await;
        assert!(matches!(supervisor.state(), ConnectionState::Connected { .. }));
    }

    #[tokio::test]
    async fn matching_pong_marks_the_session_healthy() {
        let mut supervisor = offline_supervisor();
        supervisor.connect().await;
        supervisor.session.as_mut().unwrap().last_ping_id = 5;
        supervisor.state = ConnectionState::Connected { is_healthy: false };

        supervisor.handle_in_session_event(ConnectionEvent::SessionPong { id: 5 });

        assert_eq!(supervisor.session.as_ref().unwrap().last_pong_id, Some(5));
        assert!(matches!(
            supervisor.state(),
            ConnectionState::Connected { is_healthy: true }
        ));
    }

    #[tokio::test]
    async fn pong_for_a_stale_ping_id_is_ignored() {
        let mut supervisor = offline_supervisor();
        supervisor.connect().await;
        supervisor.session.as_mut().unwrap().last_ping_id = 5;

        supervisor.handle_in_session_event(ConnectionEvent::SessionPong { id: 4 });

        assert_eq!(supervisor.session.as_ref().unwrap().last_pong_id, None);
    }

    #[tokio::test]
    async fn ping_pong_threshold_exceeded_reports_one_incident_and_marks_unhealthy() {
        let mut supervisor = offline_supervisor();
        supervisor.connect().await;
        {
            let session = supervisor.session.as_mut().unwrap();
            session.last_ping_sent_at = Some(Instant::now());
            session.last_pong_id = None;
        }

        supervisor.on_ping_pong_threshold_exceeded();
        supervisor.on_ping_pong_threshold_exceeded();

        assert_eq!(
            supervisor
                .incidents
                .incidents()
                .iter()
                .filter(|i| i.kind == crate::incident::IncidentKind::PingPongDurationExceeded)
                .count(),
            1
        );
        assert!(matches!(
            supervisor.state(),
            ConnectionState::Connected { is_healthy: false }
        ));
    }

    #[tokio::test]
    async fn mid_session_maintenance_update_ends_the_session() {
        let mut supervisor = offline_supervisor();
        supervisor.connect().await;
        let window = protocol::MaintenanceWindow {
            start_at: "2026-01-01T00:00:00Z".to_string(),
            estimated_end_time: None,
        };

        supervisor.handle_in_session_event(ConnectionEvent::UpdateScheduledMaintenanceMode {
            scheduled: Some(window.clone()),
        });

        assert_eq!(supervisor.maintenance_mode(), &MaintenanceMode::Ongoing(window.clone()));
        assert!(supervisor.session.is_none());
        assert!(matches!(
            supervisor.state(),
            ConnectionState::TerminalError {
                error: ConnectionError::InMaintenance(_),
                ..
            }
        ));
        let events = supervisor.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, SupervisorEvent::DisconnectedFromServer)));
    }

    #[tokio::test]
    async fn step_reports_session_ended_once_disconnected() {
        let mut supervisor = offline_supervisor();
        assert_eq!(supervisor.step().await, StepOutcome::SessionEnded);
    }

    #[tokio::test]
    async fn transport_drop_with_no_active_session_goes_straight_to_finalize() {
        let mut supervisor = offline_supervisor();
        supervisor.connect().await;
        supervisor.session = None;

        supervisor
            .handle_transport_drop(RawTransportError::StreamClosed)
            .await;

        assert!(matches!(
            supervisor.state(),
            ConnectionState::TransientError { .. } | ConnectionState::TerminalError { .. }
        ));
    }

    struct RecordingCredentialService {
        method: LoginMethod,
        stored: std::sync::Mutex<Option<GuestCredentials>>,
    }

    #[async_trait::async_trait]
    impl CredentialService for RecordingCredentialService {
        async fn initialize(&self) -> Result<(), String> {
            Ok(())
        }

        async fn current_login_method(&self) -> Result<LoginMethod, String> {
            Ok(self.method.clone())
        }

        async fn store_guest_credentials(&self, credentials: GuestCredentials) -> Result<(), String> {
            *self.stored.lock().unwrap() = Some(credentials);
            Ok(())
        }
    }

    #[tokio::test]
    async fn guest_account_creation_persists_minted_credentials() {
        let service = Arc::new(RecordingCredentialService {
            method: LoginMethod::NewGuestAccount,
            stored: std::sync::Mutex::new(None),
        });
        let mut supervisor = SessionSupervisor::new(
            SupervisorConfig::default(),
            Endpoint::offline(),
            service.clone(),
            Arc::new(EmptyProvider),
        );

        supervisor.connect().await;

        assert!(matches!(
            supervisor.state(),
            ConnectionState::Connected { is_healthy: true }
        ));
        assert!(service.stored.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn a_pause_shorter_than_the_masking_threshold_does_not_mask_the_error() {
        let mut supervisor = offline_supervisor();
        supervisor.connect().await;
        supervisor.paused_at = Some(Instant::now());

        supervisor
            .finalize_failure(ConnectionError::TransportClosed, false)
            .await;

        assert!(matches!(
            supervisor.state(),
            ConnectionState::TransientError {
                error: ConnectionError::TransportClosed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn a_pause_longer_than_the_masking_threshold_masks_the_error() {
        let mut supervisor = offline_supervisor();
        supervisor.connect().await;
        let threshold = supervisor.config.max_non_error_masking_pause_duration;
        supervisor.paused_at = Some(Instant::now() - threshold - Duration::from_secs(1));

        supervisor
            .finalize_failure(ConnectionError::TransportClosed, false)
            .await;

        assert!(matches!(
            supervisor.state(),
            ConnectionState::TransientError {
                error: ConnectionError::SessionLostInBackground,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn round_trip_estimate_extends_the_ping_pong_deadline() {
        let mut supervisor = offline_supervisor();
        supervisor.connect().await;
        {
            let session = supervisor.session.as_mut().unwrap();
            session.last_ping_sent_at = Some(Instant::now());
            session.last_pong_id = None;
            session.last_round_trip_estimate = Duration::from_secs(2);
        }

        let with_estimate = supervisor.pending_ping_deadline().unwrap();
        supervisor.session.as_mut().unwrap().last_round_trip_estimate = Duration::ZERO;
        let without_estimate = supervisor.pending_ping_deadline().unwrap();

        assert!(with_estimate > without_estimate);
    }
}
